//! Escape-code handling and snapshot rasterization.
//!
//! The buffer keeps raw terminal output; this module derives the plain-text
//! view by stripping CSI/OSC sequences and, on request, turns the visible
//! rows into a PNG by parsing SGR color runs and rasterizing them with a
//! monospace font. Rasterization is best-effort: any failure (no usable
//! font, malformed sequences) is reported as an error the snapshot path
//! degrades on, never propagates.

use crate::error::{ApiError, ErrorCode, BridgeResult};
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Removes ANSI escape sequences, leaving printable text and line breaks.
pub fn strip_ansi(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            match chars.peek() {
                // CSI: parameters/intermediates 0x20-0x3F, final byte 0x40-0x7E
                Some('[') => {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii() && (0x20..=0x3f).contains(&(next as u8)) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Some(&next) = chars.peek()
                        && next.is_ascii()
                        && (0x40..=0x7e).contains(&(next as u8))
                    {
                        chars.next();
                    }
                }
                // OSC: terminated by BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                // Two-character sequences (ESC c, ESC ( B, ...)
                Some(&next) => {
                    chars.next();
                    if next == '(' || next == ')' {
                        chars.next();
                    }
                }
                None => {}
            }
        } else if ch == '\x07' {
            // stray BEL
        } else {
            result.push(ch);
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// A run of characters sharing one style within a line.
#[derive(Debug, Clone, PartialEq)]
pub struct StyledRun {
    pub text: String,
    pub fg: Option<Rgb>,
    pub bold: bool,
}

const DEFAULT_FG: Rgb = Rgb(212, 212, 212);
const DEFAULT_BG: Rgb = Rgb(30, 30, 30);

const ANSI_COLORS: [Rgb; 16] = [
    Rgb(0, 0, 0),
    Rgb(205, 49, 49),
    Rgb(13, 188, 121),
    Rgb(229, 229, 16),
    Rgb(36, 114, 200),
    Rgb(188, 63, 188),
    Rgb(17, 168, 205),
    Rgb(229, 229, 229),
    Rgb(102, 102, 102),
    Rgb(241, 76, 76),
    Rgb(35, 209, 139),
    Rgb(245, 245, 67),
    Rgb(59, 142, 234),
    Rgb(214, 112, 214),
    Rgb(41, 184, 219),
    Rgb(255, 255, 255),
];

fn xterm_256(index: u8) -> Rgb {
    match index {
        0..=15 => ANSI_COLORS[index as usize],
        16..=231 => {
            let value = index - 16;
            let step = |component: u8| if component == 0 { 0 } else { 55 + component * 40 };
            Rgb(step(value / 36), step(value / 6 % 6), step(value % 6))
        }
        232..=255 => {
            let gray = 8 + (index - 232) * 10;
            Rgb(gray, gray, gray)
        }
    }
}

/// Splits raw escape-coded text into per-line runs of uniformly styled text.
///
/// Only SGR sequences affect styling; every other escape sequence is dropped.
pub fn styled_lines(raw: &str) -> Vec<Vec<StyledRun>> {
    let mut lines: Vec<Vec<StyledRun>> = vec![Vec::new()];
    let mut fg: Option<Rgb> = None;
    let mut bold = false;
    let mut pending = String::new();

    let flush = |lines: &mut Vec<Vec<StyledRun>>, pending: &mut String, fg: Option<Rgb>, bold: bool| {
        if !pending.is_empty() {
            let line = lines.last_mut().expect("at least one line");
            line.push(StyledRun {
                text: std::mem::take(pending),
                fg,
                bold,
            });
        }
    };

    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                while let Some(&next) = chars.peek() {
                    if next.is_ascii() && (0x20..=0x3f).contains(&(next as u8)) {
                        params.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(&next) = chars.peek()
                    && next.is_ascii()
                    && (0x40..=0x7e).contains(&(next as u8))
                {
                    final_byte = Some(next);
                    chars.next();
                }
                if final_byte == Some('m') {
                    flush(&mut lines, &mut pending, fg, bold);
                    apply_sgr(&params, &mut fg, &mut bold);
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            } else {
                chars.next();
            }
        } else if ch == '\n' {
            flush(&mut lines, &mut pending, fg, bold);
            lines.push(Vec::new());
        } else if ch == '\r' || ch == '\x07' {
            // carriage returns and bells are invisible in this view
        } else {
            pending.push(ch);
        }
    }
    flush(&mut lines, &mut pending, fg, bold);
    if lines.len() > 1
        && lines
            .last()
            .map(|line| line.is_empty())
            .unwrap_or(false)
    {
        lines.pop();
    }
    lines
}

fn apply_sgr(params: &str, fg: &mut Option<Rgb>, bold: &mut bool) {
    let codes: Vec<u8> = params
        .split(';')
        .map(|part| part.parse::<u8>().unwrap_or(0))
        .collect();
    let mut iter = codes.iter().copied().peekable();
    while let Some(code) = iter.next() {
        match code {
            0 => {
                *fg = None;
                *bold = false;
            }
            1 => *bold = true,
            22 => *bold = false,
            30..=37 => *fg = Some(ANSI_COLORS[(code - 30) as usize]),
            90..=97 => *fg = Some(ANSI_COLORS[(code - 90 + 8) as usize]),
            39 => *fg = None,
            38 => match iter.next() {
                Some(5) => {
                    if let Some(index) = iter.next() {
                        *fg = Some(xterm_256(index));
                    }
                }
                Some(2) => {
                    let (r, g, b) = (iter.next(), iter.next(), iter.next());
                    if let (Some(r), Some(g), Some(b)) = (r, g, b) {
                        *fg = Some(Rgb(r, g, b));
                    }
                }
                _ => {}
            },
            // Background and the remaining attributes are not rendered.
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub font_size: f32,
    pub padding_x: u32,
    pub padding_y: u32,
    pub line_height: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_size: 14.0,
            padding_x: 8,
            padding_y: 8,
            line_height: 1.3,
        }
    }
}

pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

/// Rasterizes raw escape-coded text (the visible rows) into a PNG.
pub fn rasterize(raw: &str, config: &RenderConfig) -> BridgeResult<RenderedImage> {
    let font = load_monospace_font()?;
    let scale = PxScale::from(config.font_size);
    let scaled_font = font.as_scaled(scale);

    let char_width = scaled_font.h_advance(scaled_font.glyph_id('M'));
    let line_height = (config.font_size * config.line_height).ceil() as u32;
    let ascent = scaled_font.ascent();

    let lines = styled_lines(raw);
    let max_line_len = lines
        .iter()
        .map(|line| line.iter().map(|run| run.text.chars().count()).sum::<usize>())
        .max()
        .unwrap_or(0);
    if lines.is_empty() || max_line_len == 0 {
        return Err(ApiError::new(ErrorCode::RenderFailed, "Nothing to render").into());
    }

    let width = (max_line_len as f32 * char_width).ceil() as u32 + config.padding_x * 2;
    let height = lines.len() as u32 * line_height + config.padding_y * 2;

    let bg = Rgba([DEFAULT_BG.0, DEFAULT_BG.1, DEFAULT_BG.2, 255]);
    let mut img = RgbaImage::from_pixel(width, height, bg);

    for (line_idx, line) in lines.iter().enumerate() {
        let y_baseline = config.padding_y as f32 + (line_idx as u32 * line_height) as f32 + ascent;
        let mut x = config.padding_x as f32;
        for run in line {
            let color = run.fg.unwrap_or(DEFAULT_FG);
            let pixel = Rgba([color.0, color.1, color.2, 255]);
            for ch in run.text.chars() {
                draw_char(&mut img, &scaled_font, ch, x, y_baseline, pixel);
                x += char_width;
            }
        }
    }

    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|err| {
            ApiError::new(ErrorCode::RenderFailed, "PNG encoding failed")
                .with_details(err.to_string())
        })?;

    Ok(RenderedImage { width, height, png })
}

fn draw_char(
    img: &mut RgbaImage,
    font: &ab_glyph::PxScaleFont<&FontVec>,
    ch: char,
    x: f32,
    y_baseline: f32,
    color: Rgba<u8>,
) {
    let glyph_id = font.glyph_id(ch);
    let glyph = glyph_id.with_scale_and_position(font.scale(), ab_glyph::point(x, y_baseline));
    if let Some(outlined) = font.outline_glyph(glyph) {
        let bounds = outlined.px_bounds();
        outlined.draw(|px, py, coverage| {
            let img_x = (bounds.min.x as i32 + px as i32) as u32;
            let img_y = (bounds.min.y as i32 + py as i32) as u32;
            if img_x < img.width() && img_y < img.height() {
                let alpha = (coverage * 255.0) as u8;
                if alpha > 0 {
                    let blended = blend_pixel(*img.get_pixel(img_x, img_y), color, alpha);
                    img.put_pixel(img_x, img_y, blended);
                }
            }
        });
    }
}

fn blend_pixel(bg: Rgba<u8>, fg: Rgba<u8>, alpha: u8) -> Rgba<u8> {
    let a = alpha as f32 / 255.0;
    let inv = 1.0 - a;
    Rgba([
        (fg[0] as f32 * a + bg[0] as f32 * inv) as u8,
        (fg[1] as f32 * a + bg[1] as f32 * inv) as u8,
        (fg[2] as f32 * a + bg[2] as f32 * inv) as u8,
        255,
    ])
}

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationMono-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansMono-Regular.ttf",
    "/usr/share/fonts/truetype/ubuntu/UbuntuMono-R.ttf",
];

fn load_monospace_font() -> BridgeResult<FontVec> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(path) = env::var("TERMBRIDGE_FONT") {
        candidates.push(PathBuf::from(path));
    }
    candidates.extend(FONT_CANDIDATES.iter().map(PathBuf::from));

    for path in candidates {
        if let Ok(bytes) = fs::read(&path)
            && let Ok(font) = FontVec::try_from_vec(bytes)
        {
            return Ok(font);
        }
    }
    Err(ApiError::new(ErrorCode::RenderFailed, "No usable monospace font found").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_sgr_sequences() {
        let input = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(input), "red plain");
    }

    #[test]
    fn strip_ansi_removes_osc_titles() {
        let input = "\x1b]0;window title\x07prompt$ ";
        assert_eq!(strip_ansi(input), "prompt$ ");
    }

    #[test]
    fn strip_ansi_keeps_line_breaks() {
        let input = "a\x1b[2Jb\nc";
        assert_eq!(strip_ansi(input), "ab\nc");
    }

    #[test]
    fn strip_ansi_passes_plain_text_through() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }

    #[test]
    fn styled_lines_splits_color_runs() {
        let lines = styled_lines("\x1b[32mok\x1b[0m rest");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 2);
        assert_eq!(lines[0][0].text, "ok");
        assert_eq!(lines[0][0].fg, Some(ANSI_COLORS[2]));
        assert_eq!(lines[0][1].text, " rest");
        assert_eq!(lines[0][1].fg, None);
    }

    #[test]
    fn styled_lines_handles_bright_and_256_colors() {
        let lines = styled_lines("\x1b[91mbright\x1b[38;5;196mdeep");
        assert_eq!(lines[0][0].fg, Some(ANSI_COLORS[9]));
        assert_eq!(lines[0][1].fg, Some(xterm_256(196)));
    }

    #[test]
    fn styled_lines_tracks_line_breaks() {
        let lines = styled_lines("one\ntwo\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0][0].text, "one");
        assert_eq!(lines[1][0].text, "two");
    }

    #[test]
    fn malformed_sgr_does_not_panic() {
        let lines = styled_lines("\x1b[38;2mtruncated\x1b[;;;mtext");
        let text: String = lines[0].iter().map(|run| run.text.as_str()).collect();
        assert_eq!(text, "truncatedtext");
    }

    #[test]
    fn xterm_cube_endpoints() {
        assert_eq!(xterm_256(16), Rgb(0, 0, 0));
        assert_eq!(xterm_256(231), Rgb(255, 255, 255));
        assert_eq!(xterm_256(232), Rgb(8, 8, 8));
    }

    #[test]
    fn rasterize_empty_input_is_an_error() {
        assert!(rasterize("", &RenderConfig::default()).is_err());
    }
}
