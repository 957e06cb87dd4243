mod buffer;
mod local;
mod remote;

use crate::config::{SessionConfig, SshConfig};
use crate::error::{ApiError, ErrorCode, BridgeResult};
use crate::fanout::{FanOut, SessionEvent};
use crate::keys::key_bytes;
use crate::render::{self, RenderConfig};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use buffer::OutputBuffer;
use local::LocalBackend;
use remote::RemoteBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, Instant, sleep};

pub const MAX_NAME_LEN: usize = 256;

/// How a new session's backend is established. A remote block selects the
/// SSH variant; otherwise a local PTY process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionSpec {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub remote: Option<RemoteSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_pem: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[serde(rename = "utf-8", alias = "utf8", alias = "utf_8")]
    #[default]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

pub fn decode_payload(data: &str, encoding: Encoding) -> BridgeResult<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(data.as_bytes().to_vec()),
        Encoding::Base64 => BASE64.decode(data).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Invalid base64 payload")
                .with_details(err.to_string())
                .into()
        }),
    }
}

/// Capability set every backend variant implements. The owning session is
/// the only event subscriber; data and exit delivery are wired in at
/// construction through [`OutputHandle`] and [`ExitHandle`].
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn write(&self, data: &[u8]) -> BridgeResult<usize>;
    async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()>;
    /// Requests forceful termination. Idempotent: terminating an already
    /// dead backend returns Ok.
    async fn terminate(&self) -> BridgeResult<()>;
    /// OS process id for the local variant; None for remote shells.
    fn identifier(&self) -> Option<u32>;
}

/// Single data-event subscription handed to the backend at construction.
///
/// Fan-out publishing is held back until the owning session is actually in
/// the registry: a backend that produces output (or dies) while its
/// session lost a creation race, or is still connecting, must not leak
/// events under a name observers attribute to the winning session.
#[derive(Clone)]
pub struct OutputHandle {
    session_name: String,
    buffer: Arc<Mutex<OutputBuffer>>,
    fanout: FanOut,
    notify: Arc<Notify>,
    registered: Arc<AtomicBool>,
}

impl OutputHandle {
    pub fn append_output(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(bytes);
        {
            let mut buffer = self.buffer.lock().expect("output buffer mutex poisoned");
            let dropped = buffer.append(&text);
            if dropped > 0 {
                tracing::warn!(
                    session = %self.session_name,
                    dropped_chars = dropped,
                    "Output buffer overflowed; oldest data dropped"
                );
            }
        }
        if self.registered.load(Ordering::SeqCst) {
            self.fanout.publish(SessionEvent::Data {
                name: self.session_name.clone(),
                data: text.into_owned(),
            });
        }
        self.notify.notify_waiters();
    }
}

/// Single exit-event subscription handed to the backend at construction.
/// Publishing is gated like [`OutputHandle`]'s.
#[derive(Clone)]
pub struct ExitHandle {
    session_name: String,
    alive: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    fanout: FanOut,
    notify: Arc<Notify>,
    registered: Arc<AtomicBool>,
}

impl ExitHandle {
    pub fn mark_exited(&self, code: Option<i32>) {
        {
            let mut slot = self.exit_code.lock().expect("exit code mutex poisoned");
            *slot = code;
        }
        self.alive.store(false, Ordering::SeqCst);
        tracing::info!(session = %self.session_name, exit_code = ?code, "Session process exited");
        if self.registered.load(Ordering::SeqCst) {
            self.fanout.publish(SessionEvent::Exited {
                name: self.session_name.clone(),
                exit_code: code,
            });
        }
        self.notify.notify_waiters();
    }
}

/// Point-in-time derived view of a session's buffer.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub text: String,
    pub raw: String,
    pub lines: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Base64 PNG of the currently visible rows; absent unless requested,
    /// and absent when rasterization fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

pub struct Session {
    pub name: String,
    backend: Box<dyn SessionBackend>,
    buffer: Arc<Mutex<OutputBuffer>>,
    alive: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    cols: AtomicU64,
    rows: AtomicU64,
    notify: Arc<Notify>,
}

struct SessionInit {
    name: String,
    backend: Box<dyn SessionBackend>,
    buffer: Arc<Mutex<OutputBuffer>>,
    alive: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    cols: u16,
    rows: u16,
    notify: Arc<Notify>,
}

impl Session {
    fn new(init: SessionInit) -> Self {
        Self {
            name: init.name,
            backend: init.backend,
            buffer: init.buffer,
            alive: init.alive,
            exit_code: init.exit_code,
            cols: AtomicU64::new(init.cols as u64),
            rows: AtomicU64::new(init.rows as u64),
            notify: init.notify,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit code mutex poisoned")
    }

    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::SeqCst) as u16,
            self.rows.load(Ordering::SeqCst) as u16,
        )
    }

    fn set_size(&self, cols: u16, rows: u16) {
        self.cols.store(cols as u64, Ordering::SeqCst);
        self.rows.store(rows as u64, Ordering::SeqCst);
    }

    pub fn identifier(&self) -> Option<u32> {
        self.backend.identifier()
    }

    pub async fn write(&self, data: &[u8]) -> BridgeResult<usize> {
        self.backend.write(data).await
    }

    /// Full raw buffer content, escape codes intact.
    pub fn buffer_contents(&self) -> String {
        self.buffer.lock().expect("buffer mutex poisoned").contents()
    }

    pub fn clear_buffer(&self) {
        self.buffer.lock().expect("buffer mutex poisoned").clear();
    }

    /// Derives the textual snapshot views from the current buffer state.
    /// Never blocks on the backend.
    pub fn snapshot(&self, include_image: bool) -> Snapshot {
        let (cols, rows) = self.size();
        let raw = self.buffer_contents();
        let text = render::strip_ansi(&raw);
        let all_lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let keep = (rows as usize).saturating_mul(3).max(1);
        let skip = all_lines.len().saturating_sub(keep);
        let lines = all_lines[skip..].to_vec();

        let image = if include_image {
            let visible = self
                .buffer
                .lock()
                .expect("buffer mutex poisoned")
                .tail_lines(rows as usize);
            match render::rasterize(&visible, &RenderConfig::default()) {
                Ok(rendered) => Some(BASE64.encode(rendered.png)),
                Err(err) => {
                    tracing::debug!(session = %self.name, error = %err, "Snapshot rasterization skipped");
                    None
                }
            }
        } else {
            None
        };

        Snapshot {
            text,
            raw,
            lines,
            cols,
            rows,
            alive: self.is_alive(),
            exit_code: self.exit_code(),
            image,
        }
    }

    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        SessionInfo {
            name: self.name.clone(),
            cols,
            rows,
            alive: self.is_alive(),
            pid: self.identifier(),
            exit_code: self.exit_code(),
        }
    }

    async fn terminate(&self) -> BridgeResult<()> {
        self.backend.terminate().await
    }

    /// Waits for the next output or exit notification, or `max_wait`,
    /// whichever comes first.
    async fn changed(&self, max_wait: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = sleep(max_wait) => {}
        }
    }
}

/// Process-wide session state: the name → session map plus the event
/// fan-out every backend reports into. Mutation is confined to map
/// insert/remove/lookup under the lock; no I/O happens inside a critical
/// section.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    fanout: FanOut,
    session_config: SessionConfig,
    ssh_config: SshConfig,
}

impl SessionRegistry {
    pub fn new(session_config: SessionConfig, ssh_config: SshConfig, fanout: FanOut) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            fanout,
            session_config,
            ssh_config,
        })
    }

    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    /// Returns the existing session unchanged when `name` is already
    /// registered (the supplied `spec` is ignored on purpose), otherwise constructs a
    /// backend per `spec` and inserts the new session. The boolean is true
    /// when a session was created by this call.
    pub async fn get_or_create(
        &self,
        name: &str,
        spec: SessionSpec,
    ) -> BridgeResult<(Arc<Session>, bool)> {
        validate_name(name)?;

        if let Some(existing) = self.sessions.read().await.get(name).cloned() {
            return Ok((existing, false));
        }

        if self.sessions.read().await.len() >= self.session_config.max_sessions {
            return Err(ApiError::new(ErrorCode::InvalidState, "Too many sessions").into());
        }

        let cols = spec.cols.unwrap_or(self.session_config.default_cols).max(1);
        let rows = spec.rows.unwrap_or(self.session_config.default_rows).max(1);

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(
            self.session_config.output_buffer_max_chars,
        )));
        let alive = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let registered = Arc::new(AtomicBool::new(false));
        let output = OutputHandle {
            session_name: name.to_string(),
            buffer: buffer.clone(),
            fanout: self.fanout.clone(),
            notify: notify.clone(),
            registered: registered.clone(),
        };
        let exit = ExitHandle {
            session_name: name.to_string(),
            alive: alive.clone(),
            exit_code: exit_code.clone(),
            fanout: self.fanout.clone(),
            notify: notify.clone(),
            registered: registered.clone(),
        };

        let backend: Box<dyn SessionBackend> = if let Some(remote) = &spec.remote {
            Box::new(
                RemoteBackend::connect(
                    remote,
                    cols,
                    rows,
                    &self.session_config.term,
                    &self.ssh_config,
                    output,
                    exit,
                )
                .await?,
            )
        } else {
            Box::new(LocalBackend::spawn(
                &spec,
                cols,
                rows,
                &self.session_config.term,
                output,
                exit,
            )?)
        };

        let session = Arc::new(Session::new(SessionInit {
            name: name.to_string(),
            backend,
            buffer,
            alive,
            exit_code,
            cols,
            rows,
            notify,
        }));

        {
            let mut sessions = self.sessions.write().await;
            // Lost a creation race while the backend was connecting: keep
            // the first session, tear down the one built here.
            if let Some(existing) = sessions.get(name).cloned() {
                drop(sessions);
                let _ = session.terminate().await;
                return Ok((existing, false));
            }
            sessions.insert(name.to_string(), session.clone());
        }
        registered.store(true, Ordering::SeqCst);

        self.fanout.publish(SessionEvent::Created {
            name: name.to_string(),
            cols,
            rows,
        });
        tracing::info!(session = %name, cols, rows, remote = spec.remote.is_some(), "Session created");
        Ok((session, true))
    }

    pub async fn get(&self, name: &str) -> BridgeResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "Session not found").into())
    }

    /// Writes raw bytes to a live session. A dead session is rejected
    /// before any backend call is made.
    pub async fn write(&self, name: &str, data: &[u8]) -> BridgeResult<usize> {
        let session = self.get(name).await?;
        if !session.is_alive() {
            return Err(ApiError::new(ErrorCode::InvalidState, "Session is not live").into());
        }
        session.write(data).await
    }

    pub async fn send_key(&self, name: &str, key: &str) -> BridgeResult<usize> {
        let bytes = key_bytes(key)?;
        self.write(name, &bytes).await
    }

    /// Forwards the new geometry and records it unconditionally: the stored
    /// size reflects caller intent even when the transport ignores resizes.
    pub async fn resize(&self, name: &str, cols: u16, rows: u16) -> BridgeResult<()> {
        if cols == 0 || rows == 0 {
            return Err(
                ApiError::new(ErrorCode::InvalidArgument, "cols and rows must be non-zero").into(),
            );
        }
        let session = self.get(name).await?;
        if let Err(err) = session.backend.resize(cols, rows).await {
            tracing::warn!(session = %name, error = %err, "Backend resize failed; geometry recorded anyway");
        }
        session.set_size(cols, rows);
        self.fanout.publish(SessionEvent::Resized {
            name: name.to_string(),
            cols,
            rows,
        });
        Ok(())
    }

    /// Terminates the backend and removes the session. Unlike natural
    /// process exit, close is destructive.
    pub async fn close(&self, name: &str) -> BridgeResult<()> {
        let session = self.get(name).await?;
        if let Err(err) = session.terminate().await {
            tracing::warn!(session = %name, error = %err, "Backend terminate failed during close");
        }
        self.sessions.write().await.remove(name);
        self.fanout.publish(SessionEvent::Closed {
            name: name.to_string(),
        });
        tracing::info!(session = %name, "Session closed");
        Ok(())
    }

    pub async fn clear(&self, name: &str) -> BridgeResult<()> {
        let session = self.get(name).await?;
        session.clear_buffer();
        Ok(())
    }

    pub async fn snapshot(&self, name: &str, include_image: bool) -> BridgeResult<Snapshot> {
        let session = self.get(name).await?;
        Ok(session.snapshot(include_image))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|session| session.info()).collect()
    }

    /// Coordinated teardown: every backend is terminated and the map is
    /// emptied. Termination errors are swallowed — a backend already dead
    /// when terminate is called is not an error.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            if let Err(err) = session.terminate().await {
                tracing::debug!(session = %session.name, error = %err, "Terminate during shutdown ignored");
            }
        }
    }
}

fn validate_name(name: &str) -> BridgeResult<()> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ApiError::new(
            ErrorCode::InvalidArgument,
            format!("Session name must be 1-{MAX_NAME_LEN} characters"),
        )
        .into());
    }
    Ok(())
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls snapshots until the plain-text view contains `needle` or the
/// timeout elapses. Cooperative: expiry just stops polling and leaves the
/// backend untouched.
pub async fn wait_for_text(
    registry: &SessionRegistry,
    name: &str,
    needle: &str,
    timeout_ms: u64,
) -> BridgeResult<bool> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let session = registry.get(name).await?;
        if session.snapshot(false).text.contains(needle) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        session.changed(WAIT_POLL_INTERVAL).await;
    }
}

/// Like [`wait_for_text`] but with a regular expression. The pattern is
/// compiled once up front; a bad pattern is an invalid-argument error, not
/// a failed wait.
pub async fn wait_for_pattern(
    registry: &SessionRegistry,
    name: &str,
    pattern: &str,
    timeout_ms: u64,
) -> BridgeResult<bool> {
    let regex = regex::Regex::new(pattern)?;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let session = registry.get(name).await?;
        if regex.is_match(&session.snapshot(false).text) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        session.changed(WAIT_POLL_INTERVAL).await;
    }
}

/// Polls until the session is no longer live, returning the recorded exit
/// code, or None when the timeout elapses first.
pub async fn wait_for_exit(
    registry: &SessionRegistry,
    name: &str,
    timeout_ms: u64,
) -> BridgeResult<Option<i32>> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let session = registry.get(name).await?;
        if !session.is_alive() {
            return Ok(session.exit_code());
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        session.changed(WAIT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, SshConfig};
    use std::sync::atomic::AtomicUsize;

    struct RecordingBackend {
        writes: Arc<AtomicUsize>,
        pid: Option<u32>,
    }

    #[async_trait]
    impl SessionBackend for RecordingBackend {
        async fn write(&self, data: &[u8]) -> BridgeResult<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(data.len())
        }

        async fn resize(&self, _cols: u16, _rows: u16) -> BridgeResult<()> {
            Ok(())
        }

        async fn terminate(&self) -> BridgeResult<()> {
            Ok(())
        }

        fn identifier(&self) -> Option<u32> {
            self.pid
        }
    }

    struct TestSession {
        registry: Arc<SessionRegistry>,
        writes: Arc<AtomicUsize>,
        exit: ExitHandle,
        output: OutputHandle,
    }

    async fn install_session(name: &str, buffer_limit: usize) -> TestSession {
        let fanout = FanOut::new(64);
        let registry = SessionRegistry::new(SessionConfig::default(), SshConfig::default(), fanout);

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(buffer_limit)));
        let alive = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let writes = Arc::new(AtomicUsize::new(0));
        let registered = Arc::new(AtomicBool::new(true));
        let output = OutputHandle {
            session_name: name.to_string(),
            buffer: buffer.clone(),
            fanout: registry.fanout().clone(),
            notify: notify.clone(),
            registered: registered.clone(),
        };
        let exit = ExitHandle {
            session_name: name.to_string(),
            alive: alive.clone(),
            exit_code: exit_code.clone(),
            fanout: registry.fanout().clone(),
            notify: notify.clone(),
            registered,
        };
        let session = Arc::new(Session::new(SessionInit {
            name: name.to_string(),
            backend: Box::new(RecordingBackend {
                writes: writes.clone(),
                pid: Some(4242),
            }),
            buffer,
            alive,
            exit_code,
            cols: 80,
            rows: 24,
            notify,
        }));
        registry
            .sessions
            .write()
            .await
            .insert(name.to_string(), session);
        TestSession {
            registry,
            writes,
            exit,
            output,
        }
    }

    #[test]
    fn name_validation_bounds() {
        assert!(validate_name("t1").is_ok());
        assert!(validate_name(&"x".repeat(256)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(257)).is_err());
    }

    #[tokio::test]
    async fn write_reaches_backend_for_live_session() {
        let fixture = install_session("t1", 1024).await;
        let written = fixture.registry.write("t1", b"ls\r").await.expect("write");
        assert_eq!(written, 3);
        assert_eq!(fixture.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_to_dead_session_is_invalid_state_without_backend_call() {
        let fixture = install_session("t1", 1024).await;
        fixture.exit.mark_exited(Some(0));
        let err = fixture.registry.write("t1", b"x").await.expect_err("dead");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(fixture.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_to_unknown_session_is_not_found() {
        let fixture = install_session("t1", 1024).await;
        let err = fixture.registry.write("ghost", b"x").await.expect_err("missing");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn exited_session_stays_queryable_until_closed() {
        let fixture = install_session("t1", 1024).await;
        fixture.output.append_output(b"final screen");
        fixture.exit.mark_exited(Some(3));

        let snapshot = fixture.registry.snapshot("t1", false).await.expect("snapshot");
        assert!(!snapshot.alive);
        assert_eq!(snapshot.exit_code, Some(3));
        assert_eq!(snapshot.text, "final screen");

        fixture.registry.close("t1").await.expect("close");
        let err = fixture
            .registry
            .snapshot("t1", false)
            .await
            .expect_err("closed");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn resize_records_geometry_and_emits_event() {
        let fixture = install_session("t1", 1024).await;
        let mut events = fixture.registry.fanout().subscribe();
        fixture.registry.resize("t1", 132, 50).await.expect("resize");
        let session = fixture.registry.get("t1").await.expect("get");
        assert_eq!(session.size(), (132, 50));
        match events.recv().await.expect("event") {
            SessionEvent::Resized { name, cols, rows } => {
                assert_eq!(name, "t1");
                assert_eq!((cols, rows), (132, 50));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resize_rejects_zero_geometry() {
        let fixture = install_session("t1", 1024).await;
        let err = fixture.registry.resize("t1", 0, 24).await.expect_err("zero");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn snapshot_lines_bounded_by_three_screen_heights() {
        let fixture = install_session("t1", 100_000).await;
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("line-{i}\n"));
        }
        fixture.output.append_output(body.as_bytes());

        let snapshot = fixture.registry.snapshot("t1", false).await.expect("snapshot");
        // 24 rows * 3 = 72 lines retained
        assert_eq!(snapshot.lines.len(), 72);
        assert_eq!(snapshot.lines[0], "line-129");
        assert_eq!(snapshot.lines[70], "line-199");
        assert_eq!(snapshot.lines[71], "");
    }

    #[tokio::test]
    async fn snapshot_strips_escape_codes_from_text_but_not_raw() {
        let fixture = install_session("t1", 1024).await;
        fixture.output.append_output(b"\x1b[31merror\x1b[0m done");
        let snapshot = fixture.registry.snapshot("t1", false).await.expect("snapshot");
        assert_eq!(snapshot.text, "error done");
        assert!(snapshot.raw.contains("\x1b[31m"));
        assert!(snapshot.image.is_none());
    }

    #[tokio::test]
    async fn clear_empties_buffer_without_touching_liveness() {
        let fixture = install_session("t1", 1024).await;
        fixture.output.append_output(b"noise");
        fixture.registry.clear("t1").await.expect("clear");
        let snapshot = fixture.registry.snapshot("t1", false).await.expect("snapshot");
        assert!(snapshot.text.is_empty());
        assert!(snapshot.alive);
    }

    #[tokio::test]
    async fn data_events_are_mirrored_to_the_fanout() {
        let fixture = install_session("t1", 1024).await;
        let mut events = fixture.registry.fanout().subscribe();
        fixture.output.append_output(b"chunk");
        match events.recv().await.expect("event") {
            SessionEvent::Data { name, data } => {
                assert_eq!(name, "t1");
                assert_eq!(data, "chunk");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_handles_buffer_but_do_not_publish() {
        let fanout = FanOut::new(64);
        let mut events = fanout.subscribe();
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(1024)));
        let alive = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let registered = Arc::new(AtomicBool::new(false));
        let output = OutputHandle {
            session_name: "loser".to_string(),
            buffer: buffer.clone(),
            fanout: fanout.clone(),
            notify: notify.clone(),
            registered: registered.clone(),
        };
        let exit = ExitHandle {
            session_name: "loser".to_string(),
            alive: alive.clone(),
            exit_code: exit_code.clone(),
            fanout,
            notify,
            registered: registered.clone(),
        };

        // A backend speaking (or dying) before its session is in the map
        // must stay invisible to observers.
        output.append_output(b"banner");
        exit.mark_exited(Some(1));
        assert!(events.try_recv().is_err());

        // Local state still tracked.
        assert_eq!(buffer.lock().unwrap().contents(), "banner");
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(*exit_code.lock().unwrap(), Some(1));

        registered.store(true, Ordering::SeqCst);
        output.append_output(b"visible");
        match events.try_recv().expect("event after registration") {
            SessionEvent::Data { name, data } => {
                assert_eq!(name, "loser");
                assert_eq!(data, "visible");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_key_round_trips_through_write_path() {
        let fixture = install_session("t1", 1024).await;
        let written = fixture.registry.send_key("t1", "ctrl+c").await.expect("key");
        assert_eq!(written, 1);
        let written = fixture.registry.send_key("t1", "enter").await.expect("key");
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn wait_for_text_sees_appended_output() {
        let fixture = install_session("t1", 1024).await;
        fixture.output.append_output(b"$ ready");
        let found = wait_for_text(&fixture.registry, "t1", "ready", 500)
            .await
            .expect("wait");
        assert!(found);
        let found = wait_for_text(&fixture.registry, "t1", "absent", 150)
            .await
            .expect("wait");
        assert!(!found);
    }

    #[tokio::test]
    async fn wait_for_pattern_matches_against_plain_text() {
        let fixture = install_session("t1", 1024).await;
        fixture.output.append_output(b"\x1b[32mbuild OK\x1b[0m in 4.2s");
        let found = wait_for_pattern(&fixture.registry, "t1", r"build OK in \d+\.\d+s", 500)
            .await
            .expect("wait");
        assert!(found);
        let err = wait_for_pattern(&fixture.registry, "t1", "(unclosed", 100)
            .await
            .expect_err("bad pattern");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn wait_for_exit_returns_recorded_code() {
        let fixture = install_session("t1", 1024).await;
        let exit = fixture.exit.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            exit.mark_exited(Some(7));
        });
        let code = wait_for_exit(&fixture.registry, "t1", 2_000)
            .await
            .expect("wait");
        assert_eq!(code, Some(7));
    }

    #[tokio::test]
    async fn shutdown_drains_every_session() {
        let fixture = install_session("t1", 1024).await;
        fixture.registry.shutdown().await;
        assert!(fixture.registry.list().await.is_empty());
    }

    #[test]
    fn decode_payload_handles_both_encodings() {
        assert_eq!(decode_payload("hi", Encoding::Utf8).expect("utf8"), b"hi");
        assert_eq!(
            decode_payload("aGk=", Encoding::Base64).expect("base64"),
            b"hi"
        );
        assert!(decode_payload("%%%", Encoding::Base64).is_err());
    }

    #[tokio::test]
    async fn list_reports_geometry_and_pid() {
        let fixture = install_session("t1", 1024).await;
        let infos = fixture.registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "t1");
        assert_eq!((infos[0].cols, infos[0].rows), (80, 24));
        assert_eq!(infos[0].pid, Some(4242));
        assert!(infos[0].alive);
    }
}
