use crate::error::{ApiError, ErrorCode, BridgeResult};
use crate::session::{ExitHandle, OutputHandle, SessionBackend, SessionSpec};
use async_trait::async_trait;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

/// Interactive process on a locally allocated PTY.
pub struct LocalBackend {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: Option<u32>,
}

impl LocalBackend {
    pub fn spawn(
        spec: &SessionSpec,
        cols: u16,
        rows: u16,
        term: &str,
        output: OutputHandle,
        exit: ExitHandle,
    ) -> BridgeResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                ApiError::new(ErrorCode::SpawnFailed, "Failed to allocate PTY")
                    .with_details(err.to_string())
            })?;

        let program = spec
            .command
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string());

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.args);
        cmd.env("TERM", term);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            ApiError::new(
                ErrorCode::SpawnFailed,
                format!("Failed to spawn {program}"),
            )
            .with_details(err.to_string())
        })?;
        let pid = child.process_id();

        let mut reader = pair.master.try_clone_reader().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to clone PTY reader")
                .with_details(err.to_string())
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to take PTY writer")
                .with_details(err.to_string())
        })?;

        let child = Arc::new(Mutex::new(child));
        let child_for_wait = child.clone();
        thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        output.append_output(&buffer[..n]);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "PTY read failed");
                        break;
                    }
                }
            }
            // EOF on the master means the child has released the slave;
            // wait() returns promptly at this point.
            let code = {
                let mut child = child_for_wait.lock().expect("child mutex poisoned");
                match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to collect exit status");
                        None
                    }
                }
            };
            exit.mark_exited(code);
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            child,
            pid,
        })
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    async fn write(&self, data: &[u8]) -> BridgeResult<usize> {
        let data = data.to_vec();
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> BridgeResult<usize> {
            let mut writer = writer.lock().expect("writer mutex poisoned");
            writer.write(&data).map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to write")
                    .with_details(err.to_string())
                    .into()
            })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join write").with_details(err.to_string())
        })?
    }

    async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        let master = self.master.clone();

        tokio::task::spawn_blocking(move || -> BridgeResult<()> {
            let master = master.lock().expect("master mutex poisoned");
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to resize PTY")
                        .with_details(err.to_string())
                        .into()
                })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join resize").with_details(err.to_string())
        })?
    }

    async fn terminate(&self) -> BridgeResult<()> {
        let child = self.child.clone();

        tokio::task::spawn_blocking(move || -> BridgeResult<()> {
            let mut child = child.lock().expect("child mutex poisoned");
            // Already-exited children make kill() fail with ESRCH; that is
            // the idempotent success case.
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            match child.kill() {
                Ok(()) => Ok(()),
                Err(_) if child.try_wait().is_ok_and(|status| status.is_some()) => Ok(()),
                Err(err) => Err(ApiError::new(ErrorCode::IoError, "Failed to kill process")
                    .with_details(err.to_string())
                    .into()),
            }
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join terminate")
                .with_details(err.to_string())
        })?
    }

    fn identifier(&self) -> Option<u32> {
        self.pid
    }
}
