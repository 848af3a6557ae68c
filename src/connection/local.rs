//! Local connection module.
//!
//! Executes commands on the control node through `sh -c` (optionally
//! wrapped in `sudo -u` or `su`) and performs file operations directly on
//! the local filesystem, without any network transport.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    CommandResult, Connection, ConnectionError, ConnectionInfo, ConnectionResult, EventStream,
    ExecuteOptions, FetchReader, ProgressInfo, StreamEvent, STREAM_BUFFER,
};

/// Copy progress events are throttled to at most ~10 per second.
const PROGRESS_INTERVAL_MS: u64 = 100;

/// Local connection for executing commands on the current host.
#[derive(Debug, Default)]
pub struct LocalConnection {
    info: Option<ConnectionInfo>,
    connected: bool,
}

impl LocalConnection {
    /// Create a new, unconnected local connection.
    pub fn new() -> Self {
        Self::default()
    }

    fn require_connected(&self) -> ConnectionResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected { host: self.host() })
        }
    }

    /// Build the command with escalation, working dir, and environment.
    fn build_command(&self, command: &str, options: &ExecuteOptions) -> Command {
        let mut cmd = if options.sudo {
            let user = options.user.as_deref().unwrap_or("root");
            let mut c = Command::new("sudo");
            c.arg("-u").arg(user).arg("--").arg("sh").arg("-c").arg(command);
            c
        } else if let Some(user) = &options.user {
            let mut c = Command::new("su");
            c.arg("-c").arg(command).arg(user);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Copy with periodic progress callbacks.
    pub async fn copy_with_progress(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dest: &str,
        mode: u32,
        total: Option<u64>,
        options: &ExecuteOptions,
    ) -> ConnectionResult<()> {
        self.require_connected()?;
        let dest_path = Path::new(dest);
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = tokio::fs::File::create(dest_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create {}: {}", dest, e))
        })?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut written: u64 = 0;
        let mut last_report = tokio::time::Instant::now();
        loop {
            if options.cancellation.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            let n = src.read(&mut buf).await.map_err(|e| {
                ConnectionError::TransferFailed(format!("Read failed: {}", e))
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(|e| {
                ConnectionError::TransferFailed(format!("Write to {} failed: {}", dest, e))
            })?;
            written += n as u64;

            if let Some(callback) = &options.progress_callback {
                if last_report.elapsed().as_millis() as u64 >= PROGRESS_INTERVAL_MS {
                    last_report = tokio::time::Instant::now();
                    let percentage = total
                        .filter(|t| *t > 0)
                        .map(|t| (written as f32 / t as f32) * 100.0)
                        .unwrap_or(0.0);
                    callback(
                        &ProgressInfo::new("transferring", percentage, format!("{} bytes", written))
                            .with_bytes(written, total),
                    );
                }
            }
        }
        file.flush().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Flush of {} failed: {}", dest, e))
        })?;
        drop(file);

        set_mode(dest_path, mode).await?;

        if let Some(callback) = &options.progress_callback {
            callback(
                &ProgressInfo::new("completed", 100.0, format!("{} bytes", written))
                    .with_bytes(written, total),
            );
        }
        trace!(dest = %dest, bytes = written, "local copy complete");
        Ok(())
    }
}

async fn run_to_completion(
    child: tokio::process::Child,
    timeout: Option<u64>,
    host: String,
) -> ConnectionResult<std::process::Output> {
    let wait = child.wait_with_output();
    let output = match timeout {
        Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), wait)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: host.clone(),
                seconds: secs,
            })?,
        None => wait.await,
    };
    output.map_err(|e| ConnectionError::ExecutionFailed {
        host,
        message: format!("Failed to wait for process: {}", e),
    })
}

async fn set_mode(path: &Path, mode: u32) -> ConnectionResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to set mode on {}: {}",
                    path.display(),
                    e
                ))
            })?;
    }
    Ok(())
}

#[async_trait]
impl Connection for LocalConnection {
    fn host(&self) -> String {
        self.info
            .as_ref()
            .map(|i| i.host.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    async fn connect(&mut self, info: ConnectionInfo) -> ConnectionResult<()> {
        self.info = Some(info);
        self.connected = true;
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<CommandResult> {
        self.require_connected()?;
        debug!(command = %command, "executing local command");

        let mut cmd = self.build_command(command, options);
        let child = cmd.spawn().map_err(|e| ConnectionError::ExecutionFailed {
            host: self.host(),
            message: format!("Failed to spawn process: {}", e),
        })?;

        let host = self.host();
        let output = tokio::select! {
            // kill_on_drop reaps the child when its future is dropped.
            _ = options.cancellation.cancelled() => {
                return Err(ConnectionError::Cancelled);
            }
            result = run_to_completion(child, options.timeout, host.clone()) => result?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        trace!(exit_code, stdout_len = stdout.len(), stderr_len = stderr.len(), "command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    async fn execute_stream(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<EventStream> {
        self.require_connected()?;
        debug!(command = %command, "executing local command (streaming)");

        let mut cmd = self.build_command(command, options);
        let mut child = cmd.spawn().map_err(|e| ConnectionError::ExecutionFailed {
            host: self.host(),
            message: format!("Failed to spawn process: {}", e),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);

        let output_callback = options.output_callback.clone();
        let progress_callback = options.progress_callback.clone();
        let cancellation = options.cancellation.clone();
        let timeout = options.timeout;

        tokio::spawn(async move {
            let initial = ProgressInfo::new("executing", 0.0, "command started");
            if let Some(cb) = &progress_callback {
                cb(&initial);
            }
            let _ = tx.send(StreamEvent::progress(initial)).await;

            let mut stdout_buf = String::new();
            let mut stderr_buf = String::new();

            let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
            let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

            let deadline = timeout.map(|secs| {
                tokio::time::Instant::now() + std::time::Duration::from_secs(secs)
            });

            let mut stdout_open = stdout_lines.is_some();
            let mut stderr_open = stderr_lines.is_some();

            // Phase 1: drain both pipes.
            while stdout_open || stderr_open {
                tokio::select! {
                    line = async {
                        match stdout_lines.as_mut() {
                            Some(lines) => lines.next_line().await,
                            None => Ok(None),
                        }
                    }, if stdout_open => match line {
                        Ok(Some(line)) => {
                            stdout_buf.push_str(&line);
                            stdout_buf.push('\n');
                            if let Some(cb) = &output_callback {
                                cb(&line);
                            }
                            let _ = tx.send(StreamEvent::stdout(line)).await;
                        }
                        _ => stdout_open = false,
                    },
                    line = async {
                        match stderr_lines.as_mut() {
                            Some(lines) => lines.next_line().await,
                            None => Ok(None),
                        }
                    }, if stderr_open => match line {
                        Ok(Some(line)) => {
                            stderr_buf.push_str(&line);
                            stderr_buf.push('\n');
                            if let Some(cb) = &output_callback {
                                cb(&line);
                            }
                            let _ = tx.send(StreamEvent::stderr(line)).await;
                        }
                        _ => stderr_open = false,
                    },
                    _ = cancellation.cancelled() => {
                        let _ = child.kill().await;
                        let result = CommandResult::failure(
                            -1,
                            stdout_buf,
                            format!("{}\ncommand cancelled", stderr_buf),
                        );
                        let _ = tx.send(StreamEvent::done(result)).await;
                        return;
                    }
                    _ = async {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let _ = child.kill().await;
                        let result = CommandResult::failure(
                            -1,
                            stdout_buf,
                            format!("{}\ncommand timed out", stderr_buf),
                        );
                        let _ = tx.send(StreamEvent::done(result)).await;
                        return;
                    }
                }
            }

            // Phase 2: reap the exit status, still honoring cancellation
            // and the deadline.
            enum WaitEnd {
                Status(std::io::Result<std::process::ExitStatus>),
                Cancelled,
                TimedOut,
            }
            let end = tokio::select! {
                status = child.wait() => WaitEnd::Status(status),
                _ = cancellation.cancelled() => WaitEnd::Cancelled,
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => WaitEnd::TimedOut,
            };
            let status = match end {
                WaitEnd::Status(status) => status,
                WaitEnd::Cancelled => {
                    let _ = child.kill().await;
                    let result = CommandResult::failure(
                        -1,
                        stdout_buf,
                        format!("{}\ncommand cancelled", stderr_buf),
                    );
                    let _ = tx.send(StreamEvent::done(result)).await;
                    return;
                }
                WaitEnd::TimedOut => {
                    let _ = child.kill().await;
                    let result = CommandResult::failure(
                        -1,
                        stdout_buf,
                        format!("{}\ncommand timed out", stderr_buf),
                    );
                    let _ = tx.send(StreamEvent::done(result)).await;
                    return;
                }
            };

            let final_progress = ProgressInfo::new("completed", 100.0, "command finished");
            if let Some(cb) = &progress_callback {
                cb(&final_progress);
            }
            let _ = tx.send(StreamEvent::progress(final_progress)).await;

            match status {
                Ok(status) => {
                    let exit_code = status.code().unwrap_or(-1);
                    let result = if status.success() {
                        CommandResult::success(stdout_buf, stderr_buf)
                    } else {
                        CommandResult::failure(exit_code, stdout_buf, stderr_buf)
                    };
                    let _ = tx.send(StreamEvent::done(result)).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::error(format!("wait failed: {}", e)))
                        .await;
                }
            }
        });

        Ok(rx)
    }

    async fn copy(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dest: &str,
        mode: u32,
    ) -> ConnectionResult<()> {
        self.copy_with_progress(src, dest, mode, None, &ExecuteOptions::default())
            .await
    }

    async fn fetch(&self, src: &str) -> ConnectionResult<FetchReader> {
        self.require_connected()?;
        let file = tokio::fs::File::open(src).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to open {}: {}", src, e))
        })?;
        Ok(Box::new(file))
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn ping(&self) -> ConnectionResult<()> {
        self.require_connected()
    }

    async fn file_exists(&self, path: &str) -> ConnectionResult<bool> {
        self.require_connected()?;
        Ok(Path::new(path).is_file())
    }

    async fn create_directory(&self, path: &str, mode: u32) -> ConnectionResult<()> {
        self.require_connected()?;
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create {}: {}", path, e))
        })?;
        set_mode(Path::new(path), mode).await
    }

    async fn remove_file(&self, path: &str) -> ConnectionResult<()> {
        self.require_connected()?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectionError::TransferFailed(format!(
                "Failed to remove {}: {}",
                path, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    async fn connected() -> LocalConnection {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_execute_before_connect_fails() {
        let conn = LocalConnection::new();
        let err = conn
            .execute("true", &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_execute() {
        let conn = connected().await;
        let result = conn
            .execute("echo 'hello world'", &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_execute_with_env_and_cwd() {
        let conn = connected().await;
        let options = ExecuteOptions::new()
            .with_env("TEST_VAR", "test_value")
            .with_working_dir("/tmp");
        let result = conn
            .execute("echo $TEST_VAR; pwd", &options)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("test_value"));
        assert!(result.stdout.contains("/tmp"));
    }

    #[tokio::test]
    async fn test_execute_failure_exit_code() {
        let conn = connected().await;
        let result = conn
            .execute("exit 42", &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let conn = connected().await;
        let options = ExecuteOptions::new().with_timeout(1);
        let err = conn.execute("sleep 10", &options).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn test_execute_cancellation() {
        let conn = connected().await;
        let token = CancellationToken::new();
        let options = ExecuteOptions::new().with_cancellation(token.clone());
        let handle = tokio::spawn(async move { token.cancel() });
        let err = conn.execute("sleep 10", &options).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_stream_events() {
        let conn = connected().await;
        let mut rx = conn
            .execute_stream("echo one; echo two 1>&2; echo three", &ExecuteOptions::default())
            .await
            .unwrap();

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut terminals = 0;
        let mut saw_event_after_terminal = false;

        while let Some(event) = rx.recv().await {
            if terminals > 0 {
                saw_event_after_terminal = true;
            }
            match event {
                StreamEvent::Stdout { data, .. } => stdout_lines.push(data),
                StreamEvent::Stderr { data, .. } => stderr_lines.push(data),
                StreamEvent::Done { result, .. } => {
                    terminals += 1;
                    assert!(result.success);
                    assert!(result.stdout.contains("one"));
                    assert!(result.stdout.contains("three"));
                }
                StreamEvent::Error { .. } => terminals += 1,
                _ => {}
            }
        }

        assert_eq!(terminals, 1);
        assert!(!saw_event_after_terminal);
        assert_eq!(stdout_lines, vec!["one", "three"]);
        assert_eq!(stderr_lines, vec!["two"]);
    }

    #[tokio::test]
    async fn test_execute_stream_progress_bookends() {
        let conn = connected().await;
        let mut rx = conn
            .execute_stream("true", &ExecuteOptions::default())
            .await
            .unwrap();

        let mut stages = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Progress { progress } = event {
                stages.push((progress.stage.clone(), progress.percentage));
            }
        }
        assert_eq!(stages.first().map(|s| s.0.as_str()), Some("executing"));
        assert_eq!(stages.last(), Some(&("completed".to_string(), 100.0)));
    }

    #[tokio::test]
    async fn test_execute_stream_cancellation_yields_failed_result() {
        let conn = connected().await;
        let token = CancellationToken::new();
        let options = ExecuteOptions::new().with_cancellation(token.clone());
        let mut rx = conn.execute_stream("sleep 10", &options).await.unwrap();
        token.cancel();

        let mut done = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Done { result, .. } = event {
                done = Some(result);
            }
        }
        let result = done.expect("terminal Done event");
        assert!(!result.success);
        assert!(result.stderr.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_copy_and_fetch() {
        let conn = connected().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sub/copied.txt");
        let dest_str = dest.to_string_lossy().to_string();

        let mut src = std::io::Cursor::new(b"copied content".to_vec());
        conn.copy(&mut src, &dest_str, 0o644).await.unwrap();
        assert!(dest.exists());

        let mut reader = conn.fetch(&dest_str).await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"copied content");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn test_copy_with_progress_reports() {
        let conn = connected().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.bin");

        let reported = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reported.clone();
        let options = ExecuteOptions {
            progress_callback: Some(std::sync::Arc::new(move |p: &ProgressInfo| {
                sink.lock().unwrap().push((p.stage.clone(), p.bytes_done));
            })),
            ..Default::default()
        };

        let payload = vec![7u8; 256 * 1024];
        let total = payload.len() as u64;
        let mut src = std::io::Cursor::new(payload);
        conn.copy_with_progress(
            &mut src,
            &dest.to_string_lossy(),
            0o600,
            Some(total),
            &options,
        )
        .await
        .unwrap();

        let reports = reported.lock().unwrap();
        assert!(!reports.is_empty());
        let (stage, bytes) = reports.last().unwrap();
        assert_eq!(stage, "completed");
        assert_eq!(*bytes, Some(total));
    }

    #[tokio::test]
    async fn test_file_helpers() {
        let conn = connected().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        let file_str = file.to_string_lossy().to_string();

        assert!(!conn.file_exists(&file_str).await.unwrap());
        std::fs::write(&file, "x").unwrap();
        assert!(conn.file_exists(&file_str).await.unwrap());

        conn.remove_file(&file_str).await.unwrap();
        assert!(!file.exists());
        // Removing a missing file is fine.
        conn.remove_file(&file_str).await.unwrap();

        let nested = dir.path().join("a/b/c");
        conn.create_directory(&nested.to_string_lossy(), 0o755)
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = connected().await;
        assert!(conn.is_connected());
        conn.close().await.unwrap();
        assert!(!conn.is_connected());
        conn.close().await.unwrap();

        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
    }
}
