//! SSH transport built on russh (pure Rust).
//!
//! Authentication order: explicit password, explicit private key, then the
//! default identity candidates (`~/.ssh/id_rsa`, `id_dsa`, `id_ecdsa`,
//! `id_ed25519`). After the transport is up a test exec must print
//! `connection test` before the connection is considered established. Each
//! `execute` opens a fresh session channel; environment entries are applied
//! with `set_env`, and timeout or cancellation sends SIGKILL to the remote
//! process.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Sig};
use russh_keys::key::PublicKey;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    wrap_shell_command, CommandResult, Connection, ConnectionError, ConnectionInfo,
    ConnectionResult, EventStream, ExecuteOptions, FetchReader, ProgressInfo, StreamEvent,
    STREAM_BUFFER,
};

/// Raw bytes uploaded per round-trip during base64 chunked copy. Encodes to
/// roughly 64 KiB of base64 text.
const COPY_CHUNK: usize = 48 * 1024;

/// Host key verification callback.
///
/// The reference behavior accepts any host key; hardened deployments should
/// install a known-hosts backed verifier here.
pub type HostKeyVerifier = Arc<dyn Fn(&str, u16, &PublicKey) -> bool + Send + Sync>;

/// Default identity files tried when no explicit credentials are given.
pub fn default_identity_files() -> Vec<PathBuf> {
    ["id_rsa", "id_dsa", "id_ecdsa", "id_ed25519"]
        .iter()
        .map(|name| PathBuf::from(shellexpand::tilde(&format!("~/.ssh/{}", name)).into_owned()))
        .collect()
}

struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok((self.verifier)(&self.host, self.port, server_public_key))
    }
}

/// SSH connection to a remote host.
pub struct SshConnection {
    info: RwLock<Option<ConnectionInfo>>,
    handle: RwLock<Option<Handle<ClientHandler>>>,
    connected: AtomicBool,
    verifier: HostKeyVerifier,
}

impl Default for SshConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConnection {
    /// Create a new, unconnected SSH connection with the accept-any host
    /// key policy.
    pub fn new() -> Self {
        Self {
            info: RwLock::new(None),
            handle: RwLock::new(None),
            connected: AtomicBool::new(false),
            verifier: Arc::new(|_, _, _| true),
        }
    }

    /// Create a connection with a custom host key verifier.
    pub fn with_host_key_verifier(verifier: HostKeyVerifier) -> Self {
        Self {
            info: RwLock::new(None),
            handle: RwLock::new(None),
            connected: AtomicBool::new(false),
            verifier,
        }
    }

    fn host_sync(&self) -> String {
        self.info
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|i| i.host.clone()))
            .unwrap_or_default()
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        info: &ConnectionInfo,
    ) -> ConnectionResult<()> {
        let auth_err = |message: String| ConnectionError::AuthenticationFailed {
            host: info.host.clone(),
            message,
        };

        if let Some(password) = &info.password {
            let ok = handle
                .authenticate_password(&info.user, password)
                .await
                .map_err(|e| auth_err(format!("password auth failed: {}", e)))?;
            if ok {
                debug!(host = %info.host, "authenticated with password");
                return Ok(());
            }
            return Err(auth_err("password rejected".into()));
        }

        if let Some(key_path) = &info.private_key {
            let expanded = shellexpand::tilde(key_path).into_owned();
            let key = russh_keys::load_secret_key(&expanded, None)
                .map_err(|e| auth_err(format!("cannot load key {}: {}", expanded, e)))?;
            let ok = handle
                .authenticate_publickey(&info.user, Arc::new(key))
                .await
                .map_err(|e| auth_err(format!("key auth failed: {}", e)))?;
            if ok {
                debug!(host = %info.host, key = %expanded, "authenticated with private key");
                return Ok(());
            }
            return Err(auth_err(format!("key {} rejected", expanded)));
        }

        for candidate in default_identity_files() {
            if !candidate.exists() {
                continue;
            }
            let key = match russh_keys::load_secret_key(&candidate, None) {
                Ok(key) => key,
                Err(e) => {
                    trace!(key = %candidate.display(), error = %e, "skipping unreadable key");
                    continue;
                }
            };
            match handle.authenticate_publickey(&info.user, Arc::new(key)).await {
                Ok(true) => {
                    debug!(host = %info.host, key = %candidate.display(), "authenticated with default key");
                    return Ok(());
                }
                Ok(false) => continue,
                Err(e) => {
                    trace!(key = %candidate.display(), error = %e, "default key attempt failed");
                    continue;
                }
            }
        }

        Err(auth_err(
            "no authentication method available (no password, key, or default identity)".into(),
        ))
    }

    /// Run a command over a fresh session channel, returning raw output.
    async fn exec_raw(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<(Vec<u8>, Vec<u8>, i32)> {
        let host = self.host().to_string();
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected { host });
        }

        let guard = self.handle.read().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| ConnectionError::NotConnected { host: host.clone() })?;

        let mut channel = handle.channel_open_session().await.map_err(|e| {
            ConnectionError::ExecutionFailed {
                host: host.clone(),
                message: format!("Failed to open channel: {}", e),
            }
        })?;
        drop(guard);

        for (key, value) in &options.env {
            if let Err(e) = channel.set_env(false, key.as_str(), value.as_str()).await {
                trace!(key = %key, error = %e, "set_env rejected");
            }
        }

        let mut opts_no_env = options.clone();
        opts_no_env.env.clear();
        let full_command = wrap_shell_command(command, &opts_no_env);

        channel.exec(true, full_command.as_str()).await.map_err(|e| {
            ConnectionError::ExecutionFailed {
                host: host.clone(),
                message: format!("Failed to execute command: {}", e),
            }
        })?;

        let deadline = options
            .timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: i32 = -1;

        enum Step {
            Msg(Option<ChannelMsg>),
            Cancelled,
            TimedOut,
        }

        loop {
            // The message future is dropped before the step is handled, so
            // the channel is free for the kill signal.
            let step = tokio::select! {
                msg = channel.wait() => Step::Msg(msg),
                _ = options.cancellation.cancelled() => Step::Cancelled,
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => Step::TimedOut,
            };
            match step {
                Step::Msg(Some(ChannelMsg::Data { ref data })) => {
                    stdout.extend_from_slice(data)
                }
                Step::Msg(Some(ChannelMsg::ExtendedData { ref data, ext })) if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    exit_code = exit_status as i32;
                }
                Step::Msg(Some(ChannelMsg::Close)) | Step::Msg(None) => break,
                Step::Msg(Some(_)) => {}
                Step::Cancelled => {
                    let _ = channel.signal(Sig::KILL).await;
                    return Err(ConnectionError::Cancelled);
                }
                Step::TimedOut => {
                    let _ = channel.signal(Sig::KILL).await;
                    return Err(ConnectionError::Timeout {
                        host,
                        seconds: options.timeout.unwrap_or(0),
                    });
                }
            }
        }

        Ok((stdout, stderr, exit_code))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> String {
        self.host_sync()
    }

    async fn connect(&mut self, info: ConnectionInfo) -> ConnectionResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            // Idempotent: rebind the info and keep the transport.
            *self.info.write().await = Some(info);
            return Ok(());
        }

        let host = info.host.clone();
        let port = info.effective_port();
        debug!(host = %host, port, user = %info.user, "connecting via SSH");

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: host.clone(),
            port,
            verifier: self.verifier.clone(),
        };

        let dial = client::connect(config, (host.as_str(), port), handler);
        let mut handle = if info.timeout > 0 {
            tokio::time::timeout(Duration::from_secs(info.timeout), dial)
                .await
                .map_err(|_| ConnectionError::Timeout {
                    host: host.clone(),
                    seconds: info.timeout,
                })?
        } else {
            dial.await
        }
        .map_err(|e| ConnectionError::ConnectionFailed {
            host: host.clone(),
            message: format!("dial failed: {}", e),
        })?;

        Self::authenticate(&mut handle, &info).await?;

        *self.info.write().await = Some(info);
        *self.handle.write().await = Some(handle);
        self.connected.store(true, Ordering::SeqCst);

        // The transport is not trusted until a test exec round-trips.
        let probe = self
            .execute("echo 'connection test'", &ExecuteOptions::default())
            .await?;
        if !probe.stdout.contains("connection test") {
            self.connected.store(false, Ordering::SeqCst);
            *self.handle.write().await = None;
            return Err(ConnectionError::ConnectionFailed {
                host,
                message: "connection test command produced no output".into(),
            });
        }

        debug!(host = %self.host(), "SSH connection established");
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<CommandResult> {
        let (stdout, stderr, exit_code) = self.exec_raw(command, options).await?;
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        trace!(exit_code, "remote command completed");
        if exit_code == 0 {
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
        let host = self.host().to_string();
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected { host });
        }

        let guard = self.handle.read().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| ConnectionError::NotConnected { host: host.clone() })?;
        let mut channel = handle.channel_open_session().await.map_err(|e| {
            ConnectionError::ExecutionFailed {
                host: host.clone(),
                message: format!("Failed to open channel: {}", e),
            }
        })?;
        drop(guard);

        let mut opts_no_env = options.clone();
        opts_no_env.env.clear();
        for (key, value) in &options.env {
            let _ = channel.set_env(false, key.as_str(), value.as_str()).await;
        }
        let full_command = wrap_shell_command(command, &opts_no_env);
        channel.exec(true, full_command.as_str()).await.map_err(|e| {
            ConnectionError::ExecutionFailed {
                host: host.clone(),
                message: format!("Failed to execute command: {}", e),
            }
        })?;

        let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
        let output_callback = options.output_callback.clone();
        let progress_callback = options.progress_callback.clone();
        let cancellation = options.cancellation.clone();
        let deadline = options
            .timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        tokio::spawn(async move {
            let initial = ProgressInfo::new("executing", 0.0, "command started");
            if let Some(cb) = &progress_callback {
                cb(&initial);
            }
            let _ = tx.send(StreamEvent::progress(initial)).await;

            let mut stdout_buf = String::new();
            let mut stderr_buf = String::new();
            let mut stdout_pending = String::new();
            let mut stderr_pending = String::new();
            let mut exit_code: i32 = -1;

            macro_rules! emit_lines {
                ($pending:expr, $ctor:path) => {
                    while let Some(pos) = $pending.find('\n') {
                        let line: String = $pending.drain(..=pos).collect();
                        let line = line.trim_end_matches('\n').to_string();
                        if let Some(cb) = &output_callback {
                            cb(&line);
                        }
                        let _ = tx.send($ctor(line)).await;
                    }
                };
            }

            enum Step {
                Msg(Option<ChannelMsg>),
                Cancelled,
                TimedOut,
            }

            loop {
                let step = tokio::select! {
                    msg = channel.wait() => Step::Msg(msg),
                    _ = cancellation.cancelled() => Step::Cancelled,
                    _ = async {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending().await,
                        }
                    } => Step::TimedOut,
                };
                match step {
                    Step::Msg(Some(ChannelMsg::Data { ref data })) => {
                        let text = String::from_utf8_lossy(data).into_owned();
                        stdout_buf.push_str(&text);
                        stdout_pending.push_str(&text);
                        emit_lines!(stdout_pending, StreamEvent::stdout);
                    }
                    Step::Msg(Some(ChannelMsg::ExtendedData { ref data, ext })) if ext == 1 => {
                        let text = String::from_utf8_lossy(data).into_owned();
                        stderr_buf.push_str(&text);
                        stderr_pending.push_str(&text);
                        emit_lines!(stderr_pending, StreamEvent::stderr);
                    }
                    Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                        exit_code = exit_status as i32;
                    }
                    Step::Msg(Some(ChannelMsg::Close)) | Step::Msg(None) => break,
                    Step::Msg(Some(_)) => {}
                    Step::Cancelled => {
                        let _ = channel.signal(Sig::KILL).await;
                        let result = CommandResult::failure(
                            -1,
                            stdout_buf,
                            format!("{}\ncommand cancelled", stderr_buf),
                        );
                        let _ = tx.send(StreamEvent::done(result)).await;
                        return;
                    }
                    Step::TimedOut => {
                        let _ = channel.signal(Sig::KILL).await;
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

            // Flush any unterminated trailing lines.
            if !stdout_pending.is_empty() {
                let _ = tx.send(StreamEvent::stdout(stdout_pending.clone())).await;
            }
            if !stderr_pending.is_empty() {
                let _ = tx.send(StreamEvent::stderr(stderr_pending.clone())).await;
            }

            let final_progress = ProgressInfo::new("completed", 100.0, "command finished");
            if let Some(cb) = &progress_callback {
                cb(&final_progress);
            }
            let _ = tx.send(StreamEvent::progress(final_progress)).await;

            let result = if exit_code == 0 {
                CommandResult::success(stdout_buf, stderr_buf)
            } else {
                CommandResult::failure(exit_code, stdout_buf, stderr_buf)
            };
            let _ = tx.send(StreamEvent::done(result)).await;
        });

        Ok(rx)
    }

    async fn copy(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dest: &str,
        mode: u32,
    ) -> ConnectionResult<()> {
        let host = self.host().to_string();
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected { host });
        }

        let tmp = format!("/tmp/.muster-{}.b64", Uuid::new_v4());
        let opts = ExecuteOptions::default();

        // Append base64 chunks to a remote staging file, then decode once.
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut first = true;
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = src.read(&mut buf[filled..]).await.map_err(|e| {
                    ConnectionError::TransferFailed(format!("read failed: {}", e))
                })?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 && !first {
                break;
            }
            let encoded = BASE64.encode(&buf[..filled]);
            let redirect = if first { ">" } else { ">>" };
            let cmd = format!("echo -n '{}' {} {}", encoded, redirect, tmp);
            let result = self.execute(&cmd, &opts).await?;
            if !result.success {
                let _ = self.remove_file(&tmp).await;
                return Err(ConnectionError::TransferFailed(format!(
                    "chunk upload failed: {}",
                    result.stderr
                )));
            }
            first = false;
            if filled < buf.len() {
                break;
            }
        }

        let quoted_dest = shell_words::quote(dest).into_owned();
        let cmd = format!(
            "base64 -d < {} > {} && chmod {:o} {} && rm -f {}",
            tmp, quoted_dest, mode, quoted_dest, tmp
        );
        let result = self.execute(&cmd, &opts).await?;
        if !result.success {
            let _ = self.remove_file(&tmp).await;
            return Err(ConnectionError::TransferFailed(format!(
                "decode to {} failed: {}",
                dest, result.stderr
            )));
        }
        trace!(dest = %dest, "ssh copy complete");
        Ok(())
    }

    async fn fetch(&self, src: &str) -> ConnectionResult<FetchReader> {
        let cmd = format!("cat {}", shell_words::quote(src));
        let (stdout, stderr, exit_code) = self.exec_raw(&cmd, &ExecuteOptions::default()).await?;
        if exit_code != 0 {
            return Err(ConnectionError::TransferFailed(format!(
                "cat {} failed: {}",
                src,
                String::from_utf8_lossy(&stderr)
            )));
        }
        Ok(Box::new(std::io::Cursor::new(stdout)))
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.write().await.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "closing", "en")
                .await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> ConnectionResult<()> {
        let result = self.execute("true", &ExecuteOptions::default()).await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::ExecutionFailed {
                host: self.host().to_string(),
                message: "ping probe returned non-zero".into(),
            })
        }
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host_sync())
            .field("connected", &self.is_connected())
            .finish()
    }
}
