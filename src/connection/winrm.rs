//! Windows Remote Management (WinRM) connection module.
//!
//! Speaks WS-Management SOAP over HTTP (:5985) or HTTPS (:5986). Each
//! execute creates a remote shell, issues the command, drains output with
//! Receive calls, signals termination, and deletes the shell. NTLM
//! challenge-response is used when a user and password are present;
//! otherwise Basic. File transfer rides on base64 payloads through
//! PowerShell one-liners.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md4::{Digest as Md4Digest, Md4};
use md5::Md5;
use rand::RngCore;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    CommandResult, Connection, ConnectionError, ConnectionInfo, ConnectionResult, EventStream,
    ExecuteOptions, FetchReader, ProgressInfo, StreamEvent, STREAM_BUFFER,
};

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const MAX_ENVELOPE_SIZE: u32 = 153600;
const OPERATION_TIMEOUT: &str = "PT60S";

/// Base64 text per Add-Content append during copy.
const COPY_CHUNK_B64: usize = 30 * 1024;

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ============================================================================
// NTLM (compact NTLMv2 challenge-response)
// ============================================================================

type HmacMd5 = Hmac<Md5>;

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn windows_timestamp() -> u64 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix + 11_644_473_600) * 10_000_000
}

/// NTLM challenge-response state.
struct NtlmAuthenticator {
    username: String,
    password: SecretString,
    domain: String,
    workstation: String,
}

impl NtlmAuthenticator {
    fn new(username: &str, password: &str) -> Self {
        // DOMAIN\user and user@DOMAIN spellings both carry the domain.
        let (domain, user) = match username.split_once('\\') {
            Some((d, u)) => (d.to_string(), u.to_string()),
            None => match username.split_once('@') {
                Some((u, d)) => (d.to_string(), u.to_string()),
                None => (String::new(), username.to_string()),
            },
        };
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "WORKSTATION".to_string());
        Self {
            username: user,
            password: SecretString::new(password.to_string()),
            domain,
            workstation,
        }
    }

    /// NT hash: MD4 of the UTF-16LE password.
    fn nt_hash(&self) -> [u8; 16] {
        let mut hasher = Md4::new();
        hasher.update(utf16le(self.password.expose_secret()));
        let digest = hasher.finalize();
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&digest);
        hash
    }

    fn ntlmv2_hash(&self) -> [u8; 16] {
        let identity = format!(
            "{}{}",
            self.username.to_uppercase(),
            self.domain.to_uppercase()
        );
        hmac_md5(&self.nt_hash(), &utf16le(&identity))
    }

    /// Type 1 (Negotiate) message.
    fn negotiate_message(&self) -> Vec<u8> {
        let mut msg = b"NTLMSSP\0".to_vec();
        msg.extend_from_slice(&1u32.to_le_bytes());
        // UNICODE | OEM | REQUEST_TARGET | NTLM | ALWAYS_SIGN | EXTENDED_SESSIONSECURITY
        let flags: u32 = 0x0000_0001 | 0x0000_0002 | 0x0000_0004 | 0x0000_0200
            | 0x0000_8000 | 0x0008_0000;
        msg.extend_from_slice(&flags.to_le_bytes());

        let domain = self.domain.as_bytes();
        let workstation = self.workstation.as_bytes();
        let workstation_offset: u32 = 32;
        let domain_offset: u32 = workstation_offset + workstation.len() as u32;

        push_security_buffer(&mut msg, domain.len() as u16, domain_offset);
        push_security_buffer(&mut msg, workstation.len() as u16, workstation_offset);
        msg.extend_from_slice(workstation);
        msg.extend_from_slice(domain);
        msg
    }

    /// Type 3 (Authenticate) message for a Type 2 challenge.
    fn authenticate_message(&self, challenge: &[u8]) -> ConnectionResult<Vec<u8>> {
        if challenge.len() < 32 || &challenge[..8] != b"NTLMSSP\0" {
            return Err(ConnectionError::AuthenticationFailed {
                host: String::new(),
                message: "malformed NTLM challenge".into(),
            });
        }
        let server_challenge = &challenge[24..32];
        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_challenge);

        let ntlmv2_hash = self.ntlmv2_hash();

        // Blob: signature, reserved, timestamp, client challenge, unknown.
        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&windows_timestamp().to_le_bytes());
        blob.extend_from_slice(&client_challenge);
        blob.extend_from_slice(&0u32.to_le_bytes());

        // NTProofStr = HMAC-MD5(hash, server_challenge || blob)
        let mut data = server_challenge.to_vec();
        data.extend_from_slice(&blob);
        let nt_proof = hmac_md5(&ntlmv2_hash, &data);
        let mut nt_response = nt_proof.to_vec();
        nt_response.extend_from_slice(&blob);

        // LMv2 = HMAC-MD5(hash, server_challenge || client_challenge) || client_challenge
        let mut data = server_challenge.to_vec();
        data.extend_from_slice(&client_challenge);
        let mut lm_response = hmac_md5(&ntlmv2_hash, &data).to_vec();
        lm_response.extend_from_slice(&client_challenge);

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let mut msg = b"NTLMSSP\0".to_vec();
        msg.extend_from_slice(&3u32.to_le_bytes());

        let base: u32 = 88;
        let lm_offset = base;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let user_offset = domain_offset + domain.len() as u32;
        let workstation_offset = user_offset + user.len() as u32;
        let session_key_offset = workstation_offset + workstation.len() as u32;

        push_security_buffer(&mut msg, lm_response.len() as u16, lm_offset);
        push_security_buffer(&mut msg, nt_response.len() as u16, nt_offset);
        push_security_buffer(&mut msg, domain.len() as u16, domain_offset);
        push_security_buffer(&mut msg, user.len() as u16, user_offset);
        push_security_buffer(&mut msg, workstation.len() as u16, workstation_offset);
        push_security_buffer(&mut msg, 0, session_key_offset);

        let flags: u32 = 0x0000_0001 | 0x0000_0200 | 0x0000_8000 | 0x0008_0000;
        msg.extend_from_slice(&flags.to_le_bytes());
        // Version + MIC placeholders.
        msg.extend_from_slice(&[0u8; 8]);
        msg.extend_from_slice(&[0u8; 16]);

        msg.extend_from_slice(&lm_response);
        msg.extend_from_slice(&nt_response);
        msg.extend_from_slice(&domain);
        msg.extend_from_slice(&user);
        msg.extend_from_slice(&workstation);
        Ok(msg)
    }
}

fn push_security_buffer(msg: &mut Vec<u8>, len: u16, offset: u32) {
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

// ============================================================================
// Connection
// ============================================================================

/// WinRM connection to a Windows host.
pub struct WinRmConnection {
    info: Option<ConnectionInfo>,
    client: Option<Client>,
    ntlm: Option<NtlmAuthenticator>,
    connected: AtomicBool,
}

impl Default for WinRmConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl WinRmConnection {
    /// Create a new, unconnected WinRM connection.
    pub fn new() -> Self {
        Self {
            info: None,
            client: None,
            ntlm: None,
            connected: AtomicBool::new(false),
        }
    }

    fn endpoint_url(&self) -> String {
        let info = self.info.as_ref().expect("endpoint_url after connect");
        let scheme = if info.use_ssl { "https" } else { "http" };
        format!(
            "{}://{}:{}/wsman",
            scheme,
            info.host,
            info.effective_port()
        )
    }

    fn require_connected(&self) -> ConnectionResult<(&ConnectionInfo, &Client)> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected { host: self.host() });
        }
        match (&self.info, &self.client) {
            (Some(info), Some(client)) => Ok((info, client)),
            _ => Err(ConnectionError::NotConnected { host: self.host() }),
        }
    }

    async fn send_request(&self, body: &str) -> ConnectionResult<Response> {
        let (info, client) = self.require_connected()?;
        let url = self.endpoint_url();

        if let Some(ntlm) = &self.ntlm {
            // Round 1: negotiate, expect a 401 challenge.
            let negotiate = BASE64.encode(ntlm.negotiate_message());
            let response = client
                .post(&url)
                .header("Authorization", format!("Negotiate {}", negotiate))
                .header("Content-Type", "application/soap+xml;charset=UTF-8")
                .header("Content-Length", "0")
                .send()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed {
                    host: info.host.clone(),
                    message: format!("NTLM negotiate failed: {}", e),
                })?;

            if response.status().as_u16() != 401 {
                return Err(ConnectionError::AuthenticationFailed {
                    host: info.host.clone(),
                    message: format!(
                        "expected 401 challenge, got {}",
                        response.status()
                    ),
                });
            }
            let challenge_b64 = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Negotiate "))
                .ok_or_else(|| ConnectionError::AuthenticationFailed {
                    host: info.host.clone(),
                    message: "no NTLM challenge in response".into(),
                })?
                .to_string();
            let challenge = BASE64.decode(challenge_b64.trim()).map_err(|e| {
                ConnectionError::AuthenticationFailed {
                    host: info.host.clone(),
                    message: format!("invalid challenge encoding: {}", e),
                }
            })?;

            // Round 2: authenticate carrying the actual request body.
            let authenticate = BASE64.encode(ntlm.authenticate_message(&challenge)?);
            client
                .post(&url)
                .header("Authorization", format!("Negotiate {}", authenticate))
                .header("Content-Type", "application/soap+xml;charset=UTF-8")
                .body(body.to_string())
                .send()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed {
                    host: info.host.clone(),
                    message: format!("NTLM authenticate failed: {}", e),
                })
        } else {
            let mut request = client
                .post(&url)
                .header("Content-Type", "application/soap+xml;charset=UTF-8")
                .body(body.to_string());
            if let Some(password) = &info.password {
                request = request.basic_auth(&info.user, Some(password));
            }
            request
                .send()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed {
                    host: info.host.clone(),
                    message: format!("HTTP request failed: {}", e),
                })
        }
    }

    fn envelope_header(&self, action: &str, selector: Option<&str>, options: &str) -> String {
        let selector_xml = selector
            .map(|shell_id| {
                format!(
                    "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                    shell_id
                )
            })
            .unwrap_or_default();
        format!(
            r#"<s:Header>
    <a:To>{}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{}</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{}</w:OperationTimeout>
    {}{}
  </s:Header>"#,
            self.endpoint_url(),
            SHELL_RESOURCE_URI,
            action,
            Uuid::new_v4(),
            MAX_ENVELOPE_SIZE,
            OPERATION_TIMEOUT,
            selector_xml,
            options,
        )
    }

    fn envelope(&self, header: String, body: String) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{}" xmlns:a="{}" xmlns:w="{}" xmlns:rsp="{}">
  {}
  {}
</s:Envelope>"#,
            SOAP_ENV_NS, WSA_NS, WSMAN_NS, SHELL_NS, header, body
        )
    }

    async fn soap_call(&self, envelope: &str, what: &str) -> ConnectionResult<String> {
        let response = self.send_request(envelope).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ConnectionError::ExecutionFailed {
                host: self.host(),
                message: format!("{} failed: {} - {}", what, status, truncate(&body, 300)),
            });
        }
        Ok(body)
    }

    async fn create_shell(&self) -> ConnectionResult<String> {
        let options = r#"<w:OptionSet>
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">65001</w:Option>
    </w:OptionSet>"#;
        let header = self.envelope_header(ACTION_CREATE, None, options);
        let body = r#"<s:Body>
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>
  </s:Body>"#;
        let response = self
            .soap_call(&self.envelope(header, body.to_string()), "shell create")
            .await?;
        let shell_id = extract_tag(&response, "ShellId").ok_or_else(|| {
            ConnectionError::ExecutionFailed {
                host: self.host(),
                message: "no ShellId in create response".into(),
            }
        })?;
        debug!(shell_id = %shell_id, "created WinRM shell");
        Ok(shell_id)
    }

    async fn run_command(&self, shell_id: &str, command: &str) -> ConnectionResult<String> {
        let header = self.envelope_header(ACTION_COMMAND, Some(shell_id), "");
        let body = format!(
            r#"<s:Body>
    <rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>
    </rsp:CommandLine>
  </s:Body>"#,
            xml_escape(command)
        );
        let response = self
            .soap_call(&self.envelope(header, body), "command start")
            .await?;
        extract_tag(&response, "CommandId").ok_or_else(|| ConnectionError::ExecutionFailed {
            host: self.host(),
            message: "no CommandId in command response".into(),
        })
    }

    /// One Receive round-trip: (stdout chunk, stderr chunk, exit code, done).
    async fn receive_chunk(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> ConnectionResult<(String, String, Option<i32>, bool)> {
        let header = self.envelope_header(ACTION_RECEIVE, Some(shell_id), "");
        let body = format!(
            r#"<s:Body>
    <rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  </s:Body>"#,
            command_id
        );
        let response = self
            .soap_call(&self.envelope(header, body), "receive")
            .await?;

        let done = response.contains("CommandState/Done");
        let stdout = collect_streams(&response, "stdout");
        let stderr = collect_streams(&response, "stderr");
        let exit_code = extract_tag(&response, "ExitCode").and_then(|c| c.parse::<i32>().ok());
        Ok((stdout, stderr, exit_code, done))
    }

    async fn signal(&self, shell_id: &str, command_id: &str, code: &str) -> ConnectionResult<()> {
        let header = self.envelope_header(ACTION_SIGNAL, Some(shell_id), "");
        let body = format!(
            r#"<s:Body>
    <rsp:Signal CommandId="{}">
      <rsp:Code>http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/{}</rsp:Code>
    </rsp:Signal>
  </s:Body>"#,
            command_id, code
        );
        if let Err(e) = self.soap_call(&self.envelope(header, body), "signal").await {
            warn!(shell_id = %shell_id, error = %e, "signal failed");
        }
        Ok(())
    }

    async fn delete_shell(&self, shell_id: &str) -> ConnectionResult<()> {
        let header = self.envelope_header(ACTION_DELETE, Some(shell_id), "");
        if let Err(e) = self
            .soap_call(&self.envelope(header, "<s:Body/>".to_string()), "shell delete")
            .await
        {
            warn!(shell_id = %shell_id, error = %e, "shell delete failed");
        }
        Ok(())
    }

    /// Shape the wire command: PowerShell gets `-EncodedCommand`, cmd runs
    /// as-is.
    fn wire_command(command: &str, options: &ExecuteOptions) -> String {
        let shell = options.shell.as_deref().unwrap_or("powershell");
        if shell.eq_ignore_ascii_case("cmd") {
            command.to_string()
        } else {
            let mut script = String::new();
            for (key, value) in &options.env {
                script.push_str(&format!("$env:{} = '{}'; ", key, value.replace('\'', "''")));
            }
            if let Some(dir) = &options.working_dir {
                script.push_str(&format!("Set-Location '{}'; ", dir.replace('\'', "''")));
            }
            script.push_str(command);
            let encoded = BASE64.encode(utf16le(&script));
            format!(
                "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
                encoded
            )
        }
    }

    async fn powershell(&self, script: &str) -> ConnectionResult<CommandResult> {
        let options = ExecuteOptions {
            shell: Some("powershell".into()),
            ..Default::default()
        };
        self.execute(script, &options).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

/// Extract the text of the first `<ns:tag>` / `Name="tag">` occurrence.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!(":{}>", tag);
    if let Some(start) = xml.find(&open) {
        let start = start + open.len();
        if let Some(end) = xml[start..].find("</") {
            return Some(xml[start..start + end].to_string());
        }
    }
    let attr = format!("{}\">", tag);
    if let Some(start) = xml.find(&attr) {
        let start = start + attr.len();
        if let Some(end) = xml[start..].find("</") {
            return Some(xml[start..start + end].to_string());
        }
    }
    None
}

/// Decode and concatenate every `<rsp:Stream Name="{name}">` payload.
fn collect_streams(xml: &str, name: &str) -> String {
    let marker = format!("<rsp:Stream Name=\"{}\"", name);
    let mut out = String::new();
    let mut pos = 0;
    while let Some(start) = xml[pos..].find(&marker) {
        let abs = pos + start;
        let Some(tag_end) = xml[abs..].find('>') else { break };
        let content_start = abs + tag_end + 1;
        let Some(end) = xml[content_start..].find("</rsp:Stream>") else { break };
        let content = xml[content_start..content_start + end].trim();
        if !content.is_empty() && content != "/" {
            if let Ok(decoded) = BASE64.decode(content) {
                out.push_str(&String::from_utf8_lossy(&decoded));
            }
        }
        pos = content_start + end;
    }
    out
}

#[async_trait]
impl Connection for WinRmConnection {
    fn host(&self) -> String {
        self.info
            .as_ref()
            .map(|i| i.host.clone())
            .unwrap_or_default()
    }

    async fn connect(&mut self, info: ConnectionInfo) -> ConnectionResult<()> {
        let mut builder = Client::builder().timeout(Duration::from_secs(
            if info.timeout > 0 { info.timeout } else { 60 },
        ));
        if info.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ConnectionError::ConnectionFailed {
                host: info.host.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        // NTLM when both user and password are present; Basic otherwise.
        self.ntlm = match (&info.user, &info.password) {
            (user, Some(password)) if !user.is_empty() => {
                Some(NtlmAuthenticator::new(user, password))
            }
            _ => None,
        };
        self.client = Some(client);
        self.info = Some(info);
        self.connected.store(true, Ordering::SeqCst);

        // Probe the endpoint with a shell create/delete round-trip.
        match self.create_shell().await {
            Ok(shell_id) => {
                let _ = self.delete_shell(&shell_id).await;
                debug!(host = %self.host(), "WinRM connection established");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                self.client = None;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<CommandResult> {
        self.require_connected()?;
        let wire = Self::wire_command(command, options);
        trace!(host = %self.host(), "executing WinRM command");

        let shell_id = self.create_shell().await?;
        let command_id = match self.run_command(&shell_id, &wire).await {
            Ok(id) => id,
            Err(e) => {
                let _ = self.delete_shell(&shell_id).await;
                return Err(e);
            }
        };

        let deadline = options
            .timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0i32;
        loop {
            if options.cancellation.is_cancelled() {
                let _ = self.signal(&shell_id, &command_id, "terminate").await;
                let _ = self.delete_shell(&shell_id).await;
                return Err(ConnectionError::Cancelled);
            }
            if let Some(d) = deadline {
                if tokio::time::Instant::now() >= d {
                    let _ = self.signal(&shell_id, &command_id, "terminate").await;
                    let _ = self.delete_shell(&shell_id).await;
                    return Err(ConnectionError::Timeout {
                        host: self.host(),
                        seconds: options.timeout.unwrap_or(0),
                    });
                }
            }
            let (out, err, code, done) = match self.receive_chunk(&shell_id, &command_id).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = self.delete_shell(&shell_id).await;
                    return Err(e);
                }
            };
            stdout.push_str(&out);
            stderr.push_str(&err);
            if let Some(code) = code {
                exit_code = code;
            }
            if done {
                break;
            }
        }

        let _ = self.signal(&shell_id, &command_id, "terminate").await;
        let _ = self.delete_shell(&shell_id).await;

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
        self.require_connected()?;
        let wire = Self::wire_command(command, options);
        let shell_id = self.create_shell().await?;
        let command_id = match self.run_command(&shell_id, &wire).await {
            Ok(id) => id,
            Err(e) => {
                let _ = self.delete_shell(&shell_id).await;
                return Err(e);
            }
        };

        // The receive loop needs `&self` alive for its whole run, so events
        // are produced inline and queued before the receiver is handed out.
        // Non-terminal events never block: they are dropped once the queue
        // fills, with the last slot reserved for the terminal event.
        let capacity = STREAM_BUFFER.max(1024);
        let (tx, rx) = mpsc::channel::<StreamEvent>(capacity);
        let mut queued = 0usize;
        let mut push = |event: StreamEvent| {
            if queued + 1 < capacity && tx.try_send(event).is_ok() {
                queued += 1;
            }
        };
        if let Some(cb) = &options.progress_callback {
            cb(&ProgressInfo::new("executing", 0.0, "command started"));
        }
        push(StreamEvent::progress(ProgressInfo::new(
            "executing",
            0.0,
            "command started",
        )));

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0i32;
        let mut failed: Option<String> = None;
        let mut cancelled = false;

        loop {
            if options.cancellation.is_cancelled() {
                let _ = self.signal(&shell_id, &command_id, "terminate").await;
                cancelled = true;
                break;
            }
            match self.receive_chunk(&shell_id, &command_id).await {
                Ok((out, err, code, done)) => {
                    for line in out.lines() {
                        if let Some(cb) = &options.output_callback {
                            cb(line);
                        }
                        push(StreamEvent::stdout(line));
                    }
                    for line in err.lines() {
                        if let Some(cb) = &options.output_callback {
                            cb(line);
                        }
                        push(StreamEvent::stderr(line));
                    }
                    stdout.push_str(&out);
                    stderr.push_str(&err);
                    if let Some(code) = code {
                        exit_code = code;
                    }
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    failed = Some(e.to_string());
                    break;
                }
            }
        }

        let _ = self.delete_shell(&shell_id).await;

        let final_progress = ProgressInfo::new("completed", 100.0, "command finished");
        if let Some(cb) = &options.progress_callback {
            cb(&final_progress);
        }
        push(StreamEvent::progress(final_progress));

        let terminal = if cancelled {
            StreamEvent::done(CommandResult::failure(
                -1,
                stdout,
                format!("{}\ncommand cancelled", stderr),
            ))
        } else if let Some(message) = failed {
            StreamEvent::error(message)
        } else if exit_code == 0 {
            StreamEvent::done(CommandResult::success(stdout, stderr))
        } else {
            StreamEvent::done(CommandResult::failure(exit_code, stdout, stderr))
        };
        let _ = tx.try_send(terminal);

        Ok(rx)
    }

    async fn copy(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dest: &str,
        _mode: u32,
    ) -> ConnectionResult<()> {
        self.require_connected()?;
        let mut payload = Vec::new();
        src.read_to_end(&mut payload).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("read failed: {}", e))
        })?;
        let encoded = BASE64.encode(&payload);
        let dest_ps = dest.replace('\'', "''");
        let tmp = format!("$env:TEMP\\muster-{}.b64", Uuid::new_v4());

        // Stage the base64 text in chunks, then decode in one call.
        let mut offset = 0;
        let mut first = true;
        while offset < encoded.len() || first {
            let end = (offset + COPY_CHUNK_B64).min(encoded.len());
            let chunk = &encoded[offset..end];
            let script = if first {
                format!("Set-Content -Path \"{}\" -Value '{}' -NoNewline", tmp, chunk)
            } else {
                format!("Add-Content -Path \"{}\" -Value '{}' -NoNewline", tmp, chunk)
            };
            let result = self.powershell(&script).await?;
            if !result.success {
                return Err(ConnectionError::TransferFailed(format!(
                    "chunk upload failed: {}",
                    result.stderr
                )));
            }
            first = false;
            offset = end;
        }

        let script = format!(
            "$b64 = Get-Content -Raw -Path \"{tmp}\"; \
             [IO.File]::WriteAllBytes('{dest}', [Convert]::FromBase64String($b64)); \
             Remove-Item -Force \"{tmp}\"",
            tmp = tmp,
            dest = dest_ps
        );
        let result = self.powershell(&script).await?;
        if !result.success {
            return Err(ConnectionError::TransferFailed(format!(
                "write to {} failed: {}",
                dest, result.stderr
            )));
        }
        trace!(dest = %dest, bytes = payload.len(), "winrm copy complete");
        Ok(())
    }

    async fn fetch(&self, src: &str) -> ConnectionResult<FetchReader> {
        self.require_connected()?;
        let script = format!(
            "[Convert]::ToBase64String([IO.File]::ReadAllBytes('{}'))",
            src.replace('\'', "''")
        );
        let result = self.powershell(&script).await?;
        if !result.success {
            return Err(ConnectionError::TransferFailed(format!(
                "read of {} failed: {}",
                src, result.stderr
            )));
        }
        let cleaned: String = result
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = BASE64.decode(cleaned).map_err(|e| {
            ConnectionError::TransferFailed(format!("invalid base64 payload: {}", e))
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.client = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> ConnectionResult<()> {
        let result = self.powershell("$true").await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::ExecutionFailed {
                host: self.host(),
                message: "ping probe returned non-zero".into(),
            })
        }
    }

    async fn file_exists(&self, path: &str) -> ConnectionResult<bool> {
        let script = format!(
            "if (Test-Path -PathType Leaf '{}') {{ exit 0 }} else {{ exit 1 }}",
            path.replace('\'', "''")
        );
        Ok(self.powershell(&script).await?.success)
    }

    async fn create_directory(&self, path: &str, _mode: u32) -> ConnectionResult<()> {
        let script = format!(
            "New-Item -ItemType Directory -Force -Path '{}' | Out-Null",
            path.replace('\'', "''")
        );
        let result = self.powershell(&script).await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "mkdir {} failed: {}",
                path, result.stderr
            )))
        }
    }

    async fn remove_file(&self, path: &str) -> ConnectionResult<()> {
        let script = format!(
            "Remove-Item -Force -ErrorAction SilentlyContinue '{}'",
            path.replace('\'', "''")
        );
        let result = self.powershell(&script).await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "rm {} failed: {}",
                path, result.stderr
            )))
        }
    }
}

impl std::fmt::Debug for WinRmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmConnection")
            .field("host", &self.host())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntlm_negotiate_message_shape() {
        let auth = NtlmAuthenticator::new("CORP\\alice", "pw");
        assert_eq!(auth.domain, "CORP");
        assert_eq!(auth.username, "alice");

        let msg = auth.negotiate_message();
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn test_ntlm_user_at_domain() {
        let auth = NtlmAuthenticator::new("bob@corp.example", "pw");
        assert_eq!(auth.domain, "corp.example");
        assert_eq!(auth.username, "bob");
    }

    #[test]
    fn test_ntlm_authenticate_rejects_short_challenge() {
        let auth = NtlmAuthenticator::new("alice", "pw");
        assert!(auth.authenticate_message(b"short").is_err());
    }

    #[test]
    fn test_ntlm_authenticate_message_shape() {
        let auth = NtlmAuthenticator::new("alice", "pw");
        let mut challenge = b"NTLMSSP\0".to_vec();
        challenge.extend_from_slice(&2u32.to_le_bytes());
        challenge.extend_from_slice(&[0u8; 12]); // target name + flags
        challenge.extend_from_slice(&[0xAB; 8]); // server challenge
        challenge.extend_from_slice(&[0u8; 8]);

        let msg = auth.authenticate_message(&challenge).unwrap();
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);
        // NTLMv2 response = 16-byte proof + blob (>= 28 bytes).
        let nt_len = u16::from_le_bytes(msg[20..22].try_into().unwrap());
        assert!(nt_len as usize >= 44);
    }

    #[test]
    fn test_extract_tag_and_streams() {
        let xml = r#"<rsp:Shell><rsp:ShellId>SHELL-42</rsp:ShellId></rsp:Shell>"#;
        assert_eq!(extract_tag(xml, "ShellId").as_deref(), Some("SHELL-42"));

        let xml = format!(
            r#"<rsp:Stream Name="stdout" CommandId="c">{}</rsp:Stream>
               <rsp:Stream Name="stdout" CommandId="c">{}</rsp:Stream>
               <rsp:Stream Name="stderr" CommandId="c">{}</rsp:Stream>"#,
            BASE64.encode("hello "),
            BASE64.encode("world"),
            BASE64.encode("oops"),
        );
        assert_eq!(collect_streams(&xml, "stdout"), "hello world");
        assert_eq!(collect_streams(&xml, "stderr"), "oops");
    }

    #[test]
    fn test_wire_command_powershell_encoding() {
        let options = ExecuteOptions::default();
        let wire = WinRmConnection::wire_command("Get-Process", &options);
        assert!(wire.starts_with("powershell.exe -NoProfile -NonInteractive -EncodedCommand "));

        let cmd_options = ExecuteOptions {
            shell: Some("cmd".into()),
            ..Default::default()
        };
        assert_eq!(WinRmConnection::wire_command("dir", &cmd_options), "dir");
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let conn = WinRmConnection::new();
        let err = conn
            .execute("hostname", &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&'\""), "a&lt;b&gt;&amp;&apos;&quot;");
    }
}
