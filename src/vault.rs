//! Vault for encrypted secrets management.
//!
//! Implements the `$ANSIBLE_VAULT` armored container: the body is the hex
//! encoding of `salt(32) || hmac(32) || ciphertext`, wrapped at 80 columns,
//! where the ciphertext is PKCS7-padded plaintext under AES-256-CTR. Keys
//! derive from the password via PBKDF2-HMAC-SHA-256 (10000 iterations,
//! 80 bytes split into aes_key/hmac_key/iv). Format `1.1` is the default;
//! `1.2` adds a vault id as a fourth header field. Secrets may also appear
//! inline in structured documents as a `!vault |` block indented 10 spaces.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Vault header marker.
pub const VAULT_HEADER: &str = "$ANSIBLE_VAULT";

/// Sentinel prefixing inline-encrypted strings in structured documents.
pub const INLINE_PREFIX: &str = "!vault |";

/// Indent applied to every body line of the inline form.
const INLINE_INDENT: &str = "          ";

/// PBKDF2 iteration count.
const KDF_ITERATIONS: u32 = 10_000;

/// AES block size; PKCS7 pads to this boundary.
const BLOCK_SIZE: usize = 16;

/// Hex body lines wrap at this column.
const WRAP_COLUMN: usize = 80;

const SALT_LEN: usize = 32;
const HMAC_LEN: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing/short header, truncated body, or non-hex content.
    #[error("Invalid vault format: {0}")]
    InvalidFormat(String),

    /// The header names a format version this implementation does not speak.
    #[error("Unsupported vault version: {0}")]
    UnsupportedVersion(String),

    /// HMAC mismatch: wrong password, or no registered vault verified.
    #[error("Invalid vault password")]
    InvalidPassword,

    /// PKCS7 padding of the decrypted plaintext is malformed.
    #[error("Invalid padding in decrypted data")]
    InvalidPadding,

    /// No vault registered under the requested id.
    #[error("Vault id '{0}' not found")]
    VaultNotFound(String),

    /// Decrypted bytes are not valid UTF-8.
    #[error("Decrypted content is not valid UTF-8")]
    InvalidUtf8,

    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Derived key material, zeroed on drop.
struct DerivedKeys {
    aes_key: Zeroizing<[u8; 32]>,
    hmac_key: Zeroizing<[u8; 32]>,
    iv: Zeroizing<[u8; 16]>,
}

fn derive_keys(password: &str, salt: &[u8]) -> DerivedKeys {
    let mut okm = Zeroizing::new([0u8; 80]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, okm.as_mut());

    let mut aes_key = Zeroizing::new([0u8; 32]);
    let mut hmac_key = Zeroizing::new([0u8; 32]);
    let mut iv = Zeroizing::new([0u8; 16]);
    aes_key.copy_from_slice(&okm[..32]);
    hmac_key.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..80]);

    DerivedKeys {
        aes_key,
        hmac_key,
        iv,
    }
}

/// Apply PKCS7 padding up to the AES block size.
fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

/// Strip PKCS7 padding, rejecting malformed tails.
fn pkcs7_unpad(data: &[u8]) -> VaultResult<&[u8]> {
    let last = *data.last().ok_or(VaultError::InvalidPadding)? as usize;
    if last == 0 || last > BLOCK_SIZE || last > data.len() {
        return Err(VaultError::InvalidPadding);
    }
    let tail = &data[data.len() - last..];
    if tail.iter().any(|&b| b as usize != last) {
        return Err(VaultError::InvalidPadding);
    }
    Ok(&data[..data.len() - last])
}

/// Parsed header of an armored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VaultEnvelope {
    version: String,
    vault_id: Option<String>,
    body_hex: String,
}

fn parse_envelope(armored: &str) -> VaultResult<VaultEnvelope> {
    let mut lines = armored.lines();
    let header = lines
        .next()
        .ok_or_else(|| VaultError::InvalidFormat("empty input".into()))?
        .trim();

    let fields: Vec<&str> = header.split(';').collect();
    if fields.len() < 3 || fields[0] != VAULT_HEADER {
        return Err(VaultError::InvalidFormat(format!(
            "bad header line: '{}'",
            header
        )));
    }
    let version = fields[1].to_string();
    match version.as_str() {
        "1.1" => {}
        "1.2" => {
            if fields.len() < 4 || fields[3].is_empty() {
                return Err(VaultError::InvalidFormat(
                    "version 1.2 header missing vault id".into(),
                ));
            }
        }
        other => return Err(VaultError::UnsupportedVersion(other.to_string())),
    }
    if fields[2] != "AES256" {
        return Err(VaultError::InvalidFormat(format!(
            "unknown cipher '{}'",
            fields[2]
        )));
    }
    let vault_id = (version == "1.2").then(|| fields[3].to_string());

    let body_hex: String = lines.map(str::trim).collect();
    if body_hex.is_empty() {
        return Err(VaultError::InvalidFormat("empty body".into()));
    }

    Ok(VaultEnvelope {
        version,
        vault_id,
        body_hex,
    })
}

/// Returns true when a string carries an armored or inline vault payload.
pub fn is_encrypted(content: &str) -> bool {
    let trimmed = content.trim_start();
    trimmed.starts_with(VAULT_HEADER) || trimmed.starts_with(INLINE_PREFIX)
}

/// A single-identity vault: one `(vault_id, password)` pair.
pub struct Vault {
    vault_id: Option<String>,
    password: SecretString,
}

impl Vault {
    /// Create a vault with no id (format `1.1` output).
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            vault_id: None,
            password: SecretString::new(password.into()),
        }
    }

    /// Create a vault with an id (format `1.2` output).
    pub fn with_id(vault_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            vault_id: Some(vault_id.into()),
            password: SecretString::new(password.into()),
        }
    }

    /// This vault's id, if any.
    pub fn vault_id(&self) -> Option<&str> {
        self.vault_id.as_deref()
    }

    /// Encrypt `plaintext` into armored text.
    pub fn encrypt(&self, plaintext: &[u8]) -> VaultResult<String> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let keys = derive_keys(self.password.expose_secret(), &salt);

        let mut ciphertext = pkcs7_pad(plaintext);
        let mut cipher = Aes256Ctr::new((&*keys.aes_key).into(), (&*keys.iv).into());
        cipher.apply_keystream(&mut ciphertext);

        let mut mac = HmacSha256::new_from_slice(&*keys.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut body = Vec::with_capacity(SALT_LEN + HMAC_LEN + ciphertext.len());
        body.extend_from_slice(&salt);
        body.extend_from_slice(&tag);
        body.extend_from_slice(&ciphertext);

        let hex_body = hex::encode(body);
        let wrapped: Vec<&str> = hex_body
            .as_bytes()
            .chunks(WRAP_COLUMN)
            .map(|c| std::str::from_utf8(c).expect("hex is ASCII"))
            .collect();

        let header = match &self.vault_id {
            Some(id) => format!("{};1.2;AES256;{}", VAULT_HEADER, id),
            None => format!("{};1.1;AES256", VAULT_HEADER),
        };

        trace!(body_len = hex_body.len(), "encrypted vault payload");
        Ok(format!("{}\n{}\n", header, wrapped.join("\n")))
    }

    /// Encrypt a UTF-8 string into armored text.
    pub fn encrypt_string(&self, plaintext: &str) -> VaultResult<String> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt armored text produced by [`encrypt`](Self::encrypt).
    ///
    /// The HMAC tag is verified with a constant-time compare before any AES
    /// work; a mismatch fails with [`VaultError::InvalidPassword`].
    pub fn decrypt(&self, armored: &str) -> VaultResult<Vec<u8>> {
        let envelope = parse_envelope(armored)?;
        self.decrypt_envelope(&envelope)
    }

    /// Decrypt armored text into a UTF-8 string.
    pub fn decrypt_string(&self, armored: &str) -> VaultResult<String> {
        let bytes = self.decrypt(armored)?;
        String::from_utf8(bytes).map_err(|_| VaultError::InvalidUtf8)
    }

    fn decrypt_envelope(&self, envelope: &VaultEnvelope) -> VaultResult<Vec<u8>> {
        let body = hex::decode(&envelope.body_hex)
            .map_err(|e| VaultError::InvalidFormat(format!("non-hex body: {}", e)))?;

        if body.len() < SALT_LEN + HMAC_LEN + BLOCK_SIZE {
            return Err(VaultError::InvalidFormat(format!(
                "body too short: {} bytes",
                body.len()
            )));
        }

        let salt = &body[..SALT_LEN];
        let tag = &body[SALT_LEN..SALT_LEN + HMAC_LEN];
        let ciphertext = &body[SALT_LEN + HMAC_LEN..];

        let keys = derive_keys(self.password.expose_secret(), salt);

        let mut mac = HmacSha256::new_from_slice(&*keys.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(ciphertext);
        let expected = mac.finalize().into_bytes();
        if expected.as_slice().ct_eq(tag).unwrap_u8() != 1 {
            return Err(VaultError::InvalidPassword);
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new((&*keys.aes_key).into(), (&*keys.iv).into());
        cipher.apply_keystream(&mut plaintext);

        let unpadded = pkcs7_unpad(&plaintext)?.to_vec();
        Ok(unpadded)
    }

    /// Encrypt into the inline `!vault |` form used inside structured
    /// documents: armored text with every body line indented 10 spaces.
    pub fn encrypt_inline(&self, plaintext: &str) -> VaultResult<String> {
        let armored = self.encrypt_string(plaintext)?;
        let mut out = String::from(INLINE_PREFIX);
        out.push('\n');
        for line in armored.lines() {
            out.push_str(INLINE_INDENT);
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Encrypt the contents of `path` in place.
    pub fn encrypt_file(&self, path: impl AsRef<Path>) -> VaultResult<()> {
        let path = path.as_ref();
        let content = std::fs::read(path)?;
        if is_encrypted(&String::from_utf8_lossy(&content)) {
            return Err(VaultError::InvalidFormat(format!(
                "{} is already vault encrypted",
                path.display()
            )));
        }
        let armored = self.encrypt(&content)?;
        std::fs::write(path, armored)?;
        debug!(path = %path.display(), "encrypted file");
        Ok(())
    }

    /// Decrypt the contents of `path` in place.
    pub fn decrypt_file(&self, path: impl AsRef<Path>) -> VaultResult<()> {
        let path = path.as_ref();
        let armored = std::fs::read_to_string(path)?;
        let plaintext = self.decrypt(&armored)?;
        std::fs::write(path, plaintext)?;
        debug!(path = %path.display(), "decrypted file");
        Ok(())
    }

    /// Decrypt `path` and return its plaintext without touching the file.
    pub fn view_file(&self, path: impl AsRef<Path>) -> VaultResult<String> {
        let armored = std::fs::read_to_string(path.as_ref())?;
        self.decrypt_string(&armored)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("vault_id", &self.vault_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Strip the `!vault |` sentinel and common indentation from an inline
/// payload, yielding armored text.
pub fn parse_inline(inline: &str) -> VaultResult<String> {
    let rest = inline
        .trim_start()
        .strip_prefix(INLINE_PREFIX)
        .ok_or_else(|| VaultError::InvalidFormat("missing inline sentinel".into()))?;

    let lines: Vec<&str> = rest
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(VaultError::InvalidFormat("empty inline payload".into()));
    }
    Ok(lines.join("\n"))
}

/// Owns several `(vault_id, password)` pairs and routes decryption.
#[derive(Debug, Default)]
pub struct VaultManager {
    vaults: Vec<Vault>,
}

impl VaultManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vault. Later registrations with the same id shadow earlier
    /// ones for `get_vault`, but all remain decryption candidates.
    pub fn add_vault(&mut self, vault: Vault) {
        self.vaults.push(vault);
    }

    /// Register an `(id, password)` pair.
    pub fn add_password(&mut self, vault_id: Option<&str>, password: impl Into<String>) {
        let vault = match vault_id {
            Some(id) => Vault::with_id(id, password),
            None => Vault::new(password),
        };
        self.add_vault(vault);
    }

    /// Number of registered vaults.
    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    /// Whether no vault is registered.
    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Look up the vault registered under `id`.
    pub fn get_vault(&self, id: &str) -> VaultResult<&Vault> {
        self.vaults
            .iter()
            .rev()
            .find(|v| v.vault_id() == Some(id))
            .ok_or_else(|| VaultError::VaultNotFound(id.to_string()))
    }

    /// Encrypt with the vault registered under `id`, or the first registered
    /// vault when `id` is `None`.
    pub fn encrypt(&self, plaintext: &str, vault_id: Option<&str>) -> VaultResult<String> {
        let vault = match vault_id {
            Some(id) => self.get_vault(id)?,
            None => self
                .vaults
                .first()
                .ok_or_else(|| VaultError::VaultNotFound("default".into()))?,
        };
        vault.encrypt_string(plaintext)
    }

    /// Decrypt armored text: the id embedded in a `1.2` header is tried
    /// first; on miss or HMAC failure every registered vault is tried until
    /// one verifies.
    pub fn decrypt(&self, armored: &str) -> VaultResult<Vec<u8>> {
        let envelope = parse_envelope(armored)?;

        if let Some(id) = &envelope.vault_id {
            if let Ok(vault) = self.get_vault(id) {
                match vault.decrypt_envelope(&envelope) {
                    Ok(plain) => return Ok(plain),
                    Err(VaultError::InvalidPassword) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for vault in &self.vaults {
            match vault.decrypt_envelope(&envelope) {
                Ok(plain) => return Ok(plain),
                Err(VaultError::InvalidPassword) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VaultError::InvalidPassword)
    }

    /// Decrypt armored text into a UTF-8 string.
    pub fn decrypt_string(&self, armored: &str) -> VaultResult<String> {
        let bytes = self.decrypt(armored)?;
        String::from_utf8(bytes).map_err(|_| VaultError::InvalidUtf8)
    }

    /// Re-encrypt `path` under a different vault.
    pub fn rekey_file(&self, path: impl AsRef<Path>, new_vault: &Vault) -> VaultResult<()> {
        let path = path.as_ref();
        let armored = std::fs::read_to_string(path)?;
        let plaintext = self.decrypt(&armored)?;
        let rearmored = new_vault.encrypt(&plaintext)?;
        std::fs::write(path, rearmored)?;
        debug!(path = %path.display(), "rekeyed file");
        Ok(())
    }

    /// Decrypt `path` and apply `edit` to its plaintext; the edited text is
    /// encrypted back with the vault that verified. A no-op edit leaves the
    /// file untouched.
    pub fn edit_file<F>(&self, path: impl AsRef<Path>, edit: F) -> VaultResult<()>
    where
        F: FnOnce(String) -> String,
    {
        let path = path.as_ref();
        let armored = std::fs::read_to_string(path)?;
        let plaintext = self.decrypt_string(&armored)?;
        let edited = edit(plaintext.clone());
        if edited == plaintext {
            return Ok(());
        }
        let vault_id = parse_envelope(&armored)?.vault_id;
        let vault = match vault_id.as_deref() {
            Some(id) => self.get_vault(id).unwrap_or_else(|_| &self.vaults[0]),
            None => &self.vaults[0],
        };
        std::fs::write(path, vault.encrypt_string(&edited)?)?;
        Ok(())
    }

    /// Walk a value tree of maps/sequences/strings in place, decrypting
    /// every string that begins with the armored header or the inline
    /// `!vault |` prefix.
    pub fn process_variables(&self, value: &mut JsonValue) -> VaultResult<()> {
        match value {
            JsonValue::String(s) => {
                let trimmed = s.trim_start();
                if trimmed.starts_with(INLINE_PREFIX) {
                    let armored = parse_inline(trimmed)?;
                    *s = self.decrypt_string(&armored)?;
                } else if trimmed.starts_with(VAULT_HEADER) {
                    *s = self.decrypt_string(trimmed)?;
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    self.process_variables(item)?;
                }
            }
            JsonValue::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.process_variables(v)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Decrypt vault-bearing strings in a flat variable map.
    pub fn process_variable_map(
        &self,
        vars: &mut IndexMap<String, JsonValue>,
    ) -> VaultResult<()> {
        for (_, v) in vars.iter_mut() {
            self.process_variables(v)?;
        }
        Ok(())
    }

    /// Build a manager from the process environment.
    ///
    /// Honors `ANSIBLE_VAULT_PASSWORD_FILE` (path to a password file),
    /// `ANSIBLE_VAULT_PASSWORD` (literal password), and
    /// `ANSIBLE_VAULT_IDENTITY_LIST` (comma-separated `id@source` where the
    /// source is a readable file or an executable script whose stdout is the
    /// password).
    pub fn from_environment() -> VaultResult<Self> {
        let mut manager = Self::new();

        if let Ok(path) = std::env::var("ANSIBLE_VAULT_PASSWORD_FILE") {
            let password = read_password_source(Path::new(&path))?;
            manager.add_password(None, password);
        }

        if let Ok(password) = std::env::var("ANSIBLE_VAULT_PASSWORD") {
            manager.add_password(None, password);
        }

        if let Ok(list) = std::env::var("ANSIBLE_VAULT_IDENTITY_LIST") {
            for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (id, source) = entry.split_once('@').ok_or_else(|| {
                    VaultError::InvalidFormat(format!(
                        "identity entry '{}' is not id@source",
                        entry
                    ))
                })?;
                let password = read_password_source(Path::new(source))?;
                manager.add_password(Some(id), password);
            }
        }

        Ok(manager)
    }
}

/// Read a vault password from a file, or from a script's stdout when the
/// file is executable.
fn read_password_source(path: &Path) -> VaultResult<String> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = path.metadata() {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                let output = std::process::Command::new(path).output()?;
                if !output.status.success() {
                    return Err(VaultError::InvalidFormat(format!(
                        "password script {} exited with {}",
                        path.display(),
                        output.status
                    )));
                }
                return Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
            }
        }
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = Vault::new("test_password_123");
        let armored = vault.encrypt_string("secret!").unwrap();

        assert!(armored.starts_with("$ANSIBLE_VAULT;1.1;AES256\n"));
        for line in armored.lines().skip(1) {
            assert!(line.len() <= 80);
            assert!(line.chars().all(|c| c.is_ascii_hexdigit()));
        }

        let plain = vault.decrypt_string(&armored).unwrap();
        assert_eq!(plain, "secret!");
    }

    #[test]
    fn test_wrong_password_fails_before_decryption() {
        let vault = Vault::new("test_password_123");
        let armored = vault.encrypt_string("secret!").unwrap();

        let wrong = Vault::new("wrong");
        assert!(matches!(
            wrong.decrypt(&armored),
            Err(VaultError::InvalidPassword)
        ));
    }

    #[test]
    fn test_round_trip_binary_and_block_boundary() {
        let vault = Vault::new("pw");
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let armored = vault.encrypt(&data).unwrap();
            assert_eq!(vault.decrypt(&armored).unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn test_version_12_carries_vault_id() {
        let vault = Vault::with_id("prod", "pw");
        let armored = vault.encrypt_string("hello").unwrap();
        assert!(armored.starts_with("$ANSIBLE_VAULT;1.2;AES256;prod\n"));
        assert_eq!(vault.decrypt_string(&armored).unwrap(), "hello");
    }

    #[test]
    fn test_malformed_inputs() {
        let vault = Vault::new("pw");
        assert!(matches!(
            vault.decrypt(""),
            Err(VaultError::InvalidFormat(_))
        ));
        assert!(matches!(
            vault.decrypt("$ANSIBLE_VAULT;9.9;AES256\nabcd"),
            Err(VaultError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            vault.decrypt("$ANSIBLE_VAULT;1.1;AES256\nzzzz"),
            Err(VaultError::InvalidFormat(_))
        ));
        assert!(matches!(
            vault.decrypt("$ANSIBLE_VAULT;1.1;AES256\nabcd"),
            Err(VaultError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_pkcs7_pad_unpad_identity() {
        for len in 0..=(2 * BLOCK_SIZE) {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert_eq!(pkcs7_unpad(&padded).unwrap(), &data[..]);
        }
    }

    #[test]
    fn test_pkcs7_rejects_malformed_tail() {
        assert!(pkcs7_unpad(&[]).is_err());
        // Last byte claims 3 bytes of padding, but the tail is not uniform.
        assert!(pkcs7_unpad(&[1, 2, 3, 4, 5, 9, 2, 3]).is_err());
        // Pad length above the block size.
        let mut block = vec![0u8; 16];
        block[15] = 17;
        assert!(pkcs7_unpad(&block).is_err());
        // Zero pad length.
        block[15] = 0;
        assert!(pkcs7_unpad(&block).is_err());
    }

    #[test]
    fn test_inline_round_trip() {
        let vault = Vault::new("pw");
        let inline = vault.encrypt_inline("db_password=42").unwrap();
        assert!(inline.starts_with("!vault |\n"));
        for line in inline.lines().skip(1) {
            assert!(line.starts_with(INLINE_INDENT));
        }

        let armored = parse_inline(&inline).unwrap();
        assert_eq!(vault.decrypt_string(&armored).unwrap(), "db_password=42");
    }

    #[test]
    fn test_manager_routes_by_header_id() {
        let mut manager = VaultManager::new();
        manager.add_password(Some("dev"), "dev_pw");
        manager.add_password(Some("prod"), "prod_pw");

        let armored = manager
            .get_vault("prod")
            .unwrap()
            .encrypt_string("the prod secret")
            .unwrap();
        assert_eq!(
            manager.decrypt_string(&armored).unwrap(),
            "the prod secret"
        );
    }

    #[test]
    fn test_manager_falls_back_across_vaults() {
        let mut manager = VaultManager::new();
        manager.add_password(None, "first");
        manager.add_password(None, "second");

        // Encrypted by the second vault; the first fails HMAC and is skipped.
        let armored = Vault::new("second").encrypt_string("x").unwrap();
        assert_eq!(manager.decrypt_string(&armored).unwrap(), "x");

        let foreign = Vault::new("third").encrypt_string("x").unwrap();
        assert!(matches!(
            manager.decrypt(&foreign),
            Err(VaultError::InvalidPassword)
        ));
    }

    #[test]
    fn test_manager_unknown_id_errors() {
        let manager = VaultManager::new();
        assert!(matches!(
            manager.get_vault("missing"),
            Err(VaultError::VaultNotFound(_))
        ));
    }

    #[test]
    fn test_process_variables_decrypts_nested() {
        let mut manager = VaultManager::new();
        manager.add_password(None, "pw");
        let vault = Vault::new("pw");

        let armored = vault.encrypt_string("s3cr3t").unwrap();
        let inline = vault.encrypt_inline("inline-s3cr3t").unwrap();

        let mut tree = serde_json::json!({
            "plain": "visible",
            "db": { "password": armored },
            "list": [ inline, "untouched" ],
        });
        manager.process_variables(&mut tree).unwrap();

        assert_eq!(tree["plain"], "visible");
        assert_eq!(tree["db"]["password"], "s3cr3t");
        assert_eq!(tree["list"][0], "inline-s3cr3t");
        assert_eq!(tree["list"][1], "untouched");
    }

    #[test]
    #[serial_test::serial]
    fn test_manager_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let pw_file = dir.path().join("vault_pass.txt");
        std::fs::write(&pw_file, "env-pw\n").unwrap();

        std::env::set_var("ANSIBLE_VAULT_PASSWORD_FILE", &pw_file);
        std::env::set_var(
            "ANSIBLE_VAULT_IDENTITY_LIST",
            format!("dev@{}", pw_file.display()),
        );
        let manager = VaultManager::from_environment();
        std::env::remove_var("ANSIBLE_VAULT_PASSWORD_FILE");
        std::env::remove_var("ANSIBLE_VAULT_IDENTITY_LIST");

        let manager = manager.unwrap();
        assert!(manager.len() >= 2);
        assert!(manager.get_vault("dev").is_ok());

        let armored = Vault::new("env-pw").encrypt_string("x").unwrap();
        assert_eq!(manager.decrypt_string(&armored).unwrap(), "x");
    }

    #[test]
    fn test_file_encrypt_decrypt_rekey() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yml");
        std::fs::write(&path, "api_key: hunter2\n").unwrap();

        let vault = Vault::new("pw");
        vault.encrypt_file(&path).unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.starts_with(VAULT_HEADER));

        // Double encryption is rejected.
        assert!(vault.encrypt_file(&path).is_err());

        let mut manager = VaultManager::new();
        manager.add_password(None, "pw");
        let new_vault = Vault::with_id("prod", "new_pw");
        manager.rekey_file(&path, &new_vault).unwrap();
        assert_eq!(
            new_vault.view_file(&path).unwrap(),
            "api_key: hunter2\n"
        );

        new_vault.decrypt_file(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "api_key: hunter2\n"
        );
    }
}
