use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use base64::Engine;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_SCHEME: &str = "airsync";
pub const DEFAULT_DEVICE_NAME: &str = "My Mac";
pub const DEFAULT_SERVER_PORT: u16 = 6996;
pub const SECRET_BYTES: usize = 32;
const FINGERPRINT_BYTES: usize = 4;
const UNKNOWN_FAILURE: &str = "unknown error";

/// Characters kept verbatim in the device name.
///
/// This is the URL query character set minus the three delimiters the payload
/// itself is split on (`?`, `=`, `&`), so a decoded name never changes the
/// field layout.
const NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'$')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'-')
    .remove(b'.')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'@')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("no local network address is available")]
    MissingAddress,
    #[error("no server port is configured")]
    MissingPort,
    #[error("payload scheme must be {expected}://")]
    SchemeMismatch { expected: String },
    #[error("payload field `{0}` is missing or out of order")]
    MissingField(&'static str),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("invalid plus flag `{0}`")]
    InvalidFlag(String),
    #[error("device name is not valid percent-encoded UTF-8")]
    InvalidNameEncoding,
}

/// Owner of the pairing secret.
///
/// The secret is generated lazily on the first [`SecretStore::get`] and lives
/// until [`SecretStore::reset`]. Both operations take the same lock, so a
/// reader never observes a half-replaced value.
#[derive(Default)]
pub struct SecretStore {
    current: Mutex<Option<String>>,
}

impl SecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a previously issued secret. A blank value is treated as absent.
    #[must_use]
    pub fn with_secret(encoded: impl Into<String>) -> Self {
        let encoded = encoded.into();
        let current = if encoded.trim().is_empty() {
            None
        } else {
            Some(encoded)
        };
        Self {
            current: Mutex::new(current),
        }
    }

    pub fn get(&self) -> String {
        let mut current = self.lock();
        if let Some(secret) = current.as_ref() {
            return secret.clone();
        }
        let fresh = generate_secret();
        *current = Some(fresh.clone());
        fresh
    }

    /// Current secret without generating one.
    pub fn peek(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Drops the current secret. Every payload built from it is now void and
    /// the next [`SecretStore::get`] issues a new one.
    pub fn reset(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fingerprint = self.peek().map(|secret| secret_fingerprint(&secret));
        f.debug_struct("SecretStore")
            .field("fingerprint", &fingerprint)
            .finish()
    }
}

/// 256 bits from the thread-local CSPRNG, base64 encoded (44 chars).
///
/// The RNG aborts the process if the OS entropy source is unavailable; there
/// is no recoverable path for pairing without a secret.
pub fn generate_secret() -> String {
    let mut key = [0_u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Short, log-safe identifier for a secret.
pub fn secret_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Failed(String),
}

impl ConnectionStatus {
    /// A `Failed` status always carries a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if reason.trim().is_empty() {
            ConnectionStatus::Failed(UNKNOWN_FAILURE.to_owned())
        } else {
            ConnectionStatus::Failed(reason)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Neutral,
    Informational,
    Success,
    Error,
}

impl Severity {
    pub fn color_token(self) -> &'static str {
        match self {
            Severity::Neutral => "gray",
            Severity::Informational => "orange",
            Severity::Success => "green",
            Severity::Error => "red",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDescriptor {
    pub text: String,
    pub icon: &'static str,
    pub severity: Severity,
}

impl fmt::Display for StatusDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub fn describe(status: &ConnectionStatus) -> StatusDescriptor {
    // No catch-all arm: new server states must be mapped explicitly.
    let (text, icon, severity) = match status {
        ConnectionStatus::Stopped => ("Stopped".to_owned(), "xmark.circle", Severity::Neutral),
        ConnectionStatus::Starting => (
            "Starting...".to_owned(),
            "clock",
            Severity::Informational,
        ),
        ConnectionStatus::Started => ("Ready".to_owned(), "checkmark.circle", Severity::Success),
        ConnectionStatus::Failed(reason) if reason.trim().is_empty() => (
            format!("Failed: {UNKNOWN_FAILURE}"),
            "exclamationmark.triangle",
            Severity::Error,
        ),
        ConnectionStatus::Failed(reason) => (
            format!("Failed: {reason}"),
            "exclamationmark.triangle",
            Severity::Error,
        ),
    };
    StatusDescriptor {
        text,
        icon,
        severity,
    }
}

/// Everything a scanner needs to reach and authenticate to this machine.
///
/// Canonical form:
///
/// ```text
/// {scheme}://{address}:{port}?name={percent-encoded name}?plus={bool}?key={secret}
/// ```
///
/// Every field after the endpoint is introduced by `?`, not `&`. Existing
/// scanners split on that exact layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPayload {
    scheme: String,
    address: String,
    port: u16,
    device_name: String,
    plus: bool,
    secret: String,
}

impl PairingPayload {
    pub fn build(
        address: Option<&str>,
        port: Option<u16>,
        device_name: Option<&str>,
        plus: bool,
        secret: &str,
    ) -> Result<Self, PayloadError> {
        PairingPayloadBuilder::new().build(address, port, device_name, plus, secret)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn plus(&self) -> bool {
        self.plus
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PairingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}?name={}?plus={}?key={}",
            self.scheme,
            self.address,
            self.port,
            utf8_percent_encode(&self.device_name, NAME_ENCODE_SET),
            self.plus,
            self.secret
        )
    }
}

impl FromStr for PairingPayload {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(PayloadError::MissingField("scheme"))?;
        if scheme.is_empty() {
            return Err(PayloadError::MissingField("scheme"));
        }

        // The secret is base64 and never contains `?`; the name is encoded so
        // it cannot either.
        let mut fields = rest.splitn(4, '?');
        let endpoint = fields.next().ok_or(PayloadError::MissingField("address"))?;
        let name = field_value(fields.next(), "name")?;
        let plus = field_value(fields.next(), "plus")?;
        let secret = field_value(fields.next(), "key")?;

        let (address, port) = endpoint
            .rsplit_once(':')
            .ok_or(PayloadError::MissingField("port"))?;
        if address.is_empty() {
            return Err(PayloadError::MissingAddress);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| PayloadError::InvalidPort(port.to_owned()))?;
        let plus = plus
            .parse::<bool>()
            .map_err(|_| PayloadError::InvalidFlag(plus.to_owned()))?;
        let device_name = percent_decode_str(name)
            .decode_utf8()
            .map_err(|_| PayloadError::InvalidNameEncoding)?
            .into_owned();

        Ok(Self {
            scheme: scheme.to_owned(),
            address: address.to_owned(),
            port,
            device_name,
            plus,
            secret: secret.to_owned(),
        })
    }
}

fn field_value<'a>(
    field: Option<&'a str>,
    name: &'static str,
) -> Result<&'a str, PayloadError> {
    field
        .and_then(|f| f.strip_prefix(name))
        .and_then(|f| f.strip_prefix('='))
        .ok_or(PayloadError::MissingField(name))
}

/// Builds payloads for one scheme.
#[derive(Debug, Clone)]
pub struct PairingPayloadBuilder {
    scheme: String,
    placeholder_name: String,
}

impl PairingPayloadBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_owned(),
            placeholder_name: DEFAULT_DEVICE_NAME.to_owned(),
        }
    }

    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    #[must_use]
    pub fn placeholder_name(mut self, name: impl Into<String>) -> Self {
        self.placeholder_name = name.into();
        self
    }

    /// Checks that a scanner could reach `address:port`.
    ///
    /// Surrounding whitespace is not part of an address and is dropped.
    pub fn endpoint<'a>(
        &self,
        address: Option<&'a str>,
        port: Option<u16>,
    ) -> Result<(&'a str, u16), PayloadError> {
        let address = address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(PayloadError::MissingAddress)?;
        let port = port.ok_or(PayloadError::MissingPort)?;
        Ok((address, port))
    }

    /// Fails without producing any string when the endpoint is unknown.
    /// The device name is embedded exactly as given; only an absent name
    /// falls back to the placeholder.
    pub fn build(
        &self,
        address: Option<&str>,
        port: Option<u16>,
        device_name: Option<&str>,
        plus: bool,
        secret: &str,
    ) -> Result<PairingPayload, PayloadError> {
        let (address, port) = self.endpoint(address, port)?;
        let device_name = device_name.unwrap_or(&self.placeholder_name);

        Ok(PairingPayload {
            scheme: self.scheme.clone(),
            address: address.to_owned(),
            port,
            device_name: device_name.to_owned(),
            plus,
            secret: secret.to_owned(),
        })
    }

    /// Parses a scanned payload, rejecting any scheme but this builder's.
    pub fn parse(&self, scanned: &str) -> Result<PairingPayload, PayloadError> {
        let payload: PairingPayload = scanned.parse()?;
        if payload.scheme != self.scheme {
            return Err(PayloadError::SchemeMismatch {
                expected: self.scheme.clone(),
            });
        }
        Ok(payload)
    }

    pub fn build_string(
        &self,
        address: Option<&str>,
        port: Option<u16>,
        device_name: Option<&str>,
        plus: bool,
        secret: &str,
    ) -> Result<String, PayloadError> {
        self.build(address, port, device_name, plus, secret)
            .map(|payload| payload.encode())
    }
}

impl Default for PairingPayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}
