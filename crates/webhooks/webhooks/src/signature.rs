//! HMAC signature generation and verification.
//!
//! Providers sign webhook deliveries with a header of the form
//! `t=<unix seconds>,v1=<hex hmac>[,v1=...]`. Multiple `v1` entries
//! appear while the provider rolls its signing secret; a delivery
//! verifies when any of them matches.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default acceptance window for signature timestamps, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Webhook signer for generating and verifying signatures.
pub struct WebhookSigner {
    secret: String,
}

impl WebhookSigner {
    /// Creates a new signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generates a signature for the given payload and timestamp.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");

        // Sign: timestamp.payload
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let result = mac.finalize();
        hex::encode(result.into_bytes())
    }

    /// Generates a full signature header value.
    pub fn sign_header(&self, timestamp: i64, payload: &[u8]) -> String {
        let signature = self.sign(timestamp, payload);
        format!("t={},v1={}", timestamp, signature)
    }

    /// Verifies a single signature against the payload.
    pub fn verify(&self, signature: &str, timestamp: i64, payload: &[u8]) -> bool {
        let expected = self.sign(timestamp, payload);
        constant_time_compare(&expected, signature)
    }

    /// Parses and verifies a signature header.
    ///
    /// The timestamp must fall within `tolerance_secs` of now, in either
    /// direction. The tolerance bounds how long a captured delivery can
    /// be replayed.
    pub fn verify_header(
        &self,
        header: &str,
        payload: &[u8],
        tolerance_secs: i64,
    ) -> Result<(), SignatureError> {
        let parsed = SignatureHeader::parse(header)?;

        let now = chrono::Utc::now().timestamp();
        if (now - parsed.timestamp).abs() > tolerance_secs {
            return Err(SignatureError::Expired);
        }

        if parsed
            .signatures
            .iter()
            .any(|signature| self.verify(signature, parsed.timestamp, payload))
        {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }
}

/// A parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Unix-seconds timestamp the sender signed with.
    pub timestamp: i64,
    /// All `v1` signatures carried by the header.
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parses a `t=...,v1=...` header.
    ///
    /// Keys other than `t` and `v1` are ignored; providers ship scheme
    /// markers consumers are expected to skip. Missing timestamp or a
    /// header without any `v1` entry is a format error.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let mut kv = part.splitn(2, '=');
            let key = kv.next().ok_or(SignatureError::InvalidFormat)?;
            let value = kv.next().ok_or(SignatureError::InvalidFormat)?;
            match key.trim() {
                "t" => {
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::InvalidFormat)?;
                    timestamp = Some(parsed);
                }
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::InvalidFormat)?;
        if signatures.is_empty() {
            return Err(SignatureError::InvalidFormat);
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Invalid signature format.
    InvalidFormat,
    /// Signature is invalid.
    Invalid,
    /// Signature has expired.
    Expired,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidFormat => write!(f, "Invalid signature format"),
            SignatureError::Invalid => write!(f, "Invalid signature"),
            SignatureError::Expired => write!(f, "Signature expired"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
