use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// An encoded still image (JPEG, PNG, ...) as produced by a camera or upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl EncodedImage {
    /// Wrap raw encoded bytes, sniffing the MIME type from the magic bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            mime_type: sniff_mime(&data).to_string(),
            data,
        }
    }

    /// Parse either a `data:image/...;base64,` URL or a bare base64 payload.
    ///
    /// The prefix is stripped before decoding; a bare payload is sniffed.
    pub fn from_data_url(url: &str) -> Result<Self, base64::DecodeError> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((mime, payload)) = rest.split_once(";base64,") {
                return Ok(Self {
                    mime_type: mime.to_string(),
                    data: B64.decode(payload)?,
                });
            }
        }
        Ok(Self::from_bytes(B64.decode(url)?))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Base64 payload without any data-URL prefix.
    pub fn to_base64(&self) -> String {
        B64.encode(&self.data)
    }
}

fn sniff_mime(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

mod base64_bytes {
    use super::B64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        B64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Match confidence, always within [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0.0);

    /// Clamp into [0, 1]. Non-finite input becomes 0.
    pub fn new(value: f64) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self::ZERO
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Rounded percentage, e.g. 0.92 → 92.
    pub fn percent(self) -> u32 {
        (self.0 * 100.0).round() as u32
    }
}

impl From<f64> for Confidence {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> f64 {
        c.0
    }
}

/// An enrolled person. Never mutated after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub department: String,
    pub reference_image: EncodedImage,
    pub registered_at: DateTime<Utc>,
}

/// Registration input, validated by the registry.
#[derive(Debug, Clone)]
pub struct IdentityCandidate {
    pub name: String,
    pub department: String,
    pub reference_image: EncodedImage,
}

/// Outcome of one 1:N comparison. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// `None` means no match.
    pub matched_identity_id: Option<String>,
    pub confidence: Confidence,
    pub reasoning: Option<String>,
}

impl MatchResult {
    pub fn no_match(reasoning: impl Into<String>) -> Self {
        Self {
            matched_identity_id: None,
            confidence: Confidence::ZERO,
            reasoning: Some(reasoning.into()),
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched_identity_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Late,
    Unknown,
}

/// A ledger entry. Identity fields are copied at recording time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity_id: String,
    pub identity_name: String,
    pub department: String,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub confidence: Confidence,
}
