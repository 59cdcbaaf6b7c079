//! Contract with the external recognition oracle.
//!
//! The oracle receives a target image plus labeled reference images and
//! returns a structured decision. Its model is opaque; only the request and
//! response shapes are fixed here.

pub mod gemini;

pub use gemini::GeminiOracle;

use crate::types::EncodedImage;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Instruction sent with every comparison request.
pub const TASK_INSTRUCTION: &str = "You are an automated attendance security system. \
Your task is to identify a person. Below are the 'Reference Images' of registered users, \
each followed by their ID. The final image is the 'Target Image' from the live camera. \
Compare the Target Image against the Reference Images based on facial features. \
If the person in the Target Image matches a Reference Image, return the User ID. \
If no match is found, return null.";

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("oracle returned no content")]
    EmptyResponse,
    #[error("malformed oracle response: {0}")]
    Malformed(String),
    #[error("oracle did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// One labeled reference, in registry order.
#[derive(Debug, Clone)]
pub struct Reference<'a> {
    pub identity_id: &'a str,
    pub image: &'a EncodedImage,
}

#[derive(Debug, Clone)]
pub struct ComparisonRequest<'a> {
    pub instruction: &'a str,
    pub target: &'a EncodedImage,
    pub references: Vec<Reference<'a>>,
}

/// The oracle's structured answer. `confidence` and `reasoning` are required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OracleResponse {
    #[serde(rename = "matchedUserId", default)]
    pub matched_user_id: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

impl OracleResponse {
    /// Strict parse of the oracle's JSON text.
    pub fn parse(text: &str) -> Result<Self, OracleError> {
        serde_json::from_str(text.trim()).map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

/// 1:N face comparison backend.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn compare(
        &self,
        request: &ComparisonRequest<'_>,
    ) -> Result<OracleResponse, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let r = OracleResponse::parse(
            r#"{"matchedUserId":"u1","confidence":0.92,"reasoning":"same person"}"#,
        )
        .unwrap();
        assert_eq!(r.matched_user_id.as_deref(), Some("u1"));
        assert_eq!(r.confidence, 0.92);
    }

    #[test]
    fn test_parse_null_and_absent_match() {
        let a = OracleResponse::parse(r#"{"matchedUserId":null,"confidence":0.1,"reasoning":"x"}"#)
            .unwrap();
        let b = OracleResponse::parse(r#"{"confidence":0.1,"reasoning":"x"}"#).unwrap();
        assert!(a.matched_user_id.is_none());
        assert!(b.matched_user_id.is_none());
    }

    #[test]
    fn test_parse_requires_confidence_and_reasoning() {
        assert!(OracleResponse::parse(r#"{"matchedUserId":"u1","reasoning":"x"}"#).is_err());
        assert!(OracleResponse::parse(r#"{"matchedUserId":"u1","confidence":0.5}"#).is_err());
        assert!(OracleResponse::parse("I think it's u1").is_err());
    }
}
