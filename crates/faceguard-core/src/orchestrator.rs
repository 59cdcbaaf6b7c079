//! Turns a captured frame and a registry snapshot into a [`MatchResult`].

use crate::oracle::{ComparisonRequest, Oracle, OracleError, Reference, TASK_INSTRUCTION};
use crate::types::{Confidence, EncodedImage, Identity, MatchResult};
use std::sync::Arc;
use std::time::Duration;

pub const NO_IDENTITIES_REASON: &str = "no registered identities";
pub const ORACLE_ERROR_REASON: &str = "oracle error";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of one identification attempt.
///
/// `failure` is set when the oracle could not be consulted or answered
/// out of contract. `result` is then always a zero-confidence no-match, and
/// callers must report a system error instead of an unrecognized face.
#[derive(Debug)]
pub struct Identification {
    pub result: MatchResult,
    pub failure: Option<OracleError>,
}

impl Identification {
    pub fn is_oracle_failure(&self) -> bool {
        self.failure.is_some()
    }

    fn clean(result: MatchResult) -> Self {
        Self {
            result,
            failure: None,
        }
    }

    fn failed(error: OracleError) -> Self {
        Self {
            result: MatchResult::no_match(ORACLE_ERROR_REASON),
            failure: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct MatchOrchestrator {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
}

impl MatchOrchestrator {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound on how long a single oracle call may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Compare `frame` against every identity in `registry`. Never retries.
    pub async fn identify(&self, frame: &EncodedImage, registry: &[Identity]) -> Identification {
        if registry.is_empty() {
            tracing::debug!("identify: empty registry, oracle skipped");
            return Identification::clean(MatchResult::no_match(NO_IDENTITIES_REASON));
        }

        let request = ComparisonRequest {
            instruction: TASK_INSTRUCTION,
            target: frame,
            references: registry
                .iter()
                .map(|identity| Reference {
                    identity_id: &identity.id,
                    image: &identity.reference_image,
                })
                .collect(),
        };

        tracing::debug!(
            references = request.references.len(),
            frame_bytes = frame.len(),
            "identify: consulting oracle"
        );

        let response = match tokio::time::timeout(self.timeout, self.oracle.compare(&request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "oracle call failed");
                return Identification::failed(e);
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "oracle call timed out");
                return Identification::failed(OracleError::Timeout(self.timeout));
            }
        };

        if !(0.0..=1.0).contains(&response.confidence) {
            tracing::warn!(confidence = response.confidence, "oracle confidence out of range; clamped");
        }
        let confidence = Confidence::new(response.confidence);

        let matched = match response.matched_user_id {
            Some(id) if registry.iter().any(|i| i.id == id) => Some(id),
            Some(id) => {
                tracing::warn!(matched = %id, "oracle matched an id outside the registry; treating as no match");
                None
            }
            None => None,
        };

        tracing::debug!(
            matched = matched.as_deref().unwrap_or("-"),
            confidence = confidence.value(),
            "identify: oracle answered"
        );

        Identification::clean(MatchResult {
            matched_identity_id: matched,
            confidence,
            reasoning: Some(response.reasoning),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeOracle;
    use super::*;
    use chrono::Utc;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.into(),
            name: format!("name-{id}"),
            department: "Ops".into(),
            reference_image: EncodedImage::from_bytes(vec![1, 2]),
            registered_at: Utc::now(),
        }
    }

    fn frame() -> EncodedImage {
        EncodedImage::from_bytes(vec![9, 9, 9])
    }

    #[tokio::test]
    async fn test_empty_registry_skips_oracle() {
        let oracle = Arc::new(FakeOracle::answering(Some("u1"), 0.9));
        let orchestrator = MatchOrchestrator::new(oracle.clone());
        let id = orchestrator.identify(&frame(), &[]).await;
        assert!(!id.is_oracle_failure());
        assert_eq!(id.result, MatchResult::no_match(NO_IDENTITIES_REASON));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_sends_every_reference_in_order() {
        let oracle = Arc::new(FakeOracle::answering(Some("u2"), 0.8));
        let orchestrator = MatchOrchestrator::new(oracle.clone());
        let registry = vec![identity("u1"), identity("u2"), identity("u3")];
        let id = orchestrator.identify(&frame(), &registry).await;
        assert_eq!(id.result.matched_identity_id.as_deref(), Some("u2"));
        assert_eq!(
            *oracle.last_reference_ids.lock().unwrap(),
            vec!["u1".to_string(), "u2".into(), "u3".into()]
        );
    }

    #[tokio::test]
    async fn test_confidence_is_clamped() {
        let registry = vec![identity("u1")];
        for (raw, expected) in [(1.8, 1.0), (-0.4, 0.0), (0.5, 0.5)] {
            let orchestrator = MatchOrchestrator::new(Arc::new(FakeOracle::answering(Some("u1"), raw)));
            let id = orchestrator.identify(&frame(), &registry).await;
            assert_eq!(id.result.confidence.value(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_id_becomes_no_match() {
        let orchestrator = MatchOrchestrator::new(Arc::new(FakeOracle::answering(Some("ghost"), 0.97)));
        let id = orchestrator.identify(&frame(), &[identity("u1")]).await;
        assert!(!id.is_oracle_failure());
        assert!(!id.result.is_match());
    }

    #[tokio::test]
    async fn test_oracle_error_is_flagged() {
        let oracle = Arc::new(FakeOracle::failing());
        let orchestrator = MatchOrchestrator::new(oracle.clone());
        let id = orchestrator.identify(&frame(), &[identity("u1")]).await;
        assert!(id.is_oracle_failure());
        assert_eq!(id.result, MatchResult::no_match(ORACLE_ERROR_REASON));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_oracle_failure() {
        let oracle = Arc::new(FakeOracle::answering(Some("u1"), 0.9).delayed(Duration::from_secs(60)));
        let orchestrator = MatchOrchestrator::new(oracle).with_timeout(Duration::from_secs(5));
        let id = orchestrator.identify(&frame(), &[identity("u1")]).await;
        assert!(matches!(id.failure, Some(OracleError::Timeout(_))));
        assert!(!id.result.is_match());
        assert_eq!(id.result.confidence, Confidence::ZERO);
    }
}
