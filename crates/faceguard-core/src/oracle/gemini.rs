//! Gemini `generateContent` oracle over HTTPS.

use super::{ComparisonRequest, Oracle, OracleError, OracleResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

#[derive(Clone)]
pub struct GeminiOracle {
    endpoint: String,
    model: String,
    api_key: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for GeminiOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiOracle")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiOracle {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl Oracle for GeminiOracle {
    async fn compare(
        &self,
        request: &ComparisonRequest<'_>,
    ) -> Result<OracleResponse, OracleError> {
        let body = build_request(request);

        let response = self
            .http
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        let text = completion
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.iter().find_map(|p| p.text.as_deref()))
            .filter(|t| !t.trim().is_empty())
            .ok_or(OracleError::EmptyResponse)?;

        OracleResponse::parse(text)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "matchedUserId": {
                "type": "STRING",
                "description": "The ID of the matched user, or null if no match found.",
                "nullable": true
            },
            "confidence": {
                "type": "NUMBER",
                "description": "Confidence score between 0 and 1."
            },
            "reasoning": {
                "type": "STRING",
                "description": "Brief explanation of why the face matched or didn't match."
            }
        },
        "required": ["confidence", "reasoning"]
    })
}

fn image_part(image: &crate::types::EncodedImage) -> Part {
    Part::Image {
        inline_data: InlineData {
            mime_type: image.mime_type.clone(),
            data: image.to_base64(),
        },
    }
}

fn build_request(request: &ComparisonRequest<'_>) -> GenerateContentRequest {
    let mut parts = Vec::with_capacity(request.references.len() * 2 + 3);
    parts.push(Part::Text {
        text: request.instruction.to_string(),
    });

    for (i, reference) in request.references.iter().enumerate() {
        parts.push(Part::Text {
            text: format!("Reference User {} (ID: {}):", i + 1, reference.identity_id),
        });
        parts.push(image_part(reference.image));
    }

    parts.push(Part::Text {
        text: "Target Image (Live Camera):".to_string(),
    });
    parts.push(image_part(request.target));

    GenerateContentRequest {
        contents: vec![Content { parts }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
            response_schema: response_schema(),
        },
    }
}
