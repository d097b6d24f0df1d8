//! External text generation.
//!
//! [`TextGenerator`] is the request-in / text-or-failure-out seam used by the
//! recommendation composer. [`GeminiGenerator`] talks to the Gemini
//! `generateContent` REST endpoint; [`ScriptedGenerator`] replays canned
//! outcomes in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com";

/// HTTP request timeout for a single generation call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

// ------------------------------------------------------------------ //
//  Contract                                                           //
// ------------------------------------------------------------------ //

/// A single-shot generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    /// Disable every content filter the backend allows disabling.
    pub permissive_filters: bool,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Unspecified,
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other,
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "STOP"       => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY"     => FinishReason::Safety,
            "RECITATION" => FinishReason::Recitation,
            "FINISH_REASON_UNSPECIFIED" => FinishReason::Unspecified,
            _ => FinishReason::Other,
        }
    }
}

/// First candidate returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub finish_reason: FinishReason,
    pub text: Option<String>,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("generator returned HTTP {0}")]
    HttpStatus(u16),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("response contained no candidates")]
    NoCandidates,

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend/model label used in logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GeneratorError>;
}

// ------------------------------------------------------------------ //
//  Gemini                                                             //
// ------------------------------------------------------------------ //

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: [GeminiContentOut<'a>; 1],
    generation_config: GeminiGenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Serialize)]
struct GeminiContentOut<'a> {
    role: &'static str,
    parts: [GeminiPartOut<'a>; 1],
}

#[derive(Serialize)]
struct GeminiPartOut<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct GeminiSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentIn>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentIn {
    #[serde(default)]
    parts: Vec<GeminiPartIn>,
}

#[derive(Deserialize)]
struct GeminiPartIn {
    #[serde(default)]
    text: Option<String>,
}

/// Client for the Gemini `generateContent` endpoint.
pub struct GeminiGenerator {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl GeminiGenerator {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> Result<Self, GeneratorError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.api_url, self.model)
    }
}

fn build_body(request: &GenerationRequest) -> GeminiRequest<'_> {
    let safety_settings = if request.permissive_filters {
        HARM_CATEGORIES
            .into_iter()
            .map(|category| GeminiSafetySetting { category, threshold: "BLOCK_NONE" })
            .collect()
    } else {
        Vec::new()
    };

    GeminiRequest {
        contents: [GeminiContentOut {
            role: "user",
            parts: [GeminiPartOut { text: &request.prompt }],
        }],
        generation_config: GeminiGenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_output_tokens: request.max_output_tokens,
        },
        safety_settings,
    }
}

fn parse_response(body: GeminiResponse) -> Result<Generation, GeneratorError> {
    let candidate = body
        .candidates
        .into_iter()
        .next()
        .ok_or(GeneratorError::NoCandidates)?;

    let finish_reason = candidate
        .finish_reason
        .as_deref()
        .map(FinishReason::from_wire)
        .unwrap_or(FinishReason::Unspecified);

    let text = candidate
        .content
        .and_then(|c| c.parts.into_iter().find_map(|p| p.text));

    Ok(Generation { finish_reason, text })
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GeneratorError> {
        let resp = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&build_body(request))
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GeneratorError::ModelNotFound(self.model.clone()));
        }
        if !status.is_success() {
            return Err(GeneratorError::HttpStatus(status.as_u16()));
        }

        let body: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Malformed(e.to_string()))?;

        parse_response(body)
    }
}

// ------------------------------------------------------------------ //
//  ScriptedGenerator (for tests)                                      //
// ------------------------------------------------------------------ //

/// One canned outcome for [`ScriptedGenerator`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(Generation),
    NotFound,
    Status(u16),
    /// Sleep before replying; used to exercise timeouts.
    Stall(Duration, Generation),
}

impl ScriptStep {
    pub fn stop(text: &str) -> Self {
        ScriptStep::Reply(Generation {
            finish_reason: FinishReason::Stop,
            text: Some(text.to_string()),
        })
    }

    pub fn finished(reason: FinishReason, text: Option<&str>) -> Self {
        ScriptStep::Reply(Generation {
            finish_reason: reason,
            text: text.map(str::to_string),
        })
    }
}

/// Generator that replays a fixed script, then answers HTTP 503.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Reply(g)) => Ok(g),
            Some(ScriptStep::NotFound) => Err(GeneratorError::ModelNotFound("scripted".into())),
            Some(ScriptStep::Status(code)) => Err(GeneratorError::HttpStatus(code)),
            Some(ScriptStep::Stall(delay, g)) => {
                tokio::time::sleep(delay).await;
                Ok(g)
            }
            None => Err(GeneratorError::HttpStatus(503)),
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn request(permissive: bool) -> GenerationRequest {
        GenerationRequest {
            prompt: "hello".into(),
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 100,
            permissive_filters: permissive,
        }
    }

    #[test]
    fn body_carries_sampling_and_safety_settings() {
        let req = request(true);
        let json = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(json["generationConfig"]["topK"], 40);
        let safety = json["safetySettings"].as_array().unwrap();
        assert_eq!(safety.len(), 4);
        assert!(safety.iter().all(|s| s["threshold"] == "BLOCK_NONE"));
    }

    #[test]
    fn body_omits_safety_when_not_permissive() {
        let req = request(false);
        let json = serde_json::to_value(build_body(&req)).unwrap();
        assert!(json.get("safetySettings").is_none());
    }

    #[test]
    fn parse_first_candidate() {
        let body: GeminiResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "Lower the setpoint."}], "role": "model"},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        let g = parse_response(body).unwrap();
        assert_eq!(g.finish_reason, FinishReason::Stop);
        assert_eq!(g.text.as_deref(), Some("Lower the setpoint."));
    }

    #[test]
    fn parse_blocked_candidate_without_content() {
        let body: GeminiResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }))
        .unwrap();
        let g = parse_response(body).unwrap();
        assert_eq!(g.finish_reason, FinishReason::Safety);
        assert_eq!(g.text, None);
    }

    #[test]
    fn parse_no_candidates_is_error() {
        let body: GeminiResponse =
            serde_json::from_value(serde_json::json!({"promptFeedback": {}})).unwrap();
        assert!(matches!(parse_response(body), Err(GeneratorError::NoCandidates)));
    }

    #[test]
    fn unknown_finish_reason_maps_to_other() {
        assert_eq!(FinishReason::from_wire("BLOCKLIST"), FinishReason::Other);
        assert_eq!(FinishReason::from_wire("MAX_TOKENS"), FinishReason::MaxTokens);
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let g = GeminiGenerator::new("http://localhost:9/", "k", "gemini-1.5-flash").unwrap();
        assert_eq!(
            g.endpoint(),
            "http://localhost:9/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn scripted_generator_replays_then_fails() {
        let g = ScriptedGenerator::new([ScriptStep::stop("first reply here")]);
        let first = g.generate(&request(true)).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("first reply here"));
        assert!(matches!(
            g.generate(&request(true)).await,
            Err(GeneratorError::HttpStatus(503))
        ));
        assert_eq!(g.calls(), 2);
        assert_eq!(g.prompts(), vec!["hello".to_string(), "hello".to_string()]);
    }
}
