//! Gemini API client
//!
//! Provides the two model surfaces the orchestrator needs: single-shot
//! generation (guardrail classification) and tool-bound chat turns, batch
//! or streamed. Uses a long-lived reqwest::Client for connection pooling.

use crate::error::ChatError;
use crate::models::{ToolCall, ToolResult};
use crate::Result;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_MODEL: &str = "gemini-2.0-flash-001";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

/// One tool surfaced to the model as a function declaration.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The model's answer to one chat turn: free text plus any tool calls it
/// requested. Tool calls are assigned opaque ids at parse time so results
/// can be matched back to their originating call.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            model: GEMINI_MODEL.to_string(),
        }
    }

    fn ensure_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ChatError::Configuration("GEMINI_API_KEY".to_string()));
        }
        Ok(())
    }

    /// Single-shot generation without tools. Used by the guardrail.
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let turn = self
            .invoke(None, &[Content::user(prompt.to_string())], &[])
            .await?;
        Ok(turn.text)
    }

    /// One chat-completion turn with an optional system instruction and
    /// tool declarations bound.
    pub async fn invoke(
        &self,
        system_prompt: Option<&str>,
        contents: &[Content],
        tools: &[ToolDeclaration],
    ) -> Result<ModelTurn> {
        self.ensure_key()?;

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let request = build_request(system_prompt, contents, tools);

        debug!(tool_count = tools.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                ChatError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(ChatError::Llm(format!("Gemini API error: {}", error_text)));
        }

        let body: GenerateContentResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            ChatError::Llm(format!("Gemini parse error: {}", e))
        })?;

        let turn = parse_model_turn(&body)?;
        info!(
            tool_calls = turn.tool_calls.len(),
            chars = turn.text.len(),
            "Gemini response received"
        );

        Ok(turn)
    }

    /// Streamed chat-completion turn. Text fragments are pushed onto `tx`
    /// as they arrive from the SSE endpoint; tool-call parts are buffered
    /// out of the fragment stream. Returns the accumulated turn (full text
    /// plus any tool calls) once the upstream stream ends. A closed channel
    /// means the consumer cancelled; the producer stops with `StreamClosed`.
    pub async fn stream_invoke(
        &self,
        system_prompt: Option<&str>,
        contents: &[Content],
        tools: &[ToolDeclaration],
        tx: &mpsc::Sender<String>,
    ) -> Result<ModelTurn> {
        self.ensure_key()?;

        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let request = build_request(system_prompt, contents, tools);

        debug!("Calling Gemini streaming API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Llm(format!("Gemini API error: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChatError::Llm(format!("Gemini API error: {}", error_text)));
        }

        let mut byte_stream = response.bytes_stream();
        let mut pump = SsePump::new(tx);

        while let Some(chunk) = byte_stream.next().await {
            let chunk =
                chunk.map_err(|e| ChatError::Llm(format!("Gemini stream error: {}", e)))?;
            pump.feed(&chunk).await?;
        }

        pump.finish().await
    }
}

/// Incremental SSE consumer: splits byte chunks into `data:` lines,
/// forwards text fragments onto the channel in arrival order, and
/// accumulates the complete model turn across chunks. Tool-call parts are
/// collected but never emitted as fragments.
struct SsePump<'a> {
    buffer: String,
    turn: ModelTurn,
    tx: &'a mpsc::Sender<String>,
}

impl<'a> SsePump<'a> {
    fn new(tx: &'a mpsc::Sender<String>) -> Self {
        Self {
            buffer: String::new(),
            turn: ModelTurn::default(),
            tx,
        }
    }

    async fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if self.tx.is_closed() {
            return Err(ChatError::StreamClosed);
        }

        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        // SSE events are newline-delimited; keep any partial line buffered.
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim().to_string();
            self.buffer.drain(..=newline);
            self.handle_line(&line).await?;
        }

        Ok(())
    }

    /// Flush a final unterminated line and hand back the accumulated turn.
    async fn finish(mut self) -> Result<ModelTurn> {
        let remainder = std::mem::take(&mut self.buffer);
        let remainder = remainder.trim().to_string();
        if !remainder.is_empty() {
            self.handle_line(&remainder).await?;
        }
        Ok(self.turn)
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let Some(chunk) = parse_sse_line(line) else {
            return Ok(());
        };

        if !chunk.text.is_empty() {
            self.turn.text.push_str(&chunk.text);
            if self.tx.send(chunk.text).await.is_err() {
                return Err(ChatError::StreamClosed);
            }
        }
        self.turn.tool_calls.extend(chunk.tool_calls);

        Ok(())
    }
}

/// Parse one SSE `data:` line into the text and tool-call parts it
/// carries, if any.
fn parse_sse_line(line: &str) -> Option<ModelTurn> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    let chunk: GenerateContentResponse = serde_json::from_str(payload).ok()?;
    let parts = &chunk.candidates.first()?.content.parts;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(t) = &part.text {
            text.push_str(t);
        }
        if let Some(call) = &part.function_call {
            tool_calls.push(ToolCall::new(call.name.clone(), call.args.clone()));
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        None
    } else {
        Some(ModelTurn { text, tool_calls })
    }
}

fn build_request(
    system_prompt: Option<&str>,
    contents: &[Content],
    tools: &[ToolDeclaration],
) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: contents.to_vec(),
        generation_config: GenerationConfig {
            temperature: 0.3,
            max_output_tokens: 1024,
        },
        system_instruction: system_prompt.map(|text| SystemInstruction {
            parts: vec![Part::text(text.to_string())],
        }),
        tools: if tools.is_empty() {
            None
        } else {
            Some(vec![ToolSet {
                function_declarations: tools.to_vec(),
            }])
        },
    }
}

fn parse_model_turn(response: &GenerateContentResponse) -> Result<ModelTurn> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ChatError::Llm("No response from Gemini API".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for part in &candidate.content.parts {
        if let Some(t) = &part.text {
            text.push_str(t);
        }
        if let Some(call) = &part.function_call {
            tool_calls.push(ToolCall::new(call.name.clone(), call.args.clone()));
        }
    }

    Ok(ModelTurn { text, tool_calls })
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSet>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: String) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    /// The assistant turn that requested tool calls, replayed back to the
    /// model ahead of the tool results.
    pub fn model_turn(turn: &ModelTurn) -> Self {
        let mut parts = Vec::new();
        if !turn.text.is_empty() {
            parts.push(Part::text(turn.text.clone()));
        }
        for call in &turn.tool_calls {
            parts.push(Part {
                text: None,
                function_call: Some(FunctionCall {
                    name: call.name.clone(),
                    args: call.args.clone(),
                }),
                function_response: None,
            });
        }
        Self {
            role: Some("model".to_string()),
            parts,
        }
    }

    /// One content block carrying every tool result from a turn.
    pub fn tool_results(results: &[ToolResult]) -> Self {
        let parts = results
            .iter()
            .map(|r| Part {
                text: None,
                function_call: None,
                function_response: Some(FunctionResponse {
                    name: r.name.clone(),
                    response: serde_json::json!({ "result": r.content }),
                }),
            })
            .collect();
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_uses_camel_case() {
        let request = build_request(
            Some("You are a gatekeeper"),
            &[Content::user("Tell me about PSG".to_string())],
            &[ToolDeclaration {
                name: "get_token_balance".to_string(),
                description: "Fan token balance lookup".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            }],
        );

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("systemInstruction"));
        assert!(json.contains("generationConfig"));
        assert!(json.contains("functionDeclarations"));
        assert!(json.contains("maxOutputTokens"));
        assert!(json.contains("Tell me about PSG"));
    }

    #[test]
    fn test_parse_model_turn_collects_text_and_calls() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Checking the chain." },
                        { "functionCall": { "name": "get_token_balance",
                                            "args": { "club": "PSG" } } },
                        { "functionCall": { "name": "get_native_balance",
                                            "args": {} } }
                    ]
                }
            }]
        });
        let response: GenerateContentResponse = serde_json::from_value(body).unwrap();
        let turn = parse_model_turn(&response).unwrap();

        assert_eq!(turn.text, "Checking the chain.");
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].name, "get_token_balance");
        assert_ne!(turn.tool_calls[0].id, turn.tool_calls[1].id);
    }

    #[test]
    fn test_parse_model_turn_empty_candidates_is_error() {
        let response: GenerateContentResponse =
            serde_json::from_value(serde_json::json!({ "candidates": [] })).unwrap();
        assert!(parse_model_turn(&response).is_err());
    }

    #[test]
    fn test_parse_sse_line() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Allez "}]}}]}"#;
        let turn = parse_sse_line(line).unwrap();
        assert_eq!(turn.text, "Allez ");
        assert!(turn.tool_calls.is_empty());

        assert!(parse_sse_line("data:").is_none());
        assert!(parse_sse_line(": keepalive").is_none());
        assert!(parse_sse_line("event: ping").is_none());
    }

    fn text_event(text: &str) -> Vec<u8> {
        format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}]}}\n",
            text
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_pump_emits_fragments_in_arrival_order() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let mut pump = SsePump::new(&tx);

        pump.feed(&text_event("Allez ")).await.unwrap();
        pump.feed(&text_event("Paris!")).await.unwrap();
        let turn = pump.finish().await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), "Allez ");
        assert_eq!(rx.try_recv().unwrap(), "Paris!");
        assert!(rx.try_recv().is_err());
        assert_eq!(turn.text, "Allez Paris!");
        assert!(turn.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_pump_stops_with_stream_closed_after_receiver_drops() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let mut pump = SsePump::new(&tx);

        pump.feed(&text_event("first")).await.unwrap();
        drop(rx);

        let err = pump.feed(&text_event("second")).await.unwrap_err();
        assert!(matches!(err, ChatError::StreamClosed));

        // Still closed on any further feed; nothing is ever sent again.
        let err = pump.feed(&text_event("third")).await.unwrap_err();
        assert!(matches!(err, ChatError::StreamClosed));
    }

    #[tokio::test]
    async fn test_pump_flushes_final_line_without_trailing_newline() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let mut pump = SsePump::new(&tx);

        let mut event = text_event("fin");
        event.pop(); // strip the trailing newline
        pump.feed(&event).await.unwrap();
        assert!(rx.try_recv().is_err());

        let turn = pump.finish().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), "fin");
        assert_eq!(turn.text, "fin");
    }

    #[tokio::test]
    async fn test_pump_buffers_tool_calls_out_of_the_fragment_stream() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let mut pump = SsePump::new(&tx);

        let event = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[",
            "{\"functionCall\":{\"name\":\"get_token_balance\",\"args\":{\"club\":\"PSG\"}}}",
            "]}}]}\n"
        );
        pump.feed(event.as_bytes()).await.unwrap();
        let turn = pump.finish().await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "get_token_balance");
    }

    #[test]
    fn test_tool_results_content_shape() {
        let results = vec![ToolResult {
            call_id: uuid::Uuid::new_v4(),
            name: "get_token_balance".to_string(),
            content: "42".to_string(),
        }];
        let content = Content::tool_results(&results);
        let json = serde_json::to_value(&content).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(
            json["parts"][0]["functionResponse"]["name"],
            "get_token_balance"
        );
        assert_eq!(
            json["parts"][0]["functionResponse"]["response"]["result"],
            "42"
        );
    }
}
