use crate::config::SupervisorConfig;
use crate::AgentError;
use serde::Serialize;
use serde_json::Value;

/// Reply fields tried in order when the agent answers with an object.
pub const REPLY_FIELDS: [&str; 4] = ["response", "message", "content", "text"];

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

/// HTTP client for the agent's local `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct AgentBridge {
    client: reqwest::Client,
    url: String,
}

impl AgentBridge {
    pub fn new(config: &SupervisorConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(config.bridge_timeout)
            .build()
            .map_err(AgentError::Bridge)?;
        Ok(Self {
            client,
            url: config.chat_url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts `{message}` and returns the raw reply body.
    pub async fn chat(&self, message: &str) -> Result<String, AgentError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ChatRequest { message })
            .send()
            .await
            .map_err(AgentError::Bridge)?;
        let status = response.status();
        let body = response.text().await.map_err(AgentError::Bridge)?;
        if !status.is_success() {
            return Err(AgentError::BridgeStatus {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(body)
    }
}

/// Turns a reply body into the message text.
///
/// A JSON string is used as-is, an object yields its first populated
/// [`REPLY_FIELDS`] entry or else its serialized form, and a body that is not
/// JSON at all is taken verbatim.
pub fn decode_reply(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(text)) => text,
        Ok(Value::Object(map)) => REPLY_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .find_map(populated_text)
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Ok(Value::Null) => String::new(),
        Ok(other) => other.to_string(),
        Err(_) => body.to_string(),
    }
}

fn populated_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) if number.as_f64() == Some(0.0) => None,
        other => Some(other.to_string()),
    }
}
