//! OpenAI-compatible chat-completions endpoint.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use super::{DecisionOracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::OracleError;

const ERROR_BODY_CHARS: usize = 300;

pub struct HttpOracle {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    auth_header: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

impl HttpOracle {
    pub fn from_config(cfg: &OracleConfig) -> Result<Self> {
        let auth_header = match cfg.api_key_env.as_deref() {
            Some(var) => {
                let key = env::var(var).with_context(|| format!("oracle.api_key_env: {var} is not set"))?;
                Some(format!("Bearer {}", key.trim()))
            }
            None => None,
        };
        if cfg.endpoint.trim().is_empty() {
            return Err(anyhow!("oracle.endpoint must not be empty"));
        }
        let client = reqwest::blocking::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            auth_header,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    pub fn payload(&self, request: &OracleRequest) -> Value {
        json!({
            "model": self.model,
            "messages": request.chat_messages(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

/// `choices[0].message.content`, which may be a string or a list of parts.
pub fn extract_content(body: &Value) -> Result<String, OracleError> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .ok_or(OracleError::Empty)?;
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.trim().is_empty() {
        return Err(OracleError::Empty);
    }
    Ok(text)
}

impl DecisionOracle for HttpOracle {
    fn decide(&mut self, request: &OracleRequest, timeout: Duration) -> Result<String, OracleError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&self.payload(request));
        if let Some(auth) = &self.auth_header {
            builder = builder.header("Authorization", auth);
        }
        let response = builder.send().map_err(|err| {
            if err.is_timeout() {
                OracleError::Timeout(timeout.as_secs())
            } else {
                OracleError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                message: text.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }
        let body: Value = response
            .json()
            .map_err(|err| OracleError::Transport(format!("response JSON decode failed: {err}")))?;
        let text = extract_content(&body)?;
        debug!(chars = text.len(), "oracle responded");
        Ok(text)
    }

    fn describe(&self) -> String {
        format!("http {} ({})", self.endpoint, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationStore;

    #[test]
    fn content_may_be_string_or_parts() {
        let plain = json!({"choices": [{"message": {"content": "{\"tool\":\"done\"}"}}]});
        assert_eq!(extract_content(&plain).unwrap(), "{\"tool\":\"done\"}");

        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "{\"tool\":"},
            {"type": "text", "text": "\"done\"}"}
        ]}}]});
        assert_eq!(extract_content(&parts).unwrap(), "{\"tool\":\"done\"}");

        assert!(matches!(extract_content(&json!({"choices": []})), Err(OracleError::Empty)));
        let blank = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(matches!(extract_content(&blank), Err(OracleError::Empty)));
    }

    #[test]
    fn payload_uses_configured_sampling() {
        let oracle = HttpOracle::from_config(&OracleConfig::default()).unwrap();
        let request = OracleRequest::new("goal", Vec::new(), &AnnotationStore::in_memory(), 8, None, vec![0]);
        let payload = oracle.payload(&request);
        assert_eq!(payload["model"], "qwen3-vl-4b-instruct-1m");
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["max_tokens"], 250);
        assert_eq!(payload["messages"][0]["role"], "system");
    }

    #[test]
    fn missing_api_key_variable_is_a_config_error() {
        let cfg = OracleConfig {
            api_key_env: Some("VTL_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..OracleConfig::default()
        };
        assert!(HttpOracle::from_config(&cfg).is_err());
    }
}
