//! Structured-generator client: prompt in, shaped JSON value out.
//!
//! This is the LLM collaborator the authoring loop calls between reading and
//! committing state. It sits outside the consistency core: the store sees no
//! side effect from a failed generation. The shipped client speaks the
//! OpenAI-compatible `/chat/completions` protocol (OpenRouter and friends);
//! anything else can implement [`StructuredGenerator`].

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::GeneratorSection;

/// Expected shape of a generation: a JSON object with these top-level keys.
#[derive(Debug, Clone)]
pub struct OutputShape {
    pub required_keys: Vec<String>,
}

impl OutputShape {
    pub fn object<const N: usize>(keys: [&str; N]) -> Self {
        Self {
            required_keys: keys.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator request failed")]
    Network(#[from] reqwest::Error),
    #[error("generator API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("generator response carried no choices")]
    Empty,
    #[error("generator output is not valid JSON")]
    Parse(#[source] serde_json::Error),
    #[error("generator output is missing required keys: {missing:?}")]
    Validation { missing: Vec<String> },
}

/// A capability that turns a prompt into a value matching a shape.
pub trait StructuredGenerator {
    fn generate(&self, prompt: &str, shape: &OutputShape) -> Result<Value, GeneratorError>;
}

/// Blocking client for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenRouterClient {
    pub fn new(section: &GeneratorSection, api_key: String) -> Result<Self, GeneratorError> {
        let http = Client::builder()
            .user_agent(format!("xdd/{}", env!("CARGO_PKG_VERSION")))
            .timeout(section.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            model: section.model.clone(),
            api_key,
        })
    }

    /// Read the API key from the environment variable the config names.
    pub fn from_env(section: &GeneratorSection) -> Result<Self, GeneratorError> {
        let api_key = std::env::var(&section.api_key_env).unwrap_or_default();
        Self::new(section, api_key)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl StructuredGenerator for OpenRouterClient {
    fn generate(&self, prompt: &str, shape: &OutputShape) -> Result<Value, GeneratorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": { "type": "json_object" },
        });

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = resp.json()?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(GeneratorError::Empty)?;

        let value: Value = serde_json::from_str(content).map_err(GeneratorError::Parse)?;
        validate_shape(&value, shape)?;
        Ok(value)
    }
}

fn validate_shape(value: &Value, shape: &OutputShape) -> Result<(), GeneratorError> {
    let missing: Vec<String> = match value.as_object() {
        Some(map) => shape
            .required_keys
            .iter()
            .filter(|k| !map.contains_key(*k))
            .cloned()
            .collect(),
        None => shape.required_keys.clone(),
    };
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GeneratorError::Validation { missing })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Serve a fixed body for every request on an ephemeral port.
    fn spawn_server(status: u16, body: &'static str) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind server");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(
                        "Content-Type: application/json"
                            .parse::<tiny_http::Header>()
                            .expect("header"),
                    );
                let _ = request.respond(response);
            }
        });
        format!("http://127.0.0.1:{port}")
    }

    fn client(base_url: String) -> OpenRouterClient {
        let section = GeneratorSection {
            base_url,
            model: "test/model".to_string(),
            api_key_env: "XDD_TEST_KEY".to_string(),
            timeout: Duration::from_secs(5),
        };
        OpenRouterClient::new(&section, "sk-test".to_string()).expect("client")
    }

    fn chat_body(content: &str) -> String {
        serde_json::to_string(&json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
        .expect("body")
    }

    #[test]
    fn generate_returns_shaped_object() {
        let body: &'static str =
            Box::leak(chat_body(r#"{"category": "AUTH", "description": "..."}"#).into_boxed_str());
        let base = spawn_server(200, body);
        let value = client(base)
            .generate("prompt", &OutputShape::object(["category", "description"]))
            .expect("generate");
        assert_eq!(value["category"], "AUTH");
    }

    #[test]
    fn api_error_carries_status_and_body() {
        let base = spawn_server(429, r#"{"error": "rate limited"}"#);
        let err = client(base)
            .generate("prompt", &OutputShape::object(["category"]))
            .expect_err("must fail");
        match err {
            GeneratorError::Api { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limited"));
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn non_json_content_is_a_parse_error() {
        let body: &'static str =
            Box::leak(chat_body("Here is your requirement! ...").into_boxed_str());
        let base = spawn_server(200, body);
        let err = client(base)
            .generate("prompt", &OutputShape::object(["category"]))
            .expect_err("must fail");
        assert!(matches!(err, GeneratorError::Parse(_)));
    }

    #[test]
    fn missing_keys_are_a_validation_error() {
        let body: &'static str = Box::leak(chat_body(r#"{"category": "AUTH"}"#).into_boxed_str());
        let base = spawn_server(200, body);
        let err = client(base)
            .generate("prompt", &OutputShape::object(["category", "rationale"]))
            .expect_err("must fail");
        match err {
            GeneratorError::Validation { missing } => {
                assert_eq!(missing, vec!["rationale".to_string()]);
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn empty_choices_are_rejected() {
        let base = spawn_server(200, r#"{"choices": []}"#);
        let err = client(base)
            .generate("prompt", &OutputShape::object(["category"]))
            .expect_err("must fail");
        assert!(matches!(err, GeneratorError::Empty));
    }

    #[test]
    fn network_failure_surfaces() {
        // Nothing listens on this port.
        let err = client("http://127.0.0.1:1".to_string())
            .generate("prompt", &OutputShape::object(["category"]))
            .expect_err("must fail");
        assert!(matches!(err, GeneratorError::Network(_)));
    }
}
