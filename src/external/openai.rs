use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::error::ExternalError;
use crate::external::retry::{is_retryable_http_error, is_retryable_network_error};
use crate::external::{ProposalRequest, ProposalSource};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::patch::RawPatch;

const SYSTEM_PROMPT: &str = "You improve trading strategy programs. \
Reply with a single JSON object and nothing else, in one of two shapes: \
{\"code\": \"<complete new program>\"} to replace the whole program, or \
{\"blocks\": {\"<block id>\": \"<new block body>\"}} to replace the body of \
regions delimited by EVOLVE-BLOCK markers. Never include the marker lines \
themselves in a block body.";

/// Proposal source backed by an OpenAI-compatible chat completions endpoint.
pub struct ChatProposer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize, Debug)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    response_format: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize, Debug)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl ChatProposer {
    pub fn new(cfg: &Config) -> Result<Self, ExternalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.openai_timeout_secs))
            .build()
            .map_err(|e| ExternalError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: cfg.openai_base_url.clone(),
            api_key: cfg.openai_api_key.clone(),
            model: cfg.openai_model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }

    fn messages(request: &ProposalRequest) -> Vec<ChatMessage> {
        let mut user = String::new();
        user.push_str(&request.instructions);
        user.push_str("\n\n");
        if !request.block_ids.is_empty() {
            user.push_str(&format!("Evolve blocks: {}\n\n", request.block_ids.join(", ")));
        }
        if let Some(target) = &request.target_block {
            user.push_str(&format!(
                "Focus on block `{}`. Its current body:\n```\n{}```\n\n",
                target.id, target.interior
            ));
        }
        user.push_str("Current program:\n```\n");
        user.push_str(&request.parent_text);
        user.push_str("\n```\n");

        vec![
            ChatMessage { role: "system", content: SYSTEM_PROMPT.to_string() },
            ChatMessage { role: "user", content: user },
        ]
    }
}

#[async_trait]
impl ProposalSource for ChatProposer {
    async fn propose(&self, request: &ProposalRequest) -> Result<RawPatch, ExternalError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ExternalError::Permanent("OPENAI_API_KEY is not set".to_string()))?;

        let body = ChatRequest {
            model: &self.model,
            messages: Self::messages(request),
            max_tokens: self.max_tokens,
            response_format: json!({"type": "json_object"}),
        };
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(300).collect();
            let reason = format!("chat completions returned {}: {}", status.as_u16(), snippet);
            return Err(if is_retryable_http_error(status.as_u16()) {
                ExternalError::Transient(reason)
            } else {
                ExternalError::Permanent(reason)
            });
        }

        // a body cut off mid-stream is worth another try
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ExternalError::Transient(format!("unreadable completion body: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExternalError::Permanent("completion carried no message content".to_string()))?;

        log(
            Level::Debug,
            Domain::Proposal,
            "completion",
            obj(&[
                ("program_id", json!(request.parent_id.0)),
                ("model", v_str(&self.model)),
                ("content_bytes", json!(content.len())),
            ]),
        );

        RawPatch::from_model_output(&content)
            .map_err(|e| ExternalError::Permanent(format!("model reply was not JSON: {}", e)))
    }
}

fn classify_send_error(err: reqwest::Error) -> ExternalError {
    if is_retryable_network_error(&err) {
        ExternalError::Transient(err.to_string())
    } else {
        ExternalError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ProgramId;
    use crate::external::TargetBlock;

    fn request(target: Option<TargetBlock>) -> ProposalRequest {
        ProposalRequest {
            parent_id: ProgramId(1),
            parent_text: "def f():\n    return 1\n".to_string(),
            block_ids: vec!["decision_logic".to_string()],
            target_block: target,
            instructions: "Improve calmar.".to_string(),
        }
    }

    #[test]
    fn test_messages_carry_program_and_target() {
        let msgs = ChatProposer::messages(&request(Some(TargetBlock {
            id: "decision_logic".to_string(),
            interior: "return 1\n".to_string(),
        })));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[1].content.starts_with("Improve calmar."));
        assert!(msgs[1].content.contains("Focus on block `decision_logic`"));
        assert!(msgs[1].content.contains("def f():"));
    }

    #[test]
    fn test_request_serializes_json_response_format() {
        let body = ChatRequest {
            model: "o3-mini",
            messages: ChatProposer::messages(&request(None)),
            max_tokens: 4096,
            response_format: json!({"type": "json_object"}),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[tokio::test]
    async fn test_missing_key_is_permanent() {
        let cfg = Config::from_vars(|_| None);
        let proposer = ChatProposer::new(&cfg).unwrap();
        let err = proposer.propose(&request(None)).await.unwrap_err();
        assert!(matches!(err, ExternalError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_stalled_endpoint_times_out_as_transient() {
        // accepts connections but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let mut proposer = ChatProposer::new(&Config::from_vars(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "OPENAI_BASE_URL" => Some(base.clone()),
            _ => None,
        }))
        .unwrap();
        proposer.client = Client::builder().timeout(Duration::from_millis(200)).build().unwrap();

        let started = std::time::Instant::now();
        let err = proposer.propose(&request(None)).await.unwrap_err();
        assert!(err.is_transient(), "unexpected {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(listener);
    }
}
