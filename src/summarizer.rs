//! Summary generation through the OpenAI Responses API

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::OpenAiConfig;
use crate::errors::{AppError, AppResult, status_error};

/// Instructions sent with every summarization request
const INSTRUCTIONS: &str = "You summarize emails for a busy reader. \
Write in plain English, starting with one short paragraph of 2-4 sentences that says \
what the email is about and who it is from. \
Then, only if useful, add bullet points prefixed with Action:, Optional:, Info:, or Warning: \
for deadlines, amounts, requested replies, or risks. \
If nothing needs to be done, end with \"No action required.\" \
Do not invent details that are not in the email and do not include links.";

/// Turns normalized email content into a prose summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, subject: &str, content: &str) -> AppResult<String>;
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// [`Summarizer`] backed by `POST {base_url}/responses`
pub struct OpenAiSummarizer {
    http: Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
}

impl OpenAiSummarizer {
    pub fn new(http: Client, config: &OpenAiConfig) -> Self {
        Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/responses", config.base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, subject: &str, content: &str) -> AppResult<String> {
        let request = ResponsesRequest {
            model: &self.model,
            instructions: INSTRUCTIONS,
            input: summary_input(subject, content),
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("responses.create", status, &body));
        }

        let reply: ResponsesReply = response.json().await?;
        let summary = output_text(&reply)
            .ok_or_else(|| AppError::upstream("model returned no output text"))?;
        tracing::debug!(model = %self.model, chars = summary.len(), "generated summary");
        Ok(summary)
    }
}

fn summary_input(subject: &str, content: &str) -> String {
    format!("Subject:\n{subject}\n\nContent:\n{content}")
}

/// First non-empty `output_text` item, trimmed
fn output_text(reply: &ResponsesReply) -> Option<String> {
    reply
        .output
        .iter()
        .flat_map(|item| &item.content)
        .filter(|c| c.kind == "output_text")
        .filter_map(|c| c.text.as_deref())
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_owned)
}
