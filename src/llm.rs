use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::error::AnalysisError;
use crate::records::{PageAnalysis, PageSummary};

const CHOOSE_LINK_PROMPT: &str = "Analyze the following content and identify the most relevant download link. \
     The content includes scraped text and available download links. \
     primary_data_link must be copied exactly from the available download links.";
const CHOOSE_LINK_WITH_SCREENSHOT_PROMPT: &str = "Analyze the following content and identify the most relevant download link. \
     The content includes a screenshot of the page, scraped text, and available download links. \
     primary_data_link must be copied exactly from the available download links.";
const SUMMARIZE_PROMPT: &str = "Analyze the following content and extract the title and description.";

/// Structured extraction backed by a language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Title, description and the most relevant of `links`. The returned
    /// link is unchecked; use [`analyze_page`] for a validated result.
    async fn choose_data_link(
        &self,
        text: &str,
        links: &[String],
        screenshot: Option<&str>,
    ) -> Result<PageAnalysis>;

    async fn summarize(&self, text: &str) -> Result<PageSummary>;
}

/// Ask `model` to pick a data link and make sure it picked one of `links`.
pub async fn analyze_page<M>(
    model: &M,
    text: &str,
    links: &[String],
    screenshot: Option<&str>,
) -> Result<PageAnalysis>
where
    M: LanguageModel + ?Sized,
{
    if links.is_empty() {
        return Err(AnalysisError::NoCandidateLinks.into());
    }
    let analysis = model.choose_data_link(text, links, screenshot).await?;
    Ok(validate_choice(analysis, links)?)
}

/// Closed-set check on the model's chosen link.
pub fn validate_choice(
    mut analysis: PageAnalysis,
    links: &[String],
) -> Result<PageAnalysis, AnalysisError> {
    let chosen = analysis.primary_data_link.trim();
    match links.iter().find(|l| l.as_str() == chosen) {
        Some(link) => {
            analysis.primary_data_link = link.clone();
            Ok(analysis)
        }
        None => Err(AnalysisError::LinkNotInCandidates {
            chosen: analysis.primary_data_link,
            candidates: links.len(),
        }),
    }
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiModel {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        anyhow::ensure!(!config.chat_model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            model: config.chat_model.clone(),
        })
    }

    async fn complete<T: DeserializeOwned>(&self, body: Value) -> Result<T> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("failed to call OpenAI chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("OpenAI returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp.json().await.context("failed to parse OpenAI response")?;
        parse_structured(parsed)
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn choose_data_link(
        &self,
        text: &str,
        links: &[String],
        screenshot: Option<&str>,
    ) -> Result<PageAnalysis> {
        debug!("Asking {} to choose among {} links", self.model, links.len());
        self.complete(choose_link_request(&self.model, text, links, screenshot))
            .await
    }

    async fn summarize(&self, text: &str) -> Result<PageSummary> {
        self.complete(summarize_request(&self.model, text)).await
    }
}

fn choose_link_request(model: &str, text: &str, links: &[String], screenshot: Option<&str>) -> Value {
    let mut content = Vec::new();
    let system = match screenshot {
        Some(image) => {
            content.push(json!({ "type": "text", "text": "Screenshot of the page:" }));
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", image), "detail": "high" }
            }));
            CHOOSE_LINK_WITH_SCREENSHOT_PROMPT
        }
        None => CHOOSE_LINK_PROMPT,
    };
    content.push(json!({ "type": "text", "text": format!("Scraped text from the page:\n{}", text) }));
    content.push(json!({
        "type": "text",
        "text": format!("Available download links:\n{}", links.join(", "))
    }));

    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": content },
        ],
        "response_format": response_format(
            "data_response",
            &["title", "description", "primary_data_link"],
        ),
    })
}

fn summarize_request(model: &str, text: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": SUMMARIZE_PROMPT },
            {
                "role": "user",
                "content": [{ "type": "text", "text": format!("Scraped text from the page:\n{}", text) }]
            },
        ],
        "response_format": response_format("page_summary", &["title", "description"]),
    })
}

/// Strict JSON-schema response format with string-valued fields.
fn response_format(name: &str, fields: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|f| (f.to_string(), json!({ "type": "string" })))
        .collect();
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "strict": true,
            "schema": {
                "type": "object",
                "properties": properties,
                "required": fields,
                "additionalProperties": false,
            },
        },
    })
}

fn parse_structured<T: DeserializeOwned>(response: ChatResponse) -> Result<T> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .context("OpenAI returned no choices")?;
    if let Some(refusal) = message.refusal.filter(|r| !r.is_empty()) {
        return Err(AnalysisError::Refused(refusal).into());
    }
    let content = message.content.context("OpenAI returned an empty message")?;
    serde_json::from_str(&content).context("model output did not match the requested schema")
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModel {
        link: String,
    }

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn choose_data_link(
            &self,
            _text: &str,
            _links: &[String],
            _screenshot: Option<&str>,
        ) -> Result<PageAnalysis> {
            Ok(PageAnalysis {
                title: "Fire Incidents".into(),
                description: "Fire incidents in SF".into(),
                primary_data_link: self.link.clone(),
            })
        }

        async fn summarize(&self, _text: &str) -> Result<PageSummary> {
            unreachable!()
        }
    }

    fn links() -> Vec<String> {
        vec![
            "https://data.sfgov.org/api/views/wr8u-xric/rows.csv".into(),
            "https://data.sfgov.org/files/dictionary.xlsx".into(),
        ]
    }

    #[tokio::test]
    async fn accepts_a_candidate_link() {
        let model = FixedModel {
            link: " https://data.sfgov.org/files/dictionary.xlsx\n".into(),
        };
        let analysis = analyze_page(&model, "text", &links(), None).await.unwrap();
        assert_eq!(analysis.primary_data_link, "https://data.sfgov.org/files/dictionary.xlsx");
    }

    #[tokio::test]
    async fn rejects_an_invented_link() {
        let model = FixedModel {
            link: "https://data.sfgov.org/api/views/other/rows.csv".into(),
        };
        let err = analyze_page(&model, "text", &links(), None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::LinkNotInCandidates { candidates: 2, .. })
        ));
    }

    #[tokio::test]
    async fn needs_candidates() {
        let model = FixedModel { link: String::new() };
        let err = analyze_page(&model, "text", &[], None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::NoCandidateLinks)
        ));
    }

    #[test]
    fn request_lists_links_and_schema() {
        let body = choose_link_request("gpt-4o", "page text", &links(), None);
        let user = &body["messages"][1]["content"];
        assert_eq!(user.as_array().unwrap().len(), 2);
        assert!(user[1]["text"].as_str().unwrap().contains("rows.csv, https://"));
        let schema = &body["response_format"]["json_schema"]["schema"];
        assert_eq!(schema["required"], json!(["title", "description", "primary_data_link"]));
        assert_eq!(schema["additionalProperties"], json!(false));
    }

    #[test]
    fn screenshot_becomes_image_part() {
        let body = choose_link_request("gpt-4o", "t", &links(), Some("AAAA"));
        let user = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(user.len(), 4);
        assert_eq!(user[1]["image_url"]["url"], json!("data:image/jpeg;base64,AAAA"));
    }

    #[test]
    fn parses_structured_content() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": {
                "content": "{\"title\":\"Parcels\",\"description\":\"City parcels\"}",
                "refusal": null
            }}]
        }))
        .unwrap();
        let summary: PageSummary = parse_structured(response).unwrap();
        assert_eq!(summary.title, "Parcels");
    }

    #[test]
    fn refusal_is_an_error() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": null, "refusal": "cannot help" } }]
        }))
        .unwrap();
        let err = parse_structured::<PageSummary>(response).unwrap_err();
        assert!(matches!(err.downcast_ref::<AnalysisError>(), Some(AnalysisError::Refused(_))));
    }
}
