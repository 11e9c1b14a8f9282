//! HTTP client for the treehole forum API.
//!
//! Two endpoints are used:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/chapi/api/v3/hole/list_comments?keyword=&page=&limit=` | Keyword search over posts |
//! | `GET` | `/api/pku_comment_v3/{pid}?page=&limit=&sort=asc` | Paged comments of one post |
//!
//! Both require a bearer token from the `TREEHOLE_TOKEN` environment
//! variable.
//!
//! Retry strategy (shared with the LLM client):
//! - HTTP 429 or 5xx → retry with exponential backoff: 1s, 2s, 4s, ...
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use treehole_core::{AgentError, Comment, ForumSearcher, Post};

use crate::config::ForumConfig;

pub struct HttpForumClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    max_retries: u32,
    search_delay: Duration,
}

impl HttpForumClient {
    /// Build a client from config, reading the token from
    /// `TREEHOLE_TOKEN`.
    pub fn from_config(config: &ForumConfig) -> Result<Self, AgentError> {
        let token = std::env::var("TREEHOLE_TOKEN")
            .map_err(|_| AgentError::Config("TREEHOLE_TOKEN not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpForumClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            max_retries: config.max_retries,
            search_delay: Duration::from_millis(config.search_delay_ms),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, AgentError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .query(query)
                .header("Authorization", format!("Bearer {}", self.token))
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            AgentError::upstream(format!("forum returned invalid JSON: {e}"))
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(AgentError::upstream(format!("forum API error {status}")));
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::upstream(format!(
                        "forum API error {status}: {body}"
                    )));
                }
                Err(e) => {
                    last_err = Some(AgentError::upstream(format!("forum request failed: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| AgentError::upstream("forum request failed after retries")))
    }
}

/// Comments the search endpoint includes per post as `comment_list`.
const COMMENT_PREVIEW_LIMIT: u32 = 10;

/// Query parameters for one search request.
fn search_params(keyword: &str, page: u32, limit: u32) -> Vec<(&'static str, String)> {
    vec![
        ("keyword", keyword.to_string()),
        ("page", page.to_string()),
        ("limit", limit.to_string()),
        ("comment_limit", COMMENT_PREVIEW_LIMIT.to_string()),
    ]
}

#[async_trait]
impl ForumSearcher for HttpForumClient {
    async fn search(&self, keyword: &str, limit: u32) -> Result<Vec<Post>, AgentError> {
        tokio::time::sleep(self.search_delay).await;

        let url = format!("{}/chapi/api/v3/hole/list_comments", self.base_url);
        let body = self
            .get_json(&url, &search_params(keyword, 1, limit))
            .await?;
        parse_search_body(&body)
    }

    async fn fetch_comments(
        &self,
        post_id: u64,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Comment>, AgentError> {
        let url = format!("{}/api/pku_comment_v3/{}", self.base_url, post_id);
        let body = self
            .get_json(
                &url,
                &[
                    ("page", page.to_string()),
                    ("limit", limit.to_string()),
                    ("sort", "asc".to_string()),
                ],
            )
            .await?;
        parse_comment_body(&body)
    }
}

/// Parse the search envelope: `{"code": 20000, "data": {"list": [...]}}`.
fn parse_search_body(body: &Value) -> Result<Vec<Post>, AgentError> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 20000 {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(AgentError::upstream(format!(
            "forum search rejected (code {code}): {message}"
        )));
    }

    let list = body
        .get("data")
        .and_then(|d| d.get("list"))
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::upstream("forum search response missing data.list"))?;

    let mut posts = Vec::with_capacity(list.len());
    for item in list {
        match serde_json::from_value::<Post>(item.clone()) {
            Ok(post) => posts.push(post),
            Err(e) => tracing::warn!(error = %e, "skipping malformed post in search response"),
        }
    }
    Ok(posts)
}

/// Parse the comment envelope: `{"success": true, "data": {"data": [...]}}`.
fn parse_comment_body(body: &Value) -> Result<Vec<Comment>, AgentError> {
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !success {
        return Err(AgentError::upstream("forum comment request rejected"));
    }

    let list = body
        .get("data")
        .and_then(|d| d.get("data"))
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::upstream("forum comment response missing data.data"))?;

    let mut comments = Vec::with_capacity(list.len());
    for item in list {
        match serde_json::from_value::<Comment>(item.clone()) {
            Ok(comment) => comments.push(comment),
            Err(e) => tracing::warn!(error = %e, "skipping malformed comment"),
        }
    }
    Ok(comments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_asks_for_comment_previews() {
        let params = search_params("计网", 1, 40);
        assert!(params.contains(&("keyword", "计网".to_string())));
        assert!(params.contains(&("limit", "40".to_string())));
        assert!(params.contains(&("comment_limit", "10".to_string())));
    }

    #[test]
    fn search_envelope_parses_posts() {
        let body = serde_json::json!({
            "code": 20000,
            "data": {
                "list": [
                    {"pid": 1, "text": "计网怎么样", "timestamp": 1700000000,
                     "likenum": 3, "reply": 1, "comment_total": 1,
                     "comment_list": [{"text": "不错", "is_lz": 0}]},
                ],
                "total": 1
            }
        });
        let posts = parse_search_body(&body).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, 1);
        assert_eq!(posts[0].comments.len(), 1);
    }

    #[test]
    fn search_envelope_rejects_bad_code() {
        let body = serde_json::json!({"code": 40001, "message": "token expired"});
        let err = parse_search_body(&body).unwrap_err();
        assert!(err.to_string().contains("token expired"));
    }

    #[test]
    fn search_envelope_skips_malformed_entries() {
        let body = serde_json::json!({
            "code": 20000,
            "data": {"list": [
                {"pid": 1, "text": "ok"},
                {"text": "no pid"},
            ]}
        });
        let posts = parse_search_body(&body).unwrap();
        assert_eq!(posts.len(), 1);
    }

    #[test]
    fn comment_envelope_parses() {
        let body = serde_json::json!({
            "success": true,
            "data": {
                "data": [
                    {"text": "给分好", "is_lz": 1, "name_tag": null},
                    {"text": "同问", "is_lz": 0, "name_tag": "Alice"},
                ],
                "last_page": 1
            }
        });
        let comments = parse_comment_body(&body).unwrap();
        assert_eq!(comments.len(), 2);
        assert!(comments[0].author_is_poster);
        assert_eq!(comments[1].author_tag.as_deref(), Some("Alice"));
    }

    #[test]
    fn comment_envelope_rejects_failure() {
        let body = serde_json::json!({"success": false});
        assert!(parse_comment_body(&body).is_err());
    }
}
