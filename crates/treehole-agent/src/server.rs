//! Web front-end for the agent.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Run a query; the answer streams back as SSE |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # SSE protocol
//!
//! Every event is a JSON object with a `type` field:
//!
//! - `connected` — the query was accepted
//! - `status` — progress text for the UI
//! - `search_history` — the retrieval passes, once retrieval finishes
//! - `metadata` — candidate/source counts and source previews
//! - `stream` — one chunk of the answer, in `content`
//! - `info` — a user-facing notice (e.g. nothing was found)
//! - `complete` — the answer is finished
//! - `error` — the query failed, in `message`
//!
//! Comment lines are sent periodically as keep-alive.
//!
//! # Error Contract
//!
//! Request validation failures return HTTP 400 with
//! `{ "error": { "code": "bad_request", "message": "..." } }`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use treehole_core::{AgentError, Query};

use crate::agent::Agent;
use crate::config::Config;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
}

/// Starts the web server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let agent = Arc::new(Agent::from_config(config)?);
    let state = AppState { agent };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Web server listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Request / response types ============

/// Body of `POST /api/query`. `mode` selects the retrieval strategy:
/// 1 = manual keyword, 2 = automatic, 3 = course review.
#[derive(Debug, Deserialize)]
struct QueryRequest {
    mode: u8,
    #[serde(default)]
    keyword: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    course: Option<String>,
    #[serde(default)]
    teachers: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Validate a request body into a [`Query`].
fn build_query(req: &QueryRequest) -> Result<Query, String> {
    match req.mode {
        1 => {
            let keyword = req
                .keyword
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .ok_or("keyword is required for mode 1")?;
            let question = req
                .question
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .unwrap_or(keyword);
            Ok(Query::manual(keyword, question))
        }
        2 => {
            let question = req
                .question
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .ok_or("question is required for mode 2")?;
            Ok(Query::auto(question))
        }
        3 => {
            let course = req
                .course
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or("course is required for mode 3")?;
            let teachers =
                treehole_core::review::parse_teacher_input(req.teachers.as_deref().unwrap_or(""));
            Ok(Query::course_review(course, teachers))
        }
        other => Err(format!("unknown mode {other}, expected 1, 2, or 3")),
    }
}

// ============ Handlers ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let query = build_query(&request).map_err(bad_request)?;

    let (tx, rx) = mpsc::channel::<Event>(32);
    tokio::spawn(run_query_stream(state.agent.clone(), query, tx));

    let stream = rx.map(Ok);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

fn json_event(value: serde_json::Value) -> Event {
    match Event::default().json_data(&value) {
        Ok(event) => event,
        Err(_) => Event::default().data("{\"type\":\"error\",\"message\":\"serialization failed\"}"),
    }
}

async fn run_query_stream(agent: Arc<Agent>, query: Query, mut tx: mpsc::Sender<Event>) {
    macro_rules! emit {
        ($value:expr) => {
            if tx.send(json_event($value)).await.is_err() {
                return;
            }
        };
    }

    emit!(serde_json::json!({"type": "connected"}));
    emit!(serde_json::json!({"type": "status", "message": "正在检索树洞..."}));

    let answer = match agent.answer(&query).await {
        Ok(answer) => answer,
        Err(AgentError::SearchExhausted) => {
            emit!(serde_json::json!({
                "type": "info",
                "message": "没有找到相关的树洞讨论，可以换个问法或关键词再试。",
            }));
            emit!(serde_json::json!({"type": "complete"}));
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "query failed");
            emit!(serde_json::json!({"type": "error", "message": e.to_string()}));
            return;
        }
    };

    emit!(serde_json::json!({
        "type": "search_history",
        "iterations": answer.context.history,
    }));
    emit!(serde_json::json!({
        "type": "metadata",
        "candidate_count": answer.context.candidate_count,
        "source_count": answer.context.source_count(),
        "sources": answer.context.sources(),
    }));
    emit!(serde_json::json!({"type": "status", "message": "正在生成回答..."}));

    let mut stream = answer.stream;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => {
                emit!(serde_json::json!({"type": "stream", "content": text}));
            }
            Err(e) => {
                tracing::warn!(error = %e, "answer stream failed");
                emit!(serde_json::json!({"type": "error", "message": e.to_string()}));
                return;
            }
        }
    }

    emit!(serde_json::json!({"type": "complete"}));
}

#[cfg(test)]
mod tests {
    use super::*;
    use treehole_core::QueryMode;

    fn request(json: &str) -> QueryRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn mode_1_requires_keyword() {
        let err = build_query(&request(r#"{"mode": 1}"#)).unwrap_err();
        assert!(err.contains("keyword"));

        let query =
            build_query(&request(r#"{"mode": 1, "keyword": "计网", "question": "怎么样"}"#))
                .unwrap();
        assert!(matches!(query.mode, QueryMode::Manual { .. }));
        assert_eq!(query.raw_text, "怎么样");
    }

    #[test]
    fn mode_1_defaults_question_to_keyword() {
        let query = build_query(&request(r#"{"mode": 1, "keyword": "计网"}"#)).unwrap();
        assert_eq!(query.raw_text, "计网");
    }

    #[test]
    fn mode_2_requires_question() {
        assert!(build_query(&request(r#"{"mode": 2}"#)).is_err());
        let query = build_query(&request(r#"{"mode": 2, "question": "选课建议"}"#)).unwrap();
        assert!(matches!(query.mode, QueryMode::Auto));
    }

    #[test]
    fn mode_3_parses_teacher_list() {
        let query = build_query(&request(
            r#"{"mode": 3, "course": "计网", "teachers": "zhx, yyx"}"#,
        ))
        .unwrap();
        match query.mode {
            QueryMode::CourseReview { course, teachers } => {
                assert_eq!(course, "计网");
                assert_eq!(teachers, vec!["zhx", "yyx"]);
            }
            _ => panic!("expected course review"),
        }
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(build_query(&request(r#"{"mode": 9}"#)).is_err());
    }
}
