use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::agent::{Agent, ExtractionRequest};

pub const RATE_LIMITED_BODY: &str = "429 Failure – rate limit exceeded";
pub const USE_POST_BODY: &str = "Please use POST request instead";

/// Fixed-window request limiter.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Window>,
}

struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// `true` if the request may proceed.
    pub fn check(&self, now: Instant) -> bool {
        let mut window = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub limiter: Arc<RateLimiter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractPayload {
    goal: Option<String>,
    base_url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/", any(extract_handler)).with_state(state)
}

fn parse_request(body: &[u8]) -> Result<ExtractionRequest, serde_json::Error> {
    let payload: ExtractPayload = if body.iter().all(u8::is_ascii_whitespace) {
        ExtractPayload::default()
    } else {
        serde_json::from_slice(body)?
    };
    Ok(ExtractionRequest::new(payload.goal, payload.base_url))
}

async fn extract_handler(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    if !state.limiter.check(Instant::now()) {
        tracing::warn!("rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY).into_response();
    }

    if method != Method::POST {
        return USE_POST_BODY.into_response();
    }

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")).into_response();
        }
    };

    tracing::info!(goal = %request.goal, url = %request.starting_url, "extraction requested");

    // The caller may disconnect; the job keeps going on its own task.
    match state.agent.spawn(request).await {
        Ok(Ok(outcome)) => outcome.answer.into_response(),
        Err(e) => {
            tracing::error!("job task did not finish: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("job task did not finish: {e}"),
            )
                .into_response()
        }
        Ok(Err(failure)) => {
            let job = failure
                .job_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string());
            tracing::error!(job_id = failure.job_id, "job failed: {failure}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("job {job} failed: {failure}"),
            )
                .into_response()
        }
    }
}
