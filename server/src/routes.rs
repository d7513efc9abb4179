//! HTTP handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use snafu::{ResultExt, Snafu};
use sms_spam::{PredictError, Verdict};

use crate::AppState;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// A failed request. Rendered as `{"error": "..."}`.
#[derive(Debug, Snafu)]
pub enum AppError {
    /// The request does not declare a JSON body.
    #[snafu(display(
        "Did not attempt to load JSON data because the request Content-Type was not 'application/json'"
    ))]
    NotJson,
    /// The body is not JSON.
    #[snafu(display("{source}"))]
    MalformedJson {
        /// Source error.
        source: serde_json::Error,
    },
    /// The body is JSON but not an object.
    #[snafu(display("Expected a JSON object"))]
    NotAnObject,
    /// `message` is something other than a string.
    #[snafu(display("Expected message to be a string"))]
    NotAString,
    /// The service refused or failed.
    #[snafu(context(false), display("{source}"))]
    Predict {
        /// Source error.
        source: PredictError,
    },
    /// The blocking task died.
    #[snafu(display("{source}"))]
    Join {
        /// Source error.
        source: tokio::task::JoinError,
    },
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Predict {
                source: PredictError::EmptyMessage,
            } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %snafu::Report::from_error(&self), "Prediction failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The web UI.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Classifies `{"message": "..."}`.
pub async fn predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Verdict>, AppError> {
    snafu::ensure!(declares_json(&headers), NotJsonSnafu);
    let message = parse_message(&body)?;
    let service = Arc::clone(&state.service);
    let verdict = tokio::task::spawn_blocking(move || service.predict(&message))
        .await
        .context(JoinSnafu)??;
    Ok(Json(verdict))
}

/// Accepts `application/json` and `application/*+json`, parameters aside.
fn declares_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

/// Extracts the message from the request body.
///
/// A missing message as well as any "falsy" JSON value counts as empty.
fn parse_message(body: &[u8]) -> Result<String, AppError> {
    let value: Value = serde_json::from_slice(body).context(MalformedJsonSnafu)?;
    let Value::Object(mut object) = value else {
        return NotAnObjectSnafu.fail();
    };
    match object.remove("message") {
        Some(Value::String(message)) => Ok(message),
        None => Err(PredictError::EmptyMessage.into()),
        Some(value) if is_falsy(&value) => Err(PredictError::EmptyMessage.into()),
        Some(_) => NotAStringSnafu.fail(),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(value) => !value,
        Value::Number(number) => number.as_f64() == Some(0.),
        Value::String(value) => value.is_empty(),
        Value::Array(values) => values.is_empty(),
        Value::Object(values) => values.is_empty(),
    }
}
