//! Backend error classification.
//!
//! Every repository failure path funnels the raw [`BackendError`] through
//! [`classify`]. A structured store error becomes a [`DomainError`]; anything
//! that does not decode as one is handed back untouched as a transport error.

use serde::Deserialize;

use crate::error::{BackendError, DomainError, ErrorCode, RepoError};

/// Status reported when the store sent a structured body without a status line.
const FALLBACK_STATUS: u16 = 500;

/// Error body as the table store serializes it.
///
/// JSON-light responses use `odata.error`; newer endpoints use `error`.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "odata.error", alias = "error")]
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: Option<DetailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetailMessage {
    Text(String),
    Localized { value: String },
}

impl DetailMessage {
    fn as_str(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Localized { value } => value,
        }
    }
}

/// Turn a raw backend failure into the repository's error taxonomy.
///
/// `table_name` fills the `{name}` slot of the table-scoped templates.
pub fn classify(raw: BackendError, table_name: &str) -> RepoError {
    let payload: ErrorPayload = match serde_json::from_str(raw.message.trim()) {
        Ok(payload) => payload,
        Err(_) => return RepoError::Transport(raw),
    };

    let code = ErrorCode::parse(&payload.error.code);
    let detail = payload
        .error
        .message
        .as_ref()
        .map(DetailMessage::as_str)
        .unwrap_or(raw.message.as_str());
    let message = render_message(&code, table_name, detail);

    RepoError::Domain(DomainError::new(
        message,
        &code,
        raw.status_code.unwrap_or(FALLBACK_STATUS),
    ))
}

fn render_message(code: &ErrorCode, table_name: &str, detail: &str) -> String {
    match code {
        ErrorCode::TableAlreadyExists => {
            format!("Error creating table. Table {table_name} already exists.")
        }
        ErrorCode::TableNotFound => {
            format!("Error creating entity. Table {table_name} Not Found. Is it created?")
        }
        ErrorCode::ResourceNotFound => "Error processing entity. Entity not found.".to_string(),
        ErrorCode::InvalidInput => join_lines(detail),
        ErrorCode::TableBeingDeleted => format!(
            "Error creating entity. Table {table_name} is being deleted. Try again later."
        ),
        ErrorCode::EntityAlreadyExists => "Error creating entity. Entity with the same \
                                           partitionKey and rowKey already exists."
            .to_string(),
        ErrorCode::Other(_) => detail.to_string(),
    }
}

/// Collapse a multi-line detail message into one line, keeping line order.
fn join_lines(detail: &str) -> String {
    detail
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
