use crate::duty::DutyConflict;
use rusqlite::ErrorCode;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadParams(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("email is already registered")]
    EmailTaken,
    #[error(transparent)]
    Duty(#[from] DutyConflict),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::EmailTaken => "email_taken",
            Self::Duty(c) => c.code(),
            Self::NoWorkspace => "no_workspace",
            Self::Db(e) if is_constraint_violation(e) => "db_constraint_failed",
            Self::Db(_) => "db_query_failed",
            Self::Other(_) => "io_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Duty(c) => Some(json!({
                "index": c.index(),
                "dutyId": c.triple().duty_id,
                "childId": c.triple().child_id,
                "date": c.triple().date.format("%Y-%m-%d").to_string(),
            })),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> serde_json::Value {
        crate::ipc::error::err(id, self.code(), self.to_string(), self.details())
    }
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}
