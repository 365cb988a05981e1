use crate::auth::{self, Claims};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::ipc::types::{AppState, Request};
use crate::model::parse_day;
use chrono::{FixedOffset, NaiveDate, Utc};
use rusqlite::Connection;

pub fn conn(state: &AppState) -> AppResult<&Connection> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

/// Open connection plus the caller's verified claims.
pub fn session<'a>(state: &'a AppState, req: &Request) -> AppResult<(&'a Connection, Claims)> {
    let conn = conn(state)?;
    let key = state.token_key.as_ref().ok_or(AppError::NoWorkspace)?;
    let claims = auth::authenticate(conn, key, req.token.as_deref(), now_ts())?;
    Ok((conn, claims))
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn today(cfg: &AppConfig) -> NaiveDate {
    let now = Utc::now();
    FixedOffset::east_opt(cfg.utc_offset_hours * 3600)
        .map(|offset| now.with_timezone(&offset).date_naive())
        .unwrap_or_else(|| now.date_naive())
}

pub fn required_str(params: &serde_json::Value, key: &str) -> AppResult<String> {
    optional_str(params, key).ok_or_else(|| AppError::bad_params(format!("missing {}", key)))
}

/// Trimmed string; blank counts as absent.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_day(params: &serde_json::Value, key: &str) -> AppResult<NaiveDate> {
    let raw = required_str(params, key)?;
    parse_day(&raw).ok_or_else(|| AppError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn string_list(params: &serde_json::Value, key: &str) -> AppResult<Vec<String>> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(AppError::bad_params(format!("missing {}", key)));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| AppError::bad_params(format!("{}[{}] must be a string", key, i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_list_rejects_non_string_entries() {
        let ids = string_list(&json!({ "ids": ["a", "b"] }), "ids").expect("ids");
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let err = string_list(&json!({ "ids": ["a", 1] }), "ids").unwrap_err();
        assert_eq!(err.code(), "bad_params");
        assert_eq!(err.to_string(), "ids[1] must be a string");

        let err = string_list(&json!({ "ids": "a" }), "ids").unwrap_err();
        assert_eq!(err.code(), "bad_params");
    }
}
