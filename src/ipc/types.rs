use std::path::PathBuf;

use crate::auth::TokenKey;
use crate::config::AppConfig;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Session token issued by `auth.login`.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct AppState {
    pub config: AppConfig,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub token_key: Option<TokenKey>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            token_key: None,
        }
    }
}
