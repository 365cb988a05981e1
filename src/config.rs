//! Runtime settings, layered as defaults < `<workspace>/attendd.toml` < environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "attendd.toml";
pub const MAX_TOKEN_TTL_DAYS: i64 = 365;
pub const MAX_DUTY_LOOKBACK_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Explicit HMAC key for session tokens. When unset the workspace keeps its own.
    pub token_secret: Option<String>,
    pub token_ttl_days: i64,
    /// Offset used to decide what "today" is for attendance.
    pub utc_offset_hours: i32,
    pub master_email: String,
    pub master_password: String,
    pub max_photo_bytes: usize,
    pub duty_lookback_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_days: 7,
            utc_offset_hours: 9,
            master_email: "master@example.com".to_string(),
            master_password: "master@123".to_string(),
            max_photo_bytes: 1024 * 1024,
            duty_lookback_days: 7,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    token_secret: Option<String>,
    token_ttl_days: Option<i64>,
    utc_offset_hours: Option<i32>,
    master_email: Option<String>,
    master_password: Option<String>,
    max_photo_bytes: Option<usize>,
    duty_lookback_days: Option<i64>,
}

impl AppConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Defaults, then the workspace file (if present), then the environment.
    pub fn for_workspace(workspace: &Path) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        let path = workspace.join(CONFIG_FILE_NAME);
        if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
            cfg.apply_file_text(&text)
                .with_context(|| format!("invalid config file {}", path.to_string_lossy()))?;
        }
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    fn apply_file_text(&mut self, text: &str) -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.token_secret {
            self.token_secret = Some(v);
        }
        if let Some(v) = file.token_ttl_days {
            self.token_ttl_days = v;
        }
        if let Some(v) = file.utc_offset_hours {
            self.utc_offset_hours = v;
        }
        if let Some(v) = file.master_email {
            self.master_email = v;
        }
        if let Some(v) = file.master_password {
            self.master_password = v;
        }
        if let Some(v) = file.max_photo_bytes {
            self.max_photo_bytes = v;
        }
        if let Some(v) = file.duty_lookback_days {
            self.duty_lookback_days = v;
        }
        self.validate()
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = get("ATTENDD_TOKEN_SECRET").filter(|s| !s.is_empty()) {
            self.token_secret = Some(v);
        }
        if let Some(v) = get("ATTENDD_TOKEN_TTL_DAYS") {
            self.token_ttl_days = v
                .parse()
                .context("ATTENDD_TOKEN_TTL_DAYS must be an integer")?;
        }
        if let Some(v) = get("ATTENDD_UTC_OFFSET_HOURS") {
            self.utc_offset_hours = v
                .parse()
                .context("ATTENDD_UTC_OFFSET_HOURS must be an integer")?;
        }
        if let Some(v) = get("ATTENDD_MASTER_EMAIL") {
            self.master_email = v;
        }
        if let Some(v) = get("ATTENDD_MASTER_PASSWORD") {
            self.master_password = v;
        }
        if let Some(v) = get("ATTENDD_MAX_PHOTO_BYTES") {
            self.max_photo_bytes = v
                .parse()
                .context("ATTENDD_MAX_PHOTO_BYTES must be a byte count")?;
        }
        if let Some(v) = get("ATTENDD_DUTY_LOOKBACK_DAYS") {
            self.duty_lookback_days = v
                .parse()
                .context("ATTENDD_DUTY_LOOKBACK_DAYS must be an integer")?;
        }
        self.validate()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_TOKEN_TTL_DAYS).contains(&self.token_ttl_days) {
            anyhow::bail!("token_ttl_days must be between 1 and {MAX_TOKEN_TTL_DAYS}");
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            anyhow::bail!("utc_offset_hours must be between -12 and 14");
        }
        if !(0..=MAX_DUTY_LOOKBACK_DAYS).contains(&self.duty_lookback_days) {
            anyhow::bail!("duty_lookback_days must be between 0 and {MAX_DUTY_LOOKBACK_DAYS}");
        }
        if self.master_email.trim().is_empty() || self.master_password.is_empty() {
            anyhow::bail!("master account email and password must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_are_overridden_by_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "token_ttl_days = 3\nutc_offset_hours = 0\n",
        )
        .expect("write config");

        let mut cfg = AppConfig::default();
        let text = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).expect("read");
        cfg.apply_file_text(&text).expect("apply file");
        assert_eq!(cfg.token_ttl_days, 3);
        assert_eq!(cfg.utc_offset_hours, 0);

        let env: HashMap<&str, &str> = [("ATTENDD_TOKEN_TTL_DAYS", "14")].into_iter().collect();
        cfg.apply_env(|k| env.get(k).map(|s| s.to_string()))
            .expect("apply env");
        assert_eq!(cfg.token_ttl_days, 14);
        assert_eq!(cfg.utc_offset_hours, 0);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let mut cfg = AppConfig::default();
        assert!(cfg.apply_file_text("colour = \"blue\"\n").is_err());
        assert!(cfg.apply_file_text("token_ttl_days = 0\n").is_err());

        let mut cfg = AppConfig::default();
        let res = cfg.apply_env(|k| (k == "ATTENDD_UTC_OFFSET_HOURS").then(|| "abc".to_string()));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let huge = format!("{}", i64::MAX);
        for text in [
            format!("duty_lookback_days = {huge}\n"),
            format!("token_ttl_days = {huge}\n"),
            "token_ttl_days = 366\n".to_string(),
            "duty_lookback_days = 3651\n".to_string(),
        ] {
            let mut cfg = AppConfig::default();
            assert!(cfg.apply_file_text(&text).is_err(), "accepted {text:?}");
        }

        let mut cfg = AppConfig::default();
        let res = cfg.apply_env(|k| (k == "ATTENDD_DUTY_LOOKBACK_DAYS").then(|| huge.clone()));
        assert!(res.is_err());

        let mut cfg = AppConfig::default();
        cfg.apply_file_text("token_ttl_days = 365\nduty_lookback_days = 3650\n")
            .expect("upper bounds are inclusive");
    }
}
