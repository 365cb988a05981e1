mod auth;
mod backup;
mod config;
mod db;
mod duty;
mod error;
mod grade;
mod ipc;
mod logging;
mod model;
mod photos;

use std::io::{self, BufRead, Write};
use tracing::{debug, error, info, warn};

fn main() {
    logging::init_logging();

    let config = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = ?e, "invalid environment configuration, using defaults");
            config::AppConfig::default()
        }
    };
    let mut state = ipc::AppState::new(config);
    info!(version = env!("CARGO_PKG_VERSION"), "attendd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        debug!(ok = resp["ok"].as_bool().unwrap_or(false), "response");
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
