use crate::auth::require_role;
use crate::backup;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{required_str, session};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn require_master(state: &AppState, req: &Request) -> AppResult<PathBuf> {
    let (_conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    state.workspace.clone().ok_or(AppError::NoWorkspace)
}

fn export_bundle(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let workspace_path = require_master(state, req)?;
    let out_path = required_str(&req.params, "outPath")?;

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }
    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))?;
    info!(path = %out_path, entries = export.entry_count, "workspace bundle exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256,
    }))
}

fn import_bundle(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let workspace_path = require_master(state, req)?;
    let in_path = required_str(&req.params, "inPath")?;
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(AppError::not_found(format!("bundle file not found: {in_path}")));
    }

    // Drop open handle before replacing file.
    state.db = None;
    state.token_key = None;
    let imported = backup::import_workspace_bundle(&src, &workspace_path);
    let reopened = open_workspace(state, &workspace_path);

    let import = match imported {
        Ok(v) => v,
        Err(e) => {
            if let Err(re) = reopened {
                warn!(error = ?re, "workspace reopen after failed import failed");
            }
            return Err(e.into());
        }
    };
    reopened?;
    info!(path = %in_path, uploads = import.upload_count, "workspace bundle imported");
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "uploadCount": import.upload_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, req),
        "backup.importWorkspaceBundle" => import_bundle(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
