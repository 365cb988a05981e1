use crate::auth::{self, require_staff};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::handlers::users::{insert_user, load_user, parse_new_user, user_organization};
use crate::ipc::helpers::{conn, now_rfc3339, now_ts, required_str, session};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub(crate) const DEFAULT_GROUP_NAME: &str = "default group";

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("invalid credentials".to_string())
}

fn auth_login(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let conn = conn(state)?;
    let key = state.token_key.as_ref().ok_or(AppError::NoWorkspace)?;
    let email = required_str(&req.params, "email")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::bad_params("missing password"))?;

    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, name, password_hash, role FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((user_id, name, hash, role)) = row else {
        return Err(invalid_credentials());
    };
    if !auth::verify_password(password, &hash) {
        return Err(invalid_credentials());
    }
    let role = Role::parse(&role)
        .ok_or_else(|| anyhow::anyhow!("user {user_id} has unknown role {role:?}"))?;

    let claims = auth::new_claims(
        &user_id,
        role,
        &email,
        &name,
        state.config.token_ttl_days,
        now_ts(),
    )?;
    let token = key.sign(&claims)?;
    info!(user_id = %user_id, role = role.as_str(), "signed in");
    Ok(json!({
        "token": token,
        "expiresAt": claims.exp,
        "user": {
            "id": claims.sub,
            "name": claims.name,
            "email": claims.email,
            "role": claims.role,
        }
    }))
}

fn auth_logout(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    auth::revoke(conn, &claims, now_ts())?;
    info!(user_id = %claims.sub, "signed out");
    Ok(json!({ "ok": true }))
}

fn auth_me(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (_conn, claims) = session(state, req)?;
    Ok(json!({
        "user": {
            "id": claims.sub,
            "name": claims.name,
            "email": claims.email,
            "role": claims.role,
        },
        "expiresAt": claims.exp,
    }))
}

/// First group of the organization, creating the default one when it has none.
pub(crate) fn first_group_or_create(conn: &Connection, org_id: &str) -> AppResult<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM org_groups WHERE organization_id = ?
             ORDER BY created_at, rowid LIMIT 1",
            [org_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO org_groups(id, organization_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, org_id, DEFAULT_GROUP_NAME, now_rfc3339()),
    )?;
    Ok(id)
}

fn auth_register(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let user = parse_new_user(&req.params)?;
    if user.role.rank() > claims.role.rank() {
        return Err(AppError::forbidden(format!(
            "{} may not register a {}",
            claims.role.as_str(),
            user.role.as_str()
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let id = if claims.role == Role::SuperAdmin && user.role == Role::Admin {
        let org_id = user_organization(&tx, &claims.sub)?.ok_or_else(|| {
            AppError::bad_params("your account is not attached to an organization")
        })?;
        let group_id = first_group_or_create(&tx, &org_id)?;
        insert_user(&tx, &user, Some(&org_id), Some(&group_id))?
    } else {
        insert_user(&tx, &user, None, None)?
    };
    tx.commit()?;
    info!(user_id = %id, role = user.role.as_str(), by = %claims.sub, "user registered");
    Ok(json!({ "user": load_user(conn, &id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.login" => auth_login(state, req),
        "auth.logout" => auth_logout(state, req),
        "auth.me" => auth_me(state, req),
        "auth.register" => auth_register(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
