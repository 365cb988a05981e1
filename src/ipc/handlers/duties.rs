use crate::auth::require_staff;
use crate::duty;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{optional_str, required_str, session, string_list, today};
use crate::ipc::types::{AppState, Request};
use crate::model::parse_day;
use chrono::{Days, NaiveDate};
use serde_json::json;

fn duties_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    Ok(json!({ "duties": duty::list_duties(conn)? }))
}

fn duties_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let name = required_str(&req.params, "name")?;
    Ok(json!({ "duty": duty::create_duty(conn, &name)? }))
}

fn duties_rename(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let id = required_str(&req.params, "id")?;
    let name = required_str(&req.params, "name")?;
    Ok(json!({ "duty": duty::rename_duty(conn, &id, &name)? }))
}

fn duties_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let id = required_str(&req.params, "id")?;
    duty::delete_duty(conn, &id)?;
    Ok(json!({ "ok": true }))
}

fn default_since(today: NaiveDate, lookback_days: i64) -> AppResult<NaiveDate> {
    u64::try_from(lookback_days)
        .ok()
        .and_then(|days| today.checked_sub_days(Days::new(days)))
        .ok_or_else(|| AppError::bad_params("duty_lookback_days is out of range"))
}

fn assignments_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let since = match optional_str(&req.params, "since") {
        Some(raw) => {
            parse_day(&raw).ok_or_else(|| AppError::bad_params("since must be YYYY-MM-DD"))?
        }
        None => default_since(today(&state.config), state.config.duty_lookback_days)?,
    };
    Ok(json!({
        "since": since.format("%Y-%m-%d").to_string(),
        "assignments": duty::list_since(conn, since)?,
    }))
}

fn assignments_assign(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let Some(items) = req.params.get("assignments").and_then(|v| v.as_array()) else {
        return Err(AppError::bad_params("missing assignments"));
    };
    let batch = duty::parse_triples(items)?;
    let created = duty::assign_batch(conn, &claims.sub, &batch)?;
    Ok(json!({ "assignments": created }))
}

fn assignments_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let id = required_str(&req.params, "id")?;
    duty::delete_assignment(conn, &id, &claims.sub)?;
    Ok(json!({ "ok": true }))
}

fn assignments_bulk_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let ids = string_list(&req.params, "ids")?;
    let deleted = duty::bulk_delete(conn, &ids, &claims.sub)?;
    Ok(json!({ "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "duties.list" => duties_list(state, req),
        "duties.create" => duties_create(state, req),
        "duties.rename" => duties_rename(state, req),
        "duties.delete" => duties_delete(state, req),
        "dutyAssignments.list" => assignments_list(state, req),
        "dutyAssignments.assign" => assignments_assign(state, req),
        "dutyAssignments.delete" => assignments_delete(state, req),
        "dutyAssignments.bulkDelete" => assignments_bulk_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
