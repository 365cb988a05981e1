use crate::auth::require_staff;
use crate::error::{AppError, AppResult};
use crate::grade::school_grade;
use crate::ipc::error::respond;
use crate::ipc::helpers::{now_rfc3339, optional_str, required_day, required_str, session, today};
use crate::ipc::types::{AppState, Request};
use crate::model::{format_day, parse_birth_day, parse_day};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

fn ensure_child(conn: &Connection, child_id: &str) -> AppResult<()> {
    let found = conn
        .query_row("SELECT 1 FROM children WHERE id = ?", [child_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(AppError::not_found("child not found")),
    }
}

fn is_checked(conn: &Connection, child_id: &str, day: NaiveDate) -> AppResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM attendance WHERE child_id = ? AND date = ?",
            (child_id, format_day(day)),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn insert_check(
    conn: &Connection,
    child_id: &str,
    day: NaiveDate,
    checked_by: &str,
) -> AppResult<serde_json::Value> {
    if is_checked(conn, child_id, day)? {
        return Err(AppError::Conflict("already checked in".to_string()));
    }
    let id = Uuid::new_v4().to_string();
    let checked_at = now_rfc3339();
    conn.execute(
        "INSERT INTO attendance(id, child_id, date, checked_by_id, checked_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, child_id, format_day(day), checked_by, &checked_at),
    )?;
    debug!(child_id, date = %day, "attendance checked");
    Ok(json!({
        "id": id,
        "childId": child_id,
        "date": format_day(day),
        "checkedById": checked_by,
        "checkedAt": checked_at,
    }))
}

fn remove_check(conn: &Connection, child_id: &str, day: NaiveDate) -> AppResult<bool> {
    let n = conn.execute(
        "DELETE FROM attendance WHERE child_id = ? AND date = ?",
        (child_id, format_day(day)),
    )?;
    Ok(n > 0)
}

fn attendance_check(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let child_id = required_str(&req.params, "childId")?;
    ensure_child(conn, &child_id)?;
    let record = insert_check(conn, &child_id, today(&state.config), &claims.sub)?;
    Ok(json!({ "attendance": record }))
}

fn attendance_uncheck(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let child_id = required_str(&req.params, "childId")?;
    ensure_child(conn, &child_id)?;
    let removed = remove_check(conn, &child_id, today(&state.config))?;
    Ok(json!({ "removed": removed }))
}

fn attendance_toggle(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let child_id = required_str(&req.params, "childId")?;
    let day = required_day(&req.params, "date")?;
    let action = required_str(&req.params, "action")?;
    ensure_child(conn, &child_id)?;

    match action.as_str() {
        "check" => {
            let record = insert_check(conn, &child_id, day, &claims.sub)?;
            Ok(json!({ "checked": true, "attendance": record }))
        }
        "uncheck" => {
            if !remove_check(conn, &child_id, day)? {
                return Err(AppError::not_found("no attendance record for that day"));
            }
            Ok(json!({ "checked": false }))
        }
        _ => Err(AppError::bad_params("action must be check or uncheck")),
    }
}

fn attendance_status(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, _claims) = session(state, req)?;
    let child_id = required_str(&req.params, "childId")?;
    let day = match optional_str(&req.params, "date") {
        Some(raw) => parse_day(&raw).ok_or_else(|| AppError::bad_params("date must be YYYY-MM-DD"))?,
        None => today(&state.config),
    };
    ensure_child(conn, &child_id)?;
    Ok(json!({
        "childId": child_id,
        "date": format_day(day),
        "checked": is_checked(conn, &child_id, day)?,
    }))
}

fn attendance_range(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let start = required_day(&req.params, "startDate")?;
    let end = required_day(&req.params, "endDate")?;
    if start > end {
        return Err(AppError::bad_params("startDate must not be after endDate"));
    }

    let mut records_by_child: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, child_id, date, checked_by_id, checked_at
             FROM attendance
             WHERE date >= ? AND date <= ?
             ORDER BY date DESC",
        )?;
        let rows = stmt.query_map((format_day(start), format_day(end)), |r| {
            Ok((
                r.get::<_, String>(1)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "date": r.get::<_, String>(2)?,
                    "checkedById": r.get::<_, Option<String>>(3)?,
                    "checkedAt": r.get::<_, String>(4)?,
                }),
            ))
        })?;
        for row in rows {
            let (child_id, record) = row?;
            records_by_child.entry(child_id).or_default().push(record);
        }
    }

    let as_of = today(&state.config);
    let mut stmt = conn.prepare(
        "SELECT id, name, birth_day, gender, photo_path FROM children ORDER BY name",
    )?;
    let children = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let out: Vec<serde_json::Value> = children
        .into_iter()
        .map(|(id, name, birth_day, gender, photo_path)| {
            let grade = parse_birth_day(&birth_day)
                .map(|b| school_grade(b, as_of))
                .unwrap_or("");
            let attendance = records_by_child.remove(&id).unwrap_or_default();
            json!({
                "id": id,
                "name": name,
                "birthDay": birth_day,
                "gender": gender,
                "photoPath": photo_path,
                "grade": grade,
                "attendance": attendance,
            })
        })
        .collect();

    Ok(json!({
        "startDate": format_day(start),
        "endDate": format_day(end),
        "children": out,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.range" => attendance_range(state, req),
        "attendance.status" => attendance_status(state, req),
        "attendance.check" => attendance_check(state, req),
        "attendance.uncheck" => attendance_uncheck(state, req),
        "attendance.toggle" => attendance_toggle(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
