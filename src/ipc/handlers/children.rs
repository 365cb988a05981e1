use crate::auth::{require_at_least, require_staff, Claims};
use crate::error::{AppError, AppResult};
use crate::grade::{format_birth_day, school_grade};
use crate::ipc::error::respond;
use crate::ipc::handlers::users::{parse_birth_day_param, parse_gender, user_role};
use crate::ipc::helpers::{now_rfc3339, optional_str, required_str, session, today};
use crate::ipc::types::{AppState, Request};
use crate::model::{format_day, parse_birth_day, Role};
use crate::photos;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const CHILD_SELECT: &str = "SELECT
       c.id, c.name, c.birth_day, c.gender, c.photo_path, c.phone, c.line_id,
       c.cacao_talk_id, c.manager_id, m.name, c.assigned_admin_id, a.name, c.created_at
     FROM children c
     LEFT JOIN users m ON m.id = c.manager_id
     LEFT JOIN users a ON a.id = c.assigned_admin_id";

fn map_child(r: &rusqlite::Row<'_>, as_of: NaiveDate) -> rusqlite::Result<serde_json::Value> {
    let birth_day: String = r.get(2)?;
    let birth = parse_birth_day(&birth_day);
    let assigned_id: Option<String> = r.get(10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "birthDay": birth_day,
        "birthDayLabel": birth.map(format_birth_day),
        "grade": birth.map(|b| school_grade(b, as_of)).unwrap_or(""),
        "gender": r.get::<_, String>(3)?,
        "photoPath": r.get::<_, String>(4)?,
        "phone": r.get::<_, Option<String>>(5)?,
        "lineId": r.get::<_, Option<String>>(6)?,
        "cacaoTalkId": r.get::<_, Option<String>>(7)?,
        "manager": {
            "id": r.get::<_, String>(8)?,
            "name": r.get::<_, Option<String>>(9)?,
        },
        "assignedAdmin": match assigned_id {
            Some(id) => json!({ "id": id, "name": r.get::<_, Option<String>>(11)? }),
            None => serde_json::Value::Null,
        },
        "createdAt": r.get::<_, String>(12)?,
    }))
}

fn load_child(conn: &Connection, id: &str, as_of: NaiveDate) -> AppResult<serde_json::Value> {
    let sql = format!("{CHILD_SELECT} WHERE c.id = ?");
    conn.query_row(&sql, [id], |r| map_child(r, as_of))
        .optional()?
        .ok_or_else(|| AppError::not_found("child not found"))
}

struct ChildAccess {
    assigned_admin_id: Option<String>,
    photo_path: String,
}

/// Loads the access-relevant columns and checks the caller may touch the child.
fn authorize_child(conn: &Connection, claims: &Claims, child_id: &str) -> AppResult<ChildAccess> {
    require_staff(claims)?;
    let access = conn
        .query_row(
            "SELECT assigned_admin_id, photo_path FROM children WHERE id = ?",
            [child_id],
            |r| {
                Ok(ChildAccess {
                    assigned_admin_id: r.get(0)?,
                    photo_path: r.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("child not found"))?;
    let assigned_to_caller = access.assigned_admin_id.as_deref() == Some(claims.sub.as_str());
    if claims.role.at_least(Role::SuperAdmin) || assigned_to_caller {
        Ok(access)
    } else {
        Err(AppError::forbidden("child is not assigned to you"))
    }
}

fn children_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let as_of = today(&state.config);
    let assigned_only = match optional_str(&req.params, "scope").as_deref() {
        None | Some("all") => false,
        Some("assigned") => true,
        Some(other) => {
            return Err(AppError::bad_params(format!(
                "scope must be all or assigned, got {other}"
            )))
        }
    };

    let rows = if assigned_only {
        let sql = format!("{CHILD_SELECT} WHERE c.assigned_admin_id = ? ORDER BY c.name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([&claims.sub], |r| map_child(r, as_of))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    } else {
        let sql = format!("{CHILD_SELECT} ORDER BY c.name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |r| map_child(r, as_of))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    Ok(json!({ "children": rows }))
}

fn children_get(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let child_id = required_str(&req.params, "childId")?;
    authorize_child(conn, &claims, &child_id)?;
    Ok(json!({ "child": load_child(conn, &child_id, today(&state.config))? }))
}

fn children_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let p = &req.params;
    let name = required_str(p, "name")?;
    let birth = parse_birth_day_param(p)?;
    let gender = parse_gender(&required_str(p, "gender")?)?;
    let manager_id = optional_str(p, "managerId").unwrap_or_else(|| claims.sub.clone());
    if user_role(conn, &manager_id)?.is_none() {
        return Err(AppError::not_found("manager not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO children(
           id, name, birth_day, gender, photo_path, phone, line_id, cacao_talk_id,
           manager_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            format_day(birth),
            gender.as_str(),
            optional_str(p, "photoPath").unwrap_or_default(),
            optional_str(p, "phone"),
            optional_str(p, "lineId"),
            optional_str(p, "cacaoTalkId"),
            &manager_id,
            now_rfc3339(),
        ),
    )?;
    info!(child_id = %id, by = %claims.sub, "child created");
    Ok(json!({ "child": load_child(conn, &id, today(&state.config))? }))
}

fn children_update(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let child_id = required_str(&req.params, "childId")?;
    let access = authorize_child(conn, &claims, &child_id)?;
    let p = &req.params;

    let tx = conn.unchecked_transaction()?;
    if let Some(name) = optional_str(p, "name") {
        tx.execute("UPDATE children SET name = ? WHERE id = ?", (&name, &child_id))?;
    }
    if p.get("birthDay").is_some() {
        let birth = parse_birth_day_param(p)?;
        tx.execute(
            "UPDATE children SET birth_day = ? WHERE id = ?",
            (format_day(birth), &child_id),
        )?;
    }
    if let Some(gender) = optional_str(p, "gender") {
        let gender = parse_gender(&gender)?;
        tx.execute(
            "UPDATE children SET gender = ? WHERE id = ?",
            (gender.as_str(), &child_id),
        )?;
    }
    if let Some(manager_id) = optional_str(p, "managerId") {
        if user_role(&tx, &manager_id)?.is_none() {
            return Err(AppError::not_found("manager not found"));
        }
        tx.execute(
            "UPDATE children SET manager_id = ? WHERE id = ?",
            (&manager_id, &child_id),
        )?;
    }
    let mut replaced_photo = None;
    if p.get("photoPath").is_some() {
        let photo = optional_str(p, "photoPath").unwrap_or_default();
        if photo != access.photo_path {
            replaced_photo = Some(access.photo_path.clone());
        }
        tx.execute(
            "UPDATE children SET photo_path = ? WHERE id = ?",
            (&photo, &child_id),
        )?;
    }
    for (key, column) in [
        ("phone", "phone"),
        ("lineId", "line_id"),
        ("cacaoTalkId", "cacao_talk_id"),
    ] {
        if p.get(key).is_some() {
            let value = optional_str(p, key);
            tx.execute(
                &format!("UPDATE children SET {} = ? WHERE id = ?", column),
                (&value, &child_id),
            )?;
        }
    }
    tx.commit()?;

    if let (Some(old), Some(ws)) = (replaced_photo, state.workspace.as_deref()) {
        photos::delete_photo(ws, &old);
    }
    Ok(json!({ "child": load_child(conn, &child_id, today(&state.config))? }))
}

fn children_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let child_id = required_str(&req.params, "childId")?;
    let access = authorize_child(conn, &claims, &child_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM attendance WHERE child_id = ?", [&child_id])?;
    tx.execute("DELETE FROM duty_assignments WHERE child_id = ?", [&child_id])?;
    tx.execute("DELETE FROM children WHERE id = ?", [&child_id])?;
    tx.commit()?;

    if let Some(ws) = state.workspace.as_deref() {
        photos::delete_photo(ws, &access.photo_path);
    }
    info!(child_id = %child_id, by = %claims.sub, "child deleted");
    Ok(json!({ "ok": true }))
}

fn children_assign_admin(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_at_least(&claims, Role::SuperAdmin)?;
    let child_id = required_str(&req.params, "childId")?;
    let admin_id = required_str(&req.params, "adminId")?;

    match user_role(conn, &admin_id)? {
        None => return Err(AppError::not_found("admin not found")),
        Some(role) if !role.is_staff() => {
            return Err(AppError::bad_params("adminId must refer to a staff user"))
        }
        Some(_) => {}
    }
    let n = conn.execute(
        "UPDATE children SET assigned_admin_id = ? WHERE id = ?",
        (&admin_id, &child_id),
    )?;
    if n == 0 {
        return Err(AppError::not_found("child not found"));
    }
    Ok(json!({ "child": load_child(conn, &child_id, today(&state.config))? }))
}

fn children_upload_photo(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let workspace = state.workspace.as_deref().ok_or(AppError::NoWorkspace)?;
    let file_name = required_str(&req.params, "fileName")?;
    let data = required_str(&req.params, "dataBase64")?;
    let child_id = optional_str(&req.params, "childId");

    let previous = match child_id.as_deref() {
        Some(id) => Some(authorize_child(conn, &claims, id)?.photo_path),
        None => None,
    };
    let bytes = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| AppError::bad_params(format!("dataBase64 is not valid base64: {e}")))?;
    let public_path = photos::store_photo(workspace, &file_name, &bytes, state.config.max_photo_bytes)?;

    if let (Some(id), Some(old)) = (child_id.as_deref(), previous) {
        conn.execute(
            "UPDATE children SET photo_path = ? WHERE id = ?",
            (&public_path, id),
        )?;
        photos::delete_photo(workspace, &old);
    }
    Ok(json!({ "photoPath": public_path }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "children.list" => children_list(state, req),
        "children.get" => children_get(state, req),
        "children.create" => children_create(state, req),
        "children.update" => children_update(state, req),
        "children.delete" => children_delete(state, req),
        "children.assignAdmin" => children_assign_admin(state, req),
        "children.uploadPhoto" => children_upload_photo(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
