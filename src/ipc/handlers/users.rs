use crate::auth::{self, require_role, require_staff};
use crate::error::{is_constraint_violation, AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{now_rfc3339, optional_str, required_str, session};
use crate::ipc::types::{AppState, Request};
use crate::model::{format_day, parse_birth_day, Gender, Role};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub(crate) struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    pub birth_day: NaiveDate,
    pub gender: Gender,
    pub role: Role,
    pub photo_path: Option<String>,
    pub phone: Option<String>,
    pub line_id: Option<String>,
    pub cacao_talk_id: Option<String>,
}

pub(crate) fn parse_role(raw: &str) -> AppResult<Role> {
    Role::parse(raw).ok_or_else(|| {
        AppError::bad_params("role must be one of master, superAdmin, admin, child")
    })
}

pub(crate) fn parse_gender(raw: &str) -> AppResult<Gender> {
    Gender::parse(raw).ok_or_else(|| AppError::bad_params("gender must be male or female"))
}

pub(crate) fn parse_birth_day_param(params: &serde_json::Value) -> AppResult<NaiveDate> {
    let raw = required_str(params, "birthDay")?;
    parse_birth_day(&raw).ok_or_else(|| AppError::bad_params("birthDay must be YYYY-MM-DD"))
}

pub(crate) fn parse_new_user(params: &serde_json::Value) -> AppResult<NewUser> {
    let missing: Vec<&str> = ["name", "email", "password", "birthDay", "gender", "role"]
        .into_iter()
        .filter(|k| optional_str(params, k).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::bad_params(format!(
            "missing {}",
            missing.join(", ")
        )));
    }
    Ok(NewUser {
        name: required_str(params, "name")?,
        email: required_str(params, "email")?,
        password: params
            .get("password")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        birth_day: parse_birth_day_param(params)?,
        gender: parse_gender(&required_str(params, "gender")?)?,
        role: parse_role(&required_str(params, "role")?)?,
        photo_path: optional_str(params, "photoPath"),
        phone: optional_str(params, "phone"),
        line_id: optional_str(params, "lineId"),
        cacao_talk_id: optional_str(params, "cacaoTalkId"),
    })
}

fn email_taken(conn: &Connection, email: &str, except_id: Option<&str>) -> AppResult<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()?;
    Ok(match (found, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

/// Inserts a user plus optional memberships. Callers own the transaction.
pub(crate) fn insert_user(
    conn: &Connection,
    user: &NewUser,
    organization_id: Option<&str>,
    group_id: Option<&str>,
) -> AppResult<String> {
    if email_taken(conn, &user.email, None)? {
        return Err(AppError::EmailTaken);
    }
    let id = Uuid::new_v4().to_string();
    let hash = auth::hash_password(&user.password)?;
    let inserted = conn.execute(
        "INSERT INTO users(
           id, name, email, password_hash, birth_day, gender, role,
           photo_path, phone, line_id, cacao_talk_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &user.name,
            &user.email,
            &hash,
            format_day(user.birth_day),
            user.gender.as_str(),
            user.role.as_str(),
            &user.photo_path,
            &user.phone,
            &user.line_id,
            &user.cacao_talk_id,
            now_rfc3339(),
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => return Err(AppError::EmailTaken),
        Err(e) => return Err(e.into()),
    }
    if let Some(org) = organization_id {
        set_user_organization(conn, &id, org)?;
    }
    if let Some(group) = group_id {
        set_user_group(conn, &id, group)?;
    }
    Ok(id)
}

pub(crate) fn set_user_organization(conn: &Connection, user_id: &str, org_id: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO user_organizations(user_id, organization_id) VALUES(?, ?)
         ON CONFLICT(user_id) DO UPDATE SET organization_id = excluded.organization_id",
        (user_id, org_id),
    )?;
    Ok(())
}

pub(crate) fn set_user_group(conn: &Connection, user_id: &str, group_id: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO user_groups(user_id, group_id) VALUES(?, ?)
         ON CONFLICT(user_id) DO UPDATE SET group_id = excluded.group_id",
        (user_id, group_id),
    )?;
    Ok(())
}

pub(crate) fn user_organization(conn: &Connection, user_id: &str) -> AppResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT organization_id FROM user_organizations WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub(crate) fn user_role(conn: &Connection, user_id: &str) -> AppResult<Option<Role>> {
    let raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?;
    Ok(raw.as_deref().and_then(Role::parse))
}

/// Public view of a user; never includes the password hash.
pub(crate) fn load_user(conn: &Connection, user_id: &str) -> AppResult<Option<serde_json::Value>> {
    Ok(conn
        .query_row(
            "SELECT u.id, u.name, u.email, u.birth_day, u.gender, u.role, u.photo_path,
                    u.phone, u.line_id, u.cacao_talk_id, u.created_at,
                    o.id, o.name, g.id, g.name
             FROM users u
             LEFT JOIN user_organizations uo ON uo.user_id = u.id
             LEFT JOIN organizations o ON o.id = uo.organization_id
             LEFT JOIN user_groups ug ON ug.user_id = u.id
             LEFT JOIN org_groups g ON g.id = ug.group_id
             WHERE u.id = ?",
            [user_id],
            |r| {
                let org_id: Option<String> = r.get(11)?;
                let group_id: Option<String> = r.get(13)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "birthDay": r.get::<_, String>(3)?,
                    "gender": r.get::<_, String>(4)?,
                    "role": r.get::<_, String>(5)?,
                    "photoPath": r.get::<_, Option<String>>(6)?,
                    "phone": r.get::<_, Option<String>>(7)?,
                    "lineId": r.get::<_, Option<String>>(8)?,
                    "cacaoTalkId": r.get::<_, Option<String>>(9)?,
                    "createdAt": r.get::<_, String>(10)?,
                    "organization": match org_id {
                        Some(id) => json!({ "id": id, "name": r.get::<_, Option<String>>(12)? }),
                        None => serde_json::Value::Null,
                    },
                    "group": match group_id {
                        Some(id) => json!({ "id": id, "name": r.get::<_, Option<String>>(14)? }),
                        None => serde_json::Value::Null,
                    },
                }))
            },
        )
        .optional()?)
}

fn group_in_organization(conn: &Connection, group_id: &str, org_id: &str) -> AppResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM org_groups WHERE id = ? AND organization_id = ?",
            (group_id, org_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn users_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let user = parse_new_user(&req.params)?;
    let org = optional_str(&req.params, "organizationId");
    let group = optional_str(&req.params, "groupId");

    if user.role != Role::Master && (org.is_none() || group.is_none()) {
        return Err(AppError::bad_params(
            "organizationId and groupId are required for this role",
        ));
    }
    if let (Some(o), Some(g)) = (org.as_deref(), group.as_deref()) {
        if !group_in_organization(conn, g, o)? {
            return Err(AppError::bad_params("group does not belong to organization"));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let id = insert_user(&tx, &user, org.as_deref(), group.as_deref())?;
    tx.commit()?;
    info!(user_id = %id, role = user.role.as_str(), "user created");
    Ok(json!({ "user": load_user(conn, &id)? }))
}

fn users_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let id = required_str(&req.params, "id")?;

    let Some(role) = user_role(conn, &id)? else {
        return Err(AppError::not_found("user not found"));
    };
    if id == claims.sub {
        return Err(AppError::Conflict("cannot delete your own account".to_string()));
    }
    if role == Role::Master {
        let masters: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'master'",
            [],
            |r| r.get(0),
        )?;
        if masters <= 1 {
            return Err(AppError::Conflict(
                "cannot delete the last master account".to_string(),
            ));
        }
    }

    // Explicit dependency order; no ON DELETE actions in the schema.
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE children SET assigned_admin_id = NULL WHERE assigned_admin_id = ?",
        [&id],
    )?;
    tx.execute(
        "UPDATE children SET manager_id = ? WHERE manager_id = ?",
        (&claims.sub, &id),
    )?;
    tx.execute(
        "UPDATE attendance SET checked_by_id = NULL WHERE checked_by_id = ?",
        [&id],
    )?;
    tx.execute(
        "UPDATE duty_assignments SET assigned_by_id = NULL WHERE assigned_by_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM user_groups WHERE user_id = ?", [&id])?;
    tx.execute("DELETE FROM user_organizations WHERE user_id = ?", [&id])?;
    tx.execute("DELETE FROM users WHERE id = ?", [&id])?;
    tx.commit()?;
    info!(user_id = %id, "user deleted");
    Ok(json!({ "ok": true }))
}

fn users_get(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let id = required_str(&req.params, "id")?;
    if claims.sub != id && claims.role != Role::Master {
        return Err(AppError::forbidden("you may only view your own profile"));
    }
    load_user(conn, &id)?
        .map(|u| json!({ "user": u }))
        .ok_or_else(|| AppError::not_found("user not found"))
}

fn users_update(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let id = required_str(&req.params, "id")?;
    if claims.sub != id && claims.role != Role::Master {
        return Err(AppError::forbidden("you may only edit your own profile"));
    }
    if user_role(conn, &id)?.is_none() {
        return Err(AppError::not_found("user not found"));
    }
    let p = &req.params;

    let tx = conn.unchecked_transaction()?;
    if let Some(name) = optional_str(p, "name") {
        tx.execute("UPDATE users SET name = ? WHERE id = ?", (&name, &id))?;
    }
    if let Some(email) = optional_str(p, "email") {
        if email_taken(&tx, &email, Some(&id))? {
            return Err(AppError::EmailTaken);
        }
        tx.execute("UPDATE users SET email = ? WHERE id = ?", (&email, &id))?;
    }
    if p.get("birthDay").is_some() {
        let birth = parse_birth_day_param(p)?;
        tx.execute(
            "UPDATE users SET birth_day = ? WHERE id = ?",
            (format_day(birth), &id),
        )?;
    }
    if let Some(gender) = optional_str(p, "gender") {
        let gender = parse_gender(&gender)?;
        tx.execute(
            "UPDATE users SET gender = ? WHERE id = ?",
            (gender.as_str(), &id),
        )?;
    }
    if let Some(role) = optional_str(p, "role") {
        let role = parse_role(&role)?;
        if claims.role != Role::Master {
            return Err(AppError::forbidden("only master may change roles"));
        }
        tx.execute("UPDATE users SET role = ? WHERE id = ?", (role.as_str(), &id))?;
    }
    if let Some(password) = p.get("password").and_then(|v| v.as_str()) {
        if password.is_empty() {
            return Err(AppError::bad_params("password must not be empty"));
        }
        let hash = auth::hash_password(password)?;
        tx.execute(
            "UPDATE users SET password_hash = ? WHERE id = ?",
            (&hash, &id),
        )?;
    }
    for (key, column) in [
        ("photoPath", "photo_path"),
        ("phone", "phone"),
        ("lineId", "line_id"),
        ("cacaoTalkId", "cacao_talk_id"),
    ] {
        if p.get(key).is_some() {
            // Blank or null clears the field.
            let value = optional_str(p, key);
            tx.execute(
                &format!("UPDATE users SET {} = ? WHERE id = ?", column),
                (&value, &id),
            )?;
        }
    }
    tx.commit()?;
    Ok(json!({ "user": load_user(conn, &id)? }))
}

fn admins_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;

    let mut stmt = conn.prepare(
        "SELECT id, name FROM users WHERE role = 'admin' ORDER BY name",
    )?;
    let admins = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut child_stmt = conn.prepare(
        "SELECT id, name, photo_path, birth_day FROM children
         WHERE assigned_admin_id = ? ORDER BY name",
    )?;
    let mut out = Vec::with_capacity(admins.len());
    for (id, name) in admins {
        let children = child_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "photoPath": r.get::<_, String>(2)?,
                    "birthDay": r.get::<_, String>(3)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(json!({ "id": id, "name": name, "assignedChildren": children }));
    }
    Ok(json!({ "admins": out }))
}

fn admins_get(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_staff(&claims)?;
    let id = required_str(&req.params, "id")?;
    let name: Option<String> = conn
        .query_row("SELECT name FROM users WHERE id = ?", [&id], |r| r.get(0))
        .optional()?;
    name.map(|n| json!({ "name": n }))
        .ok_or_else(|| AppError::not_found("user not found"))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.create" => users_create(state, req),
        "users.delete" => users_delete(state, req),
        "users.get" => users_get(state, req),
        "users.update" => users_update(state, req),
        "admins.list" => admins_list(state, req),
        "admins.get" => admins_get(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
