use crate::auth::{require_role, Claims};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::handlers::auth::DEFAULT_GROUP_NAME;
use crate::ipc::handlers::users::{set_user_group, set_user_organization, user_organization, user_role};
use crate::ipc::helpers::{now_rfc3339, optional_str, required_str, session};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn organization_exists(conn: &Connection, id: &str) -> AppResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM organizations WHERE id = ?", [id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn insert_group(conn: &Connection, org_id: &str, name: &str) -> AppResult<serde_json::Value> {
    let id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    conn.execute(
        "INSERT INTO org_groups(id, organization_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, org_id, name, &created_at),
    )?;
    Ok(json!({
        "id": id,
        "organizationId": org_id,
        "name": name,
        "createdAt": created_at,
    }))
}

fn list_groups(conn: &Connection, org_id: &str) -> AppResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT g.id, g.name, g.created_at,
                (SELECT COUNT(*) FROM user_groups ug WHERE ug.group_id = g.id)
         FROM org_groups g
         WHERE g.organization_id = ?
         ORDER BY g.created_at, g.rowid",
    )?;
    let rows = stmt
        .query_map([org_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "memberCount": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn organizations_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let mut stmt = conn.prepare(
        "SELECT o.id, o.name, o.created_at,
                (SELECT COUNT(*) FROM user_organizations uo WHERE uo.organization_id = o.id)
         FROM organizations o
         ORDER BY o.name",
    )?;
    let orgs = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(orgs.len());
    for (id, name, created_at, members) in orgs {
        let groups = list_groups(conn, &id)?;
        out.push(json!({
            "id": id,
            "name": name,
            "createdAt": created_at,
            "memberCount": members,
            "groups": groups,
        }));
    }
    Ok(json!({ "organizations": out }))
}

fn organizations_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let name = required_str(&req.params, "name")?;
    let group_name =
        optional_str(&req.params, "groupName").unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());

    let id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO organizations(id, name, created_at) VALUES(?, ?, ?)",
        (&id, &name, &created_at),
    )?;
    let group = insert_group(&tx, &id, &group_name)?;
    tx.commit()?;
    info!(organization_id = %id, "organization created");
    Ok(json!({
        "organization": {
            "id": id,
            "name": name,
            "createdAt": created_at,
            "groups": [group],
        }
    }))
}

fn organizations_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let id = required_str(&req.params, "id")?;
    if !organization_exists(conn, &id)? {
        return Err(AppError::not_found("organization not found"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM user_groups
         WHERE group_id IN (SELECT id FROM org_groups WHERE organization_id = ?)",
        [&id],
    )?;
    tx.execute("DELETE FROM org_groups WHERE organization_id = ?", [&id])?;
    tx.execute(
        "DELETE FROM user_organizations WHERE organization_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM organizations WHERE id = ?", [&id])?;
    tx.commit()?;
    info!(organization_id = %id, "organization deleted");
    Ok(json!({ "ok": true }))
}

fn organizations_assign_user(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let user_id = required_str(&req.params, "userId")?;
    let org_id = required_str(&req.params, "organizationId")?;
    if user_role(conn, &user_id)?.is_none() {
        return Err(AppError::not_found("user not found"));
    }
    if !organization_exists(conn, &org_id)? {
        return Err(AppError::not_found("organization not found"));
    }

    let tx = conn.unchecked_transaction()?;
    // A group from the previous organization would no longer be valid.
    tx.execute(
        "DELETE FROM user_groups
         WHERE user_id = ?
           AND group_id NOT IN (SELECT id FROM org_groups WHERE organization_id = ?)",
        (&user_id, &org_id),
    )?;
    set_user_organization(&tx, &user_id, &org_id)?;
    tx.commit()?;
    Ok(json!({ "userId": user_id, "organizationId": org_id }))
}

fn organizations_super_admins(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.email, o.id, o.name
         FROM users u
         LEFT JOIN user_organizations uo ON uo.user_id = u.id
         LEFT JOIN organizations o ON o.id = uo.organization_id
         WHERE u.role = 'superAdmin'
         ORDER BY u.name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let org_id: Option<String> = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "organization": match org_id {
                    Some(id) => json!({ "id": id, "name": r.get::<_, Option<String>>(4)? }),
                    None => serde_json::Value::Null,
                },
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "superAdmins": rows }))
}

fn groups_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let name = required_str(&req.params, "name")?;
    let org_id = required_str(&req.params, "organizationId")?;
    if !organization_exists(conn, &org_id)? {
        return Err(AppError::not_found("organization not found"));
    }
    Ok(json!({ "group": insert_group(conn, &org_id, &name)? }))
}

fn groups_delete(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    require_role(&claims, Role::Master)?;
    let id = required_str(&req.params, "id")?;
    let org_id: Option<String> = conn
        .query_row(
            "SELECT organization_id FROM org_groups WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(org_id) = org_id else {
        return Err(AppError::not_found("group not found"));
    };
    let siblings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM org_groups WHERE organization_id = ?",
        [&org_id],
        |r| r.get(0),
    )?;
    if siblings <= 1 {
        return Err(AppError::Conflict(
            "an organization must keep at least one group".to_string(),
        ));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM user_groups WHERE group_id = ?", [&id])?;
    tx.execute("DELETE FROM org_groups WHERE id = ?", [&id])?;
    tx.commit()?;
    Ok(json!({ "ok": true }))
}

/// Organization of the calling superAdmin.
fn own_organization(conn: &Connection, claims: &Claims) -> AppResult<String> {
    require_role(claims, Role::SuperAdmin)?;
    user_organization(conn, &claims.sub)?
        .ok_or_else(|| AppError::bad_params("your account is not attached to an organization"))
}

fn org_groups_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let org_id = own_organization(conn, &claims)?;
    Ok(json!({ "organizationId": org_id, "groups": list_groups(conn, &org_id)? }))
}

fn org_groups_create(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let org_id = own_organization(conn, &claims)?;
    let name = required_str(&req.params, "name")?;
    Ok(json!({ "group": insert_group(conn, &org_id, &name)? }))
}

fn org_users_list(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let org_id = own_organization(conn, &claims)?;
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.email, u.role, g.id, g.name
         FROM users u
         JOIN user_organizations uo ON uo.user_id = u.id
         LEFT JOIN user_groups ug ON ug.user_id = u.id
         LEFT JOIN org_groups g ON g.id = ug.group_id
         WHERE uo.organization_id = ? AND u.role IN ('admin', 'child')
         ORDER BY u.name",
    )?;
    let rows = stmt
        .query_map([&org_id], |r| {
            let group_id: Option<String> = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "group": match group_id {
                    Some(id) => json!({ "id": id, "name": r.get::<_, Option<String>>(5)? }),
                    None => serde_json::Value::Null,
                },
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "organizationId": org_id, "users": rows }))
}

fn org_assign_group(state: &AppState, req: &Request) -> AppResult<serde_json::Value> {
    let (conn, claims) = session(state, req)?;
    let org_id = own_organization(conn, &claims)?;
    let user_id = required_str(&req.params, "userId")?;
    let group_id = required_str(&req.params, "groupId")?;

    let group_org: Option<String> = conn
        .query_row(
            "SELECT organization_id FROM org_groups WHERE id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .optional()?;
    match group_org {
        None => return Err(AppError::not_found("group not found")),
        Some(o) if o != org_id => {
            return Err(AppError::forbidden("group belongs to another organization"))
        }
        Some(_) => {}
    }
    if user_organization(conn, &user_id)?.as_deref() != Some(org_id.as_str()) {
        return Err(AppError::not_found("user not found in your organization"));
    }
    set_user_group(conn, &user_id, &group_id)?;
    Ok(json!({ "userId": user_id, "groupId": group_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "organizations.list" => organizations_list(state, req),
        "organizations.create" => organizations_create(state, req),
        "organizations.delete" => organizations_delete(state, req),
        "organizations.assignUser" => organizations_assign_user(state, req),
        "organizations.superAdmins" => organizations_super_admins(state, req),
        "groups.create" => groups_create(state, req),
        "groups.delete" => groups_delete(state, req),
        "org.groups.list" => org_groups_list(state, req),
        "org.groups.create" => org_groups_create(state, req),
        "org.users.list" => org_users_list(state, req),
        "org.assignGroup" => org_assign_group(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
