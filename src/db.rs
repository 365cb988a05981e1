use crate::auth;
use crate::config::AppConfig;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "attendd.sqlite3";
const SESSION_SECRET_KEY: &str = "session.secret";

pub fn open_db(workspace: &Path, cfg: &AppConfig) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    seed_master_account(&conn, cfg)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            birth_day TEXT NOT NULL,
            gender TEXT NOT NULL,
            role TEXT NOT NULL,
            photo_path TEXT,
            phone TEXT,
            line_id TEXT,
            cacao_talk_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS organizations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS org_groups(
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(organization_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_org_groups_org ON org_groups(organization_id)",
        [],
    )?;

    // One organization and one group per user; assignment replaces the row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_organizations(
            user_id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(organization_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_organizations_org ON user_organizations(organization_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_groups(
            user_id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(group_id) REFERENCES org_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_groups_group ON user_groups(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS children(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            birth_day TEXT NOT NULL,
            gender TEXT NOT NULL,
            photo_path TEXT NOT NULL DEFAULT '',
            phone TEXT,
            line_id TEXT,
            cacao_talk_id TEXT,
            manager_id TEXT NOT NULL,
            assigned_admin_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(manager_id) REFERENCES users(id),
            FOREIGN KEY(assigned_admin_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_children_assigned_admin ON children(assigned_admin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_children_manager ON children(manager_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            child_id TEXT NOT NULL,
            date TEXT NOT NULL,
            checked_by_id TEXT,
            checked_at TEXT NOT NULL,
            FOREIGN KEY(child_id) REFERENCES children(id),
            FOREIGN KEY(checked_by_id) REFERENCES users(id),
            UNIQUE(child_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS duties(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // UNIQUE(duty_id, date) is the final word when two batches race past validation.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS duty_assignments(
            id TEXT PRIMARY KEY,
            duty_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            date TEXT NOT NULL,
            assigned_by_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(duty_id) REFERENCES duties(id),
            FOREIGN KEY(child_id) REFERENCES children(id),
            FOREIGN KEY(assigned_by_id) REFERENCES users(id),
            UNIQUE(duty_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_duty_assignments_date ON duty_assignments(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_duty_assignments_child ON duty_assignments(child_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS revoked_sessions(
            jti TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn seed_master_account(conn: &Connection, cfg: &AppConfig) -> anyhow::Result<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ?",
            [&cfg.master_email],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if exists {
        return Ok(());
    }
    let hash = auth::hash_password(&cfg.master_password)?;
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, birth_day, gender, role, created_at)
         VALUES(?, 'Master Admin', ?, ?, '1980-01-01', 'male', 'master', ?)",
        (
            Uuid::new_v4().to_string(),
            &cfg.master_email,
            &hash,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    info!(email = %cfg.master_email, "seeded master account");
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Configured secret if any, otherwise the workspace's own (generated on first use).
pub fn session_secret(conn: &Connection, cfg: &AppConfig) -> anyhow::Result<String> {
    if let Some(s) = cfg.token_secret.as_ref() {
        return Ok(s.clone());
    }
    if let Some(v) = settings_get_json(conn, SESSION_SECRET_KEY)? {
        if let Some(s) = v.get("secret").and_then(|s| s.as_str()) {
            return Ok(s.to_string());
        }
    }
    let secret = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    settings_set_json(conn, SESSION_SECRET_KEY, &json!({ "secret": secret }))?;
    Ok(secret)
}

#[cfg(test)]
pub fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_seed_is_idempotent_and_secret_is_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::default();

        let conn = open_db(dir.path(), &cfg).expect("open");
        let first = session_secret(&conn, &cfg).expect("secret");
        drop(conn);

        let conn = open_db(dir.path(), &cfg).expect("reopen");
        let masters: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE role = 'master'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(masters, 1);
        assert_eq!(session_secret(&conn, &cfg).expect("secret"), first);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn configured_secret_wins() {
        let conn = test_conn();
        let cfg = AppConfig {
            token_secret: Some("from-config".to_string()),
            ..AppConfig::default()
        };
        assert_eq!(session_secret(&conn, &cfg).expect("secret"), "from-config");
        assert!(settings_get_json(&conn, SESSION_SECRET_KEY)
            .expect("settings")
            .is_none());
    }
}
