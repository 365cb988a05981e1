//! Duty roster: named duties and the per-day assignment of a child to each.
//!
//! # Invariants
//! - For a `(duty, date)` pair at most one child holds the duty.
//! - A submitted batch is either stored in full or not at all.
//! - Assignments are never edited in place; callers delete and resubmit.

use crate::error::{is_constraint_violation, AppError, AppResult};
use crate::model::{format_day, parse_day};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentTriple {
    pub duty_id: String,
    pub child_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DutyConflict {
    #[error("duplicate assignment for this student")]
    DuplicateForStudent {
        index: usize,
        triple: AssignmentTriple,
    },
    #[error("duty role already filled for this date")]
    RoleAlreadyFilled {
        index: usize,
        triple: AssignmentTriple,
        holder_child_id: String,
    },
}

impl DutyConflict {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateForStudent { .. } => "duplicate_assignment",
            Self::RoleAlreadyFilled { .. } => "duty_already_filled",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::DuplicateForStudent { index, .. } | Self::RoleAlreadyFilled { index, .. } => {
                *index
            }
        }
    }

    pub fn triple(&self) -> &AssignmentTriple {
        match self {
            Self::DuplicateForStudent { triple, .. } | Self::RoleAlreadyFilled { triple, .. } => {
                triple
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Duty {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DutyAssignment {
    pub id: String,
    pub date: String,
    pub duty: Duty,
    pub child_id: String,
    pub child_name: String,
    pub child_birth_day: String,
    pub assigned_by_id: Option<String>,
    pub assigned_by_name: Option<String>,
    pub created_at: String,
}

pub fn parse_triples(items: &[serde_json::Value]) -> AppResult<Vec<AssignmentTriple>> {
    if items.is_empty() {
        return Err(AppError::bad_params("assignments must not be empty"));
    }
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let field = |key: &str| {
                v.get(key)
                    .and_then(|x| x.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| AppError::bad_params(format!("assignments[{i}] missing {key}")))
            };
            let duty_id = field("dutyId")?;
            let child_id = field("childId")?;
            let date = parse_day(&field("date")?).ok_or_else(|| {
                AppError::bad_params(format!("assignments[{i}].date must be YYYY-MM-DD"))
            })?;
            Ok(AssignmentTriple {
                duty_id,
                child_id,
                date,
            })
        })
        .collect()
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> AppResult<bool> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// Checks every triple against stored assignments and against the triples
/// before it in the same batch. Stops at the first conflict.
pub fn check_batch(conn: &Connection, batch: &[AssignmentTriple]) -> AppResult<()> {
    let mut pending: HashMap<(&str, NaiveDate), &str> = HashMap::new();
    for (index, t) in batch.iter().enumerate() {
        if !row_exists(conn, "SELECT 1 FROM duties WHERE id = ?", &t.duty_id)? {
            return Err(AppError::not_found(format!(
                "assignments[{index}]: duty not found"
            )));
        }
        if !row_exists(conn, "SELECT 1 FROM children WHERE id = ?", &t.child_id)? {
            return Err(AppError::not_found(format!(
                "assignments[{index}]: child not found"
            )));
        }

        let stored: Option<String> = conn
            .query_row(
                "SELECT child_id FROM duty_assignments WHERE duty_id = ? AND date = ?",
                (&t.duty_id, format_day(t.date)),
                |r| r.get(0),
            )
            .optional()?;
        let holder = stored.or_else(|| {
            pending
                .get(&(t.duty_id.as_str(), t.date))
                .map(|c| c.to_string())
        });

        match holder {
            Some(child_id) if child_id == t.child_id => {
                return Err(DutyConflict::DuplicateForStudent {
                    index,
                    triple: t.clone(),
                }
                .into());
            }
            Some(child_id) => {
                return Err(DutyConflict::RoleAlreadyFilled {
                    index,
                    triple: t.clone(),
                    holder_child_id: child_id,
                }
                .into());
            }
            None => {
                pending.insert((t.duty_id.as_str(), t.date), t.child_id.as_str());
            }
        }
    }
    Ok(())
}

/// Validates and stores a batch in one transaction.
pub fn assign_batch(
    conn: &Connection,
    assigned_by: &str,
    batch: &[AssignmentTriple],
) -> AppResult<Vec<DutyAssignment>> {
    if batch.is_empty() {
        return Err(AppError::bad_params("assignments must not be empty"));
    }
    let tx = conn.unchecked_transaction()?;
    if let Err(e) = check_batch(&tx, batch) {
        debug!(code = e.code(), "duty batch rejected");
        return Err(e);
    }

    let ids = insert_batch(&tx, assigned_by, batch)?;
    tx.commit()?;
    info!(count = ids.len(), "duty assignments created");

    let mut by_id: HashMap<String, DutyAssignment> = list_by_ids(conn, &ids)?
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Inserts every triple, stopping at the first failure. The caller owns the
/// transaction and drops it uncommitted on error.
fn insert_batch(
    tx: &Transaction<'_>,
    assigned_by: &str,
    batch: &[AssignmentTriple],
) -> AppResult<Vec<String>> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut ids = Vec::with_capacity(batch.len());
    for t in batch {
        let id = Uuid::new_v4().to_string();
        let inserted = tx.execute(
            "INSERT INTO duty_assignments(id, duty_id, child_id, date, assigned_by_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, &t.duty_id, &t.child_id, format_day(t.date), assigned_by, &now),
        );
        if let Err(e) = inserted {
            if is_constraint_violation(&e) {
                warn!(duty_id = %t.duty_id, date = %t.date, "duty batch lost a race at the unique constraint");
            }
            return Err(e.into());
        }
        ids.push(id);
    }
    Ok(ids)
}

const ASSIGNMENT_SELECT: &str = "SELECT
       da.id, da.date, d.id, d.name, d.created_at,
       c.id, c.name, c.birth_day,
       da.assigned_by_id, u.name, da.created_at
     FROM duty_assignments da
     JOIN duties d ON d.id = da.duty_id
     JOIN children c ON c.id = da.child_id
     LEFT JOIN users u ON u.id = da.assigned_by_id";

fn map_assignment(r: &rusqlite::Row<'_>) -> rusqlite::Result<DutyAssignment> {
    Ok(DutyAssignment {
        id: r.get(0)?,
        date: r.get(1)?,
        duty: Duty {
            id: r.get(2)?,
            name: r.get(3)?,
            created_at: r.get(4)?,
        },
        child_id: r.get(5)?,
        child_name: r.get(6)?,
        child_birth_day: r.get(7)?,
        assigned_by_id: r.get(8)?,
        assigned_by_name: r.get(9)?,
        created_at: r.get(10)?,
    })
}

fn list_by_ids(conn: &Connection, ids: &[String]) -> AppResult<Vec<DutyAssignment>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("{ASSIGNMENT_SELECT} WHERE da.id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), map_assignment)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Assignments dated on or after `since`, newest first.
pub fn list_since(conn: &Connection, since: NaiveDate) -> AppResult<Vec<DutyAssignment>> {
    let sql = format!("{ASSIGNMENT_SELECT} WHERE da.date >= ? ORDER BY da.date DESC, d.created_at");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([format_day(since)], map_assignment)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes one assignment created by `caller`.
pub fn delete_assignment(conn: &Connection, id: &str, caller: &str) -> AppResult<()> {
    let n = conn.execute(
        "DELETE FROM duty_assignments WHERE id = ? AND assigned_by_id = ?",
        (id, caller),
    )?;
    if n == 0 {
        return Err(AppError::not_found(
            "duty assignment not found or not created by you",
        ));
    }
    Ok(())
}

/// Deletes the listed assignments created by `caller`; returns how many went.
pub fn bulk_delete(conn: &Connection, ids: &[String], caller: &str) -> AppResult<usize> {
    if ids.is_empty() {
        return Err(AppError::bad_params("ids must not be empty"));
    }
    let unique: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0usize;
    for id in unique {
        deleted += tx.execute(
            "DELETE FROM duty_assignments WHERE id = ? AND assigned_by_id = ?",
            (id, caller),
        )?;
    }
    if deleted == 0 {
        return Err(AppError::not_found(
            "no matching duty assignments created by you",
        ));
    }
    tx.commit()?;
    Ok(deleted)
}

pub fn list_duties(conn: &Connection) -> AppResult<Vec<Duty>> {
    let mut stmt =
        conn.prepare("SELECT id, name, created_at FROM duties ORDER BY created_at, rowid")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Duty {
                id: r.get(0)?,
                name: r.get(1)?,
                created_at: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn clean_name(name: &str) -> AppResult<String> {
    let t = name.trim();
    if t.is_empty() {
        return Err(AppError::bad_params("duty name must not be empty"));
    }
    Ok(t.to_string())
}

pub fn create_duty(conn: &Connection, name: &str) -> AppResult<Duty> {
    let duty = Duty {
        id: Uuid::new_v4().to_string(),
        name: clean_name(name)?,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO duties(id, name, created_at) VALUES(?, ?, ?)",
        (&duty.id, &duty.name, &duty.created_at),
    )?;
    Ok(duty)
}

pub fn rename_duty(conn: &Connection, id: &str, name: &str) -> AppResult<Duty> {
    let name = clean_name(name)?;
    let n = conn.execute("UPDATE duties SET name = ? WHERE id = ?", (&name, id))?;
    if n == 0 {
        return Err(AppError::not_found("duty not found"));
    }
    let duty = conn.query_row(
        "SELECT id, name, created_at FROM duties WHERE id = ?",
        [id],
        |r| {
            Ok(Duty {
                id: r.get(0)?,
                name: r.get(1)?,
                created_at: r.get(2)?,
            })
        },
    )?;
    Ok(duty)
}

pub fn delete_duty(conn: &Connection, id: &str) -> AppResult<()> {
    let in_use: i64 = conn.query_row(
        "SELECT COUNT(*) FROM duty_assignments WHERE duty_id = ?",
        [id],
        |r| r.get(0),
    )?;
    if in_use > 0 {
        return Err(AppError::Conflict(format!(
            "duty still has {in_use} assignment(s); delete them first"
        )));
    }
    let n = conn.execute("DELETE FROM duties WHERE id = ?", [id])?;
    if n == 0 {
        return Err(AppError::not_found("duty not found"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).expect("date")
    }

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO users(id, name, email, password_hash, birth_day, gender, role, created_at)
             VALUES('t1', 'Teacher', 't1@example.com', 'x', '1990-01-01', 'female', 'admin', 'now'),
                   ('t2', 'Other', 't2@example.com', 'x', '1990-01-01', 'male', 'admin', 'now')",
            [],
        )
        .expect("users");
        conn.execute(
            "INSERT INTO children(id, name, birth_day, gender, manager_id, created_at)
             VALUES('a', 'Aiko', '2011-05-01', 'female', 't1', 'now'),
                   ('b', 'Ben', '2011-06-01', 'male', 't1', 'now')",
            [],
        )
        .expect("children");
        conn.execute(
            "INSERT INTO duties(id, name, created_at) VALUES('clean', 'Cleaning', '1'), ('lunch', 'Lunch', '2')",
            [],
        )
        .expect("duties");
    }

    fn triple(duty: &str, child: &str, date: &str) -> AssignmentTriple {
        AssignmentTriple {
            duty_id: duty.to_string(),
            child_id: child.to_string(),
            date: day(date),
        }
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM duty_assignments", [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn cleaning_example_conflicts_and_next_day_succeeds() {
        let conn = test_conn();
        seed(&conn);
        assign_batch(&conn, "t1", &[triple("clean", "a", "2024-05-01")]).expect("seed assignment");

        let err = assign_batch(&conn, "t1", &[triple("clean", "b", "2024-05-01")]).unwrap_err();
        assert_eq!(err.code(), "duty_already_filled");

        let err = assign_batch(&conn, "t1", &[triple("clean", "a", "2024-05-01")]).unwrap_err();
        assert_eq!(err.code(), "duplicate_assignment");

        let created =
            assign_batch(&conn, "t1", &[triple("clean", "a", "2024-05-02")]).expect("next day");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].duty.name, "Cleaning");
        assert_eq!(created[0].date, "2024-05-02");
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn conflicting_batch_stores_nothing() {
        let conn = test_conn();
        seed(&conn);
        assign_batch(&conn, "t1", &[triple("clean", "a", "2024-05-01")]).expect("seed");

        let err = assign_batch(
            &conn,
            "t1",
            &[
                triple("lunch", "a", "2024-05-01"),
                triple("clean", "a", "2024-05-03"),
                triple("clean", "b", "2024-05-01"),
            ],
        )
        .unwrap_err();
        match err {
            AppError::Duty(c) => assert_eq!(c.index(), 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn unique_constraint_rolls_back_a_batch_that_slipped_past_validation() {
        let conn = test_conn();
        seed(&conn);
        let batch = [
            triple("lunch", "b", "2024-05-01"),
            triple("clean", "b", "2024-05-01"),
        ];
        check_batch(&conn, &batch).expect("batch is valid before the other writer commits");

        conn.execute(
            "INSERT INTO duty_assignments(id, duty_id, child_id, date, assigned_by_id, created_at)
             VALUES('other', 'clean', 'a', '2024-05-01', 't2', 'now')",
            [],
        )
        .expect("concurrent writer");

        let tx = conn.unchecked_transaction().expect("tx");
        let err = insert_batch(&tx, "t1", &batch).unwrap_err();
        assert_eq!(err.code(), "db_constraint_failed");
        drop(tx);

        assert_eq!(count(&conn), 1);
        let kept: String = conn
            .query_row("SELECT child_id FROM duty_assignments", [], |r| r.get(0))
            .expect("row");
        assert_eq!(kept, "a");
    }

    #[test]
    fn conflicts_inside_one_batch_are_caught() {
        let conn = test_conn();
        seed(&conn);
        let err = assign_batch(
            &conn,
            "t1",
            &[
                triple("clean", "a", "2024-05-01"),
                triple("clean", "b", "2024-05-01"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.code(), "duty_already_filled");

        let err = assign_batch(
            &conn,
            "t1",
            &[
                triple("clean", "a", "2024-05-01"),
                triple("clean", "a", "2024-05-01"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.code(), "duplicate_assignment");
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn unknown_references_are_not_found() {
        let conn = test_conn();
        seed(&conn);
        let err = assign_batch(&conn, "t1", &[triple("nope", "a", "2024-05-01")]).unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = assign_batch(&conn, "t1", &[triple("clean", "zz", "2024-05-01")]).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn parse_ignores_time_of_day() {
        let items = vec![serde_json::json!({
            "dutyId": "clean",
            "childId": "a",
            "date": "2024-05-01T15:30:00.000Z"
        })];
        let parsed = parse_triples(&items).expect("parse");
        assert_eq!(parsed[0].date, day("2024-05-01"));

        let bad = vec![serde_json::json!({ "dutyId": "clean", "childId": "a", "date": "May 1" })];
        assert_eq!(parse_triples(&bad).unwrap_err().code(), "bad_params");
        assert_eq!(parse_triples(&[]).unwrap_err().code(), "bad_params");
    }

    #[test]
    fn delete_removes_only_the_named_record_of_the_creator() {
        let conn = test_conn();
        seed(&conn);
        let created = assign_batch(
            &conn,
            "t1",
            &[
                triple("clean", "a", "2024-05-01"),
                triple("clean", "b", "2024-05-02"),
                triple("lunch", "a", "2024-05-01"),
            ],
        )
        .expect("create");

        assert_eq!(
            delete_assignment(&conn, &created[0].id, "t2").unwrap_err().code(),
            "not_found"
        );
        delete_assignment(&conn, &created[0].id, "t1").expect("delete");
        assert_eq!(count(&conn), 2);

        let ids = vec![created[1].id.clone(), created[1].id.clone(), "missing".to_string()];
        assert_eq!(bulk_delete(&conn, &ids, "t1").expect("bulk"), 1);
        let left = list_since(&conn, day("2024-01-01")).expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, created[2].id);
    }

    #[test]
    fn duty_in_use_cannot_be_deleted() {
        let conn = test_conn();
        seed(&conn);
        assign_batch(&conn, "t1", &[triple("clean", "a", "2024-05-01")]).expect("assign");
        assert_eq!(delete_duty(&conn, "clean").unwrap_err().code(), "conflict");
        delete_duty(&conn, "lunch").expect("delete unused duty");
        let names: Vec<String> = list_duties(&conn)
            .expect("list")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["Cleaning".to_string()]);
    }
}
