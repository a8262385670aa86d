use rusqlite::{params, OptionalExtension};

use super::{find_user_by_sis, resolve_account, set_state, ImportContext, Row};
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;

struct PseudonymRow {
    id: i64,
    user_id: i64,
    state: String,
    sis_id: Option<String>,
}

fn pseudonym_by_sis(ctx: &ImportContext<'_>, sis_id: &str) -> rusqlite::Result<Option<PseudonymRow>> {
    ctx.conn
        .query_row(
            "SELECT id, user_id, workflow_state, sis_source_id FROM pseudonyms
             WHERE root_account_id = ? AND sis_source_id = ? ORDER BY id LIMIT 1",
            params![ctx.root_account_id, sis_id],
            |r| {
                Ok(PseudonymRow {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    state: r.get(2)?,
                    sis_id: r.get(3)?,
                })
            },
        )
        .optional()
}

fn pseudonym_by_login(ctx: &ImportContext<'_>, login: &str) -> rusqlite::Result<Option<PseudonymRow>> {
    ctx.conn
        .query_row(
            "SELECT id, user_id, workflow_state, sis_source_id FROM pseudonyms
             WHERE root_account_id = ? AND lower(unique_id) = lower(?) AND workflow_state != 'deleted'
             ORDER BY id LIMIT 1",
            params![ctx.root_account_id, login],
            |r| {
                Ok(PseudonymRow {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    state: r.get(2)?,
                    sis_id: r.get(3)?,
                })
            },
        )
        .optional()
}

fn display_name(r: &Row<'_>, login: &str) -> (String, String) {
    let first = r.get("first_name").unwrap_or("");
    let last = r.get("last_name").unwrap_or("");
    if let Some(full) = r.get("full_name") {
        let sortable = r
            .get("sortable_name")
            .map(str::to_string)
            .unwrap_or_else(|| full.to_string());
        return (full.to_string(), sortable);
    }
    if first.is_empty() && last.is_empty() {
        return (login.to_string(), login.to_string());
    }
    let full = format!("{} {}", first, last).trim().to_string();
    let sortable = if last.is_empty() {
        first.to_string()
    } else if first.is_empty() {
        last.to_string()
    } else {
        format!("{}, {}", last, first)
    };
    (full, sortable)
}

pub(super) fn user(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "user_id") else {
        return Ok(());
    };
    let Some(login) = r.require(ctx, "login_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "user", sis_id, &["active", "suspended", "deleted"]) else {
        return Ok(());
    };
    let (name, sortable_name) = display_name(r, login);

    let mut pseudonym = pseudonym_by_sis(ctx, sis_id)?;
    if let Some(claimed) = pseudonym_by_login(ctx, login)? {
        let same = pseudonym.as_ref().map(|p| p.id == claimed.id).unwrap_or(false);
        if !same {
            match claimed.sis_id.as_deref() {
                Some(other) if other != sis_id && !ctx.options.update_sis_id_if_login_claimed => {
                    ctx.warn(
                        r.file_name(),
                        format!(
                            "An existing login has already claimed the login_id {} requested by user {}",
                            login, sis_id
                        ),
                    );
                    return Ok(());
                }
                _ if pseudonym.is_none() => {
                    // Unclaimed login, or the caller allowed taking it over.
                    ctx.conn.execute(
                        "UPDATE pseudonyms SET sis_source_id = ?, updated_at = ? WHERE id = ?",
                        params![sis_id, ctx.now, claimed.id],
                    )?;
                    pseudonym = Some(PseudonymRow {
                        sis_id: Some(sis_id.to_string()),
                        ..claimed
                    });
                }
                _ => {
                    ctx.warn(
                        r.file_name(),
                        format!(
                            "An existing login has already claimed the login_id {} requested by user {}",
                            login, sis_id
                        ),
                    );
                    return Ok(());
                }
            }
        }
    }

    let user_id = match pseudonym {
        Some(p) => {
            ctx.conn.execute(
                "UPDATE users SET name = ?, sortable_name = ?, updated_at = ? WHERE id = ?",
                params![name, sortable_name, ctx.now, p.user_id],
            )?;
            ctx.conn.execute(
                "UPDATE pseudonyms SET unique_id = ?, workflow_state = ?, sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![login, status, ctx.batch_id, ctx.now, p.id],
            )?;
            ctx.record(EntityRef::new(EntityKind::Pseudonym, p.id), Some(&p.state), status);
            p.user_id
        }
        None => {
            ctx.conn.execute(
                "INSERT INTO users(name, sortable_name, workflow_state, created_at, updated_at)
                 VALUES(?, ?, 'registered', ?, ?)",
                params![name, sortable_name, ctx.now, ctx.now],
            )?;
            let user_id = ctx.conn.last_insert_rowid();
            ctx.conn.execute(
                "INSERT INTO pseudonyms(root_account_id, user_id, unique_id, sis_source_id, workflow_state,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, user_id, login, sis_id, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let pseudonym_id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::Pseudonym, pseudonym_id), None, status);
            user_id
        }
    };

    if let Some(email) = r.get("email") {
        let has_channel: bool = ctx.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM communication_channels
                WHERE user_id = ? AND lower(path) = lower(?) AND workflow_state != 'retired')",
            params![user_id, email],
            |row| row.get::<_, i64>(0),
        )? != 0;
        if !has_channel && status != "deleted" {
            ctx.conn.execute(
                "INSERT INTO communication_channels(root_account_id, user_id, path, path_type, workflow_state,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, 'email', 'unconfirmed', ?, ?, ?)",
                params![ctx.root_account_id, user_id, email, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let cc_id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::CommunicationChannel, cc_id), None, "unconfirmed");
        }
    }

    if status == "deleted" {
        delete_user_enrollments(ctx, user_id)?;
    }
    Ok(())
}

/// A deleted login takes the user's enrollments in this root account with
/// it; they are recorded as dependents of the user row.
fn delete_user_enrollments(ctx: &mut ImportContext<'_>, user_id: i64) -> Result<(), ImportError> {
    let mut stmt = ctx.conn.prepare(
        "SELECT id, workflow_state, course_id FROM enrollments
         WHERE user_id = ? AND root_account_id = ? AND workflow_state != 'deleted'",
    )?;
    let rows = stmt
        .query_map(params![user_id, ctx.root_account_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    if rows.is_empty() {
        return Ok(());
    }
    let targets: Vec<(EntityRef, String)> = rows
        .iter()
        .map(|(id, state, _)| (EntityRef::new(EntityKind::Enrollment, *id), state.clone()))
        .collect();
    ctx.ledger.record_dependents(ctx.conn, &targets, "deleted", false);
    for (id, _, course_id) in &rows {
        set_state(ctx, EntityKind::Enrollment, *id, "deleted")?;
        super::delete_enrollment_dependents(ctx, *course_id, user_id, false)?;
    }
    Ok(())
}

pub(super) fn admin(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(user_sis) = r.require(ctx, "user_id") else {
        return Ok(());
    };
    let Some(role) = r.require(ctx, "role") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "admin", user_sis, &["active", "deleted"]) else {
        return Ok(());
    };
    let Some(account_id) = resolve_account(ctx, r.get("account_id"))? else {
        ctx.warn(
            r.file_name(),
            format!("Invalid account_id given for admin {}", user_sis),
        );
        return Ok(());
    };
    let Some(user_id) = find_user_by_sis(ctx.conn, ctx.root_account_id, user_sis)? else {
        ctx.warn(r.file_name(), format!("Invalid or unknown user_id '{}' for admin", user_sis));
        return Ok(());
    };

    let existing: Option<(i64, String)> = ctx
        .conn
        .query_row(
            "SELECT id, workflow_state FROM account_users WHERE account_id = ? AND user_id = ? AND role = ?",
            params![account_id, user_id, role],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((id, before)) => {
            set_state(ctx, EntityKind::AccountUser, id, status)?;
            ctx.record(EntityRef::new(EntityKind::AccountUser, id), Some(&before), status);
        }
        None => {
            if status == "deleted" {
                return Ok(());
            }
            ctx.conn.execute(
                "INSERT INTO account_users(root_account_id, account_id, user_id, role, workflow_state,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, account_id, user_id, role, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::AccountUser, id), None, status);
        }
    }
    Ok(())
}

pub(super) fn user_observer(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(observer_sis) = r.require(ctx, "observer_id") else {
        return Ok(());
    };
    let Some(student_sis) = r.require(ctx, "student_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "observer", observer_sis, &["active", "deleted"]) else {
        return Ok(());
    };
    let Some(observer_id) = find_user_by_sis(ctx.conn, ctx.root_account_id, observer_sis)? else {
        ctx.warn(r.file_name(), format!("An observer referenced a non-existent user {}", observer_sis));
        return Ok(());
    };
    let Some(student_id) = find_user_by_sis(ctx.conn, ctx.root_account_id, student_sis)? else {
        ctx.warn(r.file_name(), format!("A student referenced a non-existent user {}", student_sis));
        return Ok(());
    };
    if observer_id == student_id {
        ctx.warn(r.file_name(), format!("Can't observe yourself user {}", observer_sis));
        return Ok(());
    }

    let existing: Option<(i64, String)> = ctx
        .conn
        .query_row(
            "SELECT id, workflow_state FROM user_observers WHERE user_id = ? AND observer_id = ? AND root_account_id = ?",
            params![student_id, observer_id, ctx.root_account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((id, before)) => {
            set_state(ctx, EntityKind::UserObserver, id, status)?;
            ctx.record(EntityRef::new(EntityKind::UserObserver, id), Some(&before), status);
        }
        None => {
            if status == "deleted" {
                return Ok(());
            }
            ctx.conn.execute(
                "INSERT INTO user_observers(root_account_id, user_id, observer_id, workflow_state, sis_batch_id,
                     created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, student_id, observer_id, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::UserObserver, id), None, status);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::CsvFile;

    #[test]
    fn display_names_prefer_full_name() {
        let f = CsvFile::parse(
            "users.csv",
            b"user_id,login_id,first_name,last_name,full_name\nu1,a,Ada,Lovelace,\nu2,b,,,Grace Hopper\nu3,c,,,\n",
        )
        .expect("parse");
        let row = |i: usize| Row {
            file: &f,
            row: &f.rows[i],
            line: i + 2,
            status: None,
        };
        assert_eq!(display_name(&row(0), "a"), ("Ada Lovelace".into(), "Lovelace, Ada".into()));
        assert_eq!(display_name(&row(1), "b"), ("Grace Hopper".into(), "Grace Hopper".into()));
        assert_eq!(display_name(&row(2), "c"), ("c".into(), "c".into()));
    }
}
