use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use super::{find_by_sis, resolve_account, ImportContext, Row};
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;

pub(super) fn account(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "account_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "account", sis_id, &["active", "deleted"]) else {
        return Ok(());
    };
    let parent = match r.get("parent_account_id") {
        None => ctx.root_account_id,
        Some(p) => match find_by_sis(ctx.conn, EntityKind::Account, ctx.root_account_id, p)? {
            Some((id, _)) => id,
            None => {
                ctx.warn(
                    r.file_name(),
                    format!("Parent account didn't exist for {}", sis_id),
                );
                return Ok(());
            }
        },
    };
    let name = r.get("name");

    match find_by_sis(ctx.conn, EntityKind::Account, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE accounts SET parent_account_id = ?, name = COALESCE(?, name), workflow_state = ?,
                     sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![parent, name, status, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::Account, id), Some(&before), status);
        }
        None => {
            let Some(name) = name else {
                ctx.warn(r.file_name(), format!("No name given for account {}", sis_id));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO accounts(root_account_id, parent_account_id, sis_source_id, name, workflow_state,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, parent, sis_id, name, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::Account, id), None, status);
        }
    }
    Ok(())
}

pub(super) fn term(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "term_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "term", sis_id, &["active", "deleted"]) else {
        return Ok(());
    };
    let name = r.get("name");
    let start_at = r.get("start_date");
    let end_at = r.get("end_date");

    let id = match find_by_sis(ctx.conn, EntityKind::EnrollmentTerm, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE enrollment_terms SET name = COALESCE(?, name), start_at = ?, end_at = ?,
                     workflow_state = ?, sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![name, start_at, end_at, status, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::EnrollmentTerm, id), Some(&before), status);
            id
        }
        None => {
            let Some(name) = name else {
                ctx.warn(r.file_name(), format!("No name given for term {}", sis_id));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO enrollment_terms(root_account_id, sis_source_id, name, start_at, end_at,
                     workflow_state, sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, sis_id, name, start_at, end_at, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::EnrollmentTerm, id), None, status);
            id
        }
    };
    if !ctx.imported_term_ids.contains(&id) {
        ctx.imported_term_ids.push(id);
    }
    Ok(())
}

/// Term by SIS id; warns and yields `Err(())` when a given id is unknown.
fn resolve_term(ctx: &mut ImportContext<'_>, r: &Row<'_>, what: &str) -> Result<Result<Option<i64>, ()>, ImportError> {
    let Some(term_sis) = r.get("term_id") else {
        return Ok(Ok(None));
    };
    match find_by_sis(ctx.conn, EntityKind::EnrollmentTerm, ctx.root_account_id, term_sis)? {
        Some((id, _)) => Ok(Ok(Some(id))),
        None => {
            ctx.warn(
                r.file_name(),
                format!("Term {} didn't exist for {}", term_sis, what),
            );
            Ok(Err(()))
        }
    }
}

fn resolve_account_or_warn(ctx: &mut ImportContext<'_>, r: &Row<'_>, what: &str) -> Result<i64, ImportError> {
    let sis = r.get("account_id");
    match resolve_account(ctx, sis)? {
        Some(id) => Ok(id),
        None => {
            ctx.warn(
                r.file_name(),
                format!(
                    "Account {} didn't exist for {}, using the root account",
                    sis.unwrap_or(""),
                    what
                ),
            );
            Ok(ctx.root_account_id)
        }
    }
}

pub(super) fn abstract_course(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "abstract_course_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "abstract course", sis_id, &["active", "deleted"]) else {
        return Ok(());
    };
    let what = format!("abstract course {}", sis_id);
    let account_id = resolve_account_or_warn(ctx, r, &what)?;
    let Ok(term_id) = resolve_term(ctx, r, &what)? else {
        return Ok(());
    };
    let short_name = r.get("short_name");
    let long_name = r.get("long_name");

    match find_by_sis(ctx.conn, EntityKind::AbstractCourse, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE abstract_courses SET account_id = ?, enrollment_term_id = COALESCE(?, enrollment_term_id),
                     short_name = COALESCE(?, short_name), name = COALESCE(?, name),
                     workflow_state = ?, sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![account_id, term_id, short_name, long_name, status, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::AbstractCourse, id), Some(&before), status);
        }
        None => {
            let Some(short_name) = short_name else {
                ctx.warn(r.file_name(), format!("No short_name given for {}", what));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO abstract_courses(root_account_id, account_id, enrollment_term_id, sis_source_id,
                     short_name, name, workflow_state, sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    ctx.root_account_id,
                    account_id,
                    term_id,
                    sis_id,
                    short_name,
                    long_name.unwrap_or(short_name),
                    status,
                    ctx.batch_id,
                    ctx.now,
                    ctx.now
                ],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::AbstractCourse, id), None, status);
        }
    }
    Ok(())
}

/// Maps a courses.csv status onto the course workflow state.
pub(crate) fn course_state(status: &str, before: Option<&str>) -> String {
    match status {
        "active" => match before {
            None | Some("deleted") => "claimed",
            Some("completed") => "available",
            Some(s) => s,
        }
        .to_string(),
        "published" => "available".to_string(),
        "unpublished" => "claimed".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn parse_stuck(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn join_stuck(fields: &BTreeSet<String>) -> String {
    fields.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Decides whether an incoming value may overwrite `field`, updating the
/// sticky set per the batch's stickiness options.
fn sticky_value(
    ctx: &ImportContext<'_>,
    stuck: &mut BTreeSet<String>,
    field: &str,
    current: &str,
    incoming: Option<&str>,
) -> Option<String> {
    let v = incoming?;
    if stuck.contains(field) && !ctx.options.override_sis_stickiness {
        return None;
    }
    if ctx.options.clear_sis_stickiness {
        stuck.remove(field);
    } else if ctx.options.add_sis_stickiness && v != current {
        stuck.insert(field.to_string());
    }
    (v != current).then(|| v.to_string())
}

pub(super) fn course(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "course_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(
        ctx,
        "course",
        sis_id,
        &["active", "deleted", "completed", "published", "unpublished"],
    ) else {
        return Ok(());
    };
    let what = format!("course {}", sis_id);
    let account_id = resolve_account_or_warn(ctx, r, &what)?;
    let Ok(term_id) = resolve_term(ctx, r, &what)? else {
        return Ok(());
    };
    let abstract_course_id = match r.get("abstract_course_id") {
        None => None,
        Some(a) => match find_by_sis(ctx.conn, EntityKind::AbstractCourse, ctx.root_account_id, a)? {
            Some((id, _)) => Some(id),
            None => {
                ctx.warn(
                    r.file_name(),
                    format!("Unknown abstract course id {}, ignoring", a),
                );
                None
            }
        },
    };
    let short_name = r.get("short_name");
    let long_name = r.get("long_name");

    let existing = ctx
        .conn
        .query_row(
            "SELECT id, workflow_state, name, course_code, stuck_sis_fields FROM courses
             WHERE root_account_id = ? AND sis_source_id = ? ORDER BY id LIMIT 1",
            params![ctx.root_account_id, sis_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    match existing {
        Some((id, before, name, code, stuck_raw)) => {
            let mut stuck = parse_stuck(&stuck_raw);
            let new_name = sticky_value(ctx, &mut stuck, "name", &name, long_name);
            let new_code = sticky_value(ctx, &mut stuck, "course_code", &code, short_name);
            let state = course_state(status, Some(&before));
            ctx.conn.execute(
                "UPDATE courses SET account_id = ?, enrollment_term_id = COALESCE(?, enrollment_term_id),
                     abstract_course_id = COALESCE(?, abstract_course_id),
                     name = COALESCE(?, name), course_code = COALESCE(?, course_code),
                     stuck_sis_fields = ?, workflow_state = ?, sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    account_id,
                    term_id,
                    abstract_course_id,
                    new_name,
                    new_code,
                    join_stuck(&stuck),
                    state,
                    ctx.batch_id,
                    ctx.now,
                    id
                ],
            )?;
            ctx.record(EntityRef::new(EntityKind::Course, id), Some(&before), &state);
        }
        None => {
            let Some(short_name) = short_name else {
                ctx.warn(r.file_name(), format!("No short_name given for {}", what));
                return Ok(());
            };
            let name = long_name.unwrap_or(short_name);
            let mut stuck = BTreeSet::new();
            if ctx.options.override_sis_stickiness && ctx.options.add_sis_stickiness {
                stuck.insert("name".to_string());
                stuck.insert("course_code".to_string());
            }
            let state = course_state(status, None);
            ctx.conn.execute(
                "INSERT INTO courses(root_account_id, account_id, enrollment_term_id, abstract_course_id,
                     sis_source_id, course_code, name, workflow_state, sis_batch_id, stuck_sis_fields,
                     created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    ctx.root_account_id,
                    account_id,
                    term_id,
                    abstract_course_id,
                    sis_id,
                    short_name,
                    name,
                    state,
                    ctx.batch_id,
                    join_stuck(&stuck),
                    ctx.now,
                    ctx.now
                ],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::Course, id), None, &state);
        }
    }
    Ok(())
}

pub(super) fn section(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "section_id") else {
        return Ok(());
    };
    let Some(course_sis) = r.require(ctx, "course_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "section", sis_id, &["active", "deleted"]) else {
        return Ok(());
    };
    let Some((course_id, _)) = find_by_sis(ctx.conn, EntityKind::Course, ctx.root_account_id, course_sis)? else {
        ctx.warn(
            r.file_name(),
            format!("Section {} references course {} that doesn't exist", sis_id, course_sis),
        );
        return Ok(());
    };
    let name = r.get("name");

    match find_by_sis(ctx.conn, EntityKind::CourseSection, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE course_sections SET course_id = ?, name = COALESCE(?, name), workflow_state = ?,
                     sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![course_id, name, status, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::CourseSection, id), Some(&before), status);
        }
        None => {
            let Some(name) = name else {
                ctx.warn(r.file_name(), format!("No name given for section {}", sis_id));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO course_sections(root_account_id, course_id, sis_source_id, name, workflow_state,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, course_id, sis_id, name, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::CourseSection, id), None, status);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_course_status_keeps_live_states() {
        assert_eq!(course_state("active", None), "claimed");
        assert_eq!(course_state("active", Some("deleted")), "claimed");
        assert_eq!(course_state("active", Some("completed")), "available");
        assert_eq!(course_state("active", Some("available")), "available");
        assert_eq!(course_state("published", Some("claimed")), "available");
        assert_eq!(course_state("deleted", Some("available")), "deleted");
    }

    #[test]
    fn stuck_fields_round_trip() {
        let s = parse_stuck("name, course_code,,");
        assert_eq!(s.len(), 2);
        assert_eq!(join_stuck(&s), "course_code,name");
    }
}
