use rusqlite::{params, OptionalExtension};

use super::{find_by_sis, find_user_by_sis, set_state, ImportContext, Row};
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;

const ROLES: [&str; 5] = ["student", "teacher", "ta", "observer", "designer"];

pub(super) fn enrollment(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(user_sis) = r.require(ctx, "user_id") else {
        return Ok(());
    };
    let Some(role) = r.require(ctx, "role") else {
        return Ok(());
    };
    let role = role.to_ascii_lowercase();
    if !ROLES.contains(&role.as_str()) {
        ctx.warn(
            r.file_name(),
            format!("Improper role \"{}\" for an enrollment", role),
        );
        return Ok(());
    }
    let Some(status) = r.status_in(
        ctx,
        "enrollment for user",
        user_sis,
        &["active", "deleted", "completed", "inactive"],
    ) else {
        return Ok(());
    };

    let course_sis = r.get("course_id");
    let section_sis = r.get("section_id");
    if course_sis.is_none() && section_sis.is_none() {
        ctx.warn(
            r.file_name(),
            format!("No course_id or section_id given for an enrollment (line {})", r.line),
        );
        return Ok(());
    }

    let section = match section_sis {
        None => None,
        Some(s) => {
            let found: Option<(i64, i64)> = ctx
                .conn
                .query_row(
                    "SELECT id, course_id FROM course_sections
                     WHERE root_account_id = ? AND sis_source_id = ? ORDER BY id LIMIT 1",
                    params![ctx.root_account_id, s],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if found.is_none() {
                ctx.warn(
                    r.file_name(),
                    format!("An enrollment referenced a non-existent section {}", s),
                );
                return Ok(());
            }
            found
        }
    };
    let course_id = match (course_sis, section) {
        (_, Some((_, course_id))) => course_id,
        (Some(c), None) => match find_by_sis(ctx.conn, EntityKind::Course, ctx.root_account_id, c)? {
            Some((id, _)) => id,
            None => {
                ctx.warn(
                    r.file_name(),
                    format!("An enrollment referenced a non-existent course {}", c),
                );
                return Ok(());
            }
        },
        (None, None) => return Ok(()),
    };
    if let (Some(c), Some(_)) = (course_sis, section) {
        if let Some((named, _)) = find_by_sis(ctx.conn, EntityKind::Course, ctx.root_account_id, c)? {
            if named != course_id {
                ctx.warn(
                    r.file_name(),
                    format!("An enrollment listed a section and a course that are unrelated for user {}", user_sis),
                );
                return Ok(());
            }
        }
    }
    let section_id = section.map(|(id, _)| id);

    let Some(user_id) = find_user_by_sis(ctx.conn, ctx.root_account_id, user_sis)? else {
        ctx.warn(
            r.file_name(),
            format!("An enrollment referenced a non-existent user {}", user_sis),
        );
        return Ok(());
    };

    let existing: Option<(i64, String)> = ctx
        .conn
        .query_row(
            "SELECT id, workflow_state FROM enrollments
             WHERE course_id = ? AND course_section_id IS ? AND user_id = ? AND role = ?
             ORDER BY id LIMIT 1",
            params![course_id, section_id, user_id, role],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, before)) => {
            set_state(ctx, EntityKind::Enrollment, id, status)?;
            ctx.record(EntityRef::new(EntityKind::Enrollment, id), Some(&before), status);
        }
        None => {
            if status == "deleted" {
                return Ok(());
            }
            ctx.conn.execute(
                "INSERT INTO enrollments(root_account_id, course_id, course_section_id, user_id, role,
                     workflow_state, sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    ctx.root_account_id,
                    course_id,
                    section_id,
                    user_id,
                    role,
                    status,
                    ctx.batch_id,
                    ctx.now,
                    ctx.now
                ],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::Enrollment, id), None, status);
        }
    }

    if status == "deleted" {
        delete_enrollment_dependents(ctx, course_id, user_id, false)?;
    }
    Ok(())
}

/// Once a user has no live enrollment left in a course, their memberships
/// in that course's groups and their assignment overrides go with it. Each
/// cascaded row is recorded against the batch.
pub fn delete_enrollment_dependents(
    ctx: &mut ImportContext<'_>,
    course_id: i64,
    user_id: i64,
    batch_mode_delete: bool,
) -> Result<(), ImportError> {
    let still_enrolled: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM enrollments
         WHERE course_id = ? AND user_id = ? AND workflow_state NOT IN ('deleted', 'completed', 'inactive')",
        params![course_id, user_id],
        |row| row.get(0),
    )?;
    if still_enrolled > 0 {
        return Ok(());
    }

    let memberships = collect(
        ctx,
        EntityKind::GroupMembership,
        "SELECT gm.id, gm.workflow_state FROM group_memberships gm
         JOIN groups g ON g.id = gm.group_id
         WHERE g.course_id = ? AND gm.user_id = ? AND gm.workflow_state != 'deleted'",
        course_id,
        user_id,
    )?;
    let overrides = collect(
        ctx,
        EntityKind::AssignmentOverrideStudent,
        "SELECT id, workflow_state FROM assignment_override_students
         WHERE course_id = ? AND user_id = ? AND workflow_state != 'deleted'",
        course_id,
        user_id,
    )?;

    for targets in [memberships, overrides] {
        if targets.is_empty() {
            continue;
        }
        ctx.ledger
            .record_dependents(ctx.conn, &targets, "deleted", batch_mode_delete);
        for (target, _) in &targets {
            set_state(ctx, target.kind, target.id, "deleted")?;
        }
    }
    Ok(())
}

fn collect(
    ctx: &ImportContext<'_>,
    kind: EntityKind,
    sql: &str,
    course_id: i64,
    user_id: i64,
) -> rusqlite::Result<Vec<(EntityRef, String)>> {
    let mut stmt = ctx.conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![course_id, user_id], |row| {
            Ok((EntityRef::new(kind, row.get(0)?), row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
