//! Batch-mode cleanup: SIS-owned courses, sections and enrollments in the
//! batch's terms that the batch did not touch are dropped, one class at a
//! time, each behind its own change threshold.

use rusqlite::{params, params_from_iter, types::Value as SqlValue};
use serde::Serialize;

use crate::batch::BatchMessage;
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;
use crate::importers::{delete_enrollment_dependents, set_state, ImportContext};
use crate::threshold;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCounts {
    pub courses: i64,
    pub sections: i64,
    pub enrollments: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Courses,
    Sections,
    Enrollments,
}

impl Class {
    fn label(self) -> &'static str {
        match self {
            Class::Courses => "courses",
            Class::Sections => "sections",
            Class::Enrollments => "enrollments",
        }
    }

    fn kind(self) -> EntityKind {
        match self {
            Class::Courses => EntityKind::Course,
            Class::Sections => EntityKind::CourseSection,
            Class::Enrollments => EntityKind::Enrollment,
        }
    }

    /// `FROM ... WHERE ...` selecting the SIS-owned, live rows of this class
    /// in the given terms. `?1` is the batch id, `?2` the drop status and
    /// term ids start at `?3`.
    fn scope_sql(self, terms: &str) -> String {
        match self {
            Class::Courses => format!(
                "FROM courses c WHERE c.enrollment_term_id IN ({terms})
                 AND c.sis_batch_id IS NOT NULL AND c.workflow_state != 'deleted'"
            ),
            Class::Sections => format!(
                "FROM course_sections c JOIN courses p ON p.id = c.course_id
                 WHERE p.enrollment_term_id IN ({terms})
                 AND c.sis_batch_id IS NOT NULL AND c.workflow_state != 'deleted'"
            ),
            Class::Enrollments => format!(
                "FROM enrollments c JOIN courses p ON p.id = c.course_id
                 WHERE p.enrollment_term_id IN ({terms})
                 AND c.sis_batch_id IS NOT NULL AND c.workflow_state != 'deleted'"
            ),
        }
    }
}

struct Plan {
    class: Class,
    total: u64,
    targets: Vec<(EntityRef, String)>,
}

fn plan(ctx: &ImportContext<'_>, class: Class, term_ids: &[i64], drop_status: &str) -> rusqlite::Result<Plan> {
    let placeholders = (0..term_ids.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let scope = class.scope_sql(&placeholders);
    let mut args: Vec<SqlValue> = vec![SqlValue::Integer(ctx.batch_id), SqlValue::Text(drop_status.to_string())];
    args.extend(term_ids.iter().map(|t| SqlValue::Integer(*t)));

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) {scope}"),
        params_from_iter(args.iter()),
        |r| r.get(0),
    )?;
    let extra = if class == Class::Enrollments {
        "AND c.workflow_state != ?2"
    } else {
        ""
    };
    let mut stmt = ctx.conn.prepare(&format!(
        "SELECT c.id, c.workflow_state {scope} AND c.sis_batch_id != ?1 {extra} ORDER BY c.id"
    ))?;
    let kind = class.kind();
    let targets = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            Ok((EntityRef::new(kind, r.get(0)?), r.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Plan {
        class,
        total: total as u64,
        targets,
    })
}

fn live_state(ctx: &ImportContext<'_>, target: EntityRef) -> rusqlite::Result<Option<String>> {
    use rusqlite::OptionalExtension;
    ctx.conn
        .query_row(
            &format!("SELECT workflow_state FROM {} WHERE id = ?", target.kind.table()),
            [target.id],
            |r| r.get(0),
        )
        .optional()
}

fn live_children(
    ctx: &ImportContext<'_>,
    kind: EntityKind,
    sql: &str,
    parent_id: i64,
) -> rusqlite::Result<Vec<(EntityRef, String, i64, i64)>> {
    let mut stmt = ctx.conn.prepare(sql)?;
    let rows = stmt
        .query_map([parent_id], |r| {
            Ok((
                EntityRef::new(kind, r.get(0)?),
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Deletes enrollments (with their own dependents) hanging off a deleted
/// course or section.
fn cascade_enrollments(ctx: &mut ImportContext<'_>, sql: &str, parent_id: i64) -> Result<(), ImportError> {
    let rows = live_children(ctx, EntityKind::Enrollment, sql, parent_id)?;
    if rows.is_empty() {
        return Ok(());
    }
    let targets: Vec<(EntityRef, String)> = rows.iter().map(|(t, s, _, _)| (*t, s.clone())).collect();
    ctx.ledger.record_dependents(ctx.conn, &targets, "deleted", true);
    for (target, _, course_id, user_id) in &rows {
        set_state(ctx, EntityKind::Enrollment, target.id, "deleted")?;
        delete_enrollment_dependents(ctx, *course_id, *user_id, true)?;
    }
    Ok(())
}

fn drop_course(ctx: &mut ImportContext<'_>, target: EntityRef, before: &str) -> Result<(), ImportError> {
    set_state(ctx, EntityKind::Course, target.id, "deleted")?;
    ctx.ledger.record(ctx.conn, target, Some(before), "deleted", true);

    let sections = live_children(
        ctx,
        EntityKind::CourseSection,
        "SELECT id, workflow_state, course_id, 0 FROM course_sections
         WHERE course_id = ? AND workflow_state != 'deleted'",
        target.id,
    )?;
    let section_targets: Vec<(EntityRef, String)> = sections.iter().map(|(t, s, _, _)| (*t, s.clone())).collect();
    ctx.ledger.record_dependents(ctx.conn, &section_targets, "deleted", true);
    for (section, _, _, _) in &sections {
        set_state(ctx, EntityKind::CourseSection, section.id, "deleted")?;
    }

    cascade_enrollments(
        ctx,
        "SELECT id, workflow_state, course_id, user_id FROM enrollments
         WHERE course_id = ? AND workflow_state != 'deleted'",
        target.id,
    )
}

fn drop_section(ctx: &mut ImportContext<'_>, target: EntityRef, before: &str) -> Result<(), ImportError> {
    set_state(ctx, EntityKind::CourseSection, target.id, "deleted")?;
    ctx.ledger.record(ctx.conn, target, Some(before), "deleted", true);
    cascade_enrollments(
        ctx,
        "SELECT id, workflow_state, course_id, user_id FROM enrollments
         WHERE course_section_id = ? AND workflow_state != 'deleted'",
        target.id,
    )
}

fn drop_enrollment(ctx: &mut ImportContext<'_>, target: EntityRef, before: &str, drop_status: &str) -> Result<(), ImportError> {
    set_state(ctx, EntityKind::Enrollment, target.id, drop_status)?;
    ctx.ledger.record(ctx.conn, target, Some(before), drop_status, true);
    if drop_status == "deleted" {
        let (course_id, user_id): (i64, i64) = ctx.conn.query_row(
            "SELECT course_id, user_id FROM enrollments WHERE id = ?",
            params![target.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        delete_enrollment_dependents(ctx, course_id, user_id, true)?;
    }
    Ok(())
}

/// Runs cleanup over `term_ids`. Every class is planned before any row
/// changes so the thresholds see the state the import left behind.
pub fn run(ctx: &mut ImportContext<'_>, term_ids: &[i64], change_threshold: Option<u32>) -> Result<CleanupCounts, ImportError> {
    let mut counts = CleanupCounts::default();
    if term_ids.is_empty() {
        tracing::info!(batch_id = ctx.batch_id, "batch mode cleanup has no terms in scope");
        return Ok(counts);
    }
    let drop_status = ctx.options.enrollment_drop_status().to_string();

    let mut plans = Vec::with_capacity(3);
    for class in [Class::Courses, Class::Sections, Class::Enrollments] {
        plans.push(plan(ctx, class, term_ids, &drop_status)?);
    }

    let mut allowed = Vec::with_capacity(3);
    for p in plans {
        let check = threshold::check(p.total, p.targets.len() as u64, change_threshold);
        if check.allow {
            allowed.push(p);
            continue;
        }
        tracing::warn!(
            batch_id = ctx.batch_id,
            class = p.class.label(),
            planned = check.planned,
            total = check.total,
            percent = check.percent(),
            "cleanup blocked by change threshold"
        );
        ctx.messages.push(BatchMessage::warning(
            None,
            format!(
                "{} {} would be deleted and exceeds the set threshold of {}%",
                check.planned,
                p.class.label(),
                check.limit_percent.unwrap_or(0)
            ),
        ));
        ctx.conn.execute(
            "UPDATE sis_batches SET diffing_threshold_exceeded = 1 WHERE id = ?",
            [ctx.batch_id],
        )?;
    }

    ctx.begin_stage(allowed.iter().map(|p| p.targets.len()).sum());
    for p in &allowed {
        let mut dropped = 0i64;
        ctx.in_chunks(&p.targets, |ctx, _, (target, _)| {
            // An earlier cascade may already have removed the row.
            let Some(before) = live_state(ctx, *target)? else {
                return Ok(());
            };
            if before == "deleted" || (p.class == Class::Enrollments && before == drop_status) {
                return Ok(());
            }
            match p.class {
                Class::Courses => drop_course(ctx, *target, &before)?,
                Class::Sections => drop_section(ctx, *target, &before)?,
                Class::Enrollments => drop_enrollment(ctx, *target, &before, &drop_status)?,
            }
            dropped += 1;
            Ok(())
        })?;
        match p.class {
            Class::Courses => counts.courses = dropped,
            Class::Sections => counts.sections = dropped,
            Class::Enrollments => counts.enrollments = dropped,
        }
    }

    ctx.bump("batch_courses_deleted", counts.courses);
    ctx.bump("batch_sections_deleted", counts.sections);
    ctx.bump("batch_enrollments_deleted", counts.enrollments);
    tracing::info!(
        batch_id = ctx.batch_id,
        courses = counts.courses,
        sections = counts.sections,
        enrollments = counts.enrollments,
        "batch mode cleanup finished"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchOptions;
    use crate::db;
    use crate::ledger::RollbackLedger;
    use rusqlite::Connection;

    fn seed(conn: &Connection, enrollments: usize) {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO accounts(id, name, workflow_state, created_at, updated_at) VALUES(1, 'Root', 'active', ?1, ?1)",
            [&now],
        )
        .expect("account");
        conn.execute(
            "INSERT INTO enrollment_terms(id, root_account_id, sis_source_id, name, workflow_state, created_at, updated_at)
             VALUES(1, 1, 'T1', 'Fall', 'active', ?1, ?1)",
            [&now],
        )
        .expect("term");
        conn.execute(
            "INSERT INTO sis_batches(id, account_id, import_type, workflow_state, created_at, updated_at)
             VALUES(1, 1, 'instructure_csv', 'imported', ?1, ?1), (2, 1, 'instructure_csv', 'importing', ?1, ?1)",
            [&now],
        )
        .expect("batches");
        conn.execute(
            "INSERT INTO courses(id, root_account_id, account_id, enrollment_term_id, sis_source_id, course_code, name,
                 workflow_state, sis_batch_id, created_at, updated_at)
             VALUES(1, 1, 1, 1, 'C1', 'C1', 'Course', 'available', 2, ?1, ?1)",
            [&now],
        )
        .expect("course");
        for i in 0..enrollments {
            conn.execute(
                "INSERT INTO users(name, sortable_name, workflow_state, created_at, updated_at) VALUES('u', 'u', 'registered', ?1, ?1)",
                [&now],
            )
            .expect("user");
            let user_id = conn.last_insert_rowid();
            // The first half was touched by batch 2, the rest only by batch 1.
            let batch = if i < enrollments / 2 { 2 } else { 1 };
            conn.execute(
                "INSERT INTO enrollments(root_account_id, course_id, user_id, role, workflow_state, sis_batch_id,
                     created_at, updated_at)
                 VALUES(1, 1, ?1, 'student', 'active', ?2, ?3, ?3)",
                params![user_id, batch, now],
            )
            .expect("enrollment");
        }
    }

    #[test]
    fn drops_untouched_enrollments_and_records_them() {
        let conn = db::open_memory();
        seed(&conn, 10);
        let opts = BatchOptions {
            batch_mode: true,
            batch_mode_term_id: Some(1),
            ..Default::default()
        };
        let mut ctx = ImportContext::new(&conn, 2, 1, &opts, RollbackLedger::new(2, 1000), 100);
        let counts = run(&mut ctx, &[1], None).expect("cleanup");
        assert_eq!(counts.enrollments, 5);
        assert_eq!(counts.courses, 0);

        let deleted: i64 = conn
            .query_row("SELECT COUNT(*) FROM enrollments WHERE workflow_state = 'deleted'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(deleted, 5);
        let flagged: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sis_batch_roll_back_data WHERE sis_batch_id = 2 AND batch_mode_delete = 1",
                [],
                |r| r.get(0),
            )
            .expect("ledger");
        assert_eq!(flagged, 5);
    }

    #[test]
    fn threshold_blocks_one_class_only() {
        let conn = db::open_memory();
        seed(&conn, 10);
        let opts = BatchOptions {
            batch_mode: true,
            batch_mode_term_id: Some(1),
            change_threshold: Some(10),
            ..Default::default()
        };
        let mut ctx = ImportContext::new(&conn, 2, 1, &opts, RollbackLedger::new(2, 1000), 100);
        let counts = run(&mut ctx, &[1], Some(10)).expect("cleanup");
        assert_eq!(counts.enrollments, 0);
        assert_eq!(ctx.messages.len(), 1);
        assert!(ctx.messages[0].message.contains("5 enrollments would be deleted"));

        let flag: i64 = conn
            .query_row("SELECT diffing_threshold_exceeded FROM sis_batches WHERE id = 2", [], |r| r.get(0))
            .expect("flag");
        assert_eq!(flag, 1);
    }

    #[test]
    fn completed_drop_status_concludes_without_cascade() {
        let conn = db::open_memory();
        seed(&conn, 4);
        let opts = BatchOptions {
            batch_mode: true,
            batch_mode_term_id: Some(1),
            batch_mode_enrollment_drop_status: Some("completed".into()),
            ..Default::default()
        };
        let mut ctx = ImportContext::new(&conn, 2, 1, &opts, RollbackLedger::new(2, 1000), 100);
        let counts = run(&mut ctx, &[1], None).expect("cleanup");
        assert_eq!(counts.enrollments, 2);
        let completed: i64 = conn
            .query_row("SELECT COUNT(*) FROM enrollments WHERE workflow_state = 'completed'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(completed, 2);
    }
}
