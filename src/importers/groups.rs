use rusqlite::{params, OptionalExtension};

use super::{find_by_sis, find_user_by_sis, resolve_account, set_state, ImportContext, Row};
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;

/// Group categories carry no workflow state; `deleted_at` stands in for it
/// and the ledger sees the derived `active`/`deleted` pair.
pub(super) fn group_category(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "group_category_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "group category", sis_id, &["active", "deleted"]) else {
        return Ok(());
    };
    let Some(account_id) = resolve_account(ctx, r.get("account_id"))? else {
        ctx.warn(
            r.file_name(),
            format!("Account not found for group category {}", sis_id),
        );
        return Ok(());
    };
    let name = r.get("category_name");
    let deleted_at = (status == "deleted").then(|| ctx.now.clone());

    match find_by_sis(ctx.conn, EntityKind::GroupCategory, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE group_categories SET account_id = ?1, name = COALESCE(?2, name),
                     deleted_at = CASE WHEN ?3 IS NULL THEN NULL ELSE COALESCE(deleted_at, ?3) END,
                     sis_batch_id = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![account_id, name, deleted_at, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::GroupCategory, id), Some(&before), status);
        }
        None => {
            let Some(name) = name else {
                ctx.warn(r.file_name(), format!("No category_name given for group category {}", sis_id));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO group_categories(root_account_id, account_id, sis_source_id, name, deleted_at,
                     sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, account_id, sis_id, name, deleted_at, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::GroupCategory, id), None, status);
        }
    }
    Ok(())
}

pub(super) fn group(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(sis_id) = r.require(ctx, "group_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "group", sis_id, &["available", "deleted"]) else {
        return Ok(());
    };
    let course_id = match r.get("course_id") {
        None => None,
        Some(c) => match find_by_sis(ctx.conn, EntityKind::Course, ctx.root_account_id, c)? {
            Some((id, _)) => Some(id),
            None => {
                ctx.warn(r.file_name(), format!("Course with id {} didn't exist for group {}", c, sis_id));
                return Ok(());
            }
        },
    };
    let account_id = match course_id {
        Some(c) => ctx
            .conn
            .query_row("SELECT account_id FROM courses WHERE id = ?", [c], |row| row.get(0))?,
        None => match resolve_account(ctx, r.get("account_id"))? {
            Some(id) => id,
            None => {
                ctx.warn(r.file_name(), format!("Parent account didn't exist for group {}", sis_id));
                return Ok(());
            }
        },
    };
    let category_id = match r.get("group_category_id") {
        None => None,
        Some(gc) => match find_by_sis(ctx.conn, EntityKind::GroupCategory, ctx.root_account_id, gc)? {
            Some((id, _)) => Some(id),
            None => {
                ctx.warn(
                    r.file_name(),
                    format!("Group category {} didn't exist for group {}", gc, sis_id),
                );
                return Ok(());
            }
        },
    };
    let name = r.get("name");

    match find_by_sis(ctx.conn, EntityKind::Group, ctx.root_account_id, sis_id)? {
        Some((id, before)) => {
            ctx.conn.execute(
                "UPDATE groups SET account_id = ?, course_id = COALESCE(?, course_id),
                     group_category_id = COALESCE(?, group_category_id), name = COALESCE(?, name),
                     workflow_state = ?, sis_batch_id = ?, updated_at = ?
                 WHERE id = ?",
                params![account_id, course_id, category_id, name, status, ctx.batch_id, ctx.now, id],
            )?;
            ctx.record(EntityRef::new(EntityKind::Group, id), Some(&before), status);
        }
        None => {
            let Some(name) = name else {
                ctx.warn(r.file_name(), format!("No name given for group {}", sis_id));
                return Ok(());
            };
            ctx.conn.execute(
                "INSERT INTO groups(root_account_id, account_id, course_id, group_category_id, sis_source_id,
                     name, workflow_state, sis_batch_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    ctx.root_account_id,
                    account_id,
                    course_id,
                    category_id,
                    sis_id,
                    name,
                    status,
                    ctx.batch_id,
                    ctx.now,
                    ctx.now
                ],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::Group, id), None, status);
        }
    }
    Ok(())
}

pub(super) fn group_membership(ctx: &mut ImportContext<'_>, r: &Row<'_>) -> Result<(), ImportError> {
    let Some(group_sis) = r.require(ctx, "group_id") else {
        return Ok(());
    };
    let Some(user_sis) = r.require(ctx, "user_id") else {
        return Ok(());
    };
    let Some(status) = r.status_in(ctx, "group membership for user", user_sis, &["accepted", "deleted"]) else {
        return Ok(());
    };
    let Some((group_id, _)) = find_by_sis(ctx.conn, EntityKind::Group, ctx.root_account_id, group_sis)? else {
        ctx.warn(r.file_name(), format!("Group {} didn't exist for user {}", group_sis, user_sis));
        return Ok(());
    };
    let Some(user_id) = find_user_by_sis(ctx.conn, ctx.root_account_id, user_sis)? else {
        ctx.warn(r.file_name(), format!("User {} didn't exist for group {}", user_sis, group_sis));
        return Ok(());
    };

    let existing: Option<(i64, String)> = ctx
        .conn
        .query_row(
            "SELECT id, workflow_state FROM group_memberships WHERE group_id = ? AND user_id = ? ORDER BY id LIMIT 1",
            params![group_id, user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((id, before)) => {
            set_state(ctx, EntityKind::GroupMembership, id, status)?;
            ctx.record(EntityRef::new(EntityKind::GroupMembership, id), Some(&before), status);
        }
        None => {
            if status == "deleted" {
                return Ok(());
            }
            ctx.conn.execute(
                "INSERT INTO group_memberships(root_account_id, group_id, user_id, workflow_state, sis_batch_id,
                     created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                params![ctx.root_account_id, group_id, user_id, status, ctx.batch_id, ctx.now, ctx.now],
            )?;
            let id = ctx.conn.last_insert_rowid();
            ctx.record(EntityRef::new(EntityKind::GroupMembership, id), None, status);
        }
    }
    Ok(())
}
