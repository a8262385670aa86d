mod test_support;

use chrono::{Duration, Utc};
use serde_json::json;
use test_support::{
    count_states, entities, error_code, import, open_db, open_workspace, request, request_ok,
    spawn_sidecar, temp_dir, ts, wait_for_progress, wait_for_state, write_zip,
};

fn seed() -> Vec<(&'static str, String)> {
    vec![
        (
            "courses.csv",
            "course_id,short_name,status\nC1,BIO,active\nC2,CHEM,active\n".to_string(),
        ),
        (
            "users.csv",
            "user_id,login_id,first_name,last_name,status\nu1,ann,Ann,A,active\nu2,bob,Bob,B,active\n"
                .to_string(),
        ),
        (
            "enrollments.csv",
            "course_id,user_id,role,status\nC1,u1,student,active\nC1,u2,student,active\nC2,u1,student,active\n"
                .to_string(),
        ),
    ]
}

fn changes() -> Vec<(&'static str, String)> {
    vec![
        ("courses.csv", "course_id,short_name,status\nC2,CHEM,deleted\n".to_string()),
        (
            "enrollments.csv",
            "course_id,user_id,role,status\nC1,u1,student,deleted\nC1,u2,student,completed\n".to_string(),
        ),
    ]
}

fn restore(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    account_id: i64,
    batch_id: i64,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut params = json!({ "accountId": account_id, "id": batch_id });
    if let (Some(p), Some(e)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            p.insert(k.clone(), v.clone());
        }
    }
    request(stdin, reader, id, "sisImports.restoreStates", params)
}

#[test]
fn restore_puts_back_prior_states_and_is_idempotent() {
    let workspace = temp_dir("sisbatchd-restore");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let account_id = open_workspace(&mut stdin, &mut reader, &workspace);

    let first = write_zip(&workspace, "seed.zip", &seed());
    let _ = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    let second = write_zip(&workspace, "changes.zip", &changes());
    let b2 = import(&mut stdin, &mut reader, account_id, &second, json!({}));
    let b2_id = b2.get("id").and_then(|v| v.as_i64()).expect("id");
    assert_eq!(b2.pointer("/statistics/Enrollment/deleted").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(b2.pointer("/statistics/Enrollment/concluded").and_then(|v| v.as_i64()), Some(1));

    let resp = restore(&mut stdin, &mut reader, "r1", account_id, b2_id, json!({}));
    let progress = resp.get("result").cloned().expect("progress");
    assert_eq!(progress.get("tag").and_then(|v| v.as_str()), Some("sis_batch_state_restore"));
    let progress_id = progress.get("id").and_then(|v| v.as_i64()).expect("progress id");
    let done = wait_for_progress(&mut stdin, &mut reader, progress_id);
    assert_eq!(done.get("workflowState").and_then(|v| v.as_str()), Some("completed"));
    let _ = wait_for_state(&mut stdin, &mut reader, account_id, b2_id, &["restored"]);

    let enrollments = entities(&mut stdin, &mut reader, account_id, "enrollments");
    assert_eq!(count_states(&enrollments, "active"), 3);
    let courses = entities(&mut stdin, &mut reader, account_id, "courses");
    assert_eq!(count_states(&courses, "deleted"), 0);

    // A second restore is accepted and changes nothing.
    let again = restore(&mut stdin, &mut reader, "r2", account_id, b2_id, json!({}));
    let again_id = again.pointer("/result/id").and_then(|v| v.as_i64()).expect("progress id");
    let done = wait_for_progress(&mut stdin, &mut reader, again_id);
    assert_eq!(done.pointer("/results/restored").and_then(|v| v.as_i64()), Some(0));
    let _ = wait_for_state(&mut stdin, &mut reader, account_id, b2_id, &["restored"]);
    let enrollments = entities(&mut stdin, &mut reader, account_id, "enrollments");
    assert_eq!(count_states(&enrollments, "active"), 3);
}

#[test]
fn undelete_only_leaves_concluded_enrollments() {
    let workspace = temp_dir("sisbatchd-restore-undelete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let account_id = open_workspace(&mut stdin, &mut reader, &workspace);

    let first = write_zip(&workspace, "seed.zip", &seed());
    let _ = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    let second = write_zip(&workspace, "changes.zip", &changes());
    let b2 = import(&mut stdin, &mut reader, account_id, &second, json!({}));
    let b2_id = b2.get("id").and_then(|v| v.as_i64()).expect("id");

    let resp = restore(
        &mut stdin,
        &mut reader,
        "r1",
        account_id,
        b2_id,
        json!({ "undeleteOnly": true, "unconcludeOnly": true }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = restore(&mut stdin, &mut reader, "r2", account_id, b2_id, json!({ "undeleteOnly": true }));
    let progress_id = resp.pointer("/result/id").and_then(|v| v.as_i64()).expect("progress id");
    let _ = wait_for_progress(&mut stdin, &mut reader, progress_id);
    let batch = wait_for_state(&mut stdin, &mut reader, account_id, b2_id, &["partially_restored"]);
    assert_eq!(batch.get("workflowState").and_then(|v| v.as_str()), Some("partially_restored"));

    let enrollments = entities(&mut stdin, &mut reader, account_id, "enrollments");
    assert_eq!(count_states(&enrollments, "active"), 2);
    assert_eq!(count_states(&enrollments, "completed"), 1);
}

#[test]
fn restore_window_follows_retention_period() {
    let workspace = temp_dir("sisbatchd-restore-window");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let account_id = open_workspace(&mut stdin, &mut reader, &workspace);

    let first = write_zip(&workspace, "seed.zip", &seed());
    let _ = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    let second = write_zip(&workspace, "changes.zip", &changes());
    let b2 = import(&mut stdin, &mut reader, account_id, &second, json!({}));
    let b2_id = b2.get("id").and_then(|v| v.as_i64()).expect("id");

    let conn = open_db(&workspace);
    let backdate = |days: i64| {
        conn.execute(
            "UPDATE sis_batch_roll_back_data SET created_at = ?1 WHERE sis_batch_id = ?2",
            rusqlite::params![ts(Utc::now() - Duration::days(days)), b2_id],
        )
        .expect("backdate");
    };

    backdate(31);
    let resp = restore(&mut stdin, &mut reader, "r1", account_id, b2_id, json!({}));
    assert_eq!(error_code(&resp), "restore_data_unavailable");
    let jobs = request_ok(&mut stdin, &mut reader, "j1", "jobs.list", json!({ "status": "queued" }));
    let queued_restores = jobs
        .get("jobs")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter(|j| j.get("kind").and_then(|v| v.as_str()) == Some("restore_batch"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(queued_restores, 0);

    // Expired rows are purged on demand; the other batch's rows stay.
    let purged = request_ok(&mut stdin, &mut reader, "p1", "maintenance.purgeExpiredRollbackData", json!({}));
    assert!(purged.get("removed").and_then(|v| v.as_i64()).unwrap_or(0) >= 3);
    let left: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sis_batch_roll_back_data WHERE sis_batch_id = ?",
            [b2_id],
            |r| r.get(0),
        )
        .expect("count");
    assert_eq!(left, 0);

    // Reactivating everything is a fresh change set; 29 days on it is still
    // inside the window.
    let b3 = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    let b3_id = b3.get("id").and_then(|v| v.as_i64()).expect("id");
    conn.execute(
        "UPDATE sis_batch_roll_back_data SET created_at = ?1 WHERE sis_batch_id = ?2",
        rusqlite::params![ts(Utc::now() - Duration::days(29)), b3_id],
    )
    .expect("backdate");
    let resp = restore(&mut stdin, &mut reader, "r2", account_id, b3_id, json!({}));
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true), "{}", resp);
}
