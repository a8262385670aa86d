mod test_support;

use serde_json::json;
use test_support::{entities, import, open_workspace, request_ok, spawn_sidecar, temp_dir, warnings, write_file};

fn course_name(rows: &[serde_json::Value], sis_id: &str) -> Option<String> {
    rows.iter()
        .find(|c| c.get("sis_source_id").and_then(|v| v.as_str()) == Some(sis_id))
        .and_then(|c| c.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[test]
fn ui_edits_stick_until_overridden() {
    let workspace = temp_dir("sisbatchd-stickiness");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let account_id = open_workspace(&mut stdin, &mut reader, &workspace);

    let first = write_file(
        &workspace,
        "courses.csv",
        "course_id,short_name,long_name,status\nC1,BIO,Biology,active\n",
    );
    let _ = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    let rows = entities(&mut stdin, &mut reader, account_id, "courses");
    let course_id = rows[0].get("id").and_then(|v| v.as_i64()).expect("course id");

    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "courses.updateFromUi",
        json!({ "accountId": account_id, "courseId": course_id, "name": "Biology Honors" }),
    );
    assert_eq!(edited.get("stuckSisFields"), Some(&json!(["name"])));

    let renamed_dir = workspace.join("renamed");
    std::fs::create_dir_all(&renamed_dir).expect("dir");
    let renamed = write_file(
        &renamed_dir,
        "courses.csv",
        "course_id,short_name,long_name,status\nC1,BIO,Biology 101,active\n",
    );
    let _ = import(&mut stdin, &mut reader, account_id, &renamed, json!({}));
    let rows = entities(&mut stdin, &mut reader, account_id, "courses");
    assert_eq!(course_name(&rows, "C1").as_deref(), Some("Biology Honors"));

    let _ = import(
        &mut stdin,
        &mut reader,
        account_id,
        &renamed,
        json!({ "overrideSisStickiness": true, "clearSisStickiness": true }),
    );
    let rows = entities(&mut stdin, &mut reader, account_id, "courses");
    assert_eq!(course_name(&rows, "C1").as_deref(), Some("Biology 101"));
    assert_eq!(rows[0].get("stuck_sis_fields"), Some(&json!("")));
}

#[test]
fn claimed_login_is_a_warning_unless_sis_id_may_move() {
    let workspace = temp_dir("sisbatchd-login-claimed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let account_id = open_workspace(&mut stdin, &mut reader, &workspace);

    let first = write_file(
        &workspace,
        "users.csv",
        "user_id,login_id,first_name,last_name,email,status\nu1,jdoe,Jane,Doe,jane@example.edu,active\n",
    );
    let b1 = import(&mut stdin, &mut reader, account_id, &first, json!({}));
    assert_eq!(b1.get("workflowState").and_then(|v| v.as_str()), Some("imported"));
    let channels = entities(&mut stdin, &mut reader, account_id, "communication_channels");
    assert_eq!(channels.len(), 1);
    assert_eq!(
        channels[0].get("workflow_state").and_then(|v| v.as_str()),
        Some("unconfirmed")
    );

    let dir = workspace.join("claim");
    std::fs::create_dir_all(&dir).expect("dir");
    let claim = write_file(
        &dir,
        "users.csv",
        "user_id,login_id,first_name,last_name,status\nu2,JDOE,Jane,Doe,active\n",
    );
    let b2 = import(&mut stdin, &mut reader, account_id, &claim, json!({}));
    assert_eq!(
        b2.get("workflowState").and_then(|v| v.as_str()),
        Some("imported_with_messages")
    );
    assert!(warnings(&b2)
        .iter()
        .any(|w| w == "An existing login has already claimed the login_id JDOE requested by user u2"));
    let pseudonyms = entities(&mut stdin, &mut reader, account_id, "pseudonyms");
    assert_eq!(pseudonyms.len(), 1);
    assert_eq!(pseudonyms[0].get("sis_source_id"), Some(&json!("u1")));

    let _ = import(
        &mut stdin,
        &mut reader,
        account_id,
        &claim,
        json!({ "updateSisIdIfLoginClaimed": true }),
    );
    let pseudonyms = entities(&mut stdin, &mut reader, account_id, "pseudonyms");
    assert_eq!(pseudonyms.len(), 1);
    assert_eq!(pseudonyms[0].get("sis_source_id"), Some(&json!("u2")));
}
