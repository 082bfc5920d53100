use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_ukkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ukkd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) -> PathBuf {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(stdin, reader, "seed", "workspace.seed", json!({}));
    workspace
}

fn create_department(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("dept-{}", code),
        "departments.create",
        json!({ "name": format!("Jurusan {}", code), "code": code }),
    );
    res["department"]["id"].as_str().expect("department id").to_string()
}

fn create_evaluator(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    email: &str,
    department_id: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("ev-{}", email),
        "evaluators.create",
        json!({
            "name": format!("Penguji {}", email),
            "kind": "internal",
            "email": email,
            "password": "rahasia",
            "departmentId": department_id
        }),
    );
    res["evaluator"]["id"].as_str().expect("evaluator id").to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    person_id: &str,
    department_id: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("st-{}", person_id),
        "students.create",
        json!({
            "personId": person_id,
            "name": format!("Siswa {}", person_id),
            "classLabel": "XII",
            "departmentId": department_id
        }),
    );
    res["studentId"].as_str().expect("student id").to_string()
}

fn create_aspect(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    department_id: &str,
) -> (String, Vec<String>) {
    let res = request_ok(
        stdin,
        reader,
        &format!("asp-{}", department_id),
        "aspects.create",
        json!({
            "name": "Persiapan",
            "departmentId": department_id,
            "elements": [
                { "name": "K3", "subElements": [{ "name": "APD" }] },
                { "name": "Alat", "weight": 3 }
            ]
        }),
    );
    let aspect = &res["aspect"];
    let elements = aspect["elements"]
        .as_array()
        .expect("elements")
        .iter()
        .map(|e| e["id"].as_str().expect("element id").to_string())
        .collect();
    (aspect["id"].as_str().expect("aspect id").to_string(), elements)
}

#[test]
fn submit_enforces_department_range_and_single_assessment() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = select_workspace(&mut stdin, &mut reader, "ukkd-assessment-rules");

    let tkj = create_department(&mut stdin, &mut reader, "TKJ");
    let rpl = create_department(&mut stdin, &mut reader, "RPL");
    let ev_tkj = create_evaluator(&mut stdin, &mut reader, "a@tkj.id", &tkj);
    let student_tkj = create_student(&mut stdin, &mut reader, "1001", &tkj);
    let student_rpl = create_student(&mut stdin, &mut reader, "2001", &rpl);
    let (_aspect_tkj, el_tkj) = create_aspect(&mut stdin, &mut reader, &tkj);
    let (_aspect_rpl, el_rpl) = create_aspect(&mut stdin, &mut reader, &rpl);

    let mismatch = request(
        &mut stdin,
        &mut reader,
        "1",
        "assessments.submit",
        json!({ "studentId": student_rpl, "evaluatorId": ev_tkj, "scores": {} }),
    );
    assert_eq!(error_code(&mismatch), "department_mismatch");

    let foreign = request(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.submit",
        json!({
            "studentId": student_tkj,
            "evaluatorId": ev_tkj,
            "scores": { el_rpl[0].clone(): 80 }
        }),
    );
    assert_eq!(error_code(&foreign), "bad_params");
    assert_eq!(foreign["error"]["details"]["elementId"], json!(el_rpl[0]));

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.submit",
        json!({
            "studentId": student_tkj,
            "evaluatorId": ev_tkj,
            "scores": { el_tkj[0].clone(): 101 }
        }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.get",
        json!({ "studentId": student_tkj, "evaluatorId": ev_tkj }),
    );
    assert_eq!(before["exists"], json!(false));

    // Only one of the two elements is scored; the other is stored as null.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.submit",
        json!({
            "studentId": student_tkj,
            "evaluatorId": ev_tkj,
            "scores": { el_tkj[1].clone(): 90 }
        }),
    );
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assessments.get",
        json!({ "studentId": student_tkj, "evaluatorId": ev_tkj }),
    );
    assert_eq!(after["exists"], json!(true));
    assert_eq!(after["scores"][el_tkj[0].as_str()], json!(null));
    assert_eq!(after["scores"][el_tkj[1].as_str()], json!(90.0));

    let again = request(
        &mut stdin,
        &mut reader,
        "7",
        "assessments.submit",
        json!({
            "studentId": student_tkj,
            "evaluatorId": ev_tkj,
            "scores": { el_tkj[0].clone(): 70, el_tkj[1].clone(): 70 }
        }),
    );
    assert_eq!(error_code(&again), "already_assessed");

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "setup.update",
        json!({ "section": "assessment", "patch": { "allowReassess": true } }),
    );
    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assessments.submit",
        json!({
            "studentId": student_tkj,
            "evaluatorId": ev_tkj,
            "scores": { el_tkj[0].clone(): 70, el_tkj[1].clone(): 70 }
        }),
    );
    assert_eq!(replaced["replaced"], json!(true));
    assert_eq!(replaced["finalScore"], json!(70.0));

    let listed = request_ok(&mut stdin, &mut reader, "10", "assessments.list", json!({}));
    let rows = listed["assessments"].as_array().expect("assessments");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["scoreCount"], json!(2));
    assert_eq!(rows[0]["scoredCount"], json!(2));

    let summary = request_ok(&mut stdin, &mut reader, "11", "dashboard.summary", json!({}));
    assert_eq!(summary["assessedStudentCount"], json!(1));
    assert_eq!(summary["departmentCount"], json!(2));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "assessments.delete",
        json!({ "studentId": student_tkj, "evaluatorId": ev_tkj }),
    );
    assert_eq!(deleted["scoreCount"], json!(2));
    let missing = request(
        &mut stdin,
        &mut reader,
        "13",
        "assessments.delete",
        json!({ "studentId": student_tkj, "evaluatorId": ev_tkj }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn preview_and_criterion_pick_follow_the_form() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = select_workspace(&mut stdin, &mut reader, "ukkd-assessment-preview");

    let tkj = create_department(&mut stdin, &mut reader, "TKJ");
    let (_aspect, el) = create_aspect(&mut stdin, &mut reader, &tkj);

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessments.preview",
        json!({ "departmentId": tkj, "scores": { el[0].clone(): 80, el[1].clone(): null } }),
    );
    assert_eq!(preview["weighted"], json!(false));
    assert_eq!(preview["aspects"][0]["score"], json!(40.0));
    assert_eq!(preview["aspects"][0]["criterion"], json!("Kurang"));
    assert_eq!(preview["aspects"][0]["scoredCount"], json!(1));
    assert_eq!(preview["total"]["finalScore"], json!(40.0));
    assert_eq!(preview["unscoredCount"], json!(1));
    assert_eq!(preview["complete"], json!(false));

    // Weights 1 and 3: (80*1 + 60*3) / 4 = 65.
    let weighted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.preview",
        json!({
            "departmentId": tkj,
            "scores": { el[0].clone(): 80, el[1].clone(): 60 },
            "weighted": true
        }),
    );
    assert_eq!(weighted["total"]["finalScore"], json!(65.0));
    assert_eq!(weighted["total"]["matchedLabel"], json!("Cukup"));
    assert_eq!(weighted["aspects"][0]["score"], json!(70.0));
    assert_eq!(weighted["complete"], json!(true));

    let criteria = request_ok(&mut stdin, &mut reader, "3", "criteria.list", json!({}));
    let baik = criteria["criteria"]
        .as_array()
        .expect("criteria")
        .iter()
        .find(|c| c["name"] == json!("Baik"))
        .and_then(|c| c["id"].as_str())
        .expect("Baik criterion")
        .to_string();
    let picked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.scoreFromCriterion",
        json!({ "criterionId": baik }),
    );
    assert_eq!(picked["score"], json!(77.0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scored_records_block_destructive_edits() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = select_workspace(&mut stdin, &mut reader, "ukkd-assessment-guards");

    let tkj = create_department(&mut stdin, &mut reader, "TKJ");
    let rpl = create_department(&mut stdin, &mut reader, "RPL");
    let ev = create_evaluator(&mut stdin, &mut reader, "g@tkj.id", &tkj);
    let student = create_student(&mut stdin, &mut reader, "3001", &tkj);
    let (aspect, el) = create_aspect(&mut stdin, &mut reader, &tkj);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessments.submit",
        json!({
            "studentId": student,
            "evaluatorId": ev,
            "scores": { el[0].clone(): 88, el[1].clone(): 92 }
        }),
    );

    let aspect_update = request(
        &mut stdin,
        &mut reader,
        "2",
        "aspects.update",
        json!({ "aspectId": aspect, "name": "Persiapan", "elements": [{ "name": "Baru" }] }),
    );
    assert_eq!(error_code(&aspect_update), "has_scores");
    let aspect_delete = request(
        &mut stdin,
        &mut reader,
        "3",
        "aspects.delete",
        json!({ "aspectId": aspect }),
    );
    assert_eq!(error_code(&aspect_delete), "has_scores");

    let student_delete = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.delete",
        json!({ "studentId": student }),
    );
    assert_eq!(error_code(&student_delete), "has_scores");
    let student_move = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": student, "patch": { "departmentId": rpl } }),
    );
    assert_eq!(error_code(&student_move), "has_scores");

    let dept_delete = request(
        &mut stdin,
        &mut reader,
        "6",
        "departments.delete",
        json!({ "departmentId": tkj }),
    );
    assert_eq!(error_code(&dept_delete), "conflict");

    let dashboard = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evaluators.dashboard",
        json!({ "evaluatorId": ev }),
    );
    assert_eq!(dashboard["studentsAssessed"], json!(1));
    assert_eq!(dashboard["studentsPending"], json!(0));
    assert_eq!(dashboard["totalScores"], json!(2));

    let refused = request(
        &mut stdin,
        &mut reader,
        "8",
        "evaluators.delete",
        json!({ "evaluatorId": ev }),
    );
    assert_eq!(error_code(&refused), "has_scores");
    assert_eq!(refused["error"]["details"]["scoreCount"], json!(2));

    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "evaluators.delete",
        json!({ "evaluatorId": ev, "force": true }),
    );
    assert_eq!(forced["scoresDeleted"], json!(2));
    assert_eq!(forced["userDeleted"], json!(true));

    // With the scores gone the aspect tree can be replaced.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "aspects.update",
        json!({
            "aspectId": aspect,
            "name": "Persiapan Kerja",
            "elements": [{ "name": "Baru", "subElements": ["Satu", "Dua"] }]
        }),
    );
    assert_eq!(updated["aspect"]["name"], json!("Persiapan Kerja"));
    assert_eq!(updated["aspect"]["elements"].as_array().map(|e| e.len()), Some(1));
    assert_eq!(
        updated["aspect"]["elements"][0]["subElements"][1]["name"],
        json!("Dua")
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.delete",
        json!({ "studentId": student }),
    );

    let db = workspace.join("ukk.sqlite3");
    let conn = rusqlite::Connection::open(&db).expect("open db");
    let scores: i64 = conn
        .query_row("SELECT COUNT(*) FROM scores", [], |r| r.get(0))
        .expect("count scores");
    assert_eq!(scores, 0);
    let users: i64 = conn
        .query_row("SELECT COUNT(*) FROM users WHERE role = 'evaluator'", [], |r| r.get(0))
        .expect("count users");
    assert_eq!(users, 0);

    let _ = std::fs::remove_dir_all(workspace);
}
