
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

struct Fixture {
    class_id: String,
    subject_id: String,
    student_ids: Vec<String>,
    exam_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &str) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace }),
    );
    let class = request_ok(
        stdin,
        reader,
        "s2",
        "classes.create",
        json!({ "name": "Grade-4" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let mut student_ids = Vec::new();
    for (i, (last, first)) in [("Otieno", "Grace"), ("Wanjiru", "Sam")].iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("s3-{i}"),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        student_ids.push(created["studentId"].as_str().expect("studentId").to_string());
    }

    let subject = request_ok(
        stdin,
        reader,
        "s4",
        "subjects.create",
        json!({ "code": "MATH", "name": "Mathematics" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "boundaries.set",
        json!({
            "subjectId": subject_id,
            "bands": [
                { "minMark": 0.0, "maxMark": 49.0, "gradeLabel": "D", "performanceCode": "D3" },
                { "minMark": 50.0, "maxMark": 100.0, "gradeLabel": "B", "performanceCode": "B2" }
            ]
        }),
    );

    let exam = request_ok(stdin, reader, "s6", "exams.create", json!({ "name": "Opener" }));
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s7",
        "marks.bulkEnter",
        json!({
            "examId": exam_id,
            "subjectId": subject_id,
            "entries": [
                { "studentId": student_ids[0], "mark": 40.0 },
                { "studentId": student_ids[1], "mark": 80.0 }
            ]
        }),
    );

    Fixture {
        class_id,
        subject_id,
        student_ids,
        exam_id,
    }
}

#[test]
fn profile_serves_the_persisted_rank_without_recomputing() {
    let workspace = temp_dir("resultsd-student-profile");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());

    // Marks exist but no report has run yet, so there is nothing persisted
    // to serve.
    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": fixture.student_ids[0] }),
    );
    assert!(profile["rank"].is_null());
    assert!(profile["total"].is_null());
    assert!(profile["classMeans"].is_null());
    // The raw marks and their bands are still visible.
    assert_eq!(profile["cells"][0]["mark"].as_f64(), Some(40.0));
    assert_eq!(profile["cells"][0]["grade"].as_str(), Some("D"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.classPerformanceModel",
        json!({ "examId": fixture.exam_id, "classId": fixture.class_id }),
    );

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": fixture.student_ids[0] }),
    );
    assert_eq!(profile["student"]["displayName"].as_str(), Some("Otieno, Grace"));
    assert_eq!(profile["total"].as_f64(), Some(40.0));
    assert_eq!(profile["rank"].as_i64(), Some(2));
    assert_eq!(profile["gradedCount"].as_i64(), Some(1));
    assert_eq!(profile["cells"][0]["level"].as_str(), Some("D3"));
    assert_eq!(profile["classMeans"]["subjectMeans"]["MATH"].as_f64(), Some(60.0));
    assert_eq!(profile["classMeans"]["totalMean"].as_f64(), Some(60.0));

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": fixture.student_ids[1] }),
    );
    assert_eq!(profile["rank"].as_i64(), Some(1));
    assert_eq!(profile["total"].as_f64(), Some(80.0));
    assert_eq!(profile["cells"][0]["grade"].as_str(), Some("B"));

    // A mark edit alone does not move the persisted rank; the stored row
    // stays as the last report run left it until the report runs again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enter",
        json!({
            "examId": fixture.exam_id,
            "subjectId": fixture.subject_id,
            "studentId": fixture.student_ids[0],
            "mark": 95.0
        }),
    );
    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "p4",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": fixture.student_ids[0] }),
    );
    assert_eq!(profile["cells"][0]["mark"].as_f64(), Some(95.0));
    assert_eq!(profile["rank"].as_i64(), Some(2));
    assert_eq!(profile["total"].as_f64(), Some(40.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.classPerformanceModel",
        json!({ "examId": fixture.exam_id, "classId": fixture.class_id }),
    );
    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "p5",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": fixture.student_ids[0] }),
    );
    assert_eq!(profile["rank"].as_i64(), Some(1));
    assert_eq!(profile["total"].as_f64(), Some(95.0));
}

#[test]
fn unknown_identifiers_fail_fast() {
    let workspace = temp_dir("resultsd-student-profile-ids");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e1",
        "reports.studentProfileModel",
        json!({ "examId": "nope", "studentId": fixture.student_ids[0] }),
    );
    assert_eq!(error["code"].as_str(), Some("not_found"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e2",
        "reports.studentProfileModel",
        json!({ "examId": fixture.exam_id, "studentId": "nope" }),
    );
    assert_eq!(error["code"].as_str(), Some("not_found"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e3",
        "reports.classPerformanceModel",
        json!({ "examId": fixture.exam_id, "classId": "nope" }),
    );
    assert_eq!(error["code"].as_str(), Some("not_found"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "e4",
        "reports.classMeanTrend",
        json!({ "classId": "nope" }),
    );
    assert_eq!(error["code"].as_str(), Some("not_found"));
}
