
use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn bands_are_inclusive_and_gaps_degrade_to_na() {
    let workspace = temp_dir("resultsd-boundary-bands");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade-5" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let mut student_ids = Vec::new();
    for (i, (last, first)) in [("Amani", "Joy"), ("Bakari", "Tom"), ("Cherono", "Ann")]
        .iter()
        .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{i}"),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        student_ids.push(created["studentId"].as_str().expect("studentId").to_string());
    }

    // Generous maxMark so an in-range mark can still fall outside every band.
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "code": "MATH", "name": "Mathematics", "maxMark": 300.0 }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "boundaries.set",
        json!({
            "subjectId": subject_id,
            "bands": [
                { "minMark": 40.0, "maxMark": 59.0, "gradeLabel": "C", "performanceCode": "C1" },
                { "minMark": 0.0, "maxMark": 39.0, "gradeLabel": "E", "performanceCode": "E4" }
            ]
        }),
    );

    // List comes back sorted by minMark regardless of submission order.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "boundaries.list",
        json!({ "subjectId": subject_id }),
    );
    let bands = listed["bands"].as_array().expect("bands");
    assert_eq!(bands[0]["gradeLabel"].as_str(), Some("E"));
    assert_eq!(bands[1]["gradeLabel"].as_str(), Some("C"));

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "exams.create",
        json!({ "name": "Opener" }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "marks.bulkEnter",
        json!({
            "examId": exam_id,
            "subjectId": subject_id,
            "entries": [
                { "studentId": student_ids[0], "mark": 39.0 },
                { "studentId": student_ids[1], "mark": 40.0 },
                { "studentId": student_ids[2], "mark": 200.0 }
            ]
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.classPerformanceModel",
        json!({ "examId": exam_id, "classId": class_id }),
    );

    let students = report["students"].as_array().expect("students");
    let cell_for = |student_id: &str| -> serde_json::Value {
        students
            .iter()
            .find(|s| s["studentId"].as_str() == Some(student_id))
            .expect("student row")["cells"][0]
            .clone()
    };

    // Inclusive on both ends: 39 is still an E, 40 already a C.
    let amani = cell_for(&student_ids[0]);
    assert_eq!(amani["grade"].as_str(), Some("E"));
    assert_eq!(amani["level"].as_str(), Some("E4"));
    let bakari = cell_for(&student_ids[1]);
    assert_eq!(bakari["grade"].as_str(), Some("C"));
    assert_eq!(bakari["level"].as_str(), Some("C1"));

    // 200 is a legal mark for the subject but no band covers it.
    let cherono = cell_for(&student_ids[2]);
    assert_eq!(cherono["mark"].as_f64(), Some(200.0));
    assert_eq!(cherono["grade"].as_str(), Some("N/A"));
    assert_eq!(cherono["level"].as_str(), Some("N/A"));

    // The unclassifiable mark still counts toward the subject mean.
    assert_eq!(
        report["means"]["perSubject"][0].as_f64(),
        Some((39.0 + 40.0 + 200.0) / 3.0)
    );
}

#[test]
fn overlapping_or_inverted_band_sets_are_rejected() {
    let workspace = temp_dir("resultsd-boundary-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "code": "ENG", "name": "English" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    // Shared endpoint counts as overlap because bands are inclusive.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "boundaries.set",
        json!({
            "subjectId": subject_id,
            "bands": [
                { "minMark": 0.0, "maxMark": 40.0, "gradeLabel": "E", "performanceCode": "E4" },
                { "minMark": 40.0, "maxMark": 59.0, "gradeLabel": "C", "performanceCode": "C1" }
            ]
        }),
    );
    assert_eq!(error["code"].as_str(), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "boundaries.set",
        json!({
            "subjectId": subject_id,
            "bands": [
                { "minMark": 50.0, "maxMark": 10.0, "gradeLabel": "X", "performanceCode": "X1" }
            ]
        }),
    );
    assert_eq!(error["code"].as_str(), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "boundaries.set",
        json!({ "subjectId": "nope", "bands": [] }),
    );
    assert_eq!(error["code"].as_str(), Some("not_found"));
}
