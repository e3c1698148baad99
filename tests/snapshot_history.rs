
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_ok, spawn_sidecar, temp_dir};

struct Fixture {
    class_id: String,
    subject_id: String,
    student_ids: Vec<String>,
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
        json!({ "name": "Grade-6" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let mut student_ids = Vec::new();
    for (i, (last, first)) in [("Imani", "Zoe"), ("Juma", "Ali")].iter().enumerate() {
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
        json!({ "code": "SCI", "name": "Science" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    Fixture {
        class_id,
        subject_id,
        student_ids,
    }
}

fn create_exam_with_marks(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    fixture: &Fixture,
    tag: &str,
    name: &str,
    marks: [f64; 2],
) -> String {
    let exam = request_ok(
        stdin,
        reader,
        &format!("{tag}-exam"),
        "exams.create",
        json!({ "name": name }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        &format!("{tag}-marks"),
        "marks.bulkEnter",
        json!({
            "examId": exam_id,
            "subjectId": fixture.subject_id,
            "entries": [
                { "studentId": fixture.student_ids[0], "mark": marks[0] },
                { "studentId": fixture.student_ids[1], "mark": marks[1] }
            ]
        }),
    );
    exam_id
}

fn run_report(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
    exam_id: &str,
    class_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        tag,
        "reports.classPerformanceModel",
        json!({ "examId": exam_id, "classId": class_id }),
    )
}

#[test]
fn prior_snapshot_is_strictly_earlier_and_upserts_are_idempotent() {
    let workspace = temp_dir("resultsd-snapshot-history");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());

    // Three exams with subject means 60, 70, 65.
    let exam1 = create_exam_with_marks(&mut stdin, &mut reader, &fixture, "e1", "Opener", [55.0, 65.0]);
    let exam2 = create_exam_with_marks(&mut stdin, &mut reader, &fixture, "e2", "Midterm", [68.0, 72.0]);
    let exam3 = create_exam_with_marks(&mut stdin, &mut reader, &fixture, "e3", "Endterm", [60.0, 70.0]);

    let report1 = run_report(&mut stdin, &mut reader, "r1", &exam1, &fixture.class_id);
    assert!(report1["priorExam"].is_null());
    assert_eq!(report1["means"]["perSubject"][0].as_f64(), Some(60.0));

    let report2 = run_report(&mut stdin, &mut reader, "r2", &exam2, &fixture.class_id);
    assert_eq!(report2["priorExam"]["name"].as_str(), Some("Opener"));
    assert_eq!(report2["deviations"]["perSubject"][0].as_f64(), Some(10.0));

    let report3 = run_report(&mut stdin, &mut reader, "r3", &exam3, &fixture.class_id);
    assert_eq!(report3["priorExam"]["name"].as_str(), Some("Midterm"));
    assert_eq!(report3["deviations"]["perSubject"][0].as_f64(), Some(-5.0));

    // Re-running the middle exam must compare against the opener, never the
    // newer endterm snapshot sitting in the same table.
    let report2_again = run_report(&mut stdin, &mut reader, "r4", &exam2, &fixture.class_id);
    assert_eq!(report2_again["priorExam"]["name"].as_str(), Some("Opener"));
    assert_eq!(report2_again["deviations"]["perSubject"][0].as_f64(), Some(10.0));

    // Repeated runs over unchanged marks change nothing: still one snapshot
    // per exam, same stored values.
    for i in 0..3 {
        let _ = run_report(&mut stdin, &mut reader, &format!("r5-{i}"), &exam1, &fixture.class_id);
    }
    let trend = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "reports.classMeanTrend",
        json!({ "classId": fixture.class_id }),
    );
    let points = trend["points"].as_array().expect("points");
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["examName"].as_str(), Some("Opener"));
    assert_eq!(points[0]["subjectMeans"]["SCI"].as_f64(), Some(60.0));
    assert_eq!(points[0]["totalMean"].as_f64(), Some(60.0));
    assert_eq!(points[1]["examName"].as_str(), Some("Midterm"));
    assert_eq!(points[1]["totalMean"].as_f64(), Some(70.0));
    assert_eq!(points[2]["examName"].as_str(), Some("Endterm"));
    assert_eq!(points[2]["totalMean"].as_f64(), Some(65.0));

    // Marks changed and re-reported: the stored snapshot follows.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enter",
        json!({
            "examId": exam1,
            "subjectId": fixture.subject_id,
            "studentId": fixture.student_ids[0],
            "mark": 75.0
        }),
    );
    let _ = run_report(&mut stdin, &mut reader, "r6", &exam1, &fixture.class_id);
    let trend = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "reports.classMeanTrend",
        json!({ "classId": fixture.class_id }),
    );
    let points = trend["points"].as_array().expect("points");
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["subjectMeans"]["SCI"].as_f64(), Some(70.0));
}

#[test]
fn snapshots_are_scoped_per_class() {
    let workspace = temp_dir("resultsd-snapshot-scope");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fixture = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());

    let other_class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "Grade-7" }),
    );
    let other_class_id = other_class["classId"].as_str().expect("classId").to_string();
    let other_student = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "students.create",
        json!({ "classId": other_class_id, "lastName": "Kito", "firstName": "Eve" }),
    );
    let other_student_id = other_student["studentId"].as_str().expect("studentId").to_string();

    let exam1 = create_exam_with_marks(&mut stdin, &mut reader, &fixture, "e1", "Opener", [50.0, 60.0]);
    let exam2 = create_exam_with_marks(&mut stdin, &mut reader, &fixture, "e2", "Midterm", [70.0, 80.0]);

    // Only the other class sat the opener report; Grade-6 runs the midterm
    // first. Its prior must come from its own class, and there is none yet.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enter",
        json!({
            "examId": exam1,
            "subjectId": fixture.subject_id,
            "studentId": other_student_id,
            "mark": 90.0
        }),
    );
    let _ = run_report(&mut stdin, &mut reader, "r1", &exam1, &other_class_id);

    let report = run_report(&mut stdin, &mut reader, "r2", &exam2, &fixture.class_id);
    assert!(report["priorExam"].is_null());
    assert_eq!(report["deviations"]["perSubject"][0].as_str(), Some("-"));

    // Once Grade-6 has its own opener snapshot, the midterm picks it up.
    let _ = run_report(&mut stdin, &mut reader, "r3", &exam1, &fixture.class_id);
    let report = run_report(&mut stdin, &mut reader, "r4", &exam2, &fixture.class_id);
    assert_eq!(report["priorExam"]["name"].as_str(), Some("Opener"));
    assert_eq!(report["deviations"]["perSubject"][0].as_f64(), Some(20.0));
}
