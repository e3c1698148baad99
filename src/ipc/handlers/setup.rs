use crate::engine::{self, GradeBand};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_uppercase(),
        None => return err(&req.id, "bad_params", "missing code", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if code.is_empty() || name.is_empty() {
        return err(&req.id, "bad_params", "code and name must not be empty", None);
    }
    let max_mark = req
        .params
        .get("maxMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(100.0);
    if max_mark <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "maxMark must be > 0",
            Some(json!({ "maxMark": max_mark })),
        );
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, code, name, max_mark, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &code, &name, max_mark, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects", "code": code })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "code": code, "sortOrder": sort_order }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, code, name, max_mark, sort_order FROM subjects ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            let max_mark: f64 = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "maxMark": max_mark,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_boundaries_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let bands: Vec<GradeBand> = match req.params.get("bands") {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(v) => v,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("bands could not be parsed: {}", e),
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing bands", None),
    };

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = engine::validate_bands(&bands) {
        return err(&req.id, &e.code, e.message, e.details.map(|d| json!(d)));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM grade_boundaries WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for band in &bands {
        let band_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO grade_boundaries(id, subject_id, min_mark, max_mark, grade_label, performance_code)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &band_id,
                &subject_id,
                band.min_mark,
                band.max_mark,
                &band.grade_label,
                &band.performance_code,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "grade_boundaries" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "subjectId": subject_id, "bandCount": bands.len() }))
}

fn handle_boundaries_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut stmt = match conn.prepare(
        "SELECT min_mark, max_mark, grade_label, performance_code
         FROM grade_boundaries
         WHERE subject_id = ?
         ORDER BY min_mark",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&subject_id], |r| {
            let min_mark: f64 = r.get(0)?;
            let max_mark: f64 = r.get(1)?;
            let grade_label: String = r.get(2)?;
            let performance_code: String = r.get(3)?;
            Ok(json!({
                "minMark": min_mark,
                "maxMark": max_mark,
                "gradeLabel": grade_label,
                "performanceCode": performance_code
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(bands) => ok(&req.id, json!({ "subjectId": subject_id, "bands": bands })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let term = req.params.get("term").and_then(|v| v.as_i64());

    // Creation order defines exam chronology.
    let seq: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM exams",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, seq, name, term) VALUES(?, ?, ?, ?)",
        (&exam_id, seq, &name, term),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    ok(&req.id, json!({ "examId": exam_id, "seq": seq, "name": name }))
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, seq, name, term FROM exams ORDER BY seq") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let seq: i64 = r.get(1)?;
            let name: String = r.get(2)?;
            let term: Option<i64> = r.get(3)?;
            Ok(json!({ "id": id, "seq": seq, "name": name, "term": term }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "boundaries.set" => Some(handle_boundaries_set(state, req)),
        "boundaries.list" => Some(handle_boundaries_list(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        _ => None,
    }
}
