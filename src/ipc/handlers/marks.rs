use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const MARKS_BULK_MAX_ENTRIES: usize = 5000;

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

fn exam_exists(conn: &Connection, exam_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM exams WHERE id = ?", [exam_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn subject_max_mark(conn: &Connection, subject_id: &str) -> Result<Option<f64>, HandlerErr> {
    conn.query_row(
        "SELECT max_mark FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// A present numeric mark must sit inside [0, max]; `null` is the explicit
/// "not yet graded" state and always passes.
fn validate_mark(mark: Option<f64>, max_mark: f64) -> Result<(), HandlerErr> {
    let Some(v) = mark else {
        return Ok(());
    };
    if v < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "negative marks are not allowed".to_string(),
            details: Some(json!({ "mark": v })),
        });
    }
    if v > max_mark {
        return Err(HandlerErr {
            code: "bad_params",
            message: "mark exceeds the subject maximum".to_string(),
            details: Some(json!({ "mark": v, "maxMark": max_mark })),
        });
    }
    Ok(())
}

fn upsert_mark(
    conn: &Connection,
    exam_id: &str,
    subject_id: &str,
    student_id: &str,
    mark: Option<f64>,
) -> Result<(), HandlerErr> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO scores(id, exam_id, subject_id, student_id, mark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, subject_id, student_id) DO UPDATE SET
           mark = excluded.mark,
           updated_at = excluded.updated_at",
        (
            &score_id,
            exam_id,
            subject_id,
            student_id,
            mark,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "scores" })),
    })?;
    Ok(())
}

fn handle_marks_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let mark = match req.params.get("mark") {
        None => return err(&req.id, "bad_params", "missing mark (use null to clear)", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "mark must be a number or null", None),
        },
    };

    match exam_exists(conn, &exam_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return e.response(&req.id),
    }
    let max_mark = match subject_max_mark(conn, &subject_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    };
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = validate_mark(mark, max_mark) {
        return e.response(&req.id);
    }
    if let Err(e) = upsert_mark(conn, &exam_id, &subject_id, &student_id, mark) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "updated": 1 }))
}

fn handle_marks_bulk_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let entries = match req.params.get("entries").and_then(|v| v.as_array()) {
        Some(v) => v.clone(),
        None => return err(&req.id, "bad_params", "missing entries", None),
    };
    if entries.len() > MARKS_BULK_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            "too many entries in one request",
            Some(json!({ "entries": entries.len(), "max": MARKS_BULK_MAX_ENTRIES })),
        );
    }

    match exam_exists(conn, &exam_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return e.response(&req.id),
    }
    let max_mark = match subject_max_mark(conn, &subject_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    };

    // Validate the whole batch before touching the table.
    let mut parsed: Vec<(String, Option<f64>)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "entry missing studentId",
                Some(json!({ "index": i })),
            );
        };
        let mark = match entry.get("mark") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => match v.as_f64() {
                Some(n) => Some(n),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "entry mark must be a number or null",
                        Some(json!({ "index": i })),
                    )
                }
            },
        };
        match student_exists(conn, student_id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "student not found",
                    Some(json!({ "index": i, "studentId": student_id })),
                )
            }
            Err(e) => return e.response(&req.id),
        }
        if let Err(e) = validate_mark(mark, max_mark) {
            return e.response(&req.id);
        }
        parsed.push((student_id.to_string(), mark));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (student_id, mark) in &parsed {
        if let Err(e) = upsert_mark(&tx, &exam_id, &subject_id, student_id, *mark) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "updated": parsed.len() }))
}

fn handle_marks_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    match exam_exists(conn, &exam_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return e.response(&req.id),
    }
    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let mut stud_stmt = match conn.prepare(
        "SELECT id, last_name, first_name
         FROM students
         WHERE class_id = ? AND active = 1
         ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<(String, String)> = match stud_stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((id, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut subj_stmt = match conn
        .prepare("SELECT id, code FROM subjects ORDER BY sort_order")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects: Vec<(String, String)> = match subj_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_index: HashMap<&str, usize> = students
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();
    let subject_index: HashMap<&str, usize> = subjects
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut cells: Vec<Vec<Option<f64>>> = vec![vec![None; subjects.len()]; students.len()];
    let mut score_stmt = match conn.prepare(
        "SELECT sc.student_id, sc.subject_id, sc.mark
         FROM scores sc
         JOIN students st ON st.id = sc.student_id
         WHERE sc.exam_id = ? AND st.class_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let score_rows = score_stmt.query_map((&exam_id, &class_id), |r| {
        let student_id: String = r.get(0)?;
        let subject_id: String = r.get(1)?;
        let mark: Option<f64> = r.get(2)?;
        Ok((student_id, subject_id, mark))
    });
    match score_rows {
        Ok(it) => {
            for row in it.flatten() {
                let Some(&r_i) = student_index.get(row.0.as_str()) else {
                    continue;
                };
                let Some(&c_i) = subject_index.get(row.1.as_str()) else {
                    continue;
                };
                cells[r_i][c_i] = row.2;
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let students_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, name)| json!({ "id": id, "displayName": name }))
        .collect();
    let subjects_json: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(id, code)| json!({ "id": id, "code": code }))
        .collect();

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "classId": class_id,
            "students": students_json,
            "subjects": subjects_json,
            "rowCount": students.len(),
            "colCount": subjects.len(),
            "cells": cells
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enter" => Some(handle_marks_enter(state, req)),
        "marks.bulkEnter" => Some(handle_marks_bulk_enter(state, req)),
        "marks.grid" => Some(handle_marks_grid(state, req)),
        _ => None,
    }
}
