use crate::engine::{
    self, BoundarySource, ClassRef, EngineError, ExamRef, ReportOptions, SnapshotStore,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteReportStore;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn engine_err(req: &Request, e: EngineError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details.map(|d| json!(d)))
}

fn parse_options(req: &Request) -> Result<ReportOptions, serde_json::Value> {
    match req.params.get("options") {
        None => Ok(ReportOptions::default()),
        Some(v) if v.is_null() => Ok(ReportOptions::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            err(
                &req.id,
                "bad_params",
                format!("options could not be parsed: {}", e),
                None,
            )
        }),
    }
}

fn load_exam(
    conn: &Connection,
    req: &Request,
    exam_id: &str,
) -> Result<ExamRef, serde_json::Value> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, name FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((seq, name)) = row else {
        return Err(err(&req.id, "not_found", "exam not found", None));
    };
    Ok(ExamRef {
        id: exam_id.to_string(),
        seq,
        name,
    })
}

fn load_class(
    conn: &Connection,
    req: &Request,
    class_id: &str,
) -> Result<ClassRef, serde_json::Value> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some(name) = name else {
        return Err(err(&req.id, "not_found", "class not found", None));
    };
    Ok(ClassRef {
        id: class_id.to_string(),
        name,
    })
}

fn handle_class_performance_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let options = match parse_options(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match load_exam(conn, req, &exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match load_class(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let store = SqliteReportStore { conn };
    match engine::assemble_report(&store, &store, &store, &store, exam, class, &options) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => engine_err(req, e),
    }
}

fn handle_student_profile_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match load_exam(conn, req, &exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_row: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT class_id, last_name, first_name FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, last_name, first_name)) = student_row else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // The rank comes from the persisted totals row, not a fresh ranking run;
    // absence just means no report has been computed for this exam yet.
    let persisted: Option<(f64, i64, i64)> = match conn
        .query_row(
            "SELECT total_mark, rank, graded_count
             FROM student_totals
             WHERE exam_id = ? AND student_id = ?",
            (&exam_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut subj_stmt = match conn.prepare(
        "SELECT su.code, sc.mark
         FROM subjects su
         LEFT JOIN scores sc
           ON sc.subject_id = su.id AND sc.exam_id = ? AND sc.student_id = ?
         ORDER BY su.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let marks: Vec<(String, Option<f64>)> = match subj_stmt
        .query_map((&exam_id, &student_id), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let store = SqliteReportStore { conn };
    let codes: Vec<String> = marks.iter().map(|(code, _)| code.clone()).collect();
    let boundary_table = match store.boundary_table(&codes) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };
    let cells: Vec<serde_json::Value> = marks
        .iter()
        .map(|(code, mark)| {
            let band = boundary_table.classify(code, *mark);
            json!({
                "subjectCode": code,
                "mark": mark,
                "grade": band.grade(),
                "level": band.level()
            })
        })
        .collect();

    let class_means = match store.current(&exam_id, &class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "exam": exam,
            "student": {
                "id": student_id,
                "classId": class_id,
                "displayName": format!("{}, {}", last_name, first_name)
            },
            "cells": cells,
            "total": persisted.map(|(total, _, _)| total),
            "rank": persisted.map(|(_, rank, _)| rank),
            "gradedCount": persisted.map(|(_, _, graded)| graded),
            "classMeans": class_means.map(|m| json!({
                "subjectMeans": m.subject_means,
                "totalMean": m.total_mean
            }))
        }),
    )
}

fn handle_class_mean_trend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match load_class(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.seq, e.name, s.subject_means, s.total_mean, s.computed_at
         FROM class_mean_snapshots s
         JOIN exams e ON e.id = s.exam_id
         WHERE s.class_id = ?
         ORDER BY e.seq",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Vec<(String, i64, String, String, Option<f64>, Option<String>)> = match stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut points = Vec::with_capacity(rows.len());
    for (exam_id, seq, name, raw_means, total_mean, computed_at) in rows {
        let subject_means: BTreeMap<String, Option<f64>> = match serde_json::from_str(&raw_means) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "snapshot_decode_failed", e.to_string(), None),
        };
        points.push(json!({
            "examId": exam_id,
            "seq": seq,
            "examName": name,
            "subjectMeans": subject_means,
            "totalMean": total_mean,
            "computedAt": computed_at
        }));
    }

    ok(&req.id, json!({ "class": class, "points": points }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classPerformanceModel" => Some(handle_class_performance_model(state, req)),
        "reports.studentProfileModel" => Some(handle_student_profile_model(state, req)),
        "reports.classMeanTrend" => Some(handle_class_mean_trend(state, req)),
        _ => None,
    }
}
