use crate::engine::{
    BoundarySource, BoundaryTable, ClassScores, EngineError, ExamRef, GradeBand, MeanSnapshot,
    RankedStudent, ScoreRow, ScoreSource, SnapshotStore, StoredSnapshot, StudentInfo,
    SubjectColumn, TotalsStore,
};
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::BTreeMap;

/// rusqlite-backed implementation of the engine's storage seams. One adapter
/// serves all four traits so a report request touches a single connection.
pub struct SqliteReportStore<'a> {
    pub conn: &'a Connection,
}

fn query_err(e: rusqlite::Error) -> EngineError {
    EngineError::new("db_query_failed", e.to_string())
}

fn insert_err(e: rusqlite::Error) -> EngineError {
    EngineError::new("db_insert_failed", e.to_string())
}

fn decode_snapshot(raw: &str, total_mean: Option<f64>) -> Result<MeanSnapshot, EngineError> {
    let subject_means: BTreeMap<String, Option<f64>> = serde_json::from_str(raw)
        .map_err(|e| EngineError::new("snapshot_decode_failed", e.to_string()))?;
    Ok(MeanSnapshot {
        subject_means,
        total_mean,
    })
}

impl ScoreSource for SqliteReportStore<'_> {
    fn class_scores(&self, exam_id: &str, class_id: &str) -> Result<ClassScores, EngineError> {
        let mut subj_stmt = self
            .conn
            .prepare("SELECT id, code, name, max_mark FROM subjects ORDER BY sort_order")
            .map_err(query_err)?;
        let subjects: Vec<SubjectColumn> = subj_stmt
            .query_map([], |r| {
                Ok(SubjectColumn {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                    max_mark: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        // Tie-break order for ranking: name, then id for full determinism.
        let mut stud_stmt = self
            .conn
            .prepare(
                "SELECT id, last_name, first_name
                 FROM students
                 WHERE class_id = ? AND active = 1
                 ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, id",
            )
            .map_err(query_err)?;
        let students: Vec<StudentInfo> = stud_stmt
            .query_map([class_id], |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(StudentInfo {
                    id: r.get(0)?,
                    display_name: format!("{}, {}", last, first),
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut score_stmt = self
            .conn
            .prepare(
                "SELECT sc.student_id, su.code, sc.mark
                 FROM scores sc
                 JOIN subjects su ON su.id = sc.subject_id
                 JOIN students st ON st.id = sc.student_id
                 WHERE sc.exam_id = ? AND st.class_id = ?",
            )
            .map_err(query_err)?;
        let scores: Vec<ScoreRow> = score_stmt
            .query_map((exam_id, class_id), |r| {
                Ok(ScoreRow {
                    student_id: r.get(0)?,
                    subject_code: r.get(1)?,
                    mark: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        Ok(ClassScores {
            subjects,
            students,
            scores,
        })
    }
}

impl BoundarySource for SqliteReportStore<'_> {
    fn boundary_table(&self, subject_codes: &[String]) -> Result<BoundaryTable, EngineError> {
        let mut table = BoundaryTable::default();
        if subject_codes.is_empty() {
            return Ok(table);
        }

        let placeholders = std::iter::repeat("?")
            .take(subject_codes.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT su.code, gb.min_mark, gb.max_mark, gb.grade_label, gb.performance_code
             FROM grade_boundaries gb
             JOIN subjects su ON su.id = gb.subject_id
             WHERE su.code IN ({})
             ORDER BY su.code, gb.min_mark",
            placeholders
        );
        let bind_values: Vec<Value> = subject_codes
            .iter()
            .map(|c| Value::Text(c.clone()))
            .collect();

        let mut stmt = self.conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |r| {
                let code: String = r.get(0)?;
                Ok((
                    code,
                    GradeBand {
                        min_mark: r.get(1)?,
                        max_mark: r.get(2)?,
                        grade_label: r.get(3)?,
                        performance_code: r.get(4)?,
                    },
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut by_code: BTreeMap<String, Vec<GradeBand>> = BTreeMap::new();
        for (code, band) in rows {
            by_code.entry(code).or_default().push(band);
        }
        for (code, bands) in by_code {
            table.set_subject_bands(&code, bands);
        }
        Ok(table)
    }
}

impl SnapshotStore for SqliteReportStore<'_> {
    fn current(&self, exam_id: &str, class_id: &str) -> Result<Option<MeanSnapshot>, EngineError> {
        let row: Option<(String, Option<f64>)> = self
            .conn
            .query_row(
                "SELECT subject_means, total_mean
                 FROM class_mean_snapshots
                 WHERE exam_id = ? AND class_id = ?",
                (exam_id, class_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(query_err)?;
        match row {
            Some((raw, total_mean)) => Ok(Some(decode_snapshot(&raw, total_mean)?)),
            None => Ok(None),
        }
    }

    fn prior(&self, exam_id: &str, class_id: &str) -> Result<Option<StoredSnapshot>, EngineError> {
        let row: Option<(String, i64, String, String, Option<f64>)> = self
            .conn
            .query_row(
                "SELECT e.id, e.seq, e.name, s.subject_means, s.total_mean
                 FROM class_mean_snapshots s
                 JOIN exams e ON e.id = s.exam_id
                 WHERE s.class_id = ?
                   AND e.seq < (SELECT seq FROM exams WHERE id = ?)
                 ORDER BY e.seq DESC
                 LIMIT 1",
                (class_id, exam_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()
            .map_err(query_err)?;
        match row {
            Some((id, seq, name, raw, total_mean)) => Ok(Some(StoredSnapshot {
                exam: ExamRef { id, seq, name },
                means: decode_snapshot(&raw, total_mean)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert(
        &self,
        exam_id: &str,
        class_id: &str,
        snapshot: &MeanSnapshot,
    ) -> Result<(), EngineError> {
        let subject_means = serde_json::to_string(&snapshot.subject_means)
            .map_err(|e| EngineError::new("snapshot_encode_failed", e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO class_mean_snapshots(exam_id, class_id, subject_means, total_mean, computed_at)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(exam_id, class_id) DO UPDATE SET
                   subject_means = excluded.subject_means,
                   total_mean = excluded.total_mean,
                   computed_at = excluded.computed_at",
                (
                    exam_id,
                    class_id,
                    &subject_means,
                    snapshot.total_mean,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(insert_err)?;
        Ok(())
    }
}

impl TotalsStore for SqliteReportStore<'_> {
    fn upsert_totals(&self, exam_id: &str, ranked: &[RankedStudent]) -> Result<(), EngineError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
        let computed_at = Utc::now().to_rfc3339();
        for row in ranked {
            tx.execute(
                "INSERT INTO student_totals(exam_id, student_id, total_mark, rank, graded_count, computed_at)
                 VALUES(?, ?, ?, ?, ?, ?)
                 ON CONFLICT(exam_id, student_id) DO UPDATE SET
                   total_mark = excluded.total_mark,
                   rank = excluded.rank,
                   graded_count = excluded.graded_count,
                   computed_at = excluded.computed_at",
                (
                    exam_id,
                    &row.student_id,
                    row.total,
                    row.rank,
                    row.graded_count as i64,
                    &computed_at,
                ),
            )
            .map_err(insert_err)?;
        }
        tx.commit()
            .map_err(|e| EngineError::new("db_tx_failed", e.to_string()))?;
        Ok(())
    }
}
