use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Display sentinel for a cell or row slot with no underlying mark.
pub const NO_DATA: &str = "-";
/// Display sentinel for a mark that falls outside every configured band.
pub const UNCLASSIFIED: &str = "N/A";

/// 2-decimal rounding used for every mean and deviation the engine emits.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One raw result: a student's mark in one subject for the exam under
/// report. `mark: None` means "not yet graded" and is excluded from every
/// mean and total without error.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub student_id: String,
    pub subject_code: String,
    pub mark: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_mark: f64,
    pub max_mark: f64,
    pub grade_label: String,
    pub performance_code: String,
}

/// Rejects malformed band sets before they reach storage: each interval must
/// have min <= max, and intervals for one subject must not overlap.
pub fn validate_bands(bands: &[GradeBand]) -> Result<(), EngineError> {
    let mut sorted: Vec<&GradeBand> = bands.iter().collect();
    sorted.sort_by(|a, b| a.min_mark.partial_cmp(&b.min_mark).unwrap_or(Ordering::Equal));
    let mut prev_max: Option<f64> = None;
    for band in sorted {
        if band.min_mark < 0.0 {
            return Err(EngineError::new("bad_params", "band minMark must be >= 0"));
        }
        if band.max_mark < band.min_mark {
            return Err(EngineError::new(
                "bad_params",
                format!(
                    "band {} has maxMark {} below minMark {}",
                    band.grade_label, band.max_mark, band.min_mark
                ),
            ));
        }
        if let Some(prev) = prev_max {
            // Bands are inclusive both ends, so touching endpoints collide too.
            if band.min_mark <= prev {
                return Err(EngineError::new(
                    "bad_params",
                    format!("band {} overlaps the previous band", band.grade_label),
                ));
            }
        }
        prev_max = Some(band.max_mark);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    NoMark,
    Unclassified,
    Band { grade: String, level: String },
}

impl Classification {
    pub fn grade(&self) -> &str {
        match self {
            Classification::NoMark => NO_DATA,
            Classification::Unclassified => UNCLASSIFIED,
            Classification::Band { grade, .. } => grade,
        }
    }

    pub fn level(&self) -> &str {
        match self {
            Classification::NoMark => NO_DATA,
            Classification::Unclassified => UNCLASSIFIED,
            Classification::Band { level, .. } => level,
        }
    }
}

/// Per-subject grade bands, each set held ascending by `min_mark`.
#[derive(Debug, Clone, Default)]
pub struct BoundaryTable {
    bands: BTreeMap<String, Vec<GradeBand>>,
}

impl BoundaryTable {
    pub fn set_subject_bands(&mut self, subject_code: &str, mut bands: Vec<GradeBand>) {
        bands.sort_by(|a, b| a.min_mark.partial_cmp(&b.min_mark).unwrap_or(Ordering::Equal));
        self.bands.insert(subject_code.to_string(), bands);
    }

    /// Interval lookup, inclusive both ends. Band sets are small (<= ~10
    /// entries), so a linear scan over the sorted set is enough. A mark no
    /// band covers is a configuration gap, not a failure: it classifies as
    /// `Unclassified` and the report goes on.
    pub fn classify(&self, subject_code: &str, mark: Option<f64>) -> Classification {
        let Some(mark) = mark else {
            return Classification::NoMark;
        };
        if let Some(bands) = self.bands.get(subject_code) {
            for band in bands {
                if mark >= band.min_mark && mark <= band.max_mark {
                    return Classification::Band {
                        grade: band.grade_label.clone(),
                        level: band.performance_code.clone(),
                    };
                }
            }
        }
        tracing::warn!(
            subject = %subject_code,
            mark,
            "mark outside every configured grade boundary"
        );
        Classification::Unclassified
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubjectAggregate {
    pub total: f64,
    pub count: usize,
}

impl SubjectAggregate {
    pub fn mean(&self) -> Option<f64> {
        if self.count > 0 {
            Some(round2(self.total / self.count as f64))
        } else {
            None
        }
    }
}

/// Sums and counts non-null marks per subject. Ungraded entries never enter
/// the denominator, so an entirely ungraded subject reports no mean rather
/// than dividing by zero.
pub fn aggregate_subjects(scores: &[ScoreRow]) -> BTreeMap<String, SubjectAggregate> {
    let mut by_subject: BTreeMap<String, SubjectAggregate> = BTreeMap::new();
    for row in scores {
        let Some(mark) = row.mark else {
            continue;
        };
        let agg = by_subject.entry(row.subject_code.clone()).or_default();
        agg.total += mark;
        agg.count += 1;
    }
    by_subject
}

#[derive(Debug, Clone)]
pub struct StudentTotalRow {
    pub student_id: String,
    pub total: f64,
    pub graded_count: usize,
}

/// Per-student totals over whatever marks exist. A student missing some
/// subjects still totals (and ranks on) the marks that are present. Output
/// preserves the order of `student_ids`.
pub fn student_totals(student_ids: &[String], scores: &[ScoreRow]) -> Vec<StudentTotalRow> {
    let mut sums: HashMap<&str, (f64, usize)> = HashMap::new();
    for row in scores {
        let Some(mark) = row.mark else {
            continue;
        };
        let entry = sums.entry(row.student_id.as_str()).or_insert((0.0, 0));
        entry.0 += mark;
        entry.1 += 1;
    }
    student_ids
        .iter()
        .map(|id| {
            let (total, graded_count) = sums.get(id.as_str()).copied().unwrap_or((0.0, 0));
            StudentTotalRow {
                student_id: id.clone(),
                total,
                graded_count,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RankedStudent {
    pub student_id: String,
    pub total: f64,
    pub graded_count: usize,
    pub rank: i64,
}

/// Positional dense ranking: descending by total, rank = 1-based position.
/// Ties do NOT share a rank; the stable sort keeps equal totals in input
/// order, so callers must pass rows already in the documented tie-break
/// order (last name, first name, student id).
pub fn rank_students(rows: Vec<StudentTotalRow>) -> Vec<RankedStudent> {
    let mut rows = rows;
    rows.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(Ordering::Equal));
    rows.into_iter()
        .enumerate()
        .map(|(i, r)| RankedStudent {
            student_id: r.student_id,
            total: r.total,
            graded_count: r.graded_count,
            rank: (i + 1) as i64,
        })
        .collect()
}

/// The persisted per-(exam, class) aggregate: one mean slot per subject code
/// plus the class total mean. `None` slots mean "no graded data".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanSnapshot {
    pub subject_means: BTreeMap<String, Option<f64>>,
    pub total_mean: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportOptions {
    /// Whether a student whose graded marks total exactly 0 contributes to
    /// the class total mean. The source behavior treats a 0 total as "no
    /// data" and leaves such students out; flipping this only excludes
    /// students with no graded marks at all.
    pub count_zero_total_in_mean: bool,
}

pub fn class_means(
    subject_codes: &[String],
    aggregates: &BTreeMap<String, SubjectAggregate>,
    totals: &[StudentTotalRow],
    options: &ReportOptions,
) -> MeanSnapshot {
    let mut subject_means = BTreeMap::new();
    for code in subject_codes {
        let mean = aggregates.get(code).and_then(|a| a.mean());
        subject_means.insert(code.clone(), mean);
    }

    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for row in totals {
        if row.graded_count == 0 {
            continue;
        }
        if !options.count_zero_total_in_mean && row.total == 0.0 {
            continue;
        }
        sum += row.total;
        count += 1;
    }
    let total_mean = if count > 0 {
        Some(round2(sum / count as f64))
    } else {
        None
    };

    MeanSnapshot {
        subject_means,
        total_mean,
    }
}

#[derive(Debug, Clone)]
pub struct DeviationReport {
    pub per_subject: Vec<Option<f64>>,
    pub total: Option<f64>,
}

/// Signed current-minus-prior deltas, rounded to 2 decimals. A delta exists
/// only where both snapshots carry a numeric mean; everything else (missing
/// prior, subject ungraded on either side) is `None` and renders as `"-"`.
pub fn deviations(
    subject_codes: &[String],
    current: &MeanSnapshot,
    prior: Option<&MeanSnapshot>,
) -> DeviationReport {
    let per_subject = subject_codes
        .iter()
        .map(|code| {
            let cur = current.subject_means.get(code).copied().flatten()?;
            let prev = prior?.subject_means.get(code).copied().flatten()?;
            Some(round2(cur - prev))
        })
        .collect();
    let total = match (current.total_mean, prior.and_then(|p| p.total_mean)) {
        (Some(cur), Some(prev)) => Some(round2(cur - prev)),
        _ => None,
    };
    DeviationReport { per_subject, total }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRef {
    pub id: String,
    pub seq: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectColumn {
    pub id: String,
    pub code: String,
    pub name: String,
    pub max_mark: f64,
}

#[derive(Debug, Clone)]
pub struct StudentInfo {
    pub id: String,
    pub display_name: String,
}

/// Everything the engine reads for one (exam, class) report. Students arrive
/// in tie-break order; subjects in registry order.
#[derive(Debug, Clone)]
pub struct ClassScores {
    pub subjects: Vec<SubjectColumn>,
    pub students: Vec<StudentInfo>,
    pub scores: Vec<ScoreRow>,
}

pub trait ScoreSource {
    fn class_scores(&self, exam_id: &str, class_id: &str) -> Result<ClassScores, EngineError>;
}

pub trait BoundarySource {
    fn boundary_table(&self, subject_codes: &[String]) -> Result<BoundaryTable, EngineError>;
}

/// Stored snapshot together with the exam it belongs to.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub exam: ExamRef,
    pub means: MeanSnapshot,
}

pub trait SnapshotStore {
    fn current(&self, exam_id: &str, class_id: &str) -> Result<Option<MeanSnapshot>, EngineError>;
    /// The snapshot of the exam with the largest seq strictly below the
    /// given exam's, scoped to the same class. Absence is a normal outcome
    /// for a class's first exam.
    fn prior(&self, exam_id: &str, class_id: &str) -> Result<Option<StoredSnapshot>, EngineError>;
    fn upsert(
        &self,
        exam_id: &str,
        class_id: &str,
        snapshot: &MeanSnapshot,
    ) -> Result<(), EngineError>;
}

pub trait TotalsStore {
    fn upsert_totals(&self, exam_id: &str, ranked: &[RankedStudent]) -> Result<(), EngineError>;
}

fn ser_slot<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(n) => s.serialize_f64(*n),
        None => s.serialize_str(NO_DATA),
    }
}

fn ser_slots<S: Serializer>(row: &[Option<f64>], s: S) -> Result<S::Ok, S::Error> {
    let mut seq = s.serialize_seq(Some(row.len()))?;
    for v in row {
        match v {
            Some(n) => seq.serialize_element(n)?,
            None => seq.serialize_element(NO_DATA)?,
        }
    }
    seq.end()
}

/// One summary line under the student rows: slots aligned with the report's
/// subject order plus a class-total slot. Empty slots serialize as `"-"`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    #[serde(serialize_with = "ser_slots")]
    pub per_subject: Vec<Option<f64>>,
    #[serde(serialize_with = "ser_slot")]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkCell {
    pub subject_code: String,
    pub mark: Option<f64>,
    pub grade: String,
    pub level: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReportRow {
    pub student_id: String,
    pub display_name: String,
    pub rank: i64,
    pub total: f64,
    pub graded_count: i64,
    pub cells: Vec<MarkCell>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportModel {
    pub class: ClassRef,
    pub exam: ExamRef,
    pub options: ReportOptions,
    pub subjects: Vec<SubjectColumn>,
    pub students: Vec<StudentReportRow>,
    pub means: SummaryRow,
    pub previous_means: SummaryRow,
    pub deviations: SummaryRow,
    pub prior_exam: Option<ExamRef>,
}

/// Full report pipeline for one (exam, class): aggregate, rank, classify,
/// persist the fresh snapshot and totals, then compare against the nearest
/// prior snapshot. Reads are deterministic in the inputs; the two writes are
/// true upserts, so rerunning over unchanged scores reproduces identical
/// stored state.
pub fn assemble_report(
    source: &dyn ScoreSource,
    boundaries: &dyn BoundarySource,
    snapshots: &dyn SnapshotStore,
    totals_store: &dyn TotalsStore,
    exam: ExamRef,
    class: ClassRef,
    options: &ReportOptions,
) -> Result<ReportModel, EngineError> {
    let ClassScores {
        subjects,
        students,
        scores,
    } = source.class_scores(&exam.id, &class.id)?;

    let subject_codes: Vec<String> = subjects.iter().map(|s| s.code.clone()).collect();
    let boundary_table = boundaries.boundary_table(&subject_codes)?;

    let aggregates = aggregate_subjects(&scores);
    let student_ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let totals = student_totals(&student_ids, &scores);
    let current = class_means(&subject_codes, &aggregates, &totals, options);
    let ranked = rank_students(totals);

    snapshots.upsert(&exam.id, &class.id, &current)?;
    totals_store.upsert_totals(&exam.id, &ranked)?;

    let prior = snapshots.prior(&exam.id, &class.id)?;
    let deviation = deviations(&subject_codes, &current, prior.as_ref().map(|p| &p.means));

    let mut mark_by_cell: HashMap<(&str, &str), Option<f64>> = HashMap::new();
    for row in &scores {
        mark_by_cell.insert((row.student_id.as_str(), row.subject_code.as_str()), row.mark);
    }
    let name_by_id: HashMap<&str, &str> = students
        .iter()
        .map(|s| (s.id.as_str(), s.display_name.as_str()))
        .collect();

    let student_rows = ranked
        .iter()
        .map(|r| {
            let cells = subject_codes
                .iter()
                .map(|code| {
                    let mark = mark_by_cell
                        .get(&(r.student_id.as_str(), code.as_str()))
                        .copied()
                        .flatten();
                    let band = boundary_table.classify(code, mark);
                    MarkCell {
                        subject_code: code.clone(),
                        mark,
                        grade: band.grade().to_string(),
                        level: band.level().to_string(),
                    }
                })
                .collect();
            StudentReportRow {
                student_id: r.student_id.clone(),
                display_name: name_by_id
                    .get(r.student_id.as_str())
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                rank: r.rank,
                total: r.total,
                graded_count: r.graded_count as i64,
                cells,
            }
        })
        .collect();

    let means_row = SummaryRow {
        per_subject: subject_codes
            .iter()
            .map(|c| current.subject_means.get(c).copied().flatten())
            .collect(),
        total: current.total_mean,
    };
    let previous_means = SummaryRow {
        per_subject: subject_codes
            .iter()
            .map(|c| {
                prior
                    .as_ref()
                    .and_then(|p| p.means.subject_means.get(c).copied().flatten())
            })
            .collect(),
        total: prior.as_ref().and_then(|p| p.means.total_mean),
    };
    let deviations_row = SummaryRow {
        per_subject: deviation.per_subject,
        total: deviation.total,
    };

    Ok(ReportModel {
        class,
        exam,
        options: *options,
        subjects,
        students: student_rows,
        means: means_row,
        previous_means,
        deviations: deviations_row,
        prior_exam: prior.map(|p| p.exam),
    })
}
