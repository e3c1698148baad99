use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultsd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            admission_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            max_mark REAL NOT NULL DEFAULT 100,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    // seq is assigned at creation and only ever grows; prior-snapshot
    // lookups order by it, never by wall-clock time.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            term INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_boundaries(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            min_mark REAL NOT NULL,
            max_mark REAL NOT NULL,
            grade_label TEXT NOT NULL,
            performance_code TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_boundaries_subject ON grade_boundaries(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            mark REAL,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_id, subject_id, student_id)
        )",
        [],
    )?;
    ensure_scores_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_exam ON scores(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id)",
        [],
    )?;

    // One row per (exam, class); the uniqueness of the key is what turns a
    // racing second report run into an update instead of a duplicate.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_mean_snapshots(
            exam_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_means TEXT NOT NULL,
            total_mean REAL,
            computed_at TEXT,
            PRIMARY KEY(exam_id, class_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_mean_snapshots_class ON class_mean_snapshots(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_totals(
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_mark REAL NOT NULL,
            rank INTEGER NOT NULL,
            graded_count INTEGER NOT NULL DEFAULT 0,
            computed_at TEXT,
            PRIMARY KEY(exam_id, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_totals_student ON student_totals(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_scores_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before mark-entry auditing lack this column.
    if table_has_column(conn, "scores", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE scores ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
