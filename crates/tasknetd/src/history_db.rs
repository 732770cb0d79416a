//! SQLite mirror of the message history and of arbiter submissions.
//!
//! Every record the in-memory history accepts is written here as JSON, so a
//! restarted node can still answer a replayed report with the exact
//! acknowledgement it sent before.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::params;

use tasknet_services::escalation::Submission;
use tasknet_services::history::{HistoryError, HistoryRecord, HistorySink};
use tasknet_services::MessageHistory;

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS history (
    seq         INTEGER PRIMARY KEY,
    class       TEXT    NOT NULL,
    node_id     TEXT    NOT NULL,
    task_id     TEXT    NOT NULL,
    subtask_id  TEXT,
    direction   TEXT    NOT NULL,
    record      TEXT    NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS history_subtask ON history (subtask_id);
CREATE TABLE IF NOT EXISTS submissions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    submission   INTEGER NOT NULL,
    subtask_id   TEXT    NOT NULL,
    class        TEXT    NOT NULL,
    attempt      INTEGER NOT NULL,
    message      TEXT    NOT NULL,
    submitted_at INTEGER NOT NULL
);
";

pub struct HistoryDb {
    conn: Mutex<rusqlite::Connection>,
}

impl HistoryDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("failed to open history database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to apply history schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, HistoryError> {
        self.conn
            .lock()
            .map_err(|_| HistoryError::Sink("history database lock poisoned".into()))
    }

    /// Load every stored record into `history`, oldest first. Rows that no
    /// longer parse are skipped with a warning.
    pub fn load_into(&self, history: &MessageHistory) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT seq, record FROM history ORDER BY seq")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut loaded = 0;
        for row in rows {
            let (seq, text) = row?;
            let record: HistoryRecord = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(seq, error = %e, "skipping unreadable history row");
                    continue;
                }
            };
            match history.restore(record) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(seq, error = %e, "skipping history row"),
            }
        }
        Ok(loaded)
    }

    pub fn record_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        let message = serde_json::to_string(&submission.message)?;
        self.lock()?.execute(
            "INSERT INTO submissions (submission, subtask_id, class, attempt, message, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                submission.id as i64,
                submission.subtask_id,
                submission.class.name(),
                submission.attempt,
                message,
                tasknet_core::task::now_secs() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn submission_count(&self) -> anyhow::Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM submissions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl HistorySink for HistoryDb {
    fn persist(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let text = serde_json::to_string(record).map_err(|e| HistoryError::Sink(e.to_string()))?;
        let direction = match record.direction {
            tasknet_services::history::Direction::Sent => "sent",
            tasknet_services::history::Direction::Received => "received",
        };
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO history
                 (seq, class, node_id, task_id, subtask_id, direction, record, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.seq as i64,
                    record.class.name(),
                    record.node_id,
                    record.task_id,
                    record.subtask_id,
                    direction,
                    text,
                    record.recorded_at as i64,
                ],
            )
            .map_err(|e| HistoryError::Sink(e.to_string()))?;
        Ok(())
    }
}
