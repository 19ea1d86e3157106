use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use crate::types::{Job, JobStatus, Message};

/// Identity of a freshly created job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewJob {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// Durable record of job progress. Writers overwrite; they never merge.
pub trait JobStore: Send + Sync {
    /// Insert a job in `pending` status.
    fn create_job(&self, goal: &str, starting_url: &str) -> Result<NewJob>;
    /// `pending -> running`.
    fn mark_running(&self, id: i64) -> Result<()>;
    /// Overwrite transcript and log. Last write wins.
    fn update_job(
        &self,
        id: i64,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// `running -> success`, recording the final answer.
    fn finalize_job(
        &self,
        id: i64,
        output: &str,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// `running -> failed`. The reason is appended to the stored log.
    fn fail_job(
        &self,
        id: i64,
        reason: &str,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn get_job(&self, id: i64) -> Result<Option<Job>>;
}

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open job database {}", path.as_ref().display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                goal TEXT NOT NULL,
                starting_url TEXT NOT NULL,
                log TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                updated_at TEXT,
                failed_at TEXT,
                output TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                messages TEXT
            );"#,
        )
        .context("Failed to create jobs table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job database lock poisoned"))
    }

    /// Move `id` from `from` to `to`, rejecting anything else.
    fn advance(
        conn: &Connection,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        sql: &str,
        extra: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        if !from.can_advance_to(to) {
            bail!("illegal job status transition {from:?} -> {to:?}");
        }
        let (from_str, to_str) = (from.as_db_str(), to.as_db_str());
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&id, &from_str, &to_str];
        args.extend_from_slice(extra);
        let changed = conn.execute(sql, args.as_slice())?;
        if changed == 0 {
            let current: Option<String> = conn
                .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            match current {
                None => bail!("job {id} does not exist"),
                Some(status) => bail!(
                    "job {id} is {status}, cannot move from {} to {}",
                    from.as_db_str(),
                    to.as_db_str()
                ),
            }
        }
        Ok(())
    }
}

fn encode_transcript(transcript: &[Message]) -> Result<String> {
    serde_json::to_string(transcript).context("Failed to serialize transcript")
}

fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Bad timestamp in jobs table: {s}"))
    })
    .transpose()
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, goal: &str, starting_url: &str) -> Result<NewJob> {
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (goal, starting_url, created_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                goal,
                starting_url,
                created_at.to_rfc3339(),
                JobStatus::Pending.as_db_str()
            ],
        )
        .context("Failed to insert job")?;
        Ok(NewJob {
            id: conn.last_insert_rowid(),
            created_at,
        })
    }

    fn mark_running(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        Self::advance(
            &conn,
            id,
            JobStatus::Pending,
            JobStatus::Running,
            "UPDATE jobs SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![Utc::now().to_rfc3339()],
        )
    }

    fn update_job(
        &self,
        id: i64,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let messages = encode_transcript(transcript)?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET messages = ?2, log = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, messages, log.join("\n"), at.to_rfc3339()],
            )
            .context("Failed to checkpoint job")?;
        if changed == 0 {
            bail!("job {id} does not exist");
        }
        Ok(())
    }

    fn finalize_job(
        &self,
        id: i64,
        output: &str,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let messages = encode_transcript(transcript)?;
        let log = log.join("\n");
        let at = at.to_rfc3339();
        let conn = self.conn()?;
        Self::advance(
            &conn,
            id,
            JobStatus::Running,
            JobStatus::Success,
            "UPDATE jobs SET status = ?3, output = ?4, messages = ?5, log = ?6, \
             completed_at = ?7, updated_at = ?7 WHERE id = ?1 AND status = ?2",
            params![output, messages, log, at],
        )
    }

    fn fail_job(
        &self,
        id: i64,
        reason: &str,
        transcript: &[Message],
        log: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let messages = encode_transcript(transcript)?;
        let mut lines = log.to_vec();
        lines.push(format!("Failed: {reason}"));
        let log = lines.join("\n");
        let at = at.to_rfc3339();
        let conn = self.conn()?;
        Self::advance(
            &conn,
            id,
            JobStatus::Running,
            JobStatus::Failed,
            "UPDATE jobs SET status = ?3, messages = ?4, log = ?5, \
             failed_at = ?6, updated_at = ?6 WHERE id = ?1 AND status = ?2",
            params![messages, log, at],
        )
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, goal, starting_url, log, created_at, completed_at, updated_at, \
                 failed_at, output, status, messages FROM jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            goal,
            starting_url,
            log,
            created_at,
            completed_at,
            updated_at,
            failed_at,
            output,
            status,
            messages,
        )) = row
        else {
            return Ok(None);
        };

        let transcript = match messages {
            Some(raw) => serde_json::from_str(&raw).context("Failed to parse stored transcript")?,
            None => Vec::new(),
        };

        Ok(Some(Job {
            id,
            goal,
            starting_url,
            status: JobStatus::from_db(&status)
                .ok_or_else(|| anyhow!("Unknown job status '{status}'"))?,
            transcript,
            log: log
                .map(|l| l.lines().map(String::from).collect())
                .unwrap_or_default(),
            created_at: parse_ts(Some(created_at))?
                .ok_or_else(|| anyhow!("job {id} has no created_at"))?,
            updated_at: parse_ts(updated_at)?,
            completed_at: parse_ts(completed_at)?,
            failed_at: parse_ts(failed_at)?,
            output,
        }))
    }
}
