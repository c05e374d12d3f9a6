//! Job run repository methods (§4.5).

use super::Store;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    fn as_sql(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
    fn from_sql(s: &str) -> Result<Self, AppError> {
        Ok(match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            other => return Err(AppError::Database(format!("bad job state '{other}'"))),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobRun {
    pub id: Uuid,
    pub name: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub last_error: Option<String>,
}

impl Store {
    pub async fn create_job_run(&self, name: &str) -> Result<JobRun, AppError> {
        let run = JobRun {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state: JobState::Queued,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            last_error: None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_runs (id,name,state,started_at,ended_at,result,last_error)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                run.id.to_string(),
                run.name,
                run.state.as_sql(),
                run.started_at.to_rfc3339(),
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
            ],
        )?;
        Ok(run)
    }

    pub async fn update_job_run(
        &self,
        id: Uuid,
        state: JobState,
        result: Option<String>,
        last_error: Option<String>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock().await;
        let ended_at = if matches!(
            state,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        ) {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        conn.execute(
            "UPDATE job_runs SET state=?1, ended_at=COALESCE(?2, ended_at), result=?3, last_error=?4
             WHERE id=?5",
            params![state.as_sql(), ended_at, result, last_error, id.to_string()],
        )?;
        Ok(())
    }

    pub async fn get_job_run(&self, id: Uuid) -> Result<Option<JobRun>, AppError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id,name,state,started_at,ended_at,result,last_error FROM job_runs WHERE id=?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?
        .map(|(id, name, state, started, ended, result, err)| {
            Ok(JobRun {
                id: Uuid::parse_str(&id).map_err(|e| AppError::Database(e.to_string()))?,
                name,
                state: JobState::from_sql(&state)?,
                started_at: DateTime::parse_from_rfc3339(&started)
                    .map_err(|e| AppError::Database(e.to_string()))?
                    .with_timezone(&Utc),
                ended_at: ended
                    .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                    .transpose()
                    .map_err(|e| AppError::Database(e.to_string()))?,
                result,
                last_error: err,
            })
        })
        .transpose()
    }

    /// Drops job rows whose retention window (>= 24h, §4.5) has elapsed.
    pub async fn sweep_expired_job_runs(&self) -> Result<usize, AppError> {
        let cutoff = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "DELETE FROM job_runs WHERE started_at < ?1",
            params![cutoff],
        )?;
        Ok(count)
    }
}
