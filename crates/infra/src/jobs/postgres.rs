//! Postgres-backed job store.
//!
//! Works against the shared schema:
//!
//! - `processing_jobs(id, job_type, status, audiobook_id, created_at, started_at, completed_at, error_message)`
//! - `audiobooks(id, file_path, language)`
//! - `transcripts(id, audiobook_id UNIQUE, content, segments, language, confidence_score, processing_time_seconds, created_at)`
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Connect / ping failure in `open` | `Connectivity` |
//! | Database, Io, PoolTimedOut, PoolClosed, other | `Persistence { operation, .. }` |
//! | Row decode failure | `Persistence { operation, .. }` |
//! | Guarded update matched no row and the job is absent | `NotFound` |
//! | Guarded terminal update matched no row, job exists | `Domain(InvalidTransition)` |
//!
//! ## Runtime
//!
//! The worker loop is synchronous. The store owns a single-threaded Tokio
//! runtime and drives each query with `block_on`, so callers never need to be
//! inside a runtime themselves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{Span, debug, instrument, warn};

use transcriber_core::{
    DomainError, Job, JobId, JobKind, JobStatus, LanguageHint, Segment, SourceMedia, SourceMediaId,
    TerminalOutcome, TranscriptId, TranscriptResult,
};

use super::store::{ClaimOutcome, JobStore, JobStoreError, PendingJob, ensure_result_matches};

const MAX_CONNECTIONS: u32 = 2;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Postgres job store.
///
/// Every write is a single guarded statement inside its own transaction.
#[derive(Debug)]
pub struct PostgresJobStore {
    runtime: Runtime,
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connect and verify the database answers.
    pub fn open(database_url: &str) -> Result<Self, JobStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::Connectivity(format!("failed to start runtime: {e}")))?;

        let pool = runtime.block_on(async {
            let pool = PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .acquire_timeout(ACQUIRE_TIMEOUT)
                .connect(database_url)
                .await
                .map_err(|e| JobStoreError::Connectivity(e.to_string()))?;
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| JobStoreError::Connectivity(e.to_string()))?;
            Ok::<_, JobStoreError>(pool)
        })?;

        debug!(max_connections = MAX_CONNECTIONS, "connected to postgres");
        Ok(Self { runtime, pool })
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub fn close(self) {
        self.runtime.block_on(self.pool.close());
    }

    /// Load one job (inspection and tests).
    pub fn job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.runtime.block_on(self.load_job(job_id))
    }

    /// Load the transcript of a media asset (inspection and tests).
    pub fn transcript_for(
        &self,
        media_id: SourceMediaId,
    ) -> Result<Option<TranscriptResult>, JobStoreError> {
        self.runtime.block_on(self.load_transcript(media_id))
    }

    #[instrument(skip(self), fields(operation = "fetch_pending", job_count), err)]
    async fn fetch_pending_jobs(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT
                pj.id,
                pj.job_type,
                pj.status,
                pj.audiobook_id,
                pj.created_at,
                pj.started_at,
                pj.completed_at,
                pj.error_message,
                ab.file_path,
                ab.language
            FROM processing_jobs pj
            JOIN audiobooks ab ON pj.audiobook_id = ab.id
            WHERE pj.job_type = $1
              AND pj.status = $2
            ORDER BY pj.created_at ASC, pj.id ASC
            LIMIT $3
            "#,
        )
        .bind(JobKind::Transcribe.as_str())
        .bind(JobStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let row = PendingJobRow::from_row(&row).map_err(|e| map_sqlx_error("fetch_pending", e))?;
            pending.push(row.into_pending()?);
        }

        Span::current().record("job_count", pending.len());
        Ok(pending)
    }

    #[instrument(skip(self), fields(operation = "mark_running", job_id = %job_id), err)]
    async fn claim_job(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = $2, started_at = GREATEST(NOW(), created_at)
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(JobStatus::Running.as_str())
        .bind(JobStatus::Pending.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?
        .rows_affected();

        let outcome = if updated == 1 {
            ClaimOutcome::Claimed
        } else {
            match current_status(&mut tx, job_id).await? {
                Some(_) => ClaimOutcome::AlreadyClaimed,
                None => return Err(JobStoreError::NotFound(job_id)),
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(
        skip(self, outcome),
        fields(operation = "mark_terminal", job_id = %job_id, status = %outcome.status()),
        err
    )]
    async fn finish_job(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError> {
        let next = outcome.status();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = $2,
                completed_at = GREATEST(NOW(), COALESCE(started_at, created_at)),
                error_message = $3
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(next.as_str())
        .bind(outcome.error_message())
        .bind(JobStatus::Running.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_terminal", e))?
        .rows_affected();

        if updated != 1 {
            let current = current_status(&mut tx, job_id).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match current {
                Some(from) => DomainError::invalid_transition(from, next).into(),
                None => JobStoreError::NotFound(job_id),
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, result),
        fields(operation = "upsert_result", media_id = %media_id, segments = result.segments.len()),
        err
    )]
    async fn store_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError> {
        ensure_result_matches(media_id, result)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO transcripts (
                id,
                audiobook_id,
                content,
                segments,
                language,
                confidence_score,
                processing_time_seconds,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (audiobook_id) DO UPDATE SET
                content = EXCLUDED.content,
                segments = EXCLUDED.segments,
                language = EXCLUDED.language,
                confidence_score = EXCLUDED.confidence_score,
                processing_time_seconds = EXCLUDED.processing_time_seconds
            "#,
        )
        .bind(result.id.as_uuid())
        .bind(media_id.as_uuid())
        .bind(&result.content)
        .bind(Json(&result.segments))
        .bind(&result.language)
        .bind(result.confidence)
        .bind(result.processing_time_seconds())
        .bind(result.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_result", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_type, status, audiobook_id, created_at, started_at, completed_at, error_message
            FROM processing_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|row| {
            JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("load_job", e))?
                .into_job()
        })
        .transpose()
    }

    async fn load_transcript(
        &self,
        media_id: SourceMediaId,
    ) -> Result<Option<TranscriptResult>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, audiobook_id, content, segments, language, confidence_score,
                   processing_time_seconds, created_at
            FROM transcripts
            WHERE audiobook_id = $1
            "#,
        )
        .bind(media_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_transcript", e))?;

        row.map(|row| {
            TranscriptRow::from_row(&row)
                .map(TranscriptResult::from)
                .map_err(|e| map_sqlx_error("load_transcript", e))
        })
        .transpose()
    }
}

impl JobStore for PostgresJobStore {
    fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError> {
        self.runtime.block_on(self.fetch_pending_jobs(limit))
    }

    fn mark_running(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        self.runtime.block_on(self.claim_job(job_id))
    }

    fn mark_terminal(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.finish_job(job_id, outcome))
    }

    fn upsert_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.store_result(media_id, result))
    }
}

/// Current status of a job, `None` if the row does not exist.
async fn current_status(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<Option<JobStatus>, JobStoreError> {
    let row = sqlx::query("SELECT status FROM processing_jobs WHERE id = $1")
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_status", e))?;

    match row {
        Some(row) => {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("load_status", e))?;
            Ok(Some(status.parse()?))
        }
        None => Ok(None),
    }
}

/// Map SQLx errors to `JobStoreError`, tagged with the failing operation.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> JobStoreError {
    let message = match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error {}: {}", code, db_err.message()),
            None => format!("database error: {}", db_err.message()),
        },
        sqlx::Error::PoolTimedOut => "timed out waiting for a connection".to_string(),
        sqlx::Error::PoolClosed => "connection pool was closed".to_string(),
        sqlx::Error::ColumnDecode { index, source } => {
            format!("failed to decode column {index}: {source}")
        }
        other => other.to_string(),
    };
    JobStoreError::persistence(operation, message)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    status: String,
    audiobook_id: uuid::Uuid,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            audiobook_id: row.try_get("audiobook_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl JobRow {
    fn into_job(self) -> Result<Job, JobStoreError> {
        Ok(Job {
            id: JobId::from_uuid(self.id),
            kind: self.job_type.parse()?,
            media_id: SourceMediaId::from_uuid(self.audiobook_id),
            status: self.status.parse()?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug)]
struct PendingJobRow {
    job: JobRow,
    file_path: String,
    language: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for PendingJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PendingJobRow {
            job: JobRow::from_row(row)?,
            file_path: row.try_get("file_path")?,
            language: row.try_get("language")?,
        })
    }
}

impl PendingJobRow {
    fn into_pending(self) -> Result<PendingJob, JobStoreError> {
        let job = self.job.into_job()?;
        let language = self.language.and_then(|raw| match raw.parse::<LanguageHint>() {
            Ok(hint) => Some(hint),
            Err(e) => {
                warn!(media_id = %job.media_id, language = %raw, error = %e, "ignoring media language");
                None
            }
        });
        let media = SourceMedia {
            id: job.media_id,
            location: self.file_path,
            language,
        };
        Ok(PendingJob { job, media })
    }
}

#[derive(Debug)]
struct TranscriptRow {
    id: uuid::Uuid,
    audiobook_id: uuid::Uuid,
    content: String,
    segments: Option<Json<Vec<Segment>>>,
    language: Option<String>,
    confidence_score: Option<f64>,
    processing_time_seconds: Option<i32>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TranscriptRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TranscriptRow {
            id: row.try_get("id")?,
            audiobook_id: row.try_get("audiobook_id")?,
            content: row.try_get("content")?,
            segments: row.try_get("segments")?,
            language: row.try_get("language")?,
            confidence_score: row.try_get("confidence_score")?,
            processing_time_seconds: row.try_get("processing_time_seconds")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<TranscriptRow> for TranscriptResult {
    fn from(row: TranscriptRow) -> Self {
        TranscriptResult {
            id: TranscriptId::from_uuid(row.id),
            media_id: SourceMediaId::from_uuid(row.audiobook_id),
            content: row.content,
            segments: row.segments.map(|Json(s)| s).unwrap_or_default(),
            language: row.language.unwrap_or_default(),
            confidence: row.confidence_score.unwrap_or_default(),
            processing_time: Duration::from_secs(
                row.processing_time_seconds.unwrap_or_default().max(0) as u64,
            ),
            created_at: row.created_at,
        }
    }
}
