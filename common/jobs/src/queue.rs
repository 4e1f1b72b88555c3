use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::JobsError;
use crate::model::{ClaimedTask, TaskKind};

const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const BACKOFF_BASE_SECS: i64 = 5;
const BACKOFF_CAP_SECS: i64 = 600;

/// Bounded exponential backoff with jitter, mirroring Celery's
/// `autoretry_for`/`max_retries` contract without replicating Celery's
/// broker. Capped at ten minutes so a flapping external service doesn't
/// starve the queue of retry slots.
pub fn backoff_duration(attempts: i32) -> Duration {
    let exp = attempts.max(0).min(10) as u32;
    let base = BACKOFF_BASE_SECS.saturating_mul(1i64 << exp).min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0..=base.max(1) / 4 + 1);
    Duration::from_secs((base + jitter) as u64)
}

/// Commit the rows a task reads before calling this. Producers own the
/// "commit before enqueue" ordering the orchestrator assumes.
pub async fn enqueue(
    pool: &PgPool,
    kind: TaskKind,
    payload: &impl Serialize,
    run_after: Option<DateTime<Utc>>,
) -> Result<Uuid, JobsError> {
    enqueue_with_retries(pool, kind, payload, run_after, DEFAULT_MAX_ATTEMPTS).await
}

pub async fn enqueue_with_retries(
    pool: &PgPool,
    kind: TaskKind,
    payload: &impl Serialize,
    run_after: Option<DateTime<Utc>>,
    max_attempts: i32,
) -> Result<Uuid, JobsError> {
    let id = Uuid::new_v4();
    let payload_json = serde_json::to_value(payload).expect("task payload must serialize");
    let run_after = run_after.unwrap_or_else(Utc::now);
    sqlx::query(
        "INSERT INTO scheduled_tasks (id, kind, payload, run_after, max_attempts)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(kind.as_str())
    .bind(payload_json)
    .bind(run_after)
    .bind(max_attempts)
    .execute(pool)
    .await?;
    Ok(id)
}

/// Claim one pending, due task for `worker_id` using `FOR UPDATE SKIP LOCKED`
/// so concurrent workers never double-claim a row. Flips `status` to
/// `running` so a claimed-but-not-yet-completed row can't be claimed again
/// by a second worker between this UPDATE and the task body actually
/// finishing.
pub async fn claim_next(pool: &PgPool, worker_id: &str) -> Result<Option<ClaimedTask>, JobsError> {
    let row = sqlx::query_as::<_, ClaimedTask>(
        "UPDATE scheduled_tasks
         SET locked_by = $1, locked_at = now(), status = 'running'
         WHERE id = (
             SELECT id FROM scheduled_tasks
             WHERE status = 'pending' AND run_after <= now()
             ORDER BY id
             FOR UPDATE SKIP LOCKED
             LIMIT 1
         )
         RETURNING id, kind, payload, run_after, attempts, max_attempts, locked_by, locked_at, status",
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// A task body finished successfully; the row is deleted rather than kept
/// around in a `done` state, completed tasks carry no further meaning.
pub async fn complete(pool: &PgPool, id: Uuid) -> Result<(), JobsError> {
    sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// A task body errored or hit the 180s hard cap. Reschedules with backoff
/// unless `attempts` has reached `max_attempts`, in which case the row is
/// marked `dead` for operator inspection instead of being retried forever.
pub async fn fail_and_reschedule(pool: &PgPool, task: &ClaimedTask) -> Result<(), JobsError> {
    let attempts = task.attempts + 1;
    if attempts >= task.max_attempts {
        sqlx::query(
            "UPDATE scheduled_tasks SET attempts = $2, status = 'dead', locked_by = NULL, locked_at = NULL
             WHERE id = $1",
        )
        .bind(task.id)
        .bind(attempts)
        .execute(pool)
        .await?;
        tracing::warn!(task_id = %task.id, kind = %task.kind, attempts, "task exhausted retries, marked dead");
        return Ok(());
    }

    let delay = backoff_duration(attempts);
    let run_after = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
    sqlx::query(
        "UPDATE scheduled_tasks SET attempts = $2, run_after = $3, locked_by = NULL, locked_at = NULL, status = 'pending'
         WHERE id = $1",
    )
    .bind(task.id)
    .bind(attempts)
    .bind(run_after)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let small = backoff_duration(0);
        let large = backoff_duration(10);
        assert!(small.as_secs() < large.as_secs());
        assert!(large.as_secs() <= (BACKOFF_CAP_SECS as u64) + (BACKOFF_CAP_SECS as u64) / 4 + 1);
    }
}
