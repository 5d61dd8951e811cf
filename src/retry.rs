use crate::audit::Alerting;
use crate::config::RetryPolicy;
use crate::error::LifecycleResult;
use crate::models::{JobExecutionRecord, JobStatus};
use crate::store::Database;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_JOB_ERROR_LEN: usize = 2_000;

/// Runs a unit of work with bounded retries and exponential backoff, keeping
/// one [`JobExecutionRecord`] per call. Only transient errors are retried;
/// the final error is always handed back to the caller.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    db: Database,
    alerting: Arc<dyn Alerting>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, db: Database, alerting: Arc<dyn Alerting>) -> Self {
        Self {
            policy,
            db,
            alerting,
        }
    }

    /// Delay after the given failed attempt (1-based): initial, x2, x4, ...
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .policy
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        let base = self.policy.initial_backoff.saturating_mul(factor);
        if self.policy.jitter > 0.0 {
            let spread = rand::rng().random_range(0.0..=self.policy.jitter);
            base.mul_f64(1.0 + spread)
        } else {
            base
        }
    }

    pub async fn execute<T, F, Fut>(&self, job_name: &str, work: F) -> LifecycleResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        self.execute_with_metrics(job_name, work, |_| None).await
    }

    /// Like [`execute`](Self::execute), storing `metrics(&result)` on the job
    /// record when the work succeeds.
    pub async fn execute_with_metrics<T, F, Fut, M>(
        &self,
        job_name: &str,
        mut work: F,
        metrics: M,
    ) -> LifecycleResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
        M: FnOnce(&T) -> Option<Value>,
    {
        let mut record = JobExecutionRecord {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::Running,
            error_message: None,
            metrics: None,
        };
        // written on its own so it survives whatever the work does
        self.db.insert_job(&record).await;
        info!(target = "listings.retry", job = job_name, job_id = %record.id, "job started");

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        let failure = loop {
            match work(attempt).await {
                Ok(value) => {
                    record.status = JobStatus::Success;
                    record.end_time = Some(Utc::now());
                    record.metrics = metrics(&value);
                    self.db.update_job(&record).await;
                    let elapsed_ms = elapsed_ms(&record);
                    crate::metrics::job_finished(job_name, "success", elapsed_ms, attempt);
                    info!(
                        target = "listings.retry",
                        job = job_name,
                        attempts = attempt,
                        elapsed_ms,
                        "job completed"
                    );
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        target = "listings.retry",
                        job = job_name,
                        attempt,
                        next_attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying job"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break err,
            }
        };

        record.status = JobStatus::Failed;
        record.end_time = Some(Utc::now());
        record.error_message = Some(truncate_message(
            &failure.to_string(),
            MAX_JOB_ERROR_LEN,
        ));
        self.db.update_job(&record).await;
        crate::metrics::job_finished(job_name, "failed", elapsed_ms(&record), attempt);
        error!(
            target = "listings.retry",
            job = job_name,
            job_id = %record.id,
            attempts = attempt,
            error = %failure,
            "job failed"
        );
        self.alerting.notify(
            &format!("CRITICAL: Job Failure Alert - {job_name}"),
            &format!(
                "Job: {job_name}\nExecution: {}\nAttempts: {attempt}\nTime: {}\nError: {}",
                record.id,
                Utc::now(),
                record.error_message.as_deref().unwrap_or_default(),
            ),
        );
        Err(failure)
    }
}

fn elapsed_ms(record: &JobExecutionRecord) -> u64 {
    record
        .end_time
        .map(|end| (end - record.start_time).num_milliseconds().max(0) as u64)
        .unwrap_or_default()
}

/// Cuts `message` to at most `max` characters, marking the cut with `...`.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = message.chars().take(keep).collect();
    out.push_str("...");
    out
}
