//! Job state machine
//!
//! Pure logic: given the current job record, an event and the current time,
//! compute the next status and the field updates that go with it. Nothing here
//! touches a store; callers persist the result with a conditional update.
//!
//! ```text
//!   PENDING ──lease acquired──▶ RUNNING ──succeeded──▶ SUCCESS
//!                                  │  ▲
//!          failed, lease expired   │  │ lease acquired (now >= next_eligible_at)
//!                                  ▼  │
//!                            RETRY_SCHEDULED
//!                                  │
//!           failed, attempts exhausted ──▶ DEAD
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::record::{Job, JobId, JobStatus};

/// Something that happened to a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A dispatcher won the job's lease
    LeaseAcquired,

    /// The work unit completed successfully
    Succeeded,

    /// The work unit failed
    ///
    /// `retry_delay` is the backoff for the attempt being recorded; it is
    /// ignored when the failure exhausts the job.
    Failed { error: String, retry_delay: Duration },

    /// The holder of a `RUNNING` job stopped renewing before recording an
    /// outcome. No attempt is spent: the job is immediately pollable again.
    LeaseExpired { reason: String },
}

impl JobEvent {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::LeaseAcquired => "lease_acquired",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::LeaseExpired { .. } => "lease_expired",
        }
    }
}

/// Field changes applied together with a status change
///
/// `None` leaves a field untouched. For the nullable fields, `Some(None)`
/// clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates {
    pub attempt_count: Option<u32>,
    pub next_eligible_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

impl FieldUpdates {
    /// No field changes
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn with_next_eligible_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Whether nothing would change
    pub fn is_empty(&self) -> bool {
        self.attempt_count.is_none() && self.next_eligible_at.is_none() && self.last_error.is_none()
    }

    /// Apply the updates to an in-memory record
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(attempt_count) = self.attempt_count {
            job.attempt_count = attempt_count;
        }
        if let Some(next_eligible_at) = self.next_eligible_at {
            job.next_eligible_at = next_eligible_at;
        }
        if let Some(last_error) = &self.last_error {
            job.last_error = last_error.clone();
        }
    }
}

/// A legal state change, ready to be applied with compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub updates: FieldUpdates,
}

/// An event that the state machine refuses to apply
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalTransition {
    /// The job already reached SUCCESS or DEAD
    #[error("job {job_id} is terminal ({status}), {event} rejected")]
    Terminal {
        job_id: JobId,
        status: JobStatus,
        event: &'static str,
    },

    /// A retry was picked up before its backoff elapsed
    #[error("job {job_id} is not eligible until {eligible_at}")]
    NotYetEligible {
        job_id: JobId,
        eligible_at: DateTime<Utc>,
    },

    /// The event has no meaning in the current state
    #[error("event {event} is not legal from {status} for job {job_id}")]
    Unexpected {
        job_id: JobId,
        status: JobStatus,
        event: &'static str,
    },

    /// The record already violates `attempt_count < max_attempts` while running
    #[error("job {job_id} already recorded {attempt_count} of {max_attempts} attempts")]
    AttemptsExhausted {
        job_id: JobId,
        attempt_count: u32,
        max_attempts: u32,
    },
}

impl Transition {
    /// Compute the transition `event` causes on `job` at `now`
    pub fn compute(
        job: &Job,
        event: &JobEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, IllegalTransition> {
        if job.status.is_terminal() {
            return Err(IllegalTransition::Terminal {
                job_id: job.id,
                status: job.status,
                event: event.name(),
            });
        }

        match (job.status, event) {
            (JobStatus::Pending, JobEvent::LeaseAcquired) => Ok(Self::to(job, JobStatus::Running)),

            (JobStatus::RetryScheduled, JobEvent::LeaseAcquired) => match job.next_eligible_at {
                Some(eligible_at) if now < eligible_at => Err(IllegalTransition::NotYetEligible {
                    job_id: job.id,
                    eligible_at,
                }),
                _ => Ok(Self::to(job, JobStatus::Running)),
            },

            (JobStatus::Running, JobEvent::Succeeded) => Ok(Self::to(job, JobStatus::Success)),

            (JobStatus::Running, JobEvent::Failed { error, retry_delay }) => {
                if job.attempt_count >= job.max_attempts {
                    return Err(IllegalTransition::AttemptsExhausted {
                        job_id: job.id,
                        attempt_count: job.attempt_count,
                        max_attempts: job.max_attempts,
                    });
                }

                let attempt_count = job.attempt_count + 1;
                let updates = FieldUpdates::none()
                    .with_attempt_count(attempt_count)
                    .with_last_error(Some(error.clone()));

                if attempt_count >= job.max_attempts {
                    Ok(Transition {
                        from: job.status,
                        to: JobStatus::Dead,
                        updates: updates.with_next_eligible_at(None),
                    })
                } else {
                    Ok(Transition {
                        from: job.status,
                        to: JobStatus::RetryScheduled,
                        updates: updates.with_next_eligible_at(Some(add_delay(now, *retry_delay))),
                    })
                }
            }

            (JobStatus::Running, JobEvent::LeaseExpired { reason }) => Ok(Transition {
                from: job.status,
                to: JobStatus::RetryScheduled,
                updates: FieldUpdates::none()
                    .with_next_eligible_at(Some(now))
                    .with_last_error(Some(reason.clone())),
            }),

            (status, event) => Err(IllegalTransition::Unexpected {
                job_id: job.id,
                status,
                event: event.name(),
            }),
        }
    }

    fn to(job: &Job, to: JobStatus) -> Transition {
        Transition {
            from: job.status,
            to,
            updates: FieldUpdates::none(),
        }
    }
}

/// `now + delay`, saturating at the largest representable instant
fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
