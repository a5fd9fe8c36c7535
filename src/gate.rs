//! Bounded poll-until-ready gate.
//!
//! A [`PollingGate`] queries an injected [`StatusCheck`] until the remote job
//! reports completion, a fatal error is raised, or the attempt budget runs out.
//! It never returns an error: every sequence ends in exactly one
//! [`PollOutcome`].

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::LoadError;

/// Status value the scanning platform reports once a scan has finished.
pub const COMPLETION_SENTINEL: &str = "DONE";

/// Identifies the remote job being waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub repo: String,
    pub path: String,
    /// Distinguishes this sequence from earlier ones in logs (e.g. `user-2-iter-5`).
    pub label: String,
}

impl PollRequest {
    pub fn new(repo: impl Into<String>, path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            label: label.into(),
        }
    }

    /// Request for the manifest of a pushed image tag.
    pub fn for_image(repo: &str, image: &str, tag: &str, label: impl Into<String>) -> Self {
        Self::new(repo, manifest_path(image, tag), label)
    }
}

/// Path of an image manifest inside a docker repository.
pub fn manifest_path(image: &str, tag: &str) -> String {
    format!("{image}/{tag}/manifest.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pending,
    Done,
    Error,
}

/// One status query and how it was classified.
#[derive(Debug, Clone)]
pub struct PollAttempt {
    pub at: DateTime<Utc>,
    pub payload: String,
    pub classification: Classification,
}

impl PollAttempt {
    pub fn new(payload: impl Into<String>, classification: Classification) -> Self {
        Self {
            at: Utc::now(),
            payload: payload.into(),
            classification,
        }
    }

    pub fn pending(payload: impl Into<String>) -> Self {
        Self::new(payload, Classification::Pending)
    }

    pub fn done(payload: impl Into<String>) -> Self {
        Self::new(payload, Classification::Done)
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self::new(payload, Classification::Error)
    }
}

/// Terminal result of one polling sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { attempts: u32 },
    TimedOut { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl PollOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Number of status queries issued before the outcome was reached.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts }
            | Self::TimedOut { attempts }
            | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: NonZeroU32,
    pub interval: Duration,
    /// Settling time before the first query.
    pub initial_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            interval: Duration::from_secs(5),
            initial_delay: Duration::ZERO,
        }
    }
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Result<Self, LoadError> {
        let max_attempts = NonZeroU32::new(max_attempts)
            .ok_or_else(|| LoadError::Config("poll max_attempts must be at least 1".into()))?;
        Ok(Self {
            max_attempts,
            interval,
            initial_delay: Duration::ZERO,
        })
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Upper bound on time spent sleeping in one sequence, or `None` when it
    /// does not fit in a `Duration`.
    pub fn worst_case_wait(&self) -> Option<Duration> {
        self.interval
            .checked_mul(self.max_attempts.get() - 1)?
            .checked_add(self.initial_delay)
    }
}

/// One remote status query.
///
/// `Err` values whose [`LoadError::is_fatal`] is true end the sequence as
/// [`PollOutcome::Failed`]; any other `Err` is recorded as an `Error` attempt
/// and polling continues.
pub trait StatusCheck: Send + Sync {
    fn check_status(
        &self,
        request: &PollRequest,
    ) -> impl Future<Output = Result<PollAttempt, LoadError>> + Send;
}

impl<T: StatusCheck> StatusCheck for Arc<T> {
    fn check_status(
        &self,
        request: &PollRequest,
    ) -> impl Future<Output = Result<PollAttempt, LoadError>> + Send {
        (**self).check_status(request)
    }
}

/// Outcome plus every attempt observed on the way to it.
#[derive(Debug, Clone)]
pub struct PollTrace {
    pub outcome: PollOutcome,
    pub attempts: Vec<PollAttempt>,
    pub elapsed: Duration,
}

pub struct PollingGate<C> {
    check: C,
    config: PollConfig,
}

impl<C: StatusCheck> PollingGate<C> {
    pub fn new(check: C, config: PollConfig) -> Self {
        Self { check, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub async fn await_completion(&self, request: &PollRequest) -> PollOutcome {
        self.await_completion_traced(request).await.outcome
    }

    /// Like [`await_completion`](Self::await_completion), keeping the attempt history.
    pub async fn await_completion_traced(&self, request: &PollRequest) -> PollTrace {
        let start = Instant::now();
        let max_attempts = self.config.max_attempts.get();
        let mut history = Vec::with_capacity(max_attempts as usize);

        if !self.config.initial_delay.is_zero() {
            tokio::time::sleep(self.config.initial_delay).await;
        }

        for attempt in 1..=max_attempts {
            let observed = match self.check.check_status(request).await {
                Ok(observed) => observed,
                Err(e) if e.is_fatal() => {
                    tracing::warn!(
                        job = request.label,
                        attempt = attempt,
                        "status check failed fatally: {e}"
                    );
                    return PollTrace {
                        outcome: PollOutcome::Failed {
                            attempts: attempt,
                            reason: e.to_string(),
                        },
                        attempts: history,
                        elapsed: start.elapsed(),
                    };
                }
                Err(e) => PollAttempt::error(e.to_string()),
            };

            let classification = observed.classification;
            let reason = match classification {
                Classification::Error => crate::error::truncate_body(&observed.payload),
                _ => String::new(),
            };
            history.push(observed);

            match classification {
                Classification::Done => {
                    tracing::info!(
                        job = request.label,
                        attempt = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "scan completed"
                    );
                    return PollTrace {
                        outcome: PollOutcome::Completed { attempts: attempt },
                        attempts: history,
                        elapsed: start.elapsed(),
                    };
                }
                Classification::Pending => {
                    tracing::debug!(job = request.label, attempt = attempt, "scan still pending");
                }
                Classification::Error if attempt < max_attempts => {
                    tracing::warn!(
                        job = request.label,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        reason = %reason,
                        "status check attempt failed, will retry"
                    );
                }
                Classification::Error => {
                    tracing::warn!(
                        job = request.label,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        reason = %reason,
                        "status check attempt failed, no attempts left"
                    );
                }
            }

            if attempt < max_attempts && !self.config.interval.is_zero() {
                tokio::time::sleep(self.config.interval).await;
            }
        }

        tracing::warn!(
            job = request.label,
            attempts = max_attempts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "scan not done after max attempts"
        );
        PollTrace {
            outcome: PollOutcome::TimedOut {
                attempts: max_attempts,
            },
            attempts: history,
            elapsed: start.elapsed(),
        }
    }
}
