//! Task engine: runs one pipeline stage with retry, backoff and timeout.
//!
//! A stage is an async body producing a [`StageOutcome`]. The engine owns the
//! attempt loop. Retryable outcomes back off quadratically until the attempt
//! budget is spent. A fatal outcome or an attempt exceeding its timeout fails
//! the operation immediately. A stage only moves the operation's state forward
//! after its success has been persisted.

use crate::{AdapterError, MiningOperation, OperationRepository, OperationState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result of one attempt of a stage body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<T> {
    Success(T),
    /// Worth another attempt after backing off.
    Retryable(String),
    /// Retrying cannot help.
    Fatal(String),
}

impl<T> From<AdapterError> for StageOutcome<T> {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(reason) => StageOutcome::Retryable(reason),
            AdapterError::Fatal(reason) => StageOutcome::Fatal(reason),
        }
    }
}

impl<T> From<Result<T, AdapterError>> for StageOutcome<T> {
    fn from(result: Result<T, AdapterError>) -> Self {
        match result {
            Ok(value) => StageOutcome::Success(value),
            Err(e) => e.into(),
        }
    }
}

/// A named pipeline step and the state it moves the operation to.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: &'static str,
    pub target: OperationState,
    /// Limit on a single attempt.
    pub timeout: Duration,
}

impl Stage {
    pub fn new(name: &'static str, target: OperationState, timeout: Duration) -> Self {
        Self {
            name,
            target,
            timeout,
        }
    }
}

/// How a stage that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    /// The operation had already reached the target state.
    Skipped,
    Completed {
        attempts: u32,
        /// Total backoff slept between attempts.
        waited: Duration,
    },
}

/// How a stage that did not complete ended.
///
/// `Failed` and `TimedOut` leave the operation `Failed` and persisted.
/// `NotPersisted` is a failure whose record could not be written, so the
/// store still shows the operation active. `Cancelled` persists nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} failed after {attempts} attempt(s): {reason}")]
    Failed {
        stage: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("{stage} took too long (limit {timeout:?})")]
    TimedOut {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("{failure}; the failure could not be persisted: {error}")]
    NotPersisted {
        stage: &'static str,
        failure: String,
        error: String,
    },

    #[error("{stage} cancelled")]
    Cancelled { stage: &'static str },
}

impl StageError {
    /// Name of the stage that ended.
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Failed { stage, .. }
            | StageError::TimedOut { stage, .. }
            | StageError::NotPersisted { stage, .. }
            | StageError::Cancelled { stage } => *stage,
        }
    }
}

/// What a stage body sees on each attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    operation: Arc<MiningOperation>,
    attempt: u32,
    cancel: CancellationToken,
}

impl StageContext {
    /// Snapshot of the operation as of this attempt.
    pub fn operation(&self) -> &MiningOperation {
        &self.operation
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Attempt budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `attempt² × 10` units.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt.saturating_mul(attempt).saturating_mul(10))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Drives stages against a repository.
#[derive(Clone)]
pub struct TaskEngine {
    repository: Arc<dyn OperationRepository>,
    policy: RetryPolicy,
}

impl TaskEngine {
    pub fn new(repository: Arc<dyn OperationRepository>, policy: RetryPolicy) -> Self {
        Self { repository, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `stage` for `operation`.
    ///
    /// `body` is invoked once per attempt. On success `apply` folds the value
    /// into the operation, the state moves to `stage.target` and the result is
    /// saved before this returns. Cancellation, checked while an attempt runs
    /// and while backing off, returns without touching the persisted record.
    pub async fn run_stage<T, F, Fut, A>(
        &self,
        operation: &mut MiningOperation,
        stage: &Stage,
        cancel: &CancellationToken,
        mut body: F,
        apply: A,
    ) -> Result<StageReport, StageError>
    where
        F: FnMut(StageContext) -> Fut,
        Fut: Future<Output = StageOutcome<T>>,
        A: FnOnce(&mut MiningOperation, T),
    {
        if operation.state >= stage.target {
            debug!(id = %operation.id, stage = stage.name, state = %operation.state, "Stage already done");
            return Ok(StageReport::Skipped);
        }

        let mut attempt = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            attempt += 1;
            let ctx = StageContext {
                operation: Arc::new(operation.clone()),
                attempt,
                cancel: cancel.clone(),
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(operation, stage));
                }
                result = tokio::time::timeout(stage.timeout, body(ctx)) => result,
            };

            let reason = match outcome {
                Err(_elapsed) => {
                    let err = StageError::TimedOut {
                        stage: stage.name,
                        timeout: stage.timeout,
                    };
                    return Err(self.fail(operation, err));
                }
                Ok(StageOutcome::Success(value)) => {
                    let mut next = operation.clone();
                    apply(&mut next, value);
                    next.advance(stage.target, attempt);

                    if let Err(e) = self.repository.save(&next) {
                        let err = StageError::Failed {
                            stage: stage.name,
                            attempts: attempt,
                            reason: format!("could not persist progress: {e}"),
                        };
                        return Err(self.fail(operation, err));
                    }

                    *operation = next;
                    debug!(
                        id = %operation.id,
                        stage = stage.name,
                        attempts = attempt,
                        state = %operation.state,
                        "Stage completed"
                    );
                    return Ok(StageReport::Completed {
                        attempts: attempt,
                        waited,
                    });
                }
                Ok(StageOutcome::Fatal(reason)) => {
                    let err = StageError::Failed {
                        stage: stage.name,
                        attempts: attempt,
                        reason,
                    };
                    return Err(self.fail(operation, err));
                }
                Ok(StageOutcome::Retryable(reason)) => reason,
            };

            if attempt >= self.policy.max_attempts {
                let err = StageError::Failed {
                    stage: stage.name,
                    attempts: attempt,
                    reason,
                };
                return Err(self.fail(operation, err));
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                id = %operation.id,
                stage = stage.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Stage attempt failed, retrying"
            );
            operation.warn(format!(
                "{} attempt {attempt} failed: {reason}; retrying in {delay:?}",
                stage.name
            ));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(operation, stage));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            waited += delay;
        }
    }

    /// Mark `operation` failed with `err` as the reason and persist it.
    /// Returns `err`, or `NotPersisted` when the save fails.
    fn fail(&self, operation: &mut MiningOperation, err: StageError) -> StageError {
        let failure = err.to_string();
        error!(id = %operation.id, state = %operation.state, reason = %failure, "Operation failed");
        operation.fail(failure.clone());
        match self.repository.save(operation) {
            Ok(()) => err,
            Err(e) => {
                error!(id = %operation.id, error = %e, "Could not persist failed operation");
                StageError::NotPersisted {
                    stage: err.stage(),
                    failure,
                    error: e.to_string(),
                }
            }
        }
    }

    fn cancelled(&self, operation: &mut MiningOperation, stage: &Stage) -> StageError {
        debug!(id = %operation.id, stage = stage.name, "Stage cancelled");
        operation.info(format!("{} cancelled", stage.name));
        StageError::Cancelled { stage: stage.name }
    }
}
