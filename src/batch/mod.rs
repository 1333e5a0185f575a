// Batch module
// Bounded-concurrency fan-out of questions over any answerer


use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info};

use crate::qa::{Answer, QueryResult};
use crate::{QaError, Result};

/// Outcome of one question in a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Success(QueryResult),
    Failed {
        question: String,
        /// Error variant name, see [`QaError::kind`]
        kind: &'static str,
        error: String,
    },
}

impl BatchOutcome {
    #[inline]
    pub fn question(&self) -> &str {
        match self {
            Self::Success(result) => &result.question,
            Self::Failed { question, .. } => question,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Kind of error for a failed question
    #[inline]
    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            Self::Success(_) => None,
            Self::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Aggregate view over a finished batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sum of per-question elapsed time over successful questions
    #[serde(rename = "total_elapsed_secs", serialize_with = "serialize_secs")]
    pub total_elapsed: Duration,
    /// Mean elapsed time per successful question
    #[serde(rename = "average_elapsed_secs", serialize_with = "serialize_secs")]
    pub average_elapsed: Duration,
}

impl BatchSummary {
    #[inline]
    pub fn from_outcomes(outcomes: &[BatchOutcome]) -> Self {
        let elapsed: Vec<Duration> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                BatchOutcome::Success(result) => Some(result.elapsed),
                BatchOutcome::Failed { .. } => None,
            })
            .collect();

        let succeeded = elapsed.len();
        let total_elapsed: Duration = elapsed.iter().sum();
        let average_elapsed = u32::try_from(succeeded)
            .ok()
            .filter(|count| *count > 0)
            .map_or(Duration::ZERO, |count| total_elapsed / count);

        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            total_elapsed,
            average_elapsed,
        }
    }
}

/// Ask every question with at most `max_workers` in flight.
///
/// Outcomes are returned in input order, one per question. A failed question
/// never affects the others. `max_workers == 0` is treated as 1.
#[inline]
pub async fn ask_batch<A>(answerer: &A, questions: &[String], max_workers: usize) -> Vec<BatchOutcome>
where
    A: Answer + ?Sized,
{
    let workers = max_workers.max(1);
    info!(
        "Processing {} questions with {} workers",
        questions.len(),
        workers
    );

    let mut slots: Vec<Option<BatchOutcome>> = vec![None; questions.len()];

    let mut completed = futures::stream::iter(questions.iter().enumerate())
        .map(|(index, question)| async move {
            let outcome = match answerer.ask(question).await {
                Ok(result) => BatchOutcome::Success(result),
                Err(e) => {
                    error!("Question {} failed: {}", index + 1, e);
                    BatchOutcome::Failed {
                        question: question.clone(),
                        kind: e.kind(),
                        error: e.to_string(),
                    }
                }
            };
            (index, outcome)
        })
        .buffer_unordered(workers);

    while let Some((index, outcome)) = completed.next().await {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    let outcomes: Vec<BatchOutcome> = slots
        .into_iter()
        .zip(questions)
        .map(|(slot, question)| {
            slot.unwrap_or_else(|| BatchOutcome::Failed {
                question: question.clone(),
                kind: "other",
                error: "question was not processed".to_string(),
            })
        })
        .collect();

    let summary = BatchSummary::from_outcomes(&outcomes);
    info!(
        "Batch completed: {}/{} succeeded",
        summary.succeeded, summary.total
    );
    outcomes
}

/// [`ask_batch`] bounded by a deadline over the whole batch
#[inline]
pub async fn ask_batch_with_timeout<A>(
    answerer: &A,
    questions: &[String],
    max_workers: usize,
    timeout: Duration,
) -> Result<Vec<BatchOutcome>>
where
    A: Answer + ?Sized,
{
    tokio::time::timeout(timeout, ask_batch(answerer, questions, max_workers))
        .await
        .map_err(|_| {
            QaError::Timeout(format!(
                "batch of {} questions did not finish within {:.1}s",
                questions.len(),
                timeout.as_secs_f64()
            ))
        })
}

fn serialize_secs<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}
