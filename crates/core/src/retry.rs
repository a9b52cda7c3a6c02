//! # Collaborator Retry
//!
//! Calls to the language model are wrapped in a timeout and retried with
//! capped exponential backoff when the failure looks transient. Failures are
//! classified from the error message, and each class carries the fixed
//! user-facing copy shown when retries run out.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff settings for collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    Overloaded,
    Timeout,
    ServerError,
    NonTransient,
}

/// What the candidate can do after a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    RetryNow,
    WaitAndRetry,
    SwitchMode,
}

impl FailureClass {
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureClass::NonTransient)
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureClass::ServerError => {
                "I'm experiencing some technical issues right now. Please try again in a moment!"
            }
            FailureClass::Overloaded => {
                "The assessment service is busy right now. Please try again in a minute or two!"
            }
            FailureClass::RateLimited => {
                "Too many requests right now. Please wait a moment and try again!"
            }
            FailureClass::Timeout => "Request timed out. Please try sending your message again!",
            FailureClass::NonTransient => {
                "I'm having trouble processing your request. Please try again shortly!"
            }
        }
    }

    pub fn next_step(self) -> NextStep {
        match self {
            FailureClass::Timeout | FailureClass::ServerError => NextStep::RetryNow,
            FailureClass::Overloaded | FailureClass::RateLimited => NextStep::WaitAndRetry,
            FailureClass::NonTransient => NextStep::SwitchMode,
        }
    }

    /// The full apology: the class message plus a hint about what to do next.
    pub fn reply_text(self) -> String {
        let hint = match self.next_step() {
            NextStep::RetryNow => "You can send your last answer again.",
            NextStep::WaitAndRetry => "Wait a minute, then send your last answer again.",
            NextStep::SwitchMode => "You can type 'menu' to start over or switch mode.",
        };
        format!("{}\n\n{}", self.user_message(), hint)
    }
}

/// Classifies a collaborator error message by keyword.
///
/// Matching is done on word tokens so that e.g. "generate" is not read as
/// "rate".
pub fn classify_failure(message: &str) -> FailureClass {
    let lowered = message.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(t));
    let has_prefix = |prefixes: &[&str]| {
        tokens
            .iter()
            .any(|t| prefixes.iter().any(|p| t.starts_with(p)))
    };

    if has(&["429", "rate", "quota", "ratelimit"]) || has_prefix(&["limit", "quota"]) {
        FailureClass::RateLimited
    } else if has(&["503", "overloaded", "unavailable"]) {
        FailureClass::Overloaded
    } else if has(&["504", "deadline", "timeout", "timedout"]) || lowered.contains("timed out") {
        FailureClass::Timeout
    } else if has(&["500", "internal"]) {
        FailureClass::ServerError
    } else {
        FailureClass::NonTransient
    }
}

/// A collaborator call that failed for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorFailure {
    pub class: FailureClass,
    pub attempts: u32,
    pub message: String,
}

/// Runs `operation` under `policy`, retrying transient failures.
///
/// Non-transient failures are returned after the first attempt. Each attempt
/// is bounded by `policy.call_timeout`; an elapsed deadline counts as a
/// transient timeout.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, CollaboratorFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let message = match tokio::time::timeout(policy.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(label, attempt, "Collaborator call succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timeout: {label} exceeded {:?}", policy.call_timeout),
        };

        let class = classify_failure(&message);
        if !class.is_transient() || attempt >= max_attempts {
            warn!(label, attempt, ?class, error = %message, "Collaborator call failed");
            return Err(CollaboratorFailure {
                class,
                attempts: attempt,
                message,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(label, attempt, ?class, ?delay, error = %message, "Transient failure, retrying");
        tokio::time::sleep(delay).await;
    }
}
