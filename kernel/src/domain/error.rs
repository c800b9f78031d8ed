// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Step and invocation error taxonomy.
//!
//! Every tool failure is classified into exactly one [`ErrorClass`]; the
//! class drives the retry decision and is what subscribers see on the
//! stream.

use serde::{Deserialize, Serialize};

/// Classification of a step or invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    RateLimited,
    Auth,
    InvalidInput,
    NotFound,
    Conflict,
    PolicyDenied,
    Idempotency,
    BudgetExceeded,
    Timeout,
    Internal,
}

impl ErrorClass {
    /// Classes that are never retried, regardless of the retry class
    /// configured on the action.
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, Self::Auth | Self::InvalidInput | Self::PolicyDenied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PolicyDenied => "policy_denied",
            Self::Idempotency => "idempotency",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified step failure, carried on `step_result` artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
    /// Server-requested delay before the next attempt (rate limiting only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl StepError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into(), retry_after_ms: None }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for StepError {}
