// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod emit;
pub mod executor;
pub mod kernel;
pub mod pipeline;
pub mod policy_engine;
pub mod rate_limiter;
pub mod streamer;
pub mod worker;

pub use emit::Emitter;
pub use executor::{ExecutionOutcome, StepExecutor};
pub use kernel::{Kernel, MissionDraft};
pub use pipeline::Pipeline;
pub use policy_engine::PolicyEngine;
pub use rate_limiter::RateLimiter;
pub use streamer::{StreamFrame, Streamer, Subscription};
pub use worker::WorkerPool;
