// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Aether Kernel
//!
//! Multi-tenant mission orchestration runtime.
//!
//! A mission enqueues a run; a worker claims it; the per-run pipeline walks
//! ingest → context → plan → gate → execute → synthesize, persisting every
//! emitted event into an HMAC hash chain before any subscriber sees it.
//!
//! # Architecture
//!
//! - **Layer: domain** — entities, the policy DSL, the `Store` contract and
//!   the adapter ports. No I/O.
//! - **Layer: application** — the pipeline state machine, the deterministic
//!   step executor, the policy engine, streaming, workers, rate limiting.
//! - **Layer: infrastructure** — canonical JSON, the audit hash chain,
//!   registry loading, configuration, and the two `Store` backends
//!   (in-memory and Postgres).

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
