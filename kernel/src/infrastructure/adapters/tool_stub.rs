// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::error::ErrorClass;
use crate::domain::ports::{ToolAdapter, ToolFailure, ToolRequest};

/// A failure the stub injects before succeeding; used to exercise retry
/// behavior.
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub class: ErrorClass,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl ScriptedFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::TransientNetwork, message: message.into(), retry_after_ms: None }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            class: ErrorClass::RateLimited,
            message: "429 rate limit".into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// Canned tool transport. Counts invocations per tool and can be loaded
/// with failures to throw before the first success of a given tool.
pub struct StubToolRunner {
    invocations: AtomicU64,
    calls_by_tool: Mutex<HashMap<String, u64>>,
    failures: Mutex<HashMap<String, Vec<ScriptedFailure>>>,
}

impl StubToolRunner {
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            calls_by_tool: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Queue failures for a tool; they are thrown in order before the tool
    /// starts succeeding.
    pub fn fail_next(&self, tool_id: &str, failures: Vec<ScriptedFailure>) {
        self.failures.lock().expect("stub lock").insert(tool_id.to_string(), failures);
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, tool_id: &str) -> u64 {
        self.calls_by_tool.lock().expect("stub lock").get(tool_id).copied().unwrap_or(0)
    }
}

impl Default for StubToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for StubToolRunner {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, ToolFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        {
            let mut calls = self.calls_by_tool.lock().expect("stub lock");
            *calls.entry(request.tool_id.clone()).or_insert(0) += 1;
        }

        let scripted = {
            let mut failures = self.failures.lock().expect("stub lock");
            failures.get_mut(&request.tool_id).and_then(|queue| {
                if queue.is_empty() { None } else { Some(queue.remove(0)) }
            })
        };
        if let Some(failure) = scripted {
            return Err(ToolFailure {
                class: failure.class,
                message: failure.message,
                retry_after_ms: failure.retry_after_ms,
            });
        }

        match request.tool_id.as_str() {
            "crm.get_customer" => {
                let id = request.args.get("customer_id").and_then(Value::as_str).unwrap_or("");
                Ok(json!({"id": id, "name": "Nina", "email": "nina@example.com"}))
            }
            "memory.search" => Ok(json!({
                "matches": [{"doc_id": "doc_kb_refunds", "summary": "14 days + defect => refund or replacement"}]
            })),
            "ticket.create" => Ok(json!({"ticket_id": "tkt_5001", "status": "open"})),
            "ticket.add_comment" => Ok(json!({"comment_id": "cmt_1", "status": "ok"})),
            "email.send" => Ok(json!({"message_id": "msg_9012", "status": "sent"})),
            other => Err(ToolFailure::new(
                ErrorClass::NotFound,
                format!("unknown tool: {other}"),
            )),
        }
    }
}
