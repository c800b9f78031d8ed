// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fixed-window rate limiting across caller scopes.
//!
//! Each privileged operation hits every applicable scope counter
//! (tenant, then user, then org); the first counter over its configured
//! RPM rejects the operation with `RateLimited`.

use std::sync::Arc;

use crate::domain::registry::TenantLimits;
use crate::domain::run::RunContext;
use crate::domain::store::{RateScope, Store, StoreError};

pub struct RateLimiter {
    store: Arc<dyn Store>,
    window_s: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, window_s: u64) -> Self {
        Self { store, window_s: window_s.max(1) }
    }

    pub async fn check(&self, ctx: &RunContext, limits: &TenantLimits) -> Result<(), StoreError> {
        self.store
            .rate_hit(RateScope::Tenant, &ctx.tenant_id, limits.tenant_rpm, self.window_s)
            .await?;
        if let Some(user_id) = &ctx.user_id {
            self.store.rate_hit(RateScope::User, user_id, limits.user_rpm, self.window_s).await?;
        }
        if let Some(org_id) = &ctx.org_id {
            self.store.rate_hit(RateScope::Org, org_id, limits.org_rpm, self.window_s).await?;
        }
        Ok(())
    }
}
