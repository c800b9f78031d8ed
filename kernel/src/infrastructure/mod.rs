// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod adapters;
pub mod canonical;
pub mod config;
pub mod hash_chain;
pub mod registry_loader;
pub mod store;
pub mod stream_hub;
