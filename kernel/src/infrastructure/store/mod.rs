// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
