// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record backends.
//!
//! - [`memory::MemoryBackend`]: DashMap of per-stream ordered logs
//! - [`sql::SqlBackend`]: SQLite through the sqlx `Any` driver (feature `sqlite`)

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sql;
#[doc(hidden)]
pub mod testing;
pub mod traits;
