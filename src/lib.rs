// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Loom Store
//!
//! An append-mostly store of device-originated records (sensor readings,
//! notes, entity references) governed by two per-table policy tables:
//! **retention** and **sync priority**.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingest Layer                         │
//! │  • Validated TypedRecords via append() / append_batch()    │
//! │  • Dedup on (device_id, table, timestamp)                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Record Store                         │
//! │  • Per-stream locks, one payload kind per table            │
//! │  • Memory (DashMap) or SQLite (sqlx) backend               │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                     │
//!   (periodic passes)                      (per device pair)
//!            ▼                                     ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │    Retention Evaluator    │   │      Sync Scheduler       │
//! │  • Downsample, expire     │   │  • CRITICAL → BACKGROUND  │
//! │  • Compress (LZ4/ZSTD/GZ) │   │  • Starvation bound       │
//! │  • Emergency eviction     │   │  • Backoff, retry limit   │
//! └───────────────────────────┘   └───────────────────────────┘
//!            ▲                                     ▲
//!            └──────────── Config Registry ────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loom_store::{EngineConfig, LoomEngine, TypedRecord};
//! use loom_store::record::{sensor::GpsFix, DevicePair, Payload};
//! use loom_store::registry::{SyncPriority, SyncPrioritySpec};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         sql_url: Some("sqlite://loom.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let engine = LoomEngine::open(config, rx).await.expect("Failed to open");
//!     engine.start().expect("Failed to start");
//!
//!     engine
//!         .upsert_sync_priority_config("gps", SyncPrioritySpec::new(SyncPriority::Critical))
//!         .expect("Invalid config");
//!
//!     let fix = TypedRecord::new("gps", "phone", chrono::Utc::now(), Payload::Gps(GpsFix::new(51.5, -0.12)))
//!         .expect("Invalid record");
//!     engine.append(fix).await.expect("Failed to append");
//!
//!     let pair = DevicePair::new("phone", "laptop");
//!     let batch = engine.pull_pending(&pair, 1 << 20).await.expect("Failed to pull");
//!     // ... deliver the batch to the laptop ...
//!     engine.ack_batch(batch.batch_id).await.expect("Failed to ack");
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`LoomEngine`] owning every component
//! - [`record`]: Typed record model (payload kinds, notes, devices, metadata)
//! - [`store`]: Record store facade, queries and the entity graph
//! - [`storage`]: Backends (memory, SQLite)
//! - [`registry`]: Retention and sync priority configs
//! - [`retention`]: Downsampling, expiry, compression, emergency eviction
//! - [`scheduler`]: Priority-ordered, retrying sync per device pair
//! - [`compression`]: Payload codecs
//! - [`backpressure`]: Storage pressure against the space budget
//! - [`resilience`]: Retry and backoff

pub mod alert;
pub mod backpressure;
pub mod clock;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod resilience;
pub mod retention;
pub mod scheduler;
pub mod similarity;
pub mod storage;
pub mod store;

pub use alert::{AlertSink, OperatorAlert};
pub use backpressure::StoragePressure;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use compression::{CompressionAlgorithm, CompressionError, PayloadCodec, StandardCodec};
pub use config::EngineConfig;
pub use coordinator::{EngineError, EngineState, LoomEngine};
pub use record::{DevicePair, Payload, Record, RecordId, TypedRecord, ValidationError};
pub use registry::{ConfigError, ConfigRegistry, RetentionSpec, SyncPriority, SyncPrioritySpec};
pub use resilience::retry::{BackoffPolicy, RetryConfig};
pub use retention::{PassReport, RetentionEvaluator};
pub use scheduler::{FailOutcome, SchedulerError, SyncBatch, SyncScheduler, SyncTransport, TransportError};
pub use similarity::{RankedId, SimilarityIndex};
pub use storage::traits::{RecordBackend, StorageError};
pub use store::{QueryRequest, RecordStore, StatusFilter, StoreError};
pub use metrics::LatencyTimer;
