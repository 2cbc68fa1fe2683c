// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! The [`LoomEngine`] owns every component and wires them to one clock,
//! one registry and one alert channel:
//! - [`RecordStore`] over the memory or SQLite backend
//! - [`ConfigRegistry`] holding retention and sync priority configs
//! - [`RetentionEvaluator`] running periodic passes
//! - [`SyncScheduler`] draining pending records per device pair
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! An engine that was never started still serves appends, queries and
//! manual `pull_pending` calls; `start()` only adds background work.
//!
//! # Example
//!
//! ```rust,no_run
//! use loom_store::{EngineConfig, EngineState, LoomEngine};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let engine = LoomEngine::open(config, rx).await.expect("open failed");
//!
//! assert_eq!(engine.state(), EngineState::Created);
//! engine.start().expect("start failed");
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::EngineState;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alert::AlertSink;
use crate::clock::{SharedClock, SystemClock};
use crate::compression::StandardCodec;
use crate::config::EngineConfig;
use crate::registry::{ConfigError, ConfigRegistry, SyncDefaults};
use crate::retention::RetentionEvaluator;
use crate::scheduler::{SchedulerError, SchedulerSettings, SyncScheduler};
use crate::similarity::SimilarityIndex;
use crate::storage::memory::MemoryBackend;
use crate::storage::traits::{RecordBackend, StorageError};
use crate::store::{RecordStore, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine is {state}, cannot {operation}")]
    InvalidState { state: EngineState, operation: &'static str },

    #[error("sql_url is set but loom-store was built without the `sqlite` feature")]
    SqlUnavailable,

    #[error("no similarity index configured")]
    NoSimilarityIndex,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Background tasks owned by a running engine.
#[derive(Default)]
struct BackgroundTasks {
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Record store, retention evaluator and sync scheduler behind one handle.
///
/// The engine is `Send + Sync`; share it behind an `Arc`.
pub struct LoomEngine {
    /// Current configuration, replaced when the watch channel changes
    pub(super) config: Arc<RwLock<EngineConfig>>,

    /// Taken by `start()` for the config watcher
    pub(super) config_rx: Mutex<Option<watch::Receiver<EngineConfig>>>,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) store: Arc<RecordStore>,
    pub(super) registry: Arc<ConfigRegistry>,
    pub(super) alerts: AlertSink,
    pub(super) evaluator: Arc<RetentionEvaluator>,
    pub(super) scheduler: Arc<SyncScheduler>,
    pub(super) similarity: Option<Arc<dyn SimilarityIndex>>,

    /// Kept to close the pool on shutdown
    #[cfg(feature = "sqlite")]
    pub(super) sql: Option<Arc<crate::storage::sql::SqlBackend>>,

    tasks: Mutex<BackgroundTasks>,
}

impl LoomEngine {
    /// Open the backend named by `config` and assemble the engine.
    ///
    /// With `sql_url` set the SQLite backend is opened (and its schema
    /// created); otherwise records live in memory. The engine starts in
    /// `Created`; call [`start()`](Self::start) for background work.
    #[tracing::instrument(skip(config, config_rx), fields(backend))]
    pub async fn open(
        config: EngineConfig,
        config_rx: watch::Receiver<EngineConfig>,
    ) -> Result<Self, EngineError> {
        let phase_start = Instant::now();

        let Some(url) = config.sql_url.clone() else {
            tracing::Span::current().record("backend", "memory");
            let engine = Self::with_backend(config, config_rx, Arc::new(MemoryBackend::new()), Arc::new(SystemClock));
            crate::metrics::record_startup_phase("backend_open", phase_start.elapsed());
            return Ok(engine);
        };

        tracing::Span::current().record("backend", "sqlite");
        let engine = Self::open_sql(config, config_rx, &url).await?;
        crate::metrics::record_startup_phase("backend_open", phase_start.elapsed());
        Ok(engine)
    }

    #[cfg(feature = "sqlite")]
    async fn open_sql(
        config: EngineConfig,
        config_rx: watch::Receiver<EngineConfig>,
        url: &str,
    ) -> Result<Self, EngineError> {
        info!(url = %url, "Opening SQL backend");
        let sql = Arc::new(crate::storage::sql::SqlBackend::new(url).await?);
        let mut engine = Self::with_backend(config, config_rx, sql.clone(), Arc::new(SystemClock));
        engine.sql = Some(sql);
        Ok(engine)
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_sql(
        _config: EngineConfig,
        _config_rx: watch::Receiver<EngineConfig>,
        url: &str,
    ) -> Result<Self, EngineError> {
        tracing::warn!(url = %url, "SQL backend requested but not compiled in");
        Err(EngineError::SqlUnavailable)
    }

    /// Assemble an engine over an already-open backend and clock.
    pub fn with_backend(
        config: EngineConfig,
        config_rx: watch::Receiver<EngineConfig>,
        backend: Arc<dyn RecordBackend>,
        clock: SharedClock,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let store = Arc::new(
            RecordStore::new(backend)
                .with_codec(Arc::new(StandardCodec::new(config.zstd_level)))
                .with_clock(clock.clone()),
        );
        let registry = Arc::new(ConfigRegistry::new(
            clock,
            SyncDefaults {
                batch_size: config.default_batch_size,
                retry_count: config.default_retry_count,
            },
        ));
        let alerts = AlertSink::new(config.alert_channel_capacity);
        let evaluator = Arc::new(RetentionEvaluator::new(
            store.clone(),
            registry.clone(),
            alerts.clone(),
            config.downsample_window(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            registry.clone(),
            alerts.clone(),
            SchedulerSettings::from(&config),
        ));

        info!(backend = store.backend().name(), "Loom engine assembled");
        crate::metrics::set_engine_state(EngineState::Created.as_str());

        Self {
            config: Arc::new(RwLock::new(config)),
            config_rx: Mutex::new(Some(config_rx)),
            state: state_tx,
            state_rx,
            store,
            registry,
            alerts,
            evaluator,
            scheduler,
            similarity: None,
            #[cfg(feature = "sqlite")]
            sql: None,
            tasks: Mutex::new(BackgroundTasks::default()),
        }
    }

    /// Attach the entity similarity collaborator.
    #[must_use]
    pub fn with_similarity(mut self, index: Arc<dyn SimilarityIndex>) -> Self {
        self.similarity = Some(index);
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Snapshot of the configuration currently in effect.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn evaluator(&self) -> &Arc<RetentionEvaluator> {
        &self.evaluator
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    pub(super) fn ensure_serving(&self, operation: &'static str) -> Result<(), EngineError> {
        let state = self.state();
        if state.is_serving() {
            Ok(())
        } else {
            Err(EngineError::InvalidState { state, operation })
        }
    }
}
