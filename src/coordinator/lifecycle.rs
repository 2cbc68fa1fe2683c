// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start, config watching, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::retention::RetentionEvaluator;

use super::{BackgroundTasks, EngineError, EngineState, LoomEngine};

impl LoomEngine {
    /// Spawn the retention evaluator and the config watcher.
    ///
    /// Must be called from inside a tokio runtime. Fails unless the
    /// engine is still `Created`.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(EngineError::InvalidState { state, operation: "start" });
        }
        let start = Instant::now();
        self.set_state(EngineState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config_rx = self.config_rx.lock().take();
        let supervisor = tokio::spawn(supervise(
            self.evaluator.clone(),
            self.config.clone(),
            config_rx,
            shutdown_rx,
        ));
        *self.tasks.lock() = BackgroundTasks {
            shutdown: Some(shutdown_tx),
            supervisor: Some(supervisor),
        };

        crate::metrics::record_startup_phase("start", start.elapsed());
        self.set_state(EngineState::Running);
        info!("Loom engine running");
        Ok(())
    }

    /// Disconnect every pair, stop the evaluator and close the backend.
    ///
    /// In-flight batches go back to pending. A retention pass in progress
    /// finishes first. Calling this twice is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let shutdown_start = Instant::now();
        info!("Initiating loom engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.scheduler.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if let Some(tx) = tasks.shutdown {
            let _ = tx.send(true);
        }
        if let Some(task) = tasks.supervisor {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine supervisor ended abnormally");
            }
        }

        #[cfg(feature = "sqlite")]
        if let Some(sql) = &self.sql {
            sql.close().await;
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        self.set_state(EngineState::Stopped);
        info!("Loom engine shutdown complete");
    }
}

struct EvaluatorTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    interval: Duration,
}

impl EvaluatorTask {
    fn spawn(evaluator: &Arc<RetentionEvaluator>, interval: Duration) -> Self {
        let (stop, rx) = watch::channel(false);
        let task = evaluator.clone().spawn(interval, rx);
        Self { stop, task, interval }
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Retention evaluator ended abnormally");
        }
    }
}

/// Fields that only take effect when a new engine is opened.
fn restart_only_changed(old: &EngineConfig, new: &EngineConfig) -> bool {
    let comparable = EngineConfig {
        evaluator_interval_secs: old.evaluator_interval_secs,
        ..new.clone()
    };
    comparable != *old
}

/// Owns the evaluator task and applies config updates until shutdown.
async fn supervise(
    evaluator: Arc<RetentionEvaluator>,
    config: Arc<RwLock<EngineConfig>>,
    config_rx: Option<watch::Receiver<EngineConfig>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial = config.read().evaluator_interval();
    let mut current = EvaluatorTask::spawn(&evaluator, initial);

    let mut watching = config_rx.is_some();
    let (_idle_tx, idle_rx) = watch::channel(EngineConfig::default());
    let mut config_rx = config_rx.unwrap_or(idle_rx);

    loop {
        tokio::select! {
            changed = config_rx.changed(), if watching => {
                if changed.is_err() {
                    debug!("Config sender dropped, no further updates");
                    watching = false;
                    continue;
                }
                let new_config = config_rx.borrow_and_update().clone();
                let old_config = std::mem::replace(&mut *config.write(), new_config.clone());
                if restart_only_changed(&old_config, &new_config) {
                    warn!("Config changed for fields that apply on the next open only");
                }

                let interval = new_config.evaluator_interval();
                if interval != current.interval {
                    info!(
                        old_ms = current.interval.as_millis() as u64,
                        new_ms = interval.as_millis() as u64,
                        "Restarting retention evaluator with new interval"
                    );
                    current.stop().await;
                    current = EvaluatorTask::spawn(&evaluator, interval);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    current.stop().await;
}
