// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine coordinator.

use std::fmt;

/// Engine lifecycle state.
///
/// Watch transitions with [`super::LoomEngine::state_receiver()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Opened, background tasks not running yet
    Created,
    /// Spawning the evaluator and config watcher
    Starting,
    /// Evaluator running, pairs may be connected
    Running,
    /// Disconnecting pairs and stopping the evaluator
    ShuttingDown,
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the engine accepts reads, writes and sync calls.
    ///
    /// Everything except `Stopped`: an engine that was never started
    /// still serves the store, it just runs no background work.
    #[must_use]
    pub fn is_serving(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
