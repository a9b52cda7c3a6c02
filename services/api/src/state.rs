//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources
//! shared by every handler.

use crate::config::Config;
use assessor_core::orchestrator::SessionOrchestrator;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub config: Arc<Config>,
}
