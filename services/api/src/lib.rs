//! Assessor API Library Crate
//!
//! This library contains the web service around the assessment orchestrator:
//! configuration, SQLite persistence, channel adapters (chat, WhatsApp, A2A),
//! API handlers, the chat WebSocket and routing. The `api` binary is a thin
//! wrapper around this library.

pub mod channels;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
