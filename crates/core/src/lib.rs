//! Core of the conversational skills assessor.
//!
//! The crate is runtime-agnostic: channel adapters build an
//! [`orchestrator::InboundMessage`], hand it to the
//! [`orchestrator::SessionOrchestrator`], and deliver the returned
//! [`orchestrator::TurnReply`] in whatever form their channel needs.

pub mod candidate;
pub mod classifier;
pub mod evaluator;
pub mod llm_client;
pub mod media;
pub mod menu;
pub mod orchestrator;
pub mod prompt;
pub mod question_bank;
pub mod quiz;
pub mod retry;
pub mod session;
pub mod tools;
pub mod verdict;
