//! Fan Vault Orchestrator
//!
//! Guardrailed, tool-calling chat service for Chiliz fan vaults. A vault
//! pairs a club persona with an on-chain prize pool; fans chat with the
//! vault's AI gatekeeper, which can read balances and send fan-token
//! rewards through a fixed tool set once a fan has earned them.
//!
//! Pipeline per turn: validate → guardrail classification → persona
//! system prompt → model turn with tools bound → concurrent tool
//! execution → final model turn, delivered in batch or as a stream.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod gemini;
pub mod guardrail;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod store;
pub mod tools;

pub use error::{ChatError, Result};
pub use orchestrator::ChatOrchestrator;
