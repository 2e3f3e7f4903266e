//! Task Relay — a scheduler brokering Ask/Answer exchanges between
//! executors and an LLM-backed answer runner.

pub mod bridge;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod llm;
pub mod manager;
pub mod mcp;
pub mod runner;
pub mod store;
pub mod worker;
