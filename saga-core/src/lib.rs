//! Orchestration engine for long-running serialized fiction.
//!
//! This crate provides:
//! - A canon store that resolves contradictory facts by authority
//! - World-constraint extraction from a foundational document
//! - A beat ledger that keeps narrative devices from repeating too often
//! - Arc and tension planning with scheduled twists
//! - Tiered, budget-bounded context assembly
//! - A quality gate with bounded auto-rewrite
//! - A runner that drives one story from premise to target length
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use saga_core::generation::ClaudeGenerator;
//! use saga_core::persist::JsonFileStore;
//! use saga_core::runner::{RunConfig, Runner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::new("ember", "A courier carries a forbidden letter.")
//!         .with_target(30)
//!         .with_arc_size(10);
//!
//!     let generator = Arc::new(ClaudeGenerator::from_env()?);
//!     let store = Arc::new(JsonFileStore::new("stories"));
//!     let mut runner = Runner::new(config, generator, store);
//!
//!     let result = runner.run().await;
//!     println!("wrote {} installments", result.installments_written);
//!     Ok(())
//! }
//! ```

pub mod beats;
pub mod canon;
pub mod context;
pub mod generation;
pub mod memory;
pub mod persist;
pub mod planning;
pub mod prompts;
pub mod quality;
pub mod runner;
pub mod testing;
pub mod text;

// Primary public API
pub use canon::{AuthorityLevel, CanonStore, Fact, FactValue, Registration};
pub use generation::{GenerationError, Generator};
pub use persist::{JsonFileStore, MemoryStore, StoryStore};
pub use runner::{RunConfig, RunResult, Runner, RunnerHandle, RunnerStatus};
pub use testing::{MockGenerator, TestHarness};
