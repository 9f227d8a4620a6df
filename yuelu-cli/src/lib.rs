//! Command-line launcher for the YueLu chat agent.
//!
//! Builds or rebuilds the vector index, answers one-shot questions and runs
//! an interactive chat session against an OpenAI-compatible embedding
//! service and a locally served language model.

pub mod app;
pub mod cli;

pub use app::run;
pub use cli::{Cli, Command, Settings};
