//! # yuelu-mistralrs
//!
//! In-process [mistral.rs](https://github.com/EricLBuehler/mistral.rs) backend
//! for the YueLu chat agent. Implements [`yuelu_rag::LanguageModel`], so a
//! fine-tuned local model can answer questions without a separate inference
//! server.
//!
//! > **Note:** This crate is NOT published to crates.io because mistral.rs depends on
//! > unpublished git dependencies. It is excluded from the workspace; build it with
//! > `cargo build --manifest-path yuelu-mistralrs/Cargo.toml`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use yuelu_mistralrs::MistralRsModel;
//! use yuelu_rag::RagService;
//!
//! let model = MistralRsModel::from_local("models/yuelu-qwen-merged").await?;
//! let service = RagService::builder()
//!     .embedding_provider(embedder)
//!     .language_model(Arc::new(model))
//!     .build()?;
//! ```

mod config;
mod error;
mod model;

pub use config::*;
pub use error::*;
pub use model::*;
