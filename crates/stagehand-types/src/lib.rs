//! Shared domain types for Stagehand.
//!
//! This crate contains the declarative shapes a task is built from: the
//! expression grammar, task/stage/dependency configuration, invocation
//! metadata, and the compiled dependency descriptors handed to a data access
//! provider.
//!
//! Zero engine dependencies -- only serde, serde_json, indexmap, thiserror.

pub mod dependency;
pub mod error;
pub mod expression;
pub mod invocation;
pub mod task;
