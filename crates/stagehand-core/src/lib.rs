//! Task engine for Stagehand.
//!
//! Resolves expressions against an invocation context, compiles each stage's
//! declared dependencies into descriptors, and drives the stage pipeline
//! against a [`provider::DataAccessProvider`]. Executing descriptors is the
//! provider's job; this crate never performs I/O beyond loading config files.

pub mod builders;
pub mod compiler;
pub mod config;
pub mod context;
pub mod depth;
pub mod executor;
pub mod expectation;
pub mod expression;
pub mod helpers;
pub mod log;
pub mod provider;
