//! # shell-loader: Module Loading for a Host Shell
//!
//! A host shell mounts UI modules that are built and deployed independently
//! of it and of each other. This crate coordinates their loading:
//!
//! - a module is fetched and initialized **at most once**, even when many
//!   callers request it concurrently ([`module_loader`])
//! - a module that declares dependencies does not start loading until those
//!   dependencies have **signaled readiness** ([`event`])
//! - readiness can be observed, queried and waited on with **bounded
//!   timeouts** ([`event`])
//!
//! ## Components
//!
//! ```text
//!            ┌──────────────┐
//!            │ ShellContext │  config, teardown, bridges
//!            └──────┬───────┘
//!       ┌───────────┼──────────────┐
//! ┌─────▼─────┐ ┌───▼─────────────┐ ┌▼─────────────┐
//! │ Dependency│ │ModuleLoadManager│ │ ShellBridge  │◀── modules
//! │   Graph   │ └───┬─────────────┘ └┬─────────────┘
//! └───────────┘     │ wait / announce │
//!               ┌───▼─────────────────▼┐
//!               │     ReadinessBus     │
//!               └──────────────────────┘
//! ```
//!
//! - Readiness bus and waits ([`event`])
//! - Dependency ordering ([`graph`])
//! - Single-flight loading ([`module_loader`])
//! - Shell lifecycle and the module bridge ([`shell`])
//! - Configuration ([`config`]) and errors ([`error`])
//!
//! The fetch of a module's remote artifact is outside this crate; it is
//! supplied per module as an async operation, or through [`shell::ModuleFetcher`].

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod module_loader;
pub mod shell;

// Re-exports
pub use error::*;
pub use event::*;
