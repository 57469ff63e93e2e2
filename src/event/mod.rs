//! # Readiness Events
//!
//! Modules mounted by the shell are built and deployed independently, so they
//! cannot call into each other directly. They coordinate through a shared bus
//! instead: they exchange named events and announce when they are ready to be
//! interacted with.
//!
//! ## Components
//!
//! - **ReadinessBus**: publish/subscribe dispatch plus the per-module readiness flags
//! - **WaitRegistry**: waits on a set of modules, woken by announcements
//! - **EventType**: the event names the shell and its modules agree on
//!
//! ## Flow
//!
//! ```text
//! ┌──────────┐ announce_ready ┌──────────────┐  deferred events  ┌──────────┐
//! │  Module  │───────────────▶│ ReadinessBus │──────────────────▶│Subscriber│
//! └──────────┘                └──────┬───────┘                   └──────────┘
//!                                    │ wake
//!                              ┌─────▼──────┐
//!                              │WaitRegistry│
//!                              └────────────┘
//! ```
//!
//! 1. A module (or the load manager on its behalf) announces readiness
//! 2. Events queued for that module are delivered, in arrival order
//! 3. Every wait whose last missing module was this one is woken
//!
//! ## Usage
//!
//! ```rust
//! # use shell_loader::event_bus::ReadinessBus;
//! # use shell_loader::event_types::EventType;
//! # use serde_json::json;
//! let bus = ReadinessBus::default();
//! let _subscription = bus.subscribe(EventType::DataSync.as_str(), |data| {
//!     println!("sync requested: {}", data);
//!     Ok(())
//! });
//!
//! // Held back until "contacts" is ready
//! bus.emit_when_ready("contacts", EventType::DataSync.as_str(), json!({ "full": true }));
//! bus.announce_ready("contacts");
//! ```

pub mod event_bus;
pub mod event_types;
mod wait_registry;
