//! # Boatswain
//!
//! A resource-aware task dispatch engine for storage appliance middleware.
//!
//! This library provides the execution layer behind long-running management
//! operations on a NAS appliance: RAID rebuilds, volume scrubs, pool
//! migrations, firmware flashes. Callers submit named tasks with JSON
//! arguments; the dispatcher verifies them, admits them against a hierarchy of
//! hardware resources, and runs each one in an out-of-process worker so a
//! crashing handler can never take the control plane down with it.
//!
//! ## Core Problem Solved
//!
//! Appliance management operations have fundamentally different constraints
//! than web request handling:
//!
//! - **Exclusive Hardware**: Two tasks touching the same disk, or a disk and
//!   its enclosing pool, must never overlap
//! - **Crash Isolation**: Handler code links vendor libraries; a segfault must
//!   cost one task, not the management daemon
//! - **Restart Accounting**: After a power cut the appliance must report what
//!   was in flight as failed rather than silently forgetting it
//! - **Long Horizons**: A rebuild runs for hours and must stay observable and
//!   abortable the whole time
//!
//! ## Key Features
//!
//! - **Hierarchical Resource Admission**: Tasks name the resource nodes they
//!   need; admission waits while any named node, ancestor, or descendant is
//!   busy
//! - **Out-of-Process Workers**: Each executor slot supervises a worker
//!   process over a unix socket; worker death fails the task and the slot
//!   respawns
//! - **Cooperative Abort**: Abortable handlers get a grace period to wind
//!   down; unabortable or unresponsive ones are killed
//! - **Durable Task Log**: Every state transition is persisted, and recovery
//!   rewrites tasks the previous process left in flight to failed
//! - **Event Bus**: State changes and progress updates fan out to any number
//!   of subscribers
//!
//! ## Submitting Work
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use boatswain::builders::BalancerBuilder;
//! use boatswain::config::DispatcherConfig;
//! use boatswain::core::handler::HandlerRegistry;
//! use serde_json::json;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("volume_scrub", Arc::new(ScrubHandler));
//!
//! let balancer = BalancerBuilder::new(DispatcherConfig::default(), Arc::new(registry))
//!     .build()?;
//! balancer.register_resource("pool-1", vec!["system".into()]).await?;
//!
//! let id = balancer.submit("volume_scrub", vec![json!("pool-1")], "admin-ui")?;
//! let record = balancer.wait(id).await?;
//! ```
//!
//! For complete examples, see:
//! - `tests/dispatch_test.rs` - Full integration tests
//! - `src/bin/boatswain-worker.rs` - The worker-side binary

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, resource graph, handlers, events, and error types.
pub mod core;
/// Configuration models for the dispatcher and its worker backend.
pub mod config;
/// Builders to construct a running balancer from configuration.
pub mod builders;
/// Task distribution: the balancer facade, its loop, and executor slots.
pub mod scheduler;
/// Durable task log backends.
pub mod store;
/// Shared utilities.
pub mod util;
/// Worker protocol, connections, launchers, and the worker-side runtime.
pub mod worker;
