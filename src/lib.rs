//! NetPulse: periodic TLS/SMTP health checks arranged as a tree.
//!
//! ```text
//! Monitor (polling loop)
//!   └── CheckTree
//!         ├── CheckNode::Group ── AND of all children, evaluated in order
//!         └── CheckNode::{Tls, Smtp} ── one probe per pass
//!               └── StateTracker ── edge-triggered transitions
//!                     └── NotificationHub ── LogSink, StatusBoard, WebhookSink
//!
//! Lifecycle
//!   ├── status listener (axum)
//!   └── shutdown watcher ── graceful stop, hard-bounded by the grace period
//! ```
//!
//! A check notifies only when its health flips. The first observation is a
//! baseline: it reaches the status board but never counts as a transition.

pub mod api;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod probes;
