//! # rscx-runtime
//!
//! Session runtime for rscx.
//!
//! This crate provides:
//! - Session controllers with an unbounded mailbox and lifecycle status
//! - Delayed sends with cancellation by send id
//! - Idle suspension to a snapshot and transparent resume
//! - A dispatch router resolving send targets and invoked child sessions
//! - YAML and environment based configuration

pub mod config;
pub mod controller;
pub mod error;
pub mod processor;
pub mod router;
pub mod scheduler;
pub mod service;

pub use config::{Config, ConfigError, RouterConfig, SessionConfig};
pub use controller::{SessionController, SessionOptions, SessionResult, SessionStatus};
pub use error::RuntimeError;
pub use processor::{EventProcessor, ScxmlProcessor, SCXML_PROCESSOR_ID};
pub use router::{DispatchRouter, RouterStats};
pub use scheduler::{ScheduledEvent, Scheduler};
pub use service::{validate_to_parent, ParentLink, PARENT_TARGET};
