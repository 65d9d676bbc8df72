//! # rscx-core
//!
//! Statechart interpreter for rscx.
//!
//! This crate provides:
//! - Chart definition parsing, validation and compilation
//! - The immutable interpreter model (states, transitions, executable content)
//! - The macrostep/microstep interpretation algorithm
//! - Condition and value expression evaluation
//! - Logging, communication and persistence boundaries

pub mod communication;
pub mod context;
pub mod definition;
pub mod error;
pub mod event;
pub mod exec;
pub mod expr;
pub mod ident;
pub mod interpreter;
pub mod logger;
pub mod model;
pub mod options;
pub mod persistence;

pub use communication::{ExternalCommunication, InvokeData, NullCommunication};
pub use context::{Invocation, RuntimeContext};
pub use definition::{ChartDefinition, ModelBuilder};
pub use error::{BoxError, CoreError, ErrorType, ExecutionError, PlatformError};
pub use event::{Event, EventType, OutgoingEvent};
pub use expr::{Expr, Scope};
pub use ident::{EventDescriptor, EventName, Identifier, InvokeId, SendId, SessionId};
pub use interpreter::Interpreter;
pub use logger::{InterpreterLogger, LogContext, TraceRecord, TracingLogger};
pub use model::{CustomAction, InterpreterModel, StateIdx};
pub use options::{
    EventSource, ExitStatus, InterpreterOptions, InterpreterState, StateChangeObserver,
    DEFAULT_MAX_MICROSTEPS,
};
pub use persistence::{Bucket, FileStorage, InMemoryStorage, StorageProvider};
