//! Execution runtime for neuromorphic dataflow graphs.
//!
//! A compiled graph (an [`executable::Executable`]) describes a set of
//! workers, each owning state variables, grouped into sync domains. The
//! runtime turns that description into channel-connected actors and drives
//! them through a phased synchronization protocol:
//! - the [`runtime::Runtime`] controller exposes `initialize`, `start`,
//!   `wait`, `pause`, `stop` and host-side variable access;
//! - one [`service`] actor per sync domain sequences its workers through
//!   protocol phases and aggregates their upstream requests;
//! - [`channel`] provides the bounded word-FIFO ports and the readiness
//!   selector everything stands on.

// This module contains the definition of `WorkerId`, `ServiceId` and `VarId`.
pub mod id;

// This module contains the runtime configuration knobs.
pub mod config;

// This module contains the runtime error type.
pub mod error;

// This module contains the management tokens and wire framing helpers.
pub mod mgmt;

// This module contains the implementation of channel ports and the selector.
pub mod channel;

// This module contains the messaging infrastructure that spawns and owns
// actors.
pub mod infra;

// This module contains the executable data model consumed by the controller.
pub mod executable;

// This module contains the builders the compiler hands to the runtime.
pub mod builder;

// This module contains the worker-side protocol loop.
pub mod worker;

// This module contains the per-sync-domain runtime services.
pub mod service;

// This module contains the runtime controller.
pub mod runtime;

// Re-exports.
pub use error::{RunResult, RuntimeError};
pub use hashbrown::HashMap;
