//! Vehicle Signal Manager core: the rule compiler and the policy engine.
//!
//! The library is strictly synchronous and single-threaded. Callers feed
//! `(name, value, timestamp)` updates and logical-time advances into
//! [`engine::PolicyEngine`] and receive emissions and violation reports;
//! transports, clocks and files live in the `vsm` binary.

pub mod capture;
pub mod compiler;
pub mod engine;
pub mod events;
pub mod expr;
pub mod sched;
pub mod signals;
pub mod types;
pub mod wire;

pub use engine::{MonitorPhase, PolicyEngine};
pub use events::{Emission, OutputEvent, ViolationReport};
pub use types::{Program, Timestamp, Truth, Value};
