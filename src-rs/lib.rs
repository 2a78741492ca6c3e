//! Vision-driven desktop agent.
//!
//! Every cycle the agent captures the desktop, blends in its own overlay so
//! the oracle sees exactly what a user would, asks the oracle for one action,
//! validates it, injects it as hardware-equivalent input and draws what it did
//! back onto the overlay before the next capture.
//!
//! - [`coords`], [`raster`], [`frame`]: coordinate mapping, drawing and the
//!   pixel pipeline.
//! - [`capture`], [`input`], [`overlay`]: OS surfaces behind traits, with
//!   native backends under the `native` feature.
//! - [`action`], [`executor`], [`annotations`], [`history`]: what the agent
//!   may do and what it remembers.
//! - [`oracle`], [`agent`]: the decision source and the cycle driving it.

pub mod action;
pub mod agent;
pub mod annotations;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod coords;
pub mod error;
pub mod executor;
pub mod files;
pub mod frame;
pub mod history;
pub mod input;
pub mod logging;
pub mod oracle;
pub mod overlay;
pub mod raster;
pub mod run_log;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use agent::{AgentLoop, AgentParts, RunOutcome};
pub use config::AgentConfig;
pub use error::AgentError;
