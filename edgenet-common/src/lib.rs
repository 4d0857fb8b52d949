//! # edgenet Common
//!
//! Shared utilities for the edgenet components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use edgenet_common::{init_logging, LogFormat, TimedOperation};
//!
//! init_logging("info", LogFormat::Json).unwrap();
//!
//! let _timer = TimedOperation::new("attach");
//! // ... work ...
//! // elapsed time is logged when `_timer` is dropped
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    LogFormat,
    TimedOperation,
};
