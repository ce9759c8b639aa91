//! # Tessera Core
//!
//! Core types shared by every Tessera crate:
//!
//! - [`ExecutionContext`] - Mutable per-call record passed down the chain
//! - [`RequestId`] - UUID v7 correlation id
//! - [`MiddlewareError`] / [`OperationError`] - Pipeline error taxonomy
//! - [`ErrorResponse`] - Structured failure produced by the error handler

#![doc(html_root_url = "https://docs.rs/tessera-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;

pub use context::{
    Checkpoint, ExecutionContext, ExecutionMetadata, PerformanceTracking, RequestId, Thresholds,
};
pub use error::{
    ErrorCategory, ErrorEnvelope, ErrorKind, ErrorResponse, MiddlewareError, OperationError,
};
pub use tessera_config::{Environment, PipelineConfig};
