//! # Tessera
//!
//! **In-process instrumentation pipeline**
//!
//! Tessera wraps units of work in a priority-ordered middleware chain and
//! ships four stages out of the box:
//!
//! - **Error handling** – maps failures to status codes and safe responses
//! - **Logging** – structured start/complete/error records with redaction
//! - **Performance** – timing, memory deltas and threshold warnings
//! - **Analytics** – sampled, buffered events flushed in batches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new().with_env_prefix("TESSERA").load()?;
//!     let instrumentation = Instrumentation::from_config(config, None)?;
//!     instrumentation.start();
//!
//!     let mut ctx = ExecutionContext::new("fetchQuestions");
//!     let outcome = instrumentation
//!         .execute_with(&mut ctx, |_ctx| Box::pin(async { Ok(serde_json::json!([])) }))
//!         .await?;
//!
//!     instrumentation.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! execute → ErrorHandling(100) → Logging(90) → Performance(80) → Analytics(70) → operation
//!                                                   │                 │
//!                                                   └──── EventBus ───┴──→ subscribers / sink
//! ```

#![doc(html_root_url = "https://docs.rs/tessera/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod instrumentation;

pub use instrumentation::{Instrumentation, InstrumentationError};

// Re-export core types
pub use tessera_core as core;

// Re-export configuration
pub use tessera_config as config;

// Re-export the chain and stages
pub use tessera_middleware as middleware;

// Re-export logging and metrics setup
pub use tessera_telemetry as telemetry;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust,ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use crate::instrumentation::{Instrumentation, InstrumentationError};

    pub use tessera_config::{ConfigLoader, Environment, PipelineConfig};

    pub use tessera_core::{
        ErrorResponse, ExecutionContext, MiddlewareError, OperationError, RequestId,
    };

    pub use tessera_middleware::{
        EmitError, EventBus, EventSink, FnMiddleware, Middleware, MiddlewareManager, Outcome,
        PipelineEvent,
    };

    pub use tessera_telemetry::init_telemetry;
}
