//! Plugin Layer
//!
//! Runs the external collection program that performs the actual SSH-based
//! login and metric collection. The orchestrator and the plugin talk over a
//! line protocol on stdin/stdout (see [`protocol`]); one process handles one
//! [`PluginRequest`] batch.
//!
//! - [`PluginInvoker`]: process lifecycle, streaming result decoding, timeout
//! - [`Dispatch`]: fire-and-forget submission seam used by the scheduler and
//!   the discovery runner

mod invoker;
pub mod protocol;

use thiserror::Error;

pub use invoker::{Invocation, InvocationExit, PluginConfig, PluginInvoker};
pub use protocol::{Category, PluginRequest, PluginResult, PluginTarget, ResultStatus};

/// Errors raised while talking to a plugin process.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The executable could not be started.
    #[error("failed to start plugin: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading from or writing to the process failed.
    #[error("plugin i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be serialized.
    #[error("failed to encode plugin request: {0}")]
    Encode(#[from] serde_json::Error),

    /// A result line could not be decoded.
    #[error("failed to decode plugin output: {0}")]
    Decode(String),
}

/// Accepts plugin requests for asynchronous execution.
///
/// `submit` never blocks the caller; results flow to the aggregator.
pub trait Dispatch: Send + Sync + 'static {
    fn submit(&self, request: PluginRequest);
}
