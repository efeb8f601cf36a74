//! Image processors
//!
//! Pixel work is delegated to [`Processor`] implementations. Processors are
//! tried in registration order; the first one that handles the parameters
//! produces the output, and one that does not recognize them declines so the
//! next can try. If every processor declines, the original passes through.

use crate::blob::Blob;
use crate::error::Result;
use crate::params::Params;
use async_trait::async_trait;

/// Outcome of a processor invocation
#[derive(Debug, Clone)]
pub enum Processed {
    /// The processor produced a new blob
    Transformed(Blob),
    /// The processor does not handle these parameters
    Declined,
}

/// Transforms a blob according to parameters
#[async_trait]
pub trait Processor: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// Called once by [`Orchestrator::startup`](crate::Orchestrator::startup)
    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    async fn process(&self, blob: &Blob, params: &Params) -> Result<Processed>;

    /// Called once by [`Orchestrator::shutdown`](crate::Orchestrator::shutdown)
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
