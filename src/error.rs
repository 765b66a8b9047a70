//! Exporter error taxonomy.
//!
//! Everything inside a scrape rolls up to the HTTP handler as one of these;
//! init-time variants abort startup after LIFO cleanup.

use crate::dcgm::DcgmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    /// User configuration references entities or levels that do not exist.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backing library failed during enumeration.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A collector failed to fetch latest values during a scrape.
    #[error("collection error: {0}")]
    Collection(String),

    /// An identity source (pod-resources, Kubernetes API, HPC mapping) failed.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// The renderer saw a snapshot it cannot express.
    #[error("render error: {0}")]
    Render(String),

    #[error(transparent)]
    Dcgm(#[from] DcgmError),
}

pub type Result<T, E = ExporterError> = std::result::Result<T, E>;
