//! Error taxonomy for the segmentation pipeline

use thiserror::Error;

/// Broad class of a [`SegmentationError`], used by callers that only care
/// about who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or inconsistent input data.
    Input,
    /// Operation requires a fitted model.
    State,
    /// Invalid configuration or cluster-count bounds.
    Parameter,
    /// Filesystem, serialization or backend failure.
    Io,
}

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("transaction table is empty")]
    EmptyInput,

    #[error("missing required column '{column}'")]
    MissingColumn { column: String },

    #[error("malformed value in column '{column}' at row {row}: {reason}")]
    MalformedValue {
        column: String,
        row: usize,
        reason: String,
    },

    #[error("row count mismatch: {rows} RFM rows but {predictions} predictions")]
    LengthMismatch { rows: usize, predictions: usize },

    #[error("cluster index {cluster} is outside [0, {n_clusters})")]
    UnknownCluster { cluster: usize, n_clusters: usize },

    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("model is not fitted")]
    NotFitted,

    #[error("invalid cluster range: max_clusters={max_clusters} must be in [2, {n_customers}]")]
    InvalidClusterRange {
        max_clusters: usize,
        n_customers: usize,
    },

    #[error("cannot form {n_clusters} clusters from {n_customers} customers")]
    InvalidClusterCount {
        n_clusters: usize,
        n_customers: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("experiment tracking failed: {0}")]
    Tracking(String),

    #[error("data frame error: {0}")]
    Frame(#[from] polars::prelude::PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SegmentationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput
            | Self::MissingColumn { .. }
            | Self::MalformedValue { .. }
            | Self::LengthMismatch { .. }
            | Self::UnknownCluster { .. }
            | Self::FeatureMismatch { .. }
            | Self::UnknownFeature(_)
            | Self::Frame(_) => ErrorKind::Input,
            Self::NotFitted => ErrorKind::State,
            Self::InvalidClusterRange { .. }
            | Self::InvalidClusterCount { .. }
            | Self::InvalidConfig(_) => ErrorKind::Parameter,
            Self::Clustering(_) | Self::Tracking(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::Io
            }
        }
    }
}
