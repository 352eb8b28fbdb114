//! RfmForge: customer segmentation from transaction history
//!
//! Builds RFM (Recency, Frequency, Monetary) features per customer, scores
//! them with quintile rules, and clusters them with K-Means into labelled
//! segments with per-customer recommendations.

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod insights;
pub mod model;
pub mod persistence;
pub mod scoring;
pub mod segmentation;
pub mod selection;
pub mod tracking;

// Re-export public items for easier access
pub use cli::Args;
pub use config::SegmentationConfig;
pub use data::{
    calculate_rfm_features, calculate_rfm_from_transactions, load_transactions, RfmFeature,
    RfmRow, RfmTable, Transaction,
};
pub use error::{ErrorKind, SegmentationError};
pub use features::{prepare_features, StandardScaler, CLUSTERING_FEATURES};
pub use insights::CustomerInsight;
pub use model::{cluster_sizes, KMeansModel, MetricValue, ModelMetrics};
pub use persistence::{load_bundle, save_bundle, ModelMetadata};
pub use scoring::{create_rfm_scores, segment_distribution, CustomerSegment, ScoredRfmRow};
pub use segmentation::{ClusterLabel, ClusterProfile, CustomerSegmentation, FittedSegmentation};
pub use selection::{find_optimal_clusters, ClusterSelection};
pub use tracking::{ExperimentTracker, FileTracker, RunStatus, TrackingRun};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, SegmentationError>;
