//! Pipeline configuration

use crate::error::SegmentationError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for clustering and cluster-count selection.
///
/// Every field has a default, so a JSON config file only needs to name
/// the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Cluster count used when the optimal-k sweep is disabled
    pub n_clusters: usize,
    /// Seed for centroid initialisation
    pub random_state: u64,
    /// Upper bound of the optimal-k sweep
    pub max_clusters: usize,
    /// Maximum Lloyd iterations per K-Means run
    pub max_iterations: u64,
    /// Convergence tolerance on centroid movement
    pub tolerance: f64,
    /// K-Means restarts; the lowest-inertia run is kept
    pub n_runs: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            n_clusters: 5,
            random_state: 42,
            max_clusters: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            n_runs: 10,
        }
    }
}

impl SegmentationConfig {
    pub fn new(n_clusters: usize, random_state: u64) -> Self {
        Self {
            n_clusters,
            random_state,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.n_clusters < 2 {
            return Err(SegmentationError::InvalidConfig(format!(
                "n_clusters must be at least 2, got {}",
                self.n_clusters
            )));
        }
        if self.max_clusters < 2 {
            return Err(SegmentationError::InvalidConfig(format!(
                "max_clusters must be at least 2, got {}",
                self.max_clusters
            )));
        }
        if self.max_iterations == 0 || self.n_runs == 0 {
            return Err(SegmentationError::InvalidConfig(
                "max_iterations and n_runs must be positive".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(SegmentationError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SegmentationConfig::default();
        assert_eq!(config.n_clusters, 5);
        assert_eq!(config.random_state, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"n_clusters": 4, "random_state": 123}}"#).unwrap();

        let config = SegmentationConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.n_clusters, 4);
        assert_eq!(config.random_state, 123);
        assert_eq!(config.max_clusters, 10);
    }

    #[test]
    fn test_invalid_config() {
        let config = SegmentationConfig::new(1, 42);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parameter);

        let config = SegmentationConfig {
            tolerance: 0.0,
            ..SegmentationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
