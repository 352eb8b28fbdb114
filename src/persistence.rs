//! Model bundle persistence: K-Means state, scaler and metadata as JSON

use crate::config::SegmentationConfig;
use crate::data::RfmFeature;
use crate::error::SegmentationError;
use crate::features::StandardScaler;
use crate::model::{KMeansModel, ModelMetrics};
use crate::segmentation::{ClusterLabel, CustomerSegmentation, FittedSegmentation};
use chrono::{DateTime, Utc};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MODEL_FILE: &str = "kmeans_model.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const METADATA_FILE: &str = "model_info.json";

/// Contents of `model_info.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub feature_names: Vec<String>,
    /// Cluster index (stringified) to label
    pub cluster_labels: BTreeMap<String, ClusterLabel>,
    pub n_clusters: usize,
    pub model_metrics: ModelMetrics,
    pub random_state: u64,
    pub saved_at: DateTime<Utc>,
}

impl ModelMetadata {
    fn from_fitted(fitted: &FittedSegmentation, random_state: u64) -> Self {
        Self {
            feature_names: fitted.feature_names(),
            cluster_labels: fitted
                .cluster_labels
                .iter()
                .map(|(cluster, label)| (cluster.to_string(), *label))
                .collect(),
            n_clusters: fitted.n_clusters(),
            model_metrics: fitted.model_metrics.clone(),
            random_state,
            saved_at: Utc::now(),
        }
    }
}

/// Write the three bundle artifacts into `dir`, creating it if needed
pub fn save_bundle(
    fitted: &FittedSegmentation,
    random_state: u64,
    dir: impl AsRef<Path>,
) -> crate::Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    write_json(&dir.join(MODEL_FILE), &fitted.kmeans)?;
    write_json(&dir.join(SCALER_FILE), &fitted.scaler)?;
    write_json(
        &dir.join(METADATA_FILE),
        &ModelMetadata::from_fitted(fitted, random_state),
    )?;

    info!("Model saved to {}", dir.display());
    Ok(())
}

/// Read a bundle written by [`save_bundle`] and check it is self-consistent
pub fn load_bundle(dir: impl AsRef<Path>) -> crate::Result<(FittedSegmentation, ModelMetadata)> {
    let dir = dir.as_ref();
    let kmeans: KMeansModel = read_json(&dir.join(MODEL_FILE))?;
    let scaler: StandardScaler = read_json(&dir.join(SCALER_FILE))?;
    let metadata: ModelMetadata = read_json(&dir.join(METADATA_FILE))?;

    let feature_names = metadata
        .feature_names
        .iter()
        .map(|name| name.parse::<RfmFeature>())
        .collect::<crate::Result<Vec<_>>>()?;

    let cluster_labels = metadata
        .cluster_labels
        .iter()
        .map(|(key, label)| {
            key.parse::<usize>()
                .map(|cluster| (cluster, *label))
                .map_err(|_| SegmentationError::MalformedValue {
                    column: "cluster_labels".to_string(),
                    row: 0,
                    reason: format!("cluster key '{}' is not an index", key),
                })
        })
        .collect::<crate::Result<BTreeMap<_, _>>>()?;

    check_dimension(metadata.n_clusters, kmeans.n_clusters)?;
    check_dimension(metadata.n_clusters, kmeans.centroids.nrows())?;
    check_dimension(feature_names.len(), kmeans.n_features())?;
    check_dimension(feature_names.len(), scaler.n_features())?;
    check_dimension(scaler.mean.len(), scaler.scale.len())?;
    if (0..metadata.n_clusters).any(|cluster| !cluster_labels.contains_key(&cluster)) {
        return Err(SegmentationError::MalformedValue {
            column: "cluster_labels".to_string(),
            row: 0,
            reason: format!("expected a label for each of {} clusters", metadata.n_clusters),
        });
    }

    let fitted = FittedSegmentation {
        kmeans,
        scaler,
        feature_names,
        cluster_labels,
        model_metrics: metadata.model_metrics.clone(),
    };
    Ok((fitted, metadata))
}

impl CustomerSegmentation {
    /// Persist the fitted model as a bundle directory
    pub fn save_model(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        save_bundle(self.fitted()?, self.random_state(), path)
    }

    /// Replace this model's state with a saved bundle
    ///
    /// The configured cluster count and seed are taken from the bundle.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        let (fitted, metadata) = load_bundle(path)?;
        let config = SegmentationConfig {
            n_clusters: metadata.n_clusters,
            random_state: metadata.random_state,
            ..self.config().clone()
        };
        *self = CustomerSegmentation::from_fitted(config, fitted);
        Ok(())
    }

    /// Construct a fitted model directly from a saved bundle
    pub fn from_saved(path: impl AsRef<Path>) -> crate::Result<Self> {
        let mut model = Self::default();
        model.load_model(path)?;
        Ok(model)
    }
}

fn check_dimension(expected: usize, actual: usize) -> crate::Result<()> {
    if expected != actual {
        return Err(SegmentationError::FeatureMismatch { expected, actual });
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::sample_rfm;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_model() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let temp_dir = tempdir().unwrap();
        let model_path = temp_dir.path().join("test_model");
        model.save_model(&model_path).unwrap();

        assert!(model_path.join(MODEL_FILE).exists());
        assert!(model_path.join(SCALER_FILE).exists());
        assert!(model_path.join(METADATA_FILE).exists());

        let mut loaded = CustomerSegmentation::default();
        loaded.load_model(&model_path).unwrap();

        assert!(loaded.is_fitted());
        assert_eq!(loaded.n_clusters(), model.n_clusters());
        assert_eq!(loaded.random_state(), 42);

        let original = model.fitted().unwrap();
        let restored = loaded.fitted().unwrap();
        assert_eq!(restored.feature_names, original.feature_names);
        assert_eq!(restored.cluster_labels, original.cluster_labels);
        assert_eq!(restored.kmeans.centroids, original.kmeans.centroids);
        assert_eq!(restored.scaler, original.scaler);
        assert_eq!(restored.model_metrics, original.model_metrics);

        assert_eq!(model.predict(&rfm).unwrap(), loaded.predict(&rfm).unwrap());
    }

    #[test]
    fn test_metadata_schema() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let temp_dir = tempdir().unwrap();
        model.save_model(temp_dir.path()).unwrap();

        let raw = fs::read_to_string(temp_dir.path().join(METADATA_FILE)).unwrap();
        let info: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(info["n_clusters"], 3);
        assert_eq!(info["feature_names"].as_array().unwrap().len(), 5);
        assert_eq!(info["feature_names"][0], "recency_days");
        assert!(info["cluster_labels"]["0"].is_string());
        assert!(info["model_metrics"]["final_inertia"].is_number());
    }

    #[test]
    fn test_save_model_without_fitting() {
        let model = CustomerSegmentation::with_params(3, 42);
        let temp_dir = tempdir().unwrap();

        let err = model.save_model(temp_dir.path().join("test_model")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!temp_dir.path().join("test_model").exists());
    }

    #[test]
    fn test_load_missing_bundle() {
        let temp_dir = tempdir().unwrap();
        let mut model = CustomerSegmentation::default();

        assert!(model.load_model(temp_dir.path().join("absent")).is_err());
        assert!(!model.is_fitted());
    }

    #[test]
    fn test_load_rejects_inconsistent_bundle() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let temp_dir = tempdir().unwrap();
        model.save_model(temp_dir.path()).unwrap();

        let truncated = StandardScaler {
            mean: vec![0.0; 4],
            scale: vec![1.0; 4],
        };
        write_json(&temp_dir.path().join(SCALER_FILE), &truncated).unwrap();

        assert!(matches!(
            CustomerSegmentation::from_saved(temp_dir.path()),
            Err(SegmentationError::FeatureMismatch { expected: 5, actual: 4 })
        ));
    }
}
