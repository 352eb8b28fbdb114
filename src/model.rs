//! K-Means clustering model implementation

use crate::config::SegmentationConfig;
use crate::error::SegmentationError;
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A diagnostic value recorded during fitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Series(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Series(values)
    }
}

/// Named diagnostics, ordered by name
pub type ModelMetrics = BTreeMap<String, MetricValue>;

/// Iteration limits for a single K-Means fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringParams {
    pub max_iterations: u64,
    pub tolerance: f64,
    pub n_runs: usize,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self::from(&SegmentationConfig::default())
    }
}

impl From<&SegmentationConfig> for ClusteringParams {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            n_runs: config.n_runs,
        }
    }
}

/// Fitted K-Means parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    /// Number of clusters
    pub n_clusters: usize,
    /// Cluster centroids in standardized feature space (n_clusters, n_features)
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares on the training data
    pub inertia: f64,
    /// Cluster assignments for training data; not persisted
    #[serde(skip)]
    pub labels: Array1<usize>,
}

impl KMeansModel {
    pub fn n_features(&self) -> usize {
        self.centroids.ncols()
    }

    /// Assign every row to its nearest centroid
    pub fn predict(&self, features: &Array2<f64>) -> crate::Result<Array1<usize>> {
        if features.ncols() != self.n_features() {
            return Err(SegmentationError::FeatureMismatch {
                expected: self.n_features(),
                actual: features.ncols(),
            });
        }
        Ok(assign_nearest(features, &self.centroids))
    }

    /// Predict cluster for a single standardized feature vector
    pub fn predict_one(&self, features: &Array1<f64>) -> crate::Result<usize> {
        if features.len() != self.n_features() {
            return Err(SegmentationError::FeatureMismatch {
                expected: self.n_features(),
                actual: features.len(),
            });
        }
        Ok(nearest_centroid(&features.view(), &self.centroids))
    }

    /// Get cluster sizes of the training assignments
    pub fn cluster_sizes(&self) -> Vec<usize> {
        cluster_sizes(self.labels.as_slice().unwrap_or(&[]), self.n_clusters)
    }
}

/// Fit K-Means on standardized features
///
/// # Arguments
/// * `features` - Standardized feature matrix (n_customers, n_features)
/// * `n_clusters` - Number of clusters, in [2, n_customers]
/// * `params` - Iteration limits and restarts
/// * `seed` - Seed for centroid initialisation; equal seeds give equal models
pub fn fit_kmeans(
    features: &Array2<f64>,
    n_clusters: usize,
    params: &ClusteringParams,
    seed: u64,
) -> crate::Result<KMeansModel> {
    let n_customers = features.nrows();
    if n_clusters < 2 || n_clusters > n_customers {
        return Err(SegmentationError::InvalidClusterCount {
            n_clusters,
            n_customers,
        });
    }

    let rng = StdRng::seed_from_u64(seed);
    let dataset = DatasetBase::from(features.clone());

    let model = KMeans::params_with(n_clusters, rng, L2Dist)
        .max_n_iterations(params.max_iterations)
        .tolerance(params.tolerance)
        .n_runs(params.n_runs)
        .fit(&dataset)
        .map_err(|e| SegmentationError::Clustering(e.to_string()))?;

    let centroids = model.centroids().clone();
    let labels = assign_nearest(features, &centroids);
    let inertia = compute_inertia(features, &labels, &centroids);

    let sizes = cluster_sizes(labels.as_slice().unwrap_or(&[]), n_clusters);
    if sizes.iter().any(|&size| size == 0) {
        warn!("K-Means with k={} left at least one cluster empty: {:?}", n_clusters, sizes);
    }
    debug!("Fitted K-Means k={} inertia={:.4}", n_clusters, inertia);

    Ok(KMeansModel {
        n_clusters,
        centroids,
        inertia,
        labels,
    })
}

/// Count members per cluster; indices outside `n_clusters` are ignored
pub fn cluster_sizes(labels: &[usize], n_clusters: usize) -> Vec<usize> {
    let mut sizes = vec![0; n_clusters];
    for &label in labels {
        if label < n_clusters {
            sizes[label] += 1;
        }
    }
    sizes
}

/// Compute within-cluster sum of squares (inertia)
pub fn compute_inertia(
    features: &Array2<f64>,
    labels: &Array1<usize>,
    centroids: &Array2<f64>,
) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster < centroids.nrows() {
            inertia += squared_distance(&features.row(i), &centroids.row(cluster));
        }
    }

    inertia
}

/// Mean silhouette coefficient over all points, in [-1, 1]
///
/// Points in singleton clusters score 0. Returns 0 when fewer than two
/// clusters are populated, and for labels that do not match `features`
/// or fall outside `0..n_clusters`.
pub fn silhouette_score(features: &Array2<f64>, labels: &Array1<usize>, n_clusters: usize) -> f64 {
    let n_samples = features.nrows();
    if n_samples < 2 {
        return 0.0;
    }
    if labels.len() != n_samples || labels.iter().any(|&label| label >= n_clusters) {
        warn!(
            "Silhouette skipped: {} labels for {} rows with {} clusters",
            labels.len(),
            n_samples,
            n_clusters
        );
        return 0.0;
    }

    let sizes = cluster_sizes(labels.as_slice().unwrap_or(&[]), n_clusters);
    if sizes.iter().filter(|&&size| size > 0).count() < 2 {
        return 0.0;
    }

    let mut silhouette_sum = 0.0;

    for i in 0..n_samples {
        let cluster_label = labels[i];
        if sizes[cluster_label] <= 1 {
            continue;
        }

        let point = features.row(i);
        let mut distance_sums = vec![0.0; n_clusters];
        for j in 0..n_samples {
            if i == j {
                continue;
            }
            distance_sums[labels[j]] += euclidean_distance(&point, &features.row(j));
        }

        // a(i): mean distance to the other members of its own cluster
        let a_i = distance_sums[cluster_label] / (sizes[cluster_label] - 1) as f64;

        // b(i): smallest mean distance to another populated cluster
        let b_i = (0..n_clusters)
            .filter(|&c| c != cluster_label && sizes[c] > 0)
            .map(|c| distance_sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);

        let denominator = a_i.max(b_i);
        if denominator > 0.0 && denominator.is_finite() {
            silhouette_sum += (b_i - a_i) / denominator;
        }
    }

    (silhouette_sum / n_samples as f64).clamp(-1.0, 1.0)
}

fn assign_nearest(features: &Array2<f64>, centroids: &Array2<f64>) -> Array1<usize> {
    features
        .outer_iter()
        .map(|row| nearest_centroid(&row, centroids))
        .collect()
}

/// Index of the closest centroid; the lowest index wins ties
fn nearest_centroid(point: &ArrayView1<f64>, centroids: &Array2<f64>) -> usize {
    let mut min_distance = f64::INFINITY;
    let mut closest_cluster = 0;

    for (cluster_idx, centroid) in centroids.outer_iter().enumerate() {
        let distance = squared_distance(point, &centroid);
        if distance < min_distance {
            min_distance = distance;
            closest_cluster = cluster_idx;
        }
    }

    closest_cluster
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Calculate Euclidean distance between two points
fn euclidean_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    squared_distance(a, b).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, 0.1],
            [0.2, 0.0],
            [10.0, 10.0],
            [10.1, 10.1],
            [10.2, 10.0],
        ]
    }

    #[test]
    fn test_fit_kmeans() {
        let features = two_blobs();
        let model = fit_kmeans(&features, 2, &ClusteringParams::default(), 42).unwrap();

        assert_eq!(model.n_clusters, 2);
        assert_eq!(model.labels.len(), 6);
        assert_eq!(model.centroids.shape(), &[2, 2]);
        assert_eq!(model.labels[0], model.labels[1]);
        assert_eq!(model.labels[0], model.labels[2]);
        assert_ne!(model.labels[0], model.labels[3]);
        assert!(model.inertia >= 0.0 && model.inertia.is_finite());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let features = two_blobs();
        let a = fit_kmeans(&features, 3, &ClusteringParams::default(), 7).unwrap();
        let b = fit_kmeans(&features, 3, &ClusteringParams::default(), 7).unwrap();

        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_predict_matches_training_labels() {
        let features = two_blobs();
        let model = fit_kmeans(&features, 2, &ClusteringParams::default(), 42).unwrap();

        let predicted = model.predict(&features).unwrap();
        assert_eq!(predicted, model.labels);

        let single = model.predict_one(&array![10.05, 10.05]).unwrap();
        assert_eq!(single, model.labels[3]);
        assert!(model.predict_one(&array![1.0]).is_err());
    }

    #[test]
    fn test_cluster_sizes() {
        let features = two_blobs();
        let model = fit_kmeans(&features, 2, &ClusteringParams::default(), 42).unwrap();

        let sizes = model.cluster_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.iter().sum::<usize>(), 6);
        assert_eq!(cluster_sizes(&[0, 2, 2, 9], 3), vec![1, 0, 2]);
    }

    #[test]
    fn test_invalid_cluster_count() {
        let features = two_blobs();

        // Too few clusters
        assert!(fit_kmeans(&features, 1, &ClusteringParams::default(), 42).is_err());

        // More clusters than points
        let result = fit_kmeans(&features, 7, &ClusteringParams::default(), 42);
        assert!(matches!(
            result,
            Err(SegmentationError::InvalidClusterCount { n_clusters: 7, n_customers: 6 })
        ));
    }

    #[test]
    fn test_silhouette_separated_blobs() {
        let features = two_blobs();
        let labels = array![0, 0, 0, 1, 1, 1];
        let score = silhouette_score(&features, &labels, 2);
        assert!(score > 0.9, "score was {}", score);

        let bad_labels = array![0, 1, 0, 1, 0, 1];
        let bad = silhouette_score(&features, &bad_labels, 2);
        assert!(bad < score);
        assert!((-1.0..=1.0).contains(&bad));
    }

    #[test]
    fn test_silhouette_degenerate() {
        let features = two_blobs();
        assert_eq!(silhouette_score(&features, &array![0, 0, 0, 0, 0, 0], 2), 0.0);
        // Every point in its own cluster
        assert_eq!(silhouette_score(&features, &array![0, 1, 2, 3, 4, 5], 6), 0.0);
    }

    #[test]
    fn test_silhouette_rejects_bad_labels() {
        let features = two_blobs();
        assert_eq!(silhouette_score(&features, &array![0, 0, 0, 1, 1, 5], 2), 0.0);
        assert_eq!(silhouette_score(&features, &array![0, 1], 2), 0.0);
    }

    #[test]
    fn test_inertia() {
        let features = array![[0.0, 0.0], [2.0, 0.0]];
        let centroids = array![[1.0, 0.0]];
        assert_eq!(compute_inertia(&features, &array![0, 0], &centroids), 2.0);
    }

    #[test]
    fn test_metric_value_serialization() {
        let mut metrics = ModelMetrics::new();
        metrics.insert("final_inertia".to_string(), 1.5.into());
        metrics.insert("inertias".to_string(), vec![3.0, 2.0].into());

        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"final_inertia":1.5,"inertias":[3.0,2.0]}"#);

        let restored: ModelMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, metrics);
        assert_eq!(restored["final_inertia"].as_scalar(), Some(1.5));
    }
}
