//! Cluster-count selection by silhouette sweep

use crate::error::SegmentationError;
use crate::model::{fit_kmeans, silhouette_score, ClusteringParams, MetricValue, ModelMetrics};
use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Diagnostics of a cluster-count sweep; the vectors are parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSelection {
    pub cluster_range: Vec<usize>,
    pub inertias: Vec<f64>,
    pub silhouette_scores: Vec<f64>,
    pub optimal_k: usize,
    pub optimal_silhouette_score: f64,
}

impl ClusterSelection {
    /// Flatten into model metrics
    pub fn to_metrics(&self) -> ModelMetrics {
        let mut metrics = ModelMetrics::new();
        metrics.insert(
            "cluster_range".to_string(),
            MetricValue::Series(self.cluster_range.iter().map(|&k| k as f64).collect()),
        );
        metrics.insert("inertias".to_string(), self.inertias.clone().into());
        metrics.insert(
            "silhouette_scores".to_string(),
            self.silhouette_scores.clone().into(),
        );
        metrics.insert("optimal_k".to_string(), (self.optimal_k as f64).into());
        metrics.insert(
            "optimal_silhouette_score".to_string(),
            self.optimal_silhouette_score.into(),
        );
        metrics
    }
}

/// Fit K-Means for every k in `2..=max_clusters` and pick the k with the
/// highest silhouette score. Ties go to the smallest k.
///
/// # Errors
/// `InvalidClusterRange` when `max_clusters < 2` or it exceeds the number
/// of customers (rows of `features`).
pub fn find_optimal_clusters(
    features: &Array2<f64>,
    max_clusters: usize,
    params: &ClusteringParams,
    seed: u64,
) -> crate::Result<(usize, ClusterSelection)> {
    let n_customers = features.nrows();
    if max_clusters < 2 || max_clusters > n_customers {
        return Err(SegmentationError::InvalidClusterRange {
            max_clusters,
            n_customers,
        });
    }

    let cluster_range: Vec<usize> = (2..=max_clusters).collect();
    let mut inertias = Vec::with_capacity(cluster_range.len());
    let mut silhouette_scores = Vec::with_capacity(cluster_range.len());

    for &k in &cluster_range {
        let model = fit_kmeans(features, k, params, seed)?;
        let silhouette = silhouette_score(features, &model.labels, k);
        debug!(
            "k={}: inertia={:.4} silhouette={:.4}",
            k, model.inertia, silhouette
        );
        inertias.push(model.inertia);
        silhouette_scores.push(silhouette);
    }

    let mut best = 0;
    for (i, &score) in silhouette_scores.iter().enumerate() {
        if score > silhouette_scores[best] {
            best = i;
        }
    }

    let optimal_k = cluster_range[best];
    let optimal_silhouette_score = silhouette_scores[best];
    info!(
        "Optimal number of clusters: {} (silhouette {:.4})",
        optimal_k, optimal_silhouette_score
    );

    Ok((
        optimal_k,
        ClusterSelection {
            cluster_range,
            inertias,
            silhouette_scores,
            optimal_k,
            optimal_silhouette_score,
        },
    ))
}
