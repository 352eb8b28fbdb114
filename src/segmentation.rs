//! Customer segmentation model: fitted state, prediction and cluster labels

use crate::config::SegmentationConfig;
use crate::data::{RfmFeature, RfmTable};
use crate::error::SegmentationError;
use crate::features::{prepare_features, StandardScaler, CLUSTERING_FEATURES};
use crate::insights::{self, CustomerInsight};
use crate::model::{
    cluster_sizes, fit_kmeans, silhouette_score, ClusteringParams, KMeansModel, MetricValue,
    ModelMetrics,
};
use crate::selection::find_optimal_clusters;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Semantic label of a cluster, derived from its centroid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterLabel {
    #[serde(rename = "High Value")]
    HighValue,
    #[serde(rename = "Loyal")]
    Loyal,
    #[serde(rename = "New")]
    New,
    #[serde(rename = "At Risk")]
    AtRisk,
    #[serde(rename = "Inactive")]
    Inactive,
}

impl ClusterLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighValue => "High Value",
            Self::Loyal => "Loyal",
            Self::New => "New",
            Self::AtRisk => "At Risk",
            Self::Inactive => "Inactive",
        }
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterLabel {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High Value" => Ok(Self::HighValue),
            "Loyal" => Ok(Self::Loyal),
            "New" => Ok(Self::New),
            "At Risk" => Ok(Self::AtRisk),
            "Inactive" => Ok(Self::Inactive),
            other => Err(SegmentationError::MalformedValue {
                column: "cluster_label".to_string(),
                row: 0,
                reason: format!("unknown cluster label '{}'", other),
            }),
        }
    }
}

/// Standardized RFM position of one centroid and its value rank
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidProfile {
    pub cluster: usize,
    /// Training customers assigned to this cluster
    pub size: usize,
    /// 0 for the most valuable populated centroid
    pub rank: usize,
    /// Number of populated clusters taking part in the ranking
    pub n_ranked: usize,
    pub recency_z: f64,
    pub frequency_z: f64,
    pub monetary_z: f64,
}

impl CentroidProfile {
    /// Higher is better: recent, frequent, high-spend
    pub fn value_score(&self) -> f64 {
        -self.recency_z + self.frequency_z + self.monetary_z
    }
}

/// One entry of the cluster label table
pub struct LabelRule {
    pub applies: fn(&CentroidProfile) -> bool,
    pub label: ClusterLabel,
}

fn is_empty(profile: &CentroidProfile) -> bool {
    profile.size == 0
}

fn is_best(profile: &CentroidProfile) -> bool {
    profile.rank == 0
}

fn is_worst(profile: &CentroidProfile) -> bool {
    profile.rank + 1 == profile.n_ranked
}

fn is_recent_but_infrequent(profile: &CentroidProfile) -> bool {
    profile.recency_z <= 0.0 && profile.frequency_z < 0.0
}

fn is_recent(profile: &CentroidProfile) -> bool {
    profile.recency_z <= 0.0
}

/// Cluster label rules in priority order; the first match wins.
pub const CLUSTER_LABEL_RULES: [LabelRule; 5] = [
    LabelRule {
        applies: is_empty,
        label: DEFAULT_CLUSTER_LABEL,
    },
    LabelRule {
        applies: is_best,
        label: ClusterLabel::HighValue,
    },
    LabelRule {
        applies: is_worst,
        label: ClusterLabel::Inactive,
    },
    LabelRule {
        applies: is_recent_but_infrequent,
        label: ClusterLabel::New,
    },
    LabelRule {
        applies: is_recent,
        label: ClusterLabel::Loyal,
    },
];

/// Label for middle-ranked clusters that have lapsed
pub const DEFAULT_CLUSTER_LABEL: ClusterLabel = ClusterLabel::AtRisk;

pub fn label_for_profile(profile: &CentroidProfile) -> ClusterLabel {
    CLUSTER_LABEL_RULES
        .iter()
        .find(|rule| (rule.applies)(profile))
        .map(|rule| rule.label)
        .unwrap_or(DEFAULT_CLUSTER_LABEL)
}

/// Build centroid profiles and rank the populated ones by value score
///
/// Ties go to the lower index. Empty clusters are ranked after every
/// populated one and never count as best or worst.
pub fn centroid_profiles(
    kmeans: &KMeansModel,
    feature_names: &[RfmFeature],
    sizes: &[usize],
) -> Vec<CentroidProfile> {
    let column = |feature: RfmFeature| feature_names.iter().position(|&f| f == feature);
    let recency = column(RfmFeature::RecencyDays);
    let frequency = column(RfmFeature::FrequencyTransactions);
    let monetary = column(RfmFeature::MonetaryTotal);

    let n_clusters = kmeans.centroids.nrows();
    let n_ranked = (0..n_clusters)
        .filter(|&cluster| sizes.get(cluster).copied().unwrap_or(0) > 0)
        .count();
    let mut profiles: Vec<CentroidProfile> = kmeans
        .centroids
        .outer_iter()
        .enumerate()
        .map(|(cluster, centroid)| {
            let value = |col: Option<usize>| col.map(|c| centroid[c]).unwrap_or(0.0);
            CentroidProfile {
                cluster,
                size: sizes.get(cluster).copied().unwrap_or(0),
                rank: 0,
                n_ranked,
                recency_z: value(recency),
                frequency_z: value(frequency),
                monetary_z: value(monetary),
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..n_clusters).collect();
    order.sort_by(|&a, &b| {
        let (pa, pb) = (&profiles[a], &profiles[b]);
        is_empty(pa)
            .cmp(&is_empty(pb))
            .then(pb.value_score().total_cmp(&pa.value_score()))
            .then(a.cmp(&b))
    });
    for (rank, &cluster) in order.iter().enumerate() {
        profiles[cluster].rank = rank;
    }

    profiles
}

/// Map every cluster index to its semantic label
pub fn label_clusters(
    kmeans: &KMeansModel,
    feature_names: &[RfmFeature],
    sizes: &[usize],
) -> BTreeMap<usize, ClusterLabel> {
    centroid_profiles(kmeans, feature_names, sizes)
        .iter()
        .map(|profile| {
            let label = label_for_profile(profile);
            debug!(
                "Cluster {}: size={} rank={} value={:.3} -> {}",
                profile.cluster,
                profile.size,
                profile.rank,
                profile.value_score(),
                label
            );
            (profile.cluster, label)
        })
        .collect()
}

/// Centroid of one cluster in raw feature units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster: usize,
    pub label: ClusterLabel,
    pub size: usize,
    pub centroid: BTreeMap<String, f64>,
}

/// Everything produced by a successful fit
#[derive(Debug, Clone, PartialEq)]
pub struct FittedSegmentation {
    pub kmeans: KMeansModel,
    pub scaler: StandardScaler,
    pub feature_names: Vec<RfmFeature>,
    pub cluster_labels: BTreeMap<usize, ClusterLabel>,
    pub model_metrics: ModelMetrics,
}

impl FittedSegmentation {
    pub fn n_clusters(&self) -> usize {
        self.kmeans.n_clusters
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.feature_names
            .iter()
            .map(|feature| feature.as_str().to_string())
            .collect()
    }

    pub fn cluster_label(&self, cluster: usize) -> crate::Result<ClusterLabel> {
        self.cluster_labels
            .get(&cluster)
            .copied()
            .ok_or(SegmentationError::UnknownCluster {
                cluster,
                n_clusters: self.n_clusters(),
            })
    }

    /// Assign each customer to the nearest centroid using the fitted scaler
    pub fn predict(&self, rfm: &RfmTable) -> crate::Result<Vec<usize>> {
        let raw = crate::features::feature_matrix(rfm, &self.feature_names)?;
        let scaled = self.scaler.transform(&raw)?;
        Ok(self.kmeans.predict(&scaled)?.to_vec())
    }

    /// Per-cluster centroid in raw units with label and training size
    pub fn cluster_profiles(&self) -> crate::Result<Vec<ClusterProfile>> {
        let raw_centroids = self.scaler.inverse_transform(&self.kmeans.centroids)?;
        let sizes = self.training_cluster_sizes();

        raw_centroids
            .outer_iter()
            .enumerate()
            .map(|(cluster, centroid)| {
                Ok(ClusterProfile {
                    cluster,
                    label: self.cluster_label(cluster)?,
                    size: sizes.get(cluster).copied().unwrap_or(0),
                    centroid: self
                        .feature_names
                        .iter()
                        .zip(centroid.iter())
                        .map(|(feature, &value)| (feature.as_str().to_string(), value))
                        .collect(),
                })
            })
            .collect()
    }

    /// Training cluster sizes, recorded in the metrics at fit time
    pub fn training_cluster_sizes(&self) -> Vec<usize> {
        match self.model_metrics.get("cluster_sizes") {
            Some(MetricValue::Series(sizes)) => sizes.iter().map(|&s| s as usize).collect(),
            _ => self.kmeans.cluster_sizes(),
        }
    }

    pub fn get_customer_insights(
        &self,
        rfm: &RfmTable,
        predictions: &[usize],
    ) -> crate::Result<Vec<CustomerInsight>> {
        insights::get_customer_insights(self, rfm, predictions)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ModelState {
    Unfitted,
    Fitted(Box<FittedSegmentation>),
}

/// RFM + K-Means segmentation model
///
/// Starts unfitted. `fit` builds the complete fitted state before
/// swapping it in, so a failed fit leaves the previous state untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSegmentation {
    config: SegmentationConfig,
    state: ModelState,
}

impl Default for CustomerSegmentation {
    fn default() -> Self {
        Self::new(SegmentationConfig::default())
    }
}

impl CustomerSegmentation {
    pub fn new(config: SegmentationConfig) -> Self {
        Self {
            config,
            state: ModelState::Unfitted,
        }
    }

    pub fn with_params(n_clusters: usize, random_state: u64) -> Self {
        Self::new(SegmentationConfig::new(n_clusters, random_state))
    }

    pub(crate) fn from_fitted(config: SegmentationConfig, fitted: FittedSegmentation) -> Self {
        Self {
            config,
            state: ModelState::Fitted(Box::new(fitted)),
        }
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    pub fn random_state(&self) -> u64 {
        self.config.random_state
    }

    /// Active cluster count: the fitted count once fitted, else the configured one
    pub fn n_clusters(&self) -> usize {
        match &self.state {
            ModelState::Fitted(fitted) => fitted.n_clusters(),
            ModelState::Unfitted => self.config.n_clusters,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, ModelState::Fitted(_))
    }

    /// Fitted state, or `NotFitted`
    pub fn fitted(&self) -> crate::Result<&FittedSegmentation> {
        match &self.state {
            ModelState::Fitted(fitted) => Ok(fitted.as_ref()),
            ModelState::Unfitted => Err(SegmentationError::NotFitted),
        }
    }

    /// Fit scaler and K-Means on `rfm`
    ///
    /// With `find_optimal_k` the cluster count is chosen by silhouette
    /// sweep over `2..=min(max_clusters, n_customers - 1)`; otherwise the
    /// configured `n_clusters` is used.
    pub fn fit(&mut self, rfm: &RfmTable, find_optimal_k: bool) -> crate::Result<&FittedSegmentation> {
        let fitted = self.build_fitted(rfm, find_optimal_k)?;
        info!(
            "Model fitted: {} clusters, silhouette {:.4}",
            fitted.n_clusters(),
            fitted
                .model_metrics
                .get("final_silhouette_score")
                .and_then(MetricValue::as_scalar)
                .unwrap_or(0.0)
        );
        self.state = ModelState::Fitted(Box::new(fitted));
        self.fitted()
    }

    fn build_fitted(&self, rfm: &RfmTable, find_optimal_k: bool) -> crate::Result<FittedSegmentation> {
        self.config.validate()?;

        let previous_scaler = self.fitted().ok().map(|fitted| &fitted.scaler);
        let (features, scaler) = prepare_features(rfm, previous_scaler)?;
        let params = ClusteringParams::from(&self.config);
        let seed = self.config.random_state;

        let mut model_metrics = ModelMetrics::new();
        let n_clusters = if find_optimal_k {
            let max_clusters = self.config.max_clusters.min(features.nrows().saturating_sub(1));
            let (optimal_k, selection) = find_optimal_clusters(&features, max_clusters, &params, seed)?;
            model_metrics.extend(selection.to_metrics());
            optimal_k
        } else {
            self.config.n_clusters
        };

        let kmeans = fit_kmeans(&features, n_clusters, &params, seed)?;
        let silhouette = silhouette_score(&features, &kmeans.labels, n_clusters);
        let sizes = cluster_sizes(kmeans.labels.as_slice().unwrap_or(&[]), n_clusters);

        model_metrics.insert("final_silhouette_score".to_string(), silhouette.into());
        model_metrics.insert("final_inertia".to_string(), kmeans.inertia.into());
        model_metrics.insert("n_clusters_used".to_string(), (n_clusters as f64).into());
        model_metrics.insert(
            "cluster_sizes".to_string(),
            MetricValue::Series(sizes.iter().map(|&s| s as f64).collect()),
        );

        let feature_names = CLUSTERING_FEATURES.to_vec();
        let cluster_labels = label_clusters(&kmeans, &feature_names, &sizes);

        Ok(FittedSegmentation {
            kmeans,
            scaler,
            feature_names,
            cluster_labels,
            model_metrics,
        })
    }

    pub fn predict(&self, rfm: &RfmTable) -> crate::Result<Vec<usize>> {
        self.fitted()?.predict(rfm)
    }

    pub fn fit_predict(&mut self, rfm: &RfmTable, find_optimal_k: bool) -> crate::Result<Vec<usize>> {
        self.fit(rfm, find_optimal_k)?.predict(rfm)
    }

    pub fn cluster_labels(&self) -> crate::Result<&BTreeMap<usize, ClusterLabel>> {
        Ok(&self.fitted()?.cluster_labels)
    }

    pub fn model_metrics(&self) -> crate::Result<&ModelMetrics> {
        Ok(&self.fitted()?.model_metrics)
    }

    pub fn get_customer_insights(
        &self,
        rfm: &RfmTable,
        predictions: &[usize],
    ) -> crate::Result<Vec<CustomerInsight>> {
        self.fitted()?.get_customer_insights(rfm, predictions)
    }
}
