//! Per-customer insights: cluster label, percentile ranks and recommendations

use crate::data::{RfmFeature, RfmRow, RfmTable};
use crate::error::SegmentationError;
use crate::segmentation::{ClusterLabel, FittedSegmentation};
use serde::{Deserialize, Serialize};

/// RFM row joined with its cluster assignment and recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerInsight {
    #[serde(flatten)]
    pub rfm: RfmRow,
    pub cluster: usize,
    pub cluster_label: ClusterLabel,
    /// Share of customers this one is at least as recent as
    pub recency_percentile: f64,
    pub frequency_percentile: f64,
    pub monetary_percentile: f64,
    pub recommendations: Vec<String>,
}

/// Marketing actions for a cluster label
pub fn recommendations(label: ClusterLabel) -> &'static [&'static str] {
    match label {
        ClusterLabel::HighValue => &[
            "Provide VIP treatment and exclusive early access to new products",
            "Invite to the premium tier of the loyalty program",
            "Ask for referrals and reviews",
        ],
        ClusterLabel::Loyal => &[
            "Upsell higher-value and complementary products",
            "Reward continued engagement with loyalty points",
        ],
        ClusterLabel::New => &[
            "Send an onboarding sequence introducing the product range",
            "Offer a second-purchase incentive",
        ],
        ClusterLabel::AtRisk => &[
            "Send personalized re-engagement offers",
            "Survey for feedback on recent experience",
            "Offer limited-time discounts on previously purchased categories",
        ],
        ClusterLabel::Inactive => &[
            "Launch a win-back campaign with a strong incentive",
            "Remind of new arrivals since the last purchase",
        ],
    }
}

/// Rank-based percentile of every value in (0, 1]
///
/// Ties share their average rank. With `descending`, the largest value
/// ranks first and so gets the lowest percentile.
pub fn percentile_ranks(values: &[f64], descending: bool) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let ordering = values[a].total_cmp(&values[b]);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });

    let mut percentiles = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; the tie group spans start+1..=end+1
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        for &index in &order[start..=end] {
            percentiles[index] = average_rank / n as f64;
        }
        start = end + 1;
    }
    percentiles
}

/// Join predictions onto the RFM table row by row
///
/// # Errors
/// * `LengthMismatch` when `predictions` and `rfm` differ in length
/// * `UnknownCluster` for a prediction outside the fitted clusters
pub fn get_customer_insights(
    model: &FittedSegmentation,
    rfm: &RfmTable,
    predictions: &[usize],
) -> crate::Result<Vec<CustomerInsight>> {
    if predictions.len() != rfm.len() {
        return Err(SegmentationError::LengthMismatch {
            rows: rfm.len(),
            predictions: predictions.len(),
        });
    }

    let recency = percentile_ranks(&rfm.values(RfmFeature::RecencyDays), true);
    let frequency = percentile_ranks(&rfm.values(RfmFeature::FrequencyTransactions), false);
    let monetary = percentile_ranks(&rfm.values(RfmFeature::MonetaryTotal), false);

    rfm.iter()
        .zip(predictions)
        .enumerate()
        .map(|(i, (row, &cluster))| {
            let cluster_label = model.cluster_label(cluster)?;
            Ok(CustomerInsight {
                rfm: row.clone(),
                cluster,
                cluster_label,
                recency_percentile: recency[i],
                frequency_percentile: frequency[i],
                monetary_percentile: monetary[i],
                recommendations: recommendations(cluster_label)
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
            })
        })
        .collect()
}
