//! Heuristic RFM scoring: quintile binning and rule-based segment labels

use crate::data::{RfmFeature, RfmRow, RfmTable};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

/// Number of score bins per metric
pub const SCORE_BINS: u8 = 5;

/// Neutral score given to every customer when a metric is constant
pub const NEUTRAL_SCORE: u8 = 3;

/// Marketing segment derived from the three RFM scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CustomerSegment {
    #[serde(rename = "Champions")]
    Champions,
    #[serde(rename = "Loyal Customers")]
    LoyalCustomers,
    #[serde(rename = "Potential Loyalists")]
    PotentialLoyalists,
    #[serde(rename = "New Customers")]
    NewCustomers,
    #[serde(rename = "Promising")]
    Promising,
    #[serde(rename = "Cannot Lose Them")]
    CannotLoseThem,
    #[serde(rename = "At Risk")]
    AtRisk,
    #[serde(rename = "Hibernating")]
    Hibernating,
    #[serde(rename = "Lost Customers")]
    LostCustomers,
    #[serde(rename = "Need Attention")]
    NeedAttention,
}

impl CustomerSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Champions => "Champions",
            Self::LoyalCustomers => "Loyal Customers",
            Self::PotentialLoyalists => "Potential Loyalists",
            Self::NewCustomers => "New Customers",
            Self::Promising => "Promising",
            Self::CannotLoseThem => "Cannot Lose Them",
            Self::AtRisk => "At Risk",
            Self::Hibernating => "Hibernating",
            Self::LostCustomers => "Lost Customers",
            Self::NeedAttention => "Need Attention",
        }
    }
}

impl fmt::Display for CustomerSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recency, frequency and monetary scores, each in 1..=5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfmScores {
    pub recency: u8,
    pub frequency: u8,
    pub monetary: u8,
}

impl RfmScores {
    pub fn new(recency: u8, frequency: u8, monetary: u8) -> Self {
        Self {
            recency,
            frequency,
            monetary,
        }
    }

    /// Three-digit code in recency, frequency, monetary order, e.g. "545"
    pub fn code(&self) -> String {
        format!("{}{}{}", self.recency, self.frequency, self.monetary)
    }

    pub fn segment(&self) -> CustomerSegment {
        assign_segment(*self)
    }
}

/// A row of the segment rule table; all three ranges must contain the score
#[derive(Debug, Clone)]
pub struct SegmentRule {
    pub recency: RangeInclusive<u8>,
    pub frequency: RangeInclusive<u8>,
    pub monetary: RangeInclusive<u8>,
    pub segment: CustomerSegment,
}

impl SegmentRule {
    pub fn matches(&self, scores: RfmScores) -> bool {
        self.recency.contains(&scores.recency)
            && self.frequency.contains(&scores.frequency)
            && self.monetary.contains(&scores.monetary)
    }
}

const fn rule(
    recency: RangeInclusive<u8>,
    frequency: RangeInclusive<u8>,
    monetary: RangeInclusive<u8>,
    segment: CustomerSegment,
) -> SegmentRule {
    SegmentRule {
        recency,
        frequency,
        monetary,
        segment,
    }
}

/// Segment rules in priority order; the first match wins.
pub const SEGMENT_RULES: [SegmentRule; 10] = [
    rule(5..=5, 5..=5, 5..=5, CustomerSegment::Champions),
    rule(1..=1, 1..=1, 1..=1, CustomerSegment::LostCustomers),
    rule(5..=5, 1..=1, 1..=5, CustomerSegment::NewCustomers),
    rule(4..=5, 4..=5, 4..=5, CustomerSegment::Champions),
    rule(3..=5, 4..=5, 1..=5, CustomerSegment::LoyalCustomers),
    rule(4..=5, 2..=5, 3..=5, CustomerSegment::PotentialLoyalists),
    rule(4..=5, 1..=2, 1..=5, CustomerSegment::Promising),
    rule(1..=2, 4..=5, 4..=5, CustomerSegment::CannotLoseThem),
    rule(1..=2, 3..=5, 1..=5, CustomerSegment::AtRisk),
    rule(1..=2, 1..=2, 3..=5, CustomerSegment::Hibernating),
];

/// Segment when no rule matches
pub const DEFAULT_SEGMENT: CustomerSegment = CustomerSegment::NeedAttention;

pub fn assign_segment(scores: RfmScores) -> CustomerSegment {
    SEGMENT_RULES
        .iter()
        .find(|rule| rule.matches(scores))
        .map(|rule| rule.segment)
        .unwrap_or(DEFAULT_SEGMENT)
}

/// RFM row with heuristic scores and segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRfmRow {
    #[serde(flatten)]
    pub rfm: RfmRow,
    pub recency_score: u8,
    pub frequency_score: u8,
    pub monetary_score: u8,
    pub rfm_score: String,
    pub customer_segment: CustomerSegment,
}

impl ScoredRfmRow {
    pub fn scores(&self) -> RfmScores {
        RfmScores::new(self.recency_score, self.frequency_score, self.monetary_score)
    }
}

/// Score every customer against the population in `rfm`
///
/// Recency is inverted (most recent quintile scores 5); frequency and
/// monetary total score 5 for the highest quintile.
pub fn create_rfm_scores(rfm: &RfmTable) -> Vec<ScoredRfmRow> {
    let recency = quintile_scores(&rfm.values(RfmFeature::RecencyDays), true);
    let frequency = quintile_scores(&rfm.values(RfmFeature::FrequencyTransactions), false);
    let monetary = quintile_scores(&rfm.values(RfmFeature::MonetaryTotal), false);

    rfm.iter()
        .enumerate()
        .map(|(i, row)| {
            let scores = RfmScores::new(recency[i], frequency[i], monetary[i]);
            ScoredRfmRow {
                rfm: row.clone(),
                recency_score: scores.recency,
                frequency_score: scores.frequency,
                monetary_score: scores.monetary,
                rfm_score: scores.code(),
                customer_segment: scores.segment(),
            }
        })
        .collect()
}

/// Count customers per segment
pub fn segment_distribution(scored: &[ScoredRfmRow]) -> BTreeMap<CustomerSegment, usize> {
    let mut counts = BTreeMap::new();
    for row in scored {
        *counts.entry(row.customer_segment).or_insert(0) += 1;
    }
    counts
}

/// Assign 1..=5 scores by cutting stable ranks at the quintile edges.
///
/// Equal values are ranked by position, so every customer lands in a bin
/// even with heavy ties. With fewer than five customers some bins stay
/// empty. A constant column carries no ordering information and every
/// customer gets [`NEUTRAL_SCORE`].
pub fn quintile_scores(values: &[f64], inverted: bool) -> Vec<u8> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if n > 1 && min == max {
        warn!("Constant metric across {} customers; assigning neutral score", n);
        return vec![NEUTRAL_SCORE; n];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));

    let bins = SCORE_BINS as usize;
    let edges: Vec<f64> = (0..=bins)
        .map(|i| 1.0 + ((n - 1) * i) as f64 / bins as f64)
        .collect();

    let mut scores = vec![0u8; n];
    for (position, &index) in order.iter().enumerate() {
        let rank = (position + 1) as f64;
        let bin = (1..=bins).find(|&b| rank <= edges[b]).unwrap_or(bins) as u8;
        scores[index] = if inverted { SCORE_BINS + 1 - bin } else { bin };
    }
    scores
}
