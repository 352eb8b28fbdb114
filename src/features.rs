//! Feature selection and standardization for clustering

use crate::data::{RfmFeature, RfmTable};
use crate::error::SegmentationError;
use log::debug;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Columns fed to K-Means, in matrix column order
pub const CLUSTERING_FEATURES: [RfmFeature; 5] = [
    RfmFeature::RecencyDays,
    RfmFeature::FrequencyTransactions,
    RfmFeature::MonetaryTotal,
    RfmFeature::MonetaryAvg,
    RfmFeature::ClvProxy,
];

/// Per-feature mean/std standardization, fitted once and reused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    /// Population standard deviation; 1.0 for constant features
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(features: &Array2<f64>) -> crate::Result<Self> {
        let mean = features
            .mean_axis(Axis(0))
            .ok_or(SegmentationError::EmptyInput)?;
        let scale = features
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std > 0.0 { std } else { 1.0 });

        Ok(Self {
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, features: &Array2<f64>) -> crate::Result<Array2<f64>> {
        self.check_width(features)?;
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        Ok((features - &mean) / &scale)
    }

    pub fn inverse_transform(&self, features: &Array2<f64>) -> crate::Result<Array2<f64>> {
        self.check_width(features)?;
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        Ok(features * &scale + &mean)
    }

    fn check_width(&self, features: &Array2<f64>) -> crate::Result<()> {
        if features.ncols() != self.n_features() {
            return Err(SegmentationError::FeatureMismatch {
                expected: self.n_features(),
                actual: features.ncols(),
            });
        }
        Ok(())
    }
}

/// Raw (unscaled) matrix of the given feature columns, one row per customer
pub fn feature_matrix(rfm: &RfmTable, features: &[RfmFeature]) -> crate::Result<Array2<f64>> {
    if rfm.is_empty() {
        return Err(SegmentationError::EmptyInput);
    }

    let mut data = Vec::with_capacity(rfm.len() * features.len());
    for row in rfm {
        data.extend(features.iter().map(|&feature| row.value(feature)));
    }

    let actual = data.len();
    Array2::from_shape_vec((rfm.len(), features.len()), data).map_err(|_| {
        SegmentationError::FeatureMismatch {
            expected: rfm.len() * features.len(),
            actual,
        }
    })
}

/// Select [`CLUSTERING_FEATURES`] and standardize them
///
/// When `scaler` is given it is reused as-is; otherwise a new scaler is
/// fitted on `rfm`. Returns the scaled matrix and the scaler used.
pub fn prepare_features(
    rfm: &RfmTable,
    scaler: Option<&StandardScaler>,
) -> crate::Result<(Array2<f64>, StandardScaler)> {
    let raw = feature_matrix(rfm, &CLUSTERING_FEATURES)?;

    let scaler = match scaler {
        Some(existing) => existing.clone(),
        None => {
            let fitted = StandardScaler::fit(&raw)?;
            debug!(
                "Fitted scaler: mean={:?} scale={:?}",
                fitted.mean, fitted.scale
            );
            fitted
        }
    };

    let scaled = scaler.transform(&raw)?;
    Ok((scaled, scaler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::sample_rfm;

    #[test]
    fn test_prepare_features_shape_and_moments() {
        let rfm = sample_rfm();
        let (features, scaler) = prepare_features(&rfm, None).unwrap();

        assert_eq!(features.shape(), &[rfm.len(), 5]);
        assert_eq!(scaler.n_features(), 5);

        let global_mean = features.mean().unwrap();
        let global_std = features.std(0.0);
        assert!(global_mean.abs() < 0.05, "mean was {}", global_mean);
        assert!((global_std - 1.0).abs() < 0.05, "std was {}", global_std);

        for column in features.axis_iter(Axis(1)) {
            assert!(column.mean().unwrap().abs() < 1e-9);
        }
    }

    #[test]
    fn test_existing_scaler_is_reused() {
        let rfm = sample_rfm();
        let (_, scaler) = prepare_features(&rfm, None).unwrap();

        let subset = RfmTable::from_rows(rfm.rows()[..5].to_vec()).unwrap();
        let (scaled_subset, reused) = prepare_features(&subset, Some(&scaler)).unwrap();

        assert_eq!(reused, scaler);
        let (full, _) = prepare_features(&rfm, Some(&scaler)).unwrap();
        assert_eq!(scaled_subset.row(0), full.row(0));
    }

    #[test]
    fn test_inverse_transform() {
        let raw = Array2::from_shape_vec((3, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]).unwrap();
        let scaler = StandardScaler::fit(&raw).unwrap();
        let restored = scaler
            .inverse_transform(&scaler.transform(&raw).unwrap())
            .unwrap();

        for (a, b) in raw.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_constant_feature_has_unit_scale() {
        let raw = Array2::from_shape_vec((3, 2), vec![5.0, 1.0, 5.0, 2.0, 5.0, 3.0]).unwrap();
        let scaler = StandardScaler::fit(&raw).unwrap();
        assert_eq!(scaler.scale[0], 1.0);

        let scaled = scaler.transform(&raw).unwrap();
        assert!(scaled.column(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_width_mismatch() {
        let scaler = StandardScaler {
            mean: vec![0.0; 5],
            scale: vec![1.0; 5],
        };
        let narrow = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            scaler.transform(&narrow),
            Err(SegmentationError::FeatureMismatch { expected: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_empty_table() {
        let empty = RfmTable::default();
        assert!(prepare_features(&empty, None).is_err());
    }
}
