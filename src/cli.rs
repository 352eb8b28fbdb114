//! Command-line interface definitions and argument parsing

use crate::config::SegmentationConfig;
use clap::Parser;
use std::path::PathBuf;

/// Customer segmentation CLI: RFM scoring and K-Means clustering of transactions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transactions CSV (customer_id, transaction_date, net_amount)
    #[arg(short, long, default_value = "transactions.csv")]
    pub input: PathBuf,

    /// JSON file with clustering settings; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of clusters when not searching for the optimal count
    #[arg(short = 'k', long)]
    pub clusters: Option<usize>,

    /// Choose the cluster count by silhouette score
    #[arg(long)]
    pub find_optimal_k: bool,

    /// Upper bound of the cluster-count search
    #[arg(long)]
    pub max_clusters: Option<usize>,

    /// Seed for centroid initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Save the fitted model bundle to this directory
    #[arg(long)]
    pub save_model: Option<PathBuf>,

    /// Predict with a saved model bundle instead of fitting
    #[arg(long, conflicts_with = "save_model")]
    pub load_model: Option<PathBuf>,

    /// Write per-customer insights as JSON
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write heuristic RFM scores and segments as JSON
    #[arg(long)]
    pub scores: Option<PathBuf>,

    /// Log the fitted model to a file-backed experiment tracker rooted here
    #[arg(long)]
    pub tracking_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Merge the config file (if any) with the command-line overrides
    pub fn to_config(&self) -> crate::Result<SegmentationConfig> {
        let mut config = match &self.config {
            Some(path) => SegmentationConfig::from_json_file(path)?,
            None => SegmentationConfig::default(),
        };

        if let Some(clusters) = self.clusters {
            config.n_clusters = clusters;
        }
        if let Some(max_clusters) = self.max_clusters {
            config.max_clusters = max_clusters;
        }
        if let Some(seed) = self.seed {
            config.random_state = seed;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "rfmforge",
            "--input",
            "tx.csv",
            "-k",
            "4",
            "--find-optimal-k",
            "--seed",
            "7",
        ])
        .unwrap();

        assert_eq!(args.input, PathBuf::from("tx.csv"));
        assert_eq!(args.clusters, Some(4));
        assert!(args.find_optimal_k);
        assert!(args.load_model.is_none());

        let config = args.to_config().unwrap();
        assert_eq!(config.n_clusters, 4);
        assert_eq!(config.random_state, 7);
        assert_eq!(config.max_clusters, 10);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"n_clusters": 6, "max_clusters": 8, "random_state": 1}}"#).unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = Args::try_parse_from(["rfmforge", "--config", &path, "--seed", "99"]).unwrap();
        let config = args.to_config().unwrap();

        assert_eq!(config.n_clusters, 6);
        assert_eq!(config.max_clusters, 8);
        assert_eq!(config.random_state, 99);
    }

    #[test]
    fn test_invalid_cluster_flag() {
        let args = Args::try_parse_from(["rfmforge", "-k", "1"]).unwrap();
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_load_conflicts_with_save() {
        assert!(Args::try_parse_from([
            "rfmforge",
            "--load-model",
            "a",
            "--save-model",
            "b"
        ])
        .is_err());
    }
}
