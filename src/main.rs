//! RfmForge: customer segmentation CLI
//!
//! Loads transactions, builds RFM features, then either fits a segmentation
//! model or predicts with a saved one, and prints a cluster report.

use anyhow::{Context, Result};
use clap::Parser;
use rfmforge::{
    calculate_rfm_features, cluster_sizes, create_rfm_scores, load_transactions,
    segment_distribution, Args, CustomerSegmentation, FileTracker, RfmTable,
};
use std::fs;
use std::path::Path;
use std::time::Instant;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if args.verbose {
        println!("RfmForge - Customer Segmentation");
        println!("================================\n");
    }

    let start_time = Instant::now();

    let transactions = load_transactions(&args.input)
        .with_context(|| format!("failed to read transactions from {}", args.input.display()))?;
    let rfm = calculate_rfm_features(&transactions).context("failed to build RFM features")?;
    println!(
        "✓ Data loaded: {} transactions, {} customers",
        transactions.height(),
        rfm.len()
    );

    print_segment_report(&args, &rfm)?;

    let model = match &args.load_model {
        Some(dir) => {
            let model = CustomerSegmentation::from_saved(dir)
                .with_context(|| format!("failed to load model from {}", dir.display()))?;
            println!("✓ Model loaded from {}", dir.display());
            model
        }
        None => fit_model(&args, &rfm)?,
    };

    let predictions = model.predict(&rfm).context("prediction failed")?;
    print_cluster_statistics(&model, &predictions)?;

    if let Some(path) = &args.output {
        let insights = model.get_customer_insights(&rfm, &predictions)?;
        write_json(path, &insights)?;
        println!("\nCustomer insights saved to: {}", path.display());
    }

    if args.load_model.is_none() {
        if let Some(dir) = &args.save_model {
            model
                .save_model(dir)
                .with_context(|| format!("failed to save model to {}", dir.display()))?;
            println!("Model saved to: {}", dir.display());
        }

        if let Some(root) = &args.tracking_dir {
            let mut tracker = FileTracker::new(root, "customer_segmentation");
            let run_id = model
                .log_to_experiment_tracker(&mut tracker)
                .context("experiment tracking failed")?;
            println!("Tracking run: {}", run_id);
        }
    }

    println!("\n=== Pipeline Complete ===");
    println!(
        "Total processing time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}

fn fit_model(args: &Args, rfm: &RfmTable) -> Result<CustomerSegmentation> {
    let config = args.to_config().context("invalid configuration")?;

    if args.verbose {
        if args.find_optimal_k {
            println!("\nSearching for the optimal cluster count");
            println!("  Max clusters: {}", config.max_clusters);
        } else {
            println!("\nFitting K-Means model");
            println!("  Number of clusters: {}", config.n_clusters);
        }
        println!("  Max iterations: {}", config.max_iterations);
        println!("  Tolerance: {}", config.tolerance);
        println!("  Seed: {}", config.random_state);
    }

    let fit_start = Instant::now();
    let mut model = CustomerSegmentation::new(config);
    model
        .fit(rfm, args.find_optimal_k)
        .context("model fitting failed")?;

    println!("✓ Model fitted with {} clusters", model.n_clusters());
    if args.verbose {
        println!("  Fitting time: {:.2}s", fit_start.elapsed().as_secs_f64());
    }
    Ok(model)
}

fn print_segment_report(args: &Args, rfm: &RfmTable) -> Result<()> {
    let scored = create_rfm_scores(rfm);

    println!("\n=== RFM Segments ===");
    for (segment, count) in segment_distribution(&scored) {
        let percentage = count as f64 / scored.len() as f64 * 100.0;
        println!(
            "{:<20} {:>6} customers ({:.1}%)",
            segment.as_str(),
            count,
            percentage
        );
    }

    if let Some(path) = &args.scores {
        write_json(path, &scored)?;
        println!("RFM scores saved to: {}", path.display());
    }
    Ok(())
}

fn print_cluster_statistics(model: &CustomerSegmentation, predictions: &[usize]) -> Result<()> {
    let fitted = model.fitted()?;
    let sizes = cluster_sizes(predictions, fitted.n_clusters());
    let total = predictions.len();

    println!("\n=== Cluster Statistics ===");
    for profile in fitted.cluster_profiles()? {
        let size = sizes[profile.cluster];
        let percentage = size as f64 / total as f64 * 100.0;
        println!(
            "Cluster {} ({}): {} customers ({:.1}%)",
            profile.cluster, profile.label, size, percentage
        );
        for (feature, value) in &profile.centroid {
            println!("    {:<24} {:>12.2}", feature, value);
        }
    }

    let metrics = model.model_metrics()?;
    if let Some(silhouette) = metrics
        .get("final_silhouette_score")
        .and_then(|m| m.as_scalar())
    {
        println!("\nSilhouette score: {:.3}", silhouette);
    }
    if let Some(inertia) = metrics.get("final_inertia").and_then(|m| m.as_scalar()) {
        println!("Within-cluster sum of squares: {:.2}", inertia);
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
