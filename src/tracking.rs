//! Experiment tracking: run-scoped parameter, metric and artifact reporting

use crate::error::SegmentationError;
use crate::model::MetricValue;
use crate::persistence::save_bundle;
use crate::segmentation::{ClusterProfile, CustomerSegmentation};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the supplementary summary artifact
pub const SUMMARY_ARTIFACT: &str = "segmentation_summary.json";

/// Artifact path under which the model bundle is logged
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// A sink that can open tracking runs
pub trait ExperimentTracker {
    type Run: TrackingRun;

    fn start_run(&mut self, run_name: &str) -> crate::Result<Self::Run>;
}

/// An open run; everything logged through it belongs to that run
pub trait TrackingRun {
    fn run_id(&self) -> &str;
    fn log_param(&mut self, key: &str, value: &str) -> crate::Result<()>;
    fn log_metric(&mut self, key: &str, value: f64, step: Option<usize>) -> crate::Result<()>;
    /// Log a model directory under `artifact_path`
    fn log_model(&mut self, artifact_path: &str, model_dir: &Path) -> crate::Result<()>;
    fn log_artifact(&mut self, local_path: &Path) -> crate::Result<()>;
    /// Close the run with its final status
    fn end(self, status: RunStatus) -> crate::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationSummary {
    pub n_clusters: usize,
    pub random_state: u64,
    pub feature_names: Vec<String>,
    pub clusters: Vec<ClusterProfile>,
    pub model_metrics: BTreeMap<String, MetricValue>,
}

impl CustomerSegmentation {
    pub fn summary(&self) -> crate::Result<SegmentationSummary> {
        let fitted = self.fitted()?;
        Ok(SegmentationSummary {
            n_clusters: fitted.n_clusters(),
            random_state: self.random_state(),
            feature_names: fitted.feature_names(),
            clusters: fitted.cluster_profiles()?,
            model_metrics: fitted.model_metrics.clone(),
        })
    }

    /// Report parameters, metrics, the model bundle and a summary to one run
    ///
    /// Returns the id of the run that was opened.
    pub fn log_to_experiment_tracker<T: ExperimentTracker>(
        &self,
        tracker: &mut T,
    ) -> crate::Result<String> {
        let fitted = self.fitted()?;
        let summary = self.summary()?;

        let staging = tempfile::tempdir()?;
        let bundle_dir = staging.path().join(MODEL_ARTIFACT_PATH);
        save_bundle(fitted, self.random_state(), &bundle_dir)?;
        let summary_path = staging.path().join(SUMMARY_ARTIFACT);
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

        let mut run = tracker.start_run("customer_segmentation")?;
        let run_id = run.run_id().to_string();

        // The run is closed even when logging fails part way
        let logged = self.log_run(&mut run, &bundle_dir, &summary_path);
        let status = if logged.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        let ended = run.end(status);
        logged?;
        ended?;

        info!("Logged segmentation run {}", run_id);
        Ok(run_id)
    }

    fn log_run<R: TrackingRun>(
        &self,
        run: &mut R,
        bundle_dir: &Path,
        summary_path: &Path,
    ) -> crate::Result<()> {
        let fitted = self.fitted()?;

        run.log_param("n_clusters", &fitted.n_clusters().to_string())?;
        run.log_param("random_state", &self.random_state().to_string())?;
        run.log_param("max_iterations", &self.config().max_iterations.to_string())?;
        run.log_param("n_features", &fitted.feature_names.len().to_string())?;

        for (key, value) in &fitted.model_metrics {
            match value {
                MetricValue::Scalar(v) => run.log_metric(key, *v, None)?,
                MetricValue::Series(values) => {
                    for (step, v) in values.iter().enumerate() {
                        run.log_metric(key, *v, Some(step))?;
                    }
                }
            }
        }

        run.log_model(MODEL_ARTIFACT_PATH, bundle_dir)?;
        run.log_artifact(summary_path)
    }
}

/// Tracker that stores runs on the local filesystem
///
/// Layout: `<root>/<experiment>/<run_id>/{meta.json, params/, metrics/, artifacts/}`.
/// Each param is a file holding its value; each metric is a file of
/// `<timestamp_ms> <value> <step>` lines.
#[derive(Debug, Clone)]
pub struct FileTracker {
    root: PathBuf,
    experiment: String,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>, experiment: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            experiment: experiment.into(),
        }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join(&self.experiment)
    }
}

impl ExperimentTracker for FileTracker {
    type Run = FileRun;

    fn start_run(&mut self, run_name: &str) -> crate::Result<FileRun> {
        let run_id = Uuid::new_v4().simple().to_string();
        let dir = self.experiment_dir().join(&run_id);
        for sub in ["params", "metrics", "artifacts"] {
            fs::create_dir_all(dir.join(sub))?;
        }

        let run = FileRun {
            meta: RunMeta {
                run_id,
                run_name: run_name.to_string(),
                experiment: self.experiment.clone(),
                status: RunStatus::Running,
                start_time: Utc::now(),
                end_time: None,
            },
            dir,
        };
        run.write_meta()?;
        Ok(run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

/// Contents of a run's `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub run_name: String,
    pub experiment: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct FileRun {
    meta: RunMeta,
    dir: PathBuf,
}

impl FileRun {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_meta(&self) -> crate::Result<()> {
        fs::write(
            self.dir.join("meta.json"),
            serde_json::to_string_pretty(&self.meta)?,
        )?;
        Ok(())
    }
}

impl TrackingRun for FileRun {
    fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    fn log_param(&mut self, key: &str, value: &str) -> crate::Result<()> {
        fs::write(self.dir.join("params").join(key), value)?;
        Ok(())
    }

    fn log_metric(&mut self, key: &str, value: f64, step: Option<usize>) -> crate::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("metrics").join(key))?;
        writeln!(
            file,
            "{} {} {}",
            Utc::now().timestamp_millis(),
            value,
            step.unwrap_or(0)
        )?;
        Ok(())
    }

    fn log_model(&mut self, artifact_path: &str, model_dir: &Path) -> crate::Result<()> {
        copy_dir(model_dir, &self.dir.join("artifacts").join(artifact_path))
    }

    fn log_artifact(&mut self, local_path: &Path) -> crate::Result<()> {
        let file_name = local_path.file_name().ok_or_else(|| {
            SegmentationError::Tracking(format!("{} is not a file", local_path.display()))
        })?;
        fs::copy(local_path, self.dir.join("artifacts").join(file_name))?;
        Ok(())
    }

    fn end(mut self, status: RunStatus) -> crate::Result<()> {
        self.meta.status = status;
        self.meta.end_time = Some(Utc::now());
        self.write_meta()
    }
}

fn copy_dir(from: &Path, to: &Path) -> crate::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::sample_rfm;
    use crate::error::ErrorKind;
    use crate::persistence::{METADATA_FILE, MODEL_FILE, SCALER_FILE};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct Recorded {
        runs_started: usize,
        runs_ended: usize,
        final_status: Option<RunStatus>,
        reject_metrics: bool,
        params: Vec<(String, String)>,
        metrics: Vec<(String, f64, Option<usize>)>,
        models: Vec<String>,
        artifacts: Vec<PathBuf>,
    }

    #[derive(Default)]
    struct RecordingTracker {
        log: Rc<RefCell<Recorded>>,
    }

    struct RecordingRun {
        log: Rc<RefCell<Recorded>>,
    }

    impl ExperimentTracker for RecordingTracker {
        type Run = RecordingRun;

        fn start_run(&mut self, _run_name: &str) -> crate::Result<RecordingRun> {
            self.log.borrow_mut().runs_started += 1;
            Ok(RecordingRun {
                log: Rc::clone(&self.log),
            })
        }
    }

    impl TrackingRun for RecordingRun {
        fn run_id(&self) -> &str {
            "recorded"
        }

        fn log_param(&mut self, key: &str, value: &str) -> crate::Result<()> {
            self.log
                .borrow_mut()
                .params
                .push((key.to_string(), value.to_string()));
            Ok(())
        }

        fn log_metric(&mut self, key: &str, value: f64, step: Option<usize>) -> crate::Result<()> {
            if self.log.borrow().reject_metrics {
                return Err(SegmentationError::Tracking("metric store offline".to_string()));
            }
            self.log
                .borrow_mut()
                .metrics
                .push((key.to_string(), value, step));
            Ok(())
        }

        fn log_model(&mut self, artifact_path: &str, model_dir: &Path) -> crate::Result<()> {
            assert!(model_dir.join(MODEL_FILE).exists());
            self.log.borrow_mut().models.push(artifact_path.to_string());
            Ok(())
        }

        fn log_artifact(&mut self, local_path: &Path) -> crate::Result<()> {
            assert!(local_path.exists());
            self.log.borrow_mut().artifacts.push(local_path.to_path_buf());
            Ok(())
        }

        fn end(self, status: RunStatus) -> crate::Result<()> {
            let mut log = self.log.borrow_mut();
            log.runs_ended += 1;
            log.final_status = Some(status);
            Ok(())
        }
    }

    /// File-backed tracker whose runs refuse every metric
    struct MetricRejectingTracker(FileTracker);

    struct MetricRejectingRun(FileRun);

    impl ExperimentTracker for MetricRejectingTracker {
        type Run = MetricRejectingRun;

        fn start_run(&mut self, run_name: &str) -> crate::Result<MetricRejectingRun> {
            self.0.start_run(run_name).map(MetricRejectingRun)
        }
    }

    impl TrackingRun for MetricRejectingRun {
        fn run_id(&self) -> &str {
            self.0.run_id()
        }

        fn log_param(&mut self, key: &str, value: &str) -> crate::Result<()> {
            self.0.log_param(key, value)
        }

        fn log_metric(&mut self, _key: &str, _value: f64, _step: Option<usize>) -> crate::Result<()> {
            Err(SegmentationError::Tracking("metric store offline".to_string()))
        }

        fn log_model(&mut self, artifact_path: &str, model_dir: &Path) -> crate::Result<()> {
            self.0.log_model(artifact_path, model_dir)
        }

        fn log_artifact(&mut self, local_path: &Path) -> crate::Result<()> {
            self.0.log_artifact(local_path)
        }

        fn end(self, status: RunStatus) -> crate::Result<()> {
            self.0.end(status)
        }
    }

    #[test]
    fn test_logging_reports_one_run() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let mut tracker = RecordingTracker::default();
        model.log_to_experiment_tracker(&mut tracker).unwrap();

        let log = tracker.log.borrow();
        assert_eq!(log.runs_started, 1);
        assert_eq!(log.runs_ended, 1);
        assert_eq!(log.final_status, Some(RunStatus::Finished));
        assert!(log.params.iter().any(|(k, v)| k == "n_clusters" && v == "3"));
        assert!(log.params.iter().any(|(k, v)| k == "random_state" && v == "42"));
        assert!(log.metrics.iter().any(|(k, _, _)| k == "final_silhouette_score"));
        assert!(log.metrics.iter().any(|(k, _, _)| k == "final_inertia"));
        assert_eq!(log.models, vec![MODEL_ARTIFACT_PATH.to_string()]);
        assert_eq!(log.artifacts.len(), 1);
        assert!(log.artifacts[0].ends_with(SUMMARY_ARTIFACT));
    }

    #[test]
    fn test_failed_logging_still_ends_run() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let mut tracker = RecordingTracker::default();
        tracker.log.borrow_mut().reject_metrics = true;

        let err = model.log_to_experiment_tracker(&mut tracker).unwrap_err();
        assert!(matches!(err, SegmentationError::Tracking(_)));

        let log = tracker.log.borrow();
        assert_eq!(log.runs_started, 1);
        assert_eq!(log.runs_ended, 1);
        assert_eq!(log.final_status, Some(RunStatus::Failed));
        assert!(log.models.is_empty());
    }

    #[test]
    fn test_file_tracker_marks_failed_run() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, false).unwrap();

        let root = tempdir().unwrap();
        let mut tracker = MetricRejectingTracker(FileTracker::new(root.path(), "segmentation"));
        assert!(model.log_to_experiment_tracker(&mut tracker).is_err());

        let runs: Vec<PathBuf> = fs::read_dir(tracker.0.experiment_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(runs.len(), 1);

        let meta: RunMeta =
            serde_json::from_str(&fs::read_to_string(runs[0].join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        assert!(meta.end_time.is_some());
        assert!(runs[0].join("params").join("n_clusters").exists());
    }

    #[test]
    fn test_logging_without_fitting() {
        let model = CustomerSegmentation::with_params(3, 42);
        let mut tracker = RecordingTracker::default();

        let err = model.log_to_experiment_tracker(&mut tracker).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(tracker.log.borrow().runs_started, 0);
    }

    #[test]
    fn test_file_tracker_layout() {
        let rfm = sample_rfm();
        let mut model = CustomerSegmentation::with_params(3, 42);
        model.fit(&rfm, true).unwrap();

        let root = tempdir().unwrap();
        let mut tracker = FileTracker::new(root.path(), "segmentation");
        let run_id = model.log_to_experiment_tracker(&mut tracker).unwrap();

        let run_dir = tracker.experiment_dir().join(&run_id);
        let meta: RunMeta =
            serde_json::from_str(&fs::read_to_string(run_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta.status, RunStatus::Finished);
        assert!(meta.end_time.is_some());

        let n_clusters = fs::read_to_string(run_dir.join("params").join("n_clusters")).unwrap();
        assert_eq!(n_clusters, model.n_clusters().to_string());

        let inertia = fs::read_to_string(run_dir.join("metrics").join("final_inertia")).unwrap();
        assert_eq!(inertia.lines().count(), 1);

        // One line per swept k
        let silhouettes =
            fs::read_to_string(run_dir.join("metrics").join("silhouette_scores")).unwrap();
        let cluster_range = model.model_metrics().unwrap()["cluster_range"].clone();
        match cluster_range {
            MetricValue::Series(ks) => assert_eq!(silhouettes.lines().count(), ks.len()),
            MetricValue::Scalar(_) => panic!("cluster_range should be a series"),
        }

        let artifacts = run_dir.join("artifacts");
        for file in [MODEL_FILE, SCALER_FILE, METADATA_FILE] {
            assert!(artifacts.join(MODEL_ARTIFACT_PATH).join(file).exists());
        }
        let summary: SegmentationSummary = serde_json::from_str(
            &fs::read_to_string(artifacts.join(SUMMARY_ARTIFACT)).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.clusters.len(), model.n_clusters());
    }
}
