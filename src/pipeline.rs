//! Sequences assembly, preprocessing, inference, encoding and upload for one
//! study.
//!
//! A run moves through [`RunState`]s in order and stops at the first step
//! that fails, reporting that step and its cause as [`PipelineFailed`].
//! Nothing is retried here and nothing is uploaded unless every earlier step
//! succeeded. Runs share no mutable state, so one [`Orchestrator`] can serve
//! any number of concurrent runs.

use crate::{
    config::PipelineConfig,
    enums::{ResolveMode, Stage},
    stages::{Model, ResultEncoder, StageError, infer, preprocess},
    store::{InstanceStore, StoreError},
    volume_assembler::{AssemblyError, VolumeAssembler},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span};
use web_time::Instant;

/// Progress of a run; each state is reached once the step before succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    VolumeAssembled,
    Preprocessed,
    Inferred,
    Encoded,
    Completed,
}

#[derive(Debug, Error)]
pub enum PipelineCause {
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
#[error("Pipeline failed at {stage}: {cause}")]
pub struct PipelineFailed {
    pub stage: Stage,
    /// Last state reached before the failing step.
    pub reached: RunState,
    #[source]
    pub cause: PipelineCause,
}

impl PipelineFailed {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, PipelineCause::Cancelled(_))
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::Failed {
            stage: self.stage,
            reason: self.cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed { stage: Stage, reason: String },
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub study_id: String,
    pub volume_shape: (usize, usize, usize),
    pub label_shape: (usize, usize, usize),
    pub status: PipelineStatus,
    /// Store id of the uploaded artifact, when uploading is enabled.
    pub artifact_id: Option<String>,
    pub artifact_size: usize,
    /// The slice order fell back to InstanceNumber or arrival order.
    pub degraded_ordering: bool,
    pub elapsed_ms: u64,
}

/// Cooperative cancellation, checked by the orchestrator between steps.
///
/// Clones share state. The first reason given wins.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let first = self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            *self.inner.reason.lock() = Some(reason.into());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}

/// One run's progress; lives only as long as the run.
struct Run<'a> {
    state: RunState,
    cancellation: &'a CancellationToken,
}

impl Run<'_> {
    fn fail(&self, stage: Stage, cause: impl Into<PipelineCause>) -> PipelineFailed {
        PipelineFailed {
            stage,
            reached: self.state,
            cause: cause.into(),
        }
    }

    /// Refuse to start `stage` once the caller has given up on the run.
    fn enter(&self, stage: Stage) -> Result<(), PipelineFailed> {
        if self.cancellation.is_cancelled() {
            let reason = self
                .cancellation
                .reason()
                .unwrap_or_else(|| "cancelled by caller".to_string());
            return Err(self.fail(stage, PipelineCause::Cancelled(reason)));
        }
        debug!(%stage, "Entering stage");
        Ok(())
    }

    fn advance(&mut self, state: RunState) {
        info!(from = ?self.state, to = ?state, "Pipeline transition");
        self.state = state;
    }
}

/// Runs the contouring pipeline for one study at a time per call.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn InstanceStore>,
    assembler: VolumeAssembler,
    model: Arc<dyn Model>,
    encoder: Arc<dyn ResultEncoder>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        model: Arc<dyn Model>,
        encoder: Arc<dyn ResultEncoder>,
        config: PipelineConfig,
    ) -> Self {
        let assembler = VolumeAssembler::new(Arc::clone(&store), config.assembly.clone());
        Self {
            store,
            assembler,
            model,
            encoder,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns the step that failed and why; no artifact is uploaded then.
    pub async fn run(
        &self,
        identifier: &str,
        mode: ResolveMode,
    ) -> Result<PipelineResult, PipelineFailed> {
        self.run_with_cancellation(identifier, mode, &CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::run`], giving up at the next step boundary once
    /// `cancellation` fires.
    pub async fn run_with_cancellation(
        &self,
        identifier: &str,
        mode: ResolveMode,
        cancellation: &CancellationToken,
    ) -> Result<PipelineResult, PipelineFailed> {
        let span = info_span!("pipeline", identifier, ?mode, model = self.model.name());
        let outcome = self
            .execute(identifier, mode, cancellation)
            .instrument(span.clone())
            .await;
        if let Err(failed) = &outcome {
            span.in_scope(|| {
                error!(
                    stage = %failed.stage,
                    reached = ?failed.reached,
                    error = %failed.cause,
                    "Pipeline failed"
                );
            });
        }
        outcome
    }

    async fn execute(
        &self,
        identifier: &str,
        mode: ResolveMode,
        cancellation: &CancellationToken,
    ) -> Result<PipelineResult, PipelineFailed> {
        let started = Instant::now();
        let mut run = Run {
            state: RunState::Started,
            cancellation,
        };

        run.enter(Stage::Assembly)?;
        let study_id = self
            .assembler
            .resolve_study(identifier, mode)
            .await
            .map_err(|e| run.fail(Stage::Assembly, e))?;
        let volume = Arc::new(
            self.assembler
                .assemble_study(&study_id)
                .await
                .map_err(|e| run.fail(Stage::Assembly, e))?,
        );
        let volume_shape = volume.dim();
        run.advance(RunState::VolumeAssembled);

        run.enter(Stage::Preprocess)?;
        let normalization = self.config.normalization;
        let normalized = blocking({
            let volume = Arc::clone(&volume);
            move || -> Result<_, PipelineCause> { Ok(preprocess(&volume, normalization)) }
        })
        .await
        .map_err(|cause| run.fail(Stage::Preprocess, cause))?;
        run.advance(RunState::Preprocessed);

        run.enter(Stage::Inference)?;
        let labels = blocking({
            let model = Arc::clone(&self.model);
            move || -> Result<_, PipelineCause> { Ok(infer(normalized.view(), model.as_ref())?) }
        })
        .await
        .map_err(|cause| run.fail(Stage::Inference, cause))?;
        let label_shape = labels.dim();
        run.advance(RunState::Inferred);

        run.enter(Stage::Encoding)?;
        let artifact = blocking({
            let encoder = Arc::clone(&self.encoder);
            let volume = Arc::clone(&volume);
            move || -> Result<_, PipelineCause> { Ok(encoder.encode(&labels, &volume.slices)?) }
        })
        .await
        .map_err(|cause| run.fail(Stage::Encoding, cause))?;
        let artifact_size = artifact.len();
        run.advance(RunState::Encoded);

        let artifact_id = if self.config.upload_result {
            run.enter(Stage::Upload)?;
            let id = self
                .store
                .upload_artifact(artifact, self.encoder.content_type())
                .await
                .map_err(|e| run.fail(Stage::Upload, e))?;
            info!(artifact_id = %id, size = artifact_size, "Artifact uploaded");
            Some(id)
        } else {
            None
        };
        run.advance(RunState::Completed);

        Ok(PipelineResult {
            study_id,
            volume_shape,
            label_shape,
            status: PipelineStatus::Completed,
            artifact_id,
            artifact_size,
            degraded_ordering: volume.ordering.degraded,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Run CPU-bound step work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, PipelineCause>
where
    F: FnOnce() -> Result<T, PipelineCause> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineCause::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AssemblyConfig,
        enums::SeriesPolicy,
        instance::ImagingInstance,
        stages::{LabelVolume, ModelOutput, SegmentationEncoder, ThresholdModel, ZeroModel},
        testing::{FakeStore, slice},
        volume::SliceInfo,
    };
    use ndarray::{Array3, ArrayView3};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn located(id: &str, location: f64, size: usize) -> ImagingInstance {
        slice(id, size, size, location as f32).with_slice_location(location)
    }

    fn four_slice_study() -> FakeStore {
        FakeStore::new().with_study(
            "st1",
            vec![(
                "se1",
                vec![
                    located("a", 3.0, 16),
                    located("b", 0.0, 16),
                    located("c", 2.0, 16),
                    located("d", 1.0, 16),
                ],
            )],
        )
    }

    fn orchestrator(store: Arc<FakeStore>, config: PipelineConfig) -> Orchestrator {
        Orchestrator::new(
            store,
            Arc::new(ZeroModel),
            Arc::new(SegmentationEncoder::default()),
            config,
        )
    }

    /// Fails or cancels inside inference.
    struct Failing {
        cancel: Option<CancellationToken>,
    }

    impl Model for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn predict(&self, _volume: ArrayView3<'_, f32>) -> Result<ModelOutput, StageError> {
            match &self.cancel {
                Some(token) => {
                    token.cancel("caller went away");
                    Ok(ModelOutput::Labels(Array3::zeros((4, 16, 16))))
                }
                None => Err(StageError::Model("weights missing".to_string())),
            }
        }
    }

    struct Placeholder;

    impl ResultEncoder for Placeholder {
        fn content_type(&self) -> &str {
            "text/plain"
        }

        fn encode(
            &self,
            _labels: &LabelVolume,
            _source: &[SliceInfo],
        ) -> Result<Vec<u8>, StageError> {
            Ok(b"RTSTRUCT".to_vec())
        }
    }

    #[tokio::test]
    async fn four_slice_study_completes() {
        let store = Arc::new(four_slice_study());
        let result = orchestrator(Arc::clone(&store), PipelineConfig::default())
            .run("st1", ResolveMode::ByStudy)
            .await
            .unwrap();

        assert_eq!(result.study_id, "st1");
        assert_eq!(result.volume_shape, (4, 16, 16));
        assert_eq!(result.label_shape, (4, 16, 16));
        assert_eq!(result.status, PipelineStatus::Completed);
        assert!(result.artifact_size > 0);
        assert_eq!(result.artifact_id.as_deref(), Some("artifact-1"));
        assert!(!result.degraded_ordering);

        let uploads = store.uploads.lock();
        assert_eq!(uploads[0].1, "application/dicom");
        assert_eq!(uploads[0].0.len(), result.artifact_size);
    }

    #[tokio::test]
    async fn upload_can_be_disabled() {
        let store = Arc::new(four_slice_study());
        let result = orchestrator(Arc::clone(&store), PipelineConfig::default().with_upload(false))
            .run("st1", ResolveMode::ByStudy)
            .await
            .unwrap();

        assert!(result.artifact_id.is_none());
        assert!(result.artifact_size > 0);
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn encoders_are_interchangeable() {
        let store = Arc::new(four_slice_study());
        let result = Orchestrator::new(
            store.clone(),
            Arc::new(ThresholdModel::new(2.0)),
            Arc::new(Placeholder),
            PipelineConfig::default(),
        )
        .run("st1", ResolveMode::ByStudy)
        .await
        .unwrap();

        assert_eq!(result.artifact_size, 8);
        assert_eq!(store.uploads.lock()[0].1, "text/plain");
    }

    #[tokio::test]
    async fn study_without_series_fails_at_assembly() {
        let store = Arc::new(FakeStore::new());
        let failed = orchestrator(Arc::clone(&store), PipelineConfig::default())
            .run("missing", ResolveMode::ByStudy)
            .await
            .unwrap_err();

        assert_eq!(failed.stage, Stage::Assembly);
        assert_eq!(failed.reached, RunState::Started);
        assert!(matches!(
            failed.cause,
            PipelineCause::Assembly(ref e) if e.is_not_found()
        ));
        assert!(matches!(failed.status(), PipelineStatus::Failed { stage: Stage::Assembly, .. }));
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn geometry_mismatch_fails_without_upload() {
        let store = Arc::new(FakeStore::new().with_study(
            "st1",
            vec![("se1", vec![located("a", 0.0, 16), located("b", 1.0, 8)])],
        ));
        let failed = orchestrator(Arc::clone(&store), PipelineConfig::default())
            .run("st1", ResolveMode::ByStudy)
            .await
            .unwrap_err();

        assert_eq!(failed.stage, Stage::Assembly);
        assert!(matches!(
            failed.cause,
            PipelineCause::Assembly(AssemblyError::InconsistentGeometry { .. })
        ));
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn model_failure_is_attributed_to_inference() {
        let store = Arc::new(four_slice_study());
        let failed = Orchestrator::new(
            store.clone(),
            Arc::new(Failing { cancel: None }),
            Arc::new(SegmentationEncoder::default()),
            PipelineConfig::default(),
        )
        .run("st1", ResolveMode::ByStudy)
        .await
        .unwrap_err();

        assert_eq!(failed.stage, Stage::Inference);
        assert_eq!(failed.reached, RunState::Preprocessed);
        assert!(failed.to_string().contains("weights missing"));
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn rejected_upload_fails_at_upload() {
        let store = Arc::new(four_slice_study().rejecting_uploads());
        let failed = orchestrator(store, PipelineConfig::default())
            .run("st1", ResolveMode::ByStudy)
            .await
            .unwrap_err();

        assert_eq!(failed.stage, Stage::Upload);
        assert_eq!(failed.reached, RunState::Encoded);
        assert!(matches!(
            failed.cause,
            PipelineCause::Store(ref e) if e.is_retryable()
        ));
    }

    #[tokio::test]
    async fn cancellation_before_start_fetches_nothing() {
        let store = Arc::new(four_slice_study());
        let token = CancellationToken::new();
        token.cancel("shutdown");

        let failed = orchestrator(Arc::clone(&store), PipelineConfig::default())
            .run_with_cancellation("st1", ResolveMode::ByStudy, &token)
            .await
            .unwrap_err();

        assert!(failed.is_cancelled());
        assert_eq!(failed.stage, Stage::Assembly);
        assert!(store.fetches.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_run_stops_before_upload() {
        let store = Arc::new(four_slice_study());
        let token = CancellationToken::new();
        let failed = Orchestrator::new(
            store.clone(),
            Arc::new(Failing {
                cancel: Some(token.clone()),
            }),
            Arc::new(SegmentationEncoder::default()),
            PipelineConfig::default(),
        )
        .run_with_cancellation("st1", ResolveMode::ByStudy, &token)
        .await
        .unwrap_err();

        assert!(failed.is_cancelled());
        assert_eq!(failed.stage, Stage::Encoding);
        assert_eq!(failed.reached, RunState::Inferred);
        assert_eq!(store.upload_count(), 0);
    }

    #[test]
    fn reason_survives_a_panic_while_locked() {
        let token = CancellationToken::new();
        let held = token.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = held.inner.reason.lock();
            panic!("worker died holding the reason");
        })
        .join();
        assert!(crashed.is_err());

        token.cancel("shutdown");
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn first_cancellation_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn concurrent_runs_stay_independent() {
        let store = Arc::new(
            four_slice_study()
                .with_study(
                    "st2",
                    vec![
                        ("se2", vec![located("x", 5.0, 8), located("y", -5.0, 8)]),
                        ("se3", vec![located("z", 0.0, 8)]),
                    ],
                )
                .with_delay("a", Duration::from_millis(20)),
        );
        let config = PipelineConfig::default().with_assembly(
            AssemblyConfig::default().with_series_policy(SeriesPolicy::AllSeries),
        );
        let orchestrator = orchestrator(Arc::clone(&store), config);

        let (first, second) = tokio::join!(
            orchestrator.run("st1", ResolveMode::ByStudy),
            orchestrator.run("st2", ResolveMode::ByStudy),
        );

        assert_eq!(first.unwrap().volume_shape, (4, 16, 16));
        assert_eq!(second.unwrap().volume_shape, (3, 8, 8));
        assert_eq!(store.upload_count(), 2);
    }

    #[tokio::test]
    async fn degraded_ordering_is_reported() {
        let store = Arc::new(FakeStore::new().with_study(
            "st1",
            vec![("se1", vec![slice("a", 4, 4, 0.0), slice("b", 4, 4, 0.0)])],
        ));
        let result = orchestrator(store, PipelineConfig::default())
            .run("st1", ResolveMode::ByStudy)
            .await
            .unwrap();
        assert!(result.degraded_ordering);
    }

    #[test]
    fn failed_status_serializes_with_stage_and_reason() {
        let failed = PipelineFailed {
            stage: Stage::Upload,
            reached: RunState::Encoded,
            cause: PipelineCause::Cancelled("shutdown".to_string()),
        };
        let json = serde_json::to_value(failed.status()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "failed",
                "stage": "upload",
                "reason": "Cancelled: shutdown"
            })
        );
    }
}
