use crate::{
    config::AssemblyConfig,
    enums::{ResolveMode, SeriesPolicy, SortKey},
    instance::ImagingInstance,
    store::{InstanceStore, SearchCriteria, StoreError},
    volume::{OrderingReport, SliceInfo, Volume},
};
use futures::{StreamExt, TryStreamExt, future::try_join_all, stream};
use ndarray::{Array3, s};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No slices found: {0}")]
    EmptySeries(String),

    #[error(
        "Inconsistent image dimensions: instance {instance_id} is {found:?}, expected {expected:?}"
    )]
    InconsistentGeometry {
        instance_id: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AssemblyError {
    /// Nothing to assemble, as opposed to a failure to reach the store.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AssemblyError::EmptySeries(_) | AssemblyError::Store(StoreError::NotFound(_))
        )
    }
}

/// The key a slice sorts by: SliceLocation, else InstanceNumber, else the
/// arrival-order fallback.
pub fn sort_key(instance: &ImagingInstance) -> SortKey {
    match (instance.slice_location, instance.instance_number) {
        (Some(location), _) => SortKey::SliceLocation(location),
        (None, Some(number)) => SortKey::InstanceNumber(number),
        (None, None) => SortKey::Fallback,
    }
}

/// Sort slices ascending by [`sort_key`].
///
/// The sort is stable, so slices with equal keys (including every slice
/// taking the fallback) keep the order they were given in.
pub fn order_slices(
    instances: Vec<ImagingInstance>,
) -> (Vec<(SortKey, ImagingInstance)>, OrderingReport) {
    let mut keyed: Vec<_> = instances
        .into_iter()
        .map(|instance| (sort_key(&instance), instance))
        .collect();
    keyed.sort_by(|a, b| a.0.value().total_cmp(&b.0.value()));

    let report = OrderingReport {
        degraded: keyed.iter().any(|(key, _)| key.is_degraded()),
        slices_without_location: keyed.iter().filter(|(key, _)| key.is_degraded()).count(),
        duplicate_keys: keyed
            .windows(2)
            .filter(|pair| pair[0].0.value() == pair[1].0.value())
            .count(),
    };
    (keyed, report)
}

/// Order, validate and stack already fetched slices.
///
/// `instances` must be in arrival order; it decides ties.
///
/// # Errors
///
/// Returns error if there are no slices or their dimensions differ.
pub fn stack_slices(instances: Vec<ImagingInstance>) -> Result<Volume, AssemblyError> {
    if instances.is_empty() {
        return Err(AssemblyError::EmptySeries("no instances to stack".to_string()));
    }

    let (ordered, report) = order_slices(instances);
    if report.degraded {
        warn!(
            slices_without_location = report.slices_without_location,
            total = ordered.len(),
            "SliceLocation missing, slice order relies on InstanceNumber or arrival order"
        );
    }
    if report.duplicate_keys > 0 {
        debug!(duplicate_keys = report.duplicate_keys, "Slices share sort keys");
    }

    validate_dimensions(&ordered)?;

    let volume_array = build_volume_array(&ordered);
    let slices = ordered
        .iter()
        .map(|(key, instance)| SliceInfo::from_instance(instance, *key))
        .collect();
    Ok(Volume::new(volume_array, slices, report))
}

fn validate_dimensions(ordered: &[(SortKey, ImagingInstance)]) -> Result<(), AssemblyError> {
    let expected = ordered[0].1.dim();
    match ordered.iter().find(|(_, instance)| instance.dim() != expected) {
        Some((_, instance)) => Err(AssemblyError::InconsistentGeometry {
            instance_id: instance.id.clone(),
            expected,
            found: instance.dim(),
        }),
        None => Ok(()),
    }
}

fn build_volume_array(ordered: &[(SortKey, ImagingInstance)]) -> Array3<f32> {
    let (height, width) = ordered[0].1.dim();
    let depth = ordered.len();
    let mut volume = Array3::<f32>::zeros((depth, height, width));

    for (i, (_, instance)) in ordered.iter().enumerate() {
        volume.slice_mut(s![i, .., ..]).assign(&instance.pixels);
    }

    volume
}

/// Builds a [`Volume`] for a study out of the instances held by a store.
#[derive(Clone)]
pub struct VolumeAssembler {
    store: Arc<dyn InstanceStore>,
    config: AssemblyConfig,
}

impl VolumeAssembler {
    pub fn new(store: Arc<dyn InstanceStore>, config: AssemblyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Assemble the volume of a study, or of the study an instance belongs to.
    ///
    /// # Errors
    ///
    /// Returns `EmptySeries` if any listing is empty, `InconsistentGeometry`
    /// if slice dimensions differ, and store errors unchanged otherwise.
    pub async fn assemble(
        &self,
        identifier: &str,
        mode: ResolveMode,
    ) -> Result<Volume, AssemblyError> {
        let study_id = self.resolve_study(identifier, mode).await?;
        self.assemble_study(&study_id).await
    }

    /// The store id of the study `identifier` designates.
    pub async fn resolve_study(
        &self,
        identifier: &str,
        mode: ResolveMode,
    ) -> Result<String, AssemblyError> {
        match mode {
            ResolveMode::ByStudy => Ok(identifier.to_string()),
            ResolveMode::ByInstance => self.resolve_parent_study(identifier).await,
        }
    }

    pub async fn assemble_study(&self, study_id: &str) -> Result<Volume, AssemblyError> {
        let instance_ids = self.list_study_instances(study_id).await?;
        info!(
            study_id,
            instances = instance_ids.len(),
            policy = ?self.config.series_policy,
            "Fetching instances"
        );
        let instances = self.fetch_all(instance_ids).await?;
        let volume = stack_slices(instances)?;
        info!(study_id, shape = ?volume.dim(), "Volume assembled");
        Ok(volume)
    }

    /// The store id of the study an instance belongs to.
    async fn resolve_parent_study(&self, instance_id: &str) -> Result<String, AssemblyError> {
        let instance = self.store.fetch_instance(instance_id).await?;
        let study_uid = instance.metadata.study_instance_uid.ok_or_else(|| {
            StoreError::NotFound(format!("instance {instance_id} has no StudyInstanceUID"))
        })?;
        let study = self
            .store
            .search(&SearchCriteria::study_uid(&study_uid))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("no study with UID {study_uid}")))?;
        debug!(instance_id, %study_uid, study_id = %study.id, "Resolved parent study");
        Ok(study.id)
    }

    async fn list_study_instances(&self, study_id: &str) -> Result<Vec<String>, AssemblyError> {
        let mut series = self.store.list_series(study_id).await.map_err(empty_listing)?;
        if series.is_empty() {
            return Err(AssemblyError::EmptySeries(format!("study {study_id} has no series")));
        }
        if self.config.series_policy == SeriesPolicy::FirstSeries {
            if series.len() > 1 {
                debug!(study_id, ignored = series.len() - 1, "Using first series only");
            }
            series.truncate(1);
        }

        let listings = try_join_all(
            series
                .iter()
                .map(|series_id| self.store.list_instances(series_id)),
        )
        .await
        .map_err(empty_listing)?;
        let instance_ids: Vec<String> = listings.into_iter().flatten().collect();
        if instance_ids.is_empty() {
            return Err(AssemblyError::EmptySeries(format!("study {study_id} has no instances")));
        }
        Ok(instance_ids)
    }

    /// Fetch every instance concurrently and return them in listing order,
    /// whatever order the downloads complete in.
    async fn fetch_all(
        &self,
        instance_ids: Vec<String>,
    ) -> Result<Vec<ImagingInstance>, AssemblyError> {
        let mut fetched: Vec<(usize, ImagingInstance)> =
            stream::iter(instance_ids.into_iter().enumerate())
                .map(|(index, id)| {
                    let store = Arc::clone(&self.store);
                    async move {
                        store
                            .fetch_instance(&id)
                            .await
                            .map(|instance| (index, instance))
                    }
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .try_collect()
                .await?;
        fetched.sort_by_key(|(index, _)| *index);
        Ok(fetched.into_iter().map(|(_, instance)| instance).collect())
    }
}

fn empty_listing(err: StoreError) -> AssemblyError {
    match err {
        StoreError::NotFound(what) => AssemblyError::EmptySeries(what),
        other => AssemblyError::Store(other),
    }
}
