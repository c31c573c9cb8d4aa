//! Fixtures shared by the unit tests: synthetic DICOM files and an
//! in-memory [`InstanceStore`].

use crate::{
    instance::{ImagingInstance, InstanceMetadata},
    store::{InstanceStore, SearchCriteria, StoreError, StudySummary},
};
use async_trait::async_trait;
use dicom::{
    core::{DataElement, PrimitiveValue, VR},
    object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use ndarray::Array2;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

pub(crate) const STUDY_UID: &str = "1.2.826.0.1.3680043.8.498.1";
pub(crate) const SERIES_UID: &str = "1.2.826.0.1.3680043.8.498.2";

/// Builder for a single-frame 16 bit CT slice.
pub(crate) struct SyntheticSlice {
    rows: u16,
    columns: u16,
    fill: u16,
    slice_location: Option<String>,
    instance_number: Option<i32>,
    rescale: Option<(String, String)>,
    sop_instance_uid: String,
}

impl SyntheticSlice {
    pub(crate) fn new(rows: u16, columns: u16) -> Self {
        Self {
            rows,
            columns,
            fill: 0,
            slice_location: None,
            instance_number: None,
            rescale: None,
            sop_instance_uid: "1.2.826.0.1.3680043.8.498.3".to_string(),
        }
    }

    pub(crate) fn slice_location(mut self, location: &str) -> Self {
        self.slice_location = Some(location.to_string());
        self
    }

    pub(crate) fn instance_number(mut self, number: i32) -> Self {
        self.instance_number = Some(number);
        self
    }

    pub(crate) fn fill(mut self, value: u16) -> Self {
        self.fill = value;
        self
    }

    pub(crate) fn rescale(mut self, slope: &str, intercept: &str) -> Self {
        self.rescale = Some((slope.to_string(), intercept.to_string()));
        self
    }

    pub(crate) fn to_object(&self) -> DefaultDicomObject {
        let mut object = InMemDicomObject::new_empty();
        let mut put = |tag, vr, value: PrimitiveValue| {
            object.put(DataElement::new(tag, vr, value));
        };
        put(tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE.into());
        put(tags::SOP_INSTANCE_UID, VR::UI, self.sop_instance_uid.as_str().into());
        put(tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID.into());
        put(tags::SERIES_INSTANCE_UID, VR::UI, SERIES_UID.into());
        put(tags::PATIENT_ID, VR::LO, "PAT-001".into());
        put(tags::STUDY_DATE, VR::DA, "20240101".into());
        put(tags::MODALITY, VR::CS, "CT".into());
        put(
            tags::PIXEL_SPACING,
            VR::DS,
            PrimitiveValue::Strs(SmallVec::from_vec(vec!["0.5".to_string(), "0.5".to_string()])),
        );
        if let Some(location) = &self.slice_location {
            put(tags::SLICE_LOCATION, VR::DS, location.as_str().into());
        }
        if let Some(number) = self.instance_number {
            put(tags::INSTANCE_NUMBER, VR::IS, number.to_string().into());
        }
        if let Some((slope, intercept)) = &self.rescale {
            put(tags::RESCALE_SLOPE, VR::DS, slope.as_str().into());
            put(tags::RESCALE_INTERCEPT, VR::DS, intercept.as_str().into());
        }
        put(tags::SAMPLES_PER_PIXEL, VR::US, 1_u16.into());
        put(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2".into());
        put(tags::ROWS, VR::US, self.rows.into());
        put(tags::COLUMNS, VR::US, self.columns.into());
        put(tags::BITS_ALLOCATED, VR::US, 16_u16.into());
        put(tags::BITS_STORED, VR::US, 16_u16.into());
        put(tags::HIGH_BIT, VR::US, 15_u16.into());
        put(tags::PIXEL_REPRESENTATION, VR::US, 0_u16.into());
        let pixels = vec![self.fill; usize::from(self.rows) * usize::from(self.columns)];
        put(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(SmallVec::from_vec(pixels)));

        object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(self.sop_instance_uid.as_str()),
            )
            .expect("synthetic slice should have a valid meta group")
    }

    /// A complete Part-10 file, preamble included.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.to_object()
            .write_all(&mut bytes)
            .expect("synthetic slice should serialize");
        bytes
    }
}

/// An in-memory slice of the synthetic study whose pixels all equal `fill`.
pub(crate) fn slice(id: &str, rows: usize, columns: usize, fill: f32) -> ImagingInstance {
    ImagingInstance::new(id, Array2::from_elem((rows, columns), fill)).with_metadata(
        InstanceMetadata {
            study_instance_uid: Some(STUDY_UID.to_string()),
            series_instance_uid: Some(SERIES_UID.to_string()),
            modality: "CT".to_string(),
            ..InstanceMetadata::default()
        },
    )
}

/// An in-memory store. Fetches can be delayed per instance to force
/// completion orders that differ from listing order.
#[derive(Default)]
pub(crate) struct FakeStore {
    series: HashMap<String, Vec<String>>,
    instances: HashMap<String, Vec<String>>,
    slices: HashMap<String, ImagingInstance>,
    delays: HashMap<String, Duration>,
    unavailable: HashSet<String>,
    studies: Vec<StudySummary>,
    reject_uploads: bool,
    pub(crate) uploads: Mutex<Vec<(Vec<u8>, String)>>,
    pub(crate) fetches: Mutex<Vec<String>>,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a study whose series hold the given slices, in listing order.
    pub(crate) fn with_study(
        mut self,
        study_id: &str,
        series: Vec<(&str, Vec<ImagingInstance>)>,
    ) -> Self {
        let mut series_ids = Vec::new();
        for (series_id, slices) in series {
            series_ids.push(series_id.to_string());
            let ids = slices.iter().map(|slice| slice.id.clone()).collect();
            self.instances.insert(series_id.to_string(), ids);
            for slice in slices {
                self.slices.insert(slice.id.clone(), slice);
            }
        }
        self.series.insert(study_id.to_string(), series_ids);
        self
    }

    pub(crate) fn with_summary(mut self, summary: StudySummary) -> Self {
        self.studies.push(summary);
        self
    }

    pub(crate) fn with_delay(mut self, instance_id: &str, delay: Duration) -> Self {
        self.delays.insert(instance_id.to_string(), delay);
        self
    }

    pub(crate) fn with_unavailable(mut self, instance_id: &str) -> Self {
        self.unavailable.insert(instance_id.to_string());
        self
    }

    pub(crate) fn rejecting_uploads(mut self) -> Self {
        self.reject_uploads = true;
        self
    }

    pub(crate) fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }
}

fn listing(map: &HashMap<String, Vec<String>>, key: &str) -> Result<Vec<String>, StoreError> {
    match map.get(key) {
        Some(ids) if !ids.is_empty() => Ok(ids.clone()),
        _ => Err(StoreError::NotFound(key.to_string())),
    }
}

#[async_trait]
impl InstanceStore for FakeStore {
    async fn list_series(&self, study_id: &str) -> Result<Vec<String>, StoreError> {
        listing(&self.series, study_id)
    }

    async fn list_instances(&self, series_id: &str) -> Result<Vec<String>, StoreError> {
        listing(&self.instances, series_id)
    }

    async fn download(&self, instance_id: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::NotFound(instance_id.to_string()))
    }

    async fn fetch_instance(&self, instance_id: &str) -> Result<ImagingInstance, StoreError> {
        if let Some(delay) = self.delays.get(instance_id) {
            tokio::time::sleep(*delay).await;
        }
        self.fetches.lock().push(instance_id.to_string());
        if self.unavailable.contains(instance_id) {
            return Err(StoreError::RemoteUnavailable(format!("{instance_id} timed out")));
        }
        self.slices
            .get(instance_id)
            .cloned()
            .ok_or_else(|| StoreError::RemoteRejected {
                status: 404,
                message: instance_id.to_string(),
            })
    }

    async fn upload_artifact(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        if self.reject_uploads {
            return Err(StoreError::RemoteRejected {
                status: 500,
                message: "storage full".to_string(),
            });
        }
        let mut uploads = self.uploads.lock();
        uploads.push((bytes, content_type.to_string()));
        Ok(format!("artifact-{}", uploads.len()))
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<StudySummary>, StoreError> {
        Ok(self
            .studies
            .iter()
            .filter(|study| {
                criteria
                    .study_instance_uid
                    .as_ref()
                    .is_none_or(|uid| study.study_instance_uid.as_ref() == Some(uid))
                    && criteria
                        .patient_id
                        .as_ref()
                        .is_none_or(|id| study.patient_id.as_ref() == Some(id))
            })
            .cloned()
            .collect())
    }
}
