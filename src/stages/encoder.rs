use super::{LabelVolume, StageError};
use crate::{store::DICOM_CONTENT_TYPE, volume::SliceInfo};
use dicom::{
    core::{DataElement, Length, PrimitiveValue, Tag, VR, value::DataSetSequence},
    object::{FileMetaTableBuilder, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use smallvec::SmallVec;
use tracing::warn;
use uuid::Uuid;

pub const LABEL_MAP_SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.7";

const SERIES_NUMBER: &str = "9001";

/// Turns a label volume into bytes the store accepts as a new resource.
pub trait ResultEncoder: Send + Sync {
    fn content_type(&self) -> &str;

    /// `source` lists the contributing slices in volume order.
    fn encode(&self, labels: &LabelVolume, source: &[SliceInfo]) -> Result<Vec<u8>, StageError>;
}

/// Encodes labels as a DICOM label map segmentation: one 8 bit frame per
/// slice, in the study of the source slices, referencing each of them.
#[derive(Debug, Clone)]
pub struct SegmentationEncoder {
    pub series_description: String,
    pub content_label: String,
}

impl Default for SegmentationEncoder {
    fn default() -> Self {
        Self {
            series_description: "Auto-contour".to_string(),
            content_label: "AUTOCONTOUR".to_string(),
        }
    }
}

impl ResultEncoder for SegmentationEncoder {
    fn content_type(&self) -> &str {
        DICOM_CONTENT_TYPE
    }

    fn encode(&self, labels: &LabelVolume, source: &[SliceInfo]) -> Result<Vec<u8>, StageError> {
        let (frames, rows, columns) = labels.dim();
        if frames != source.len() || frames == 0 {
            return Err(StageError::ShapeMismatch {
                expected: (source.len(), rows, columns),
                found: labels.shape().to_vec(),
            });
        }
        let rows = dimension_u16(rows)?;
        let columns = dimension_u16(columns)?;

        let first = &source[0].metadata;
        let study_uid = first
            .study_instance_uid
            .clone()
            .ok_or_else(|| {
                StageError::Encoding("source slices carry no StudyInstanceUID".to_string())
            })?;
        let sop_instance_uid = new_uid();

        let mut object = InMemDicomObject::new_empty();
        let mut put_str = |tag: Tag, vr: VR, value: &str| {
            object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        };
        put_str(tags::SOP_CLASS_UID, VR::UI, LABEL_MAP_SEGMENTATION_STORAGE);
        put_str(tags::SOP_INSTANCE_UID, VR::UI, &sop_instance_uid);
        put_str(tags::STUDY_INSTANCE_UID, VR::UI, &study_uid);
        put_str(tags::SERIES_INSTANCE_UID, VR::UI, &new_uid());
        put_str(tags::MODALITY, VR::CS, "SEG");
        put_str(tags::SERIES_NUMBER, VR::IS, SERIES_NUMBER);
        put_str(tags::INSTANCE_NUMBER, VR::IS, "1");
        put_str(tags::SERIES_DESCRIPTION, VR::LO, &self.series_description);
        put_str(tags::CONTENT_LABEL, VR::CS, &self.content_label);
        put_str(tags::SEGMENTATION_TYPE, VR::CS, "LABELMAP");
        put_str(tags::PATIENT_ID, VR::LO, &first.patient_id);
        if first.study_date.chars().all(|c| c.is_ascii_digit()) {
            put_str(tags::STUDY_DATE, VR::DA, &first.study_date);
        }
        if let Some(name) = &first.patient_name {
            put_str(tags::PATIENT_NAME, VR::PN, name);
        }
        put_str(tags::NUMBER_OF_FRAMES, VR::IS, &frames.to_string());
        put_str(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");

        let mut put_us = |tag: Tag, value: u16| {
            object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        };
        put_us(tags::SAMPLES_PER_PIXEL, 1);
        put_us(tags::ROWS, rows);
        put_us(tags::COLUMNS, columns);
        put_us(tags::BITS_ALLOCATED, 8);
        put_us(tags::BITS_STORED, 8);
        put_us(tags::HIGH_BIT, 7);
        put_us(tags::PIXEL_REPRESENTATION, 0);

        let (references, skipped) = referenced_series(source);
        if skipped > 0 {
            warn!(
                skipped,
                frames,
                "Slices without SOPInstanceUID are not referenced by the segmentation"
            );
        }
        object.put(DataElement::new(
            tags::REFERENCED_SERIES_SEQUENCE,
            VR::SQ,
            DataSetSequence::new(references, Length::UNDEFINED),
        ));

        let pixels: Vec<u8> = labels.iter().copied().collect();
        object.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(SmallVec::from_vec(pixels)),
        ));

        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(LABEL_MAP_SEGMENTATION_STORAGE)
                    .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
            )
            .map_err(|e| StageError::Encoding(e.to_string()))?;

        let mut bytes = Vec::new();
        file.write_all(&mut bytes)
            .map_err(|e| StageError::Encoding(e.to_string()))?;
        Ok(bytes)
    }
}

/// One item per source series, each listing its instances in volume order,
/// and the number of slices left out for lacking a SOPInstanceUID.
fn referenced_series(source: &[SliceInfo]) -> (Vec<InMemDicomObject>, usize) {
    let mut series: Vec<(Option<&str>, Vec<InMemDicomObject>)> = Vec::new();
    let mut skipped = 0;
    for slice in source {
        let Some(sop_instance_uid) = slice.metadata.sop_instance_uid.as_deref() else {
            skipped += 1;
            continue;
        };
        let mut reference = InMemDicomObject::new_empty();
        if let Some(class) = slice.metadata.sop_class_uid.as_deref() {
            reference.put(DataElement::new(
                tags::REFERENCED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(class),
            ));
        }
        reference.put(DataElement::new(
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ));

        let series_uid = slice.metadata.series_instance_uid.as_deref();
        match series.iter_mut().find(|(uid, _)| *uid == series_uid) {
            Some((_, references)) => references.push(reference),
            None => series.push((series_uid, vec![reference])),
        }
    }

    let items = series
        .into_iter()
        .map(|(series_uid, references)| {
            let mut item = InMemDicomObject::new_empty();
            if let Some(uid) = series_uid {
                item.put(DataElement::new(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    PrimitiveValue::from(uid),
                ));
            }
            item.put(DataElement::new(
                tags::REFERENCED_INSTANCE_SEQUENCE,
                VR::SQ,
                DataSetSequence::new(references, Length::UNDEFINED),
            ));
            item
        })
        .collect();
    (items, skipped)
}

fn dimension_u16(value: usize) -> Result<u16, StageError> {
    u16::try_from(value)
        .map_err(|_| StageError::Encoding(format!("dimension {value} exceeds 16 bits")))
}

/// A UID under the UUID-derived `2.25` root.
fn new_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}
