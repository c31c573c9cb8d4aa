use dicom::{
    core::Tag,
    object::{DefaultDicomObject, from_reader},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNKNOWN: &str = "Unknown";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Pixel data could not be decoded: {0}")]
    PixelData(String),
}

/// Identifying and descriptive attributes of one slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_date: String,
    pub modality: String,
    pub study_description: String,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            study_instance_uid: None,
            series_instance_uid: None,
            sop_instance_uid: None,
            sop_class_uid: None,
            patient_id: UNKNOWN.to_string(),
            patient_name: None,
            study_date: UNKNOWN.to_string(),
            modality: UNKNOWN.to_string(),
            study_description: UNKNOWN.to_string(),
        }
    }
}

impl InstanceMetadata {
    fn from_object(object: &DefaultDicomObject) -> Self {
        let or_unknown = |tag| read_string(object, tag).unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            study_instance_uid: read_string(object, tags::STUDY_INSTANCE_UID),
            series_instance_uid: read_string(object, tags::SERIES_INSTANCE_UID),
            sop_instance_uid: read_string(object, tags::SOP_INSTANCE_UID),
            sop_class_uid: read_string(object, tags::SOP_CLASS_UID),
            patient_id: or_unknown(tags::PATIENT_ID),
            patient_name: read_string(object, tags::PATIENT_NAME),
            study_date: or_unknown(tags::STUDY_DATE),
            modality: or_unknown(tags::MODALITY),
            study_description: or_unknown(tags::STUDY_DESCRIPTION),
        }
    }
}

/// Linear modality transform from stored values to output units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rescale {
    pub slope: f32,
    pub intercept: f32,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Rescale {
    #[inline]
    pub fn apply(&self, value: f32) -> f32 {
        value.mul_add(self.slope, self.intercept)
    }
}

/// One 2D slice as fetched from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagingInstance {
    /// Store-assigned identifier.
    pub id: String,
    pub metadata: InstanceMetadata,
    pub slice_location: Option<f64>,
    pub instance_number: Option<i32>,
    /// Row and column spacing in millimetres.
    pub pixel_spacing: Option<(f64, f64)>,
    pub rescale: Rescale,
    /// Stored pixel values, rows x columns.
    pub pixels: Array2<f32>,
}

impl ImagingInstance {
    pub fn new(id: impl Into<String>, pixels: Array2<f32>) -> Self {
        Self {
            id: id.into(),
            metadata: InstanceMetadata::default(),
            slice_location: None,
            instance_number: None,
            pixel_spacing: None,
            rescale: Rescale::default(),
            pixels,
        }
    }

    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_slice_location(mut self, location: f64) -> Self {
        self.slice_location = Some(location);
        self
    }

    pub fn with_instance_number(mut self, number: i32) -> Self {
        self.instance_number = Some(number);
        self
    }

    /// Decode a DICOM file, with or without its 128 byte preamble.
    ///
    /// Only the first frame of multi-frame objects is kept.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a readable DICOM object or its
    /// pixel data cannot be decoded.
    pub fn from_dicom_bytes(id: impl Into<String>, bytes: &[u8]) -> Result<Self, InstanceError> {
        let body = match bytes.get(PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()) {
            Some(magic) if magic == MAGIC => &bytes[PREAMBLE_LEN..],
            _ => bytes,
        };
        let object = from_reader(body)?;
        Self::from_dicom_object(id, &object)
    }

    pub fn from_dicom_object(
        id: impl Into<String>,
        object: &DefaultDicomObject,
    ) -> Result<Self, InstanceError> {
        Ok(Self {
            id: id.into(),
            metadata: InstanceMetadata::from_object(object),
            slice_location: read_float(object, tags::SLICE_LOCATION),
            instance_number: object
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|element| element.to_int::<i32>().ok()),
            pixel_spacing: object
                .element(tags::PIXEL_SPACING)
                .ok()
                .and_then(|element| element.to_multi_float64().ok())
                .and_then(|spacing| Some((*spacing.first()?, *spacing.get(1)?))),
            rescale: Rescale {
                slope: read_float(object, tags::RESCALE_SLOPE).map_or(1.0, |v| v as f32),
                intercept: read_float(object, tags::RESCALE_INTERCEPT).map_or(0.0, |v| v as f32),
            },
            pixels: Self::decode_pixels(object)?,
        })
    }

    /// (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    fn decode_pixels(object: &DefaultDicomObject) -> Result<Array2<f32>, InstanceError> {
        let pixel_data = object
            .decode_pixel_data()
            .map_err(|e| InstanceError::PixelData(e.to_string()))?;
        // Stored values only; the rescale is applied during preprocessing.
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::None)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|e| InstanceError::PixelData(e.to_string()))
    }
}

fn read_string(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let trimmed = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn read_float(object: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    object.element(tag).ok()?.to_float64().ok()
}
