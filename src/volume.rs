use crate::{
    enums::SortKey,
    instance::{ImagingInstance, InstanceMetadata, Rescale},
};
use ndarray::{Array3, ArrayView2, s};
use serde::{Deserialize, Serialize};

/// Everything kept about a contributing slice once its pixels are stacked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceInfo {
    /// Store-assigned instance identifier.
    pub id: String,
    pub metadata: InstanceMetadata,
    pub sort_key: SortKey,
    pub pixel_spacing: Option<(f64, f64)>,
    pub rescale: Rescale,
}

impl SliceInfo {
    pub(crate) fn from_instance(instance: &ImagingInstance, sort_key: SortKey) -> Self {
        Self {
            id: instance.id.clone(),
            metadata: instance.metadata.clone(),
            sort_key,
            pixel_spacing: instance.pixel_spacing,
            rescale: instance.rescale,
        }
    }
}

/// How trustworthy the slice order of a volume is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderingReport {
    /// At least one slice was ordered by InstanceNumber or by arrival.
    pub degraded: bool,
    /// Slices missing SliceLocation.
    pub slices_without_location: usize,
    /// Slices sharing their key with the slice before them.
    pub duplicate_keys: usize,
}

/// An ordered stack of slices, slice axis outermost.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    /// One entry per slice along axis 0, in the same order.
    pub slices: Vec<SliceInfo>,
    pub ordering: OrderingReport,
}

impl Volume {
    pub(crate) fn new(data: Array3<f32>, slices: Vec<SliceInfo>, ordering: OrderingReport) -> Self {
        debug_assert_eq!(data.dim().0, slices.len());
        Self {
            data,
            slices,
            ordering,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn slice(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        (index < self.dim().0).then(|| self.data.slice(s![index, .., ..]))
    }

    pub fn study_instance_uid(&self) -> Option<&str> {
        self.slices
            .iter()
            .find_map(|slice| slice.metadata.study_instance_uid.as_deref())
    }

    /// (slice, row, column) spacing in millimetres.
    ///
    /// The slice spacing is the mean gap between consecutive locations and is
    /// only known when every slice carries one.
    pub fn spacing(&self) -> Option<(f64, f64, f64)> {
        let (row, column) = self.slices.iter().find_map(|slice| slice.pixel_spacing)?;
        let locations: Vec<f64> = self
            .slices
            .iter()
            .map(|slice| match slice.sort_key {
                SortKey::SliceLocation(location) => Some(location),
                _ => None,
            })
            .collect::<Option<_>>()?;
        let gaps = locations.len().checked_sub(1).filter(|&n| n > 0)?;
        let span = locations[gaps] - locations[0];
        Some((span.abs() / gaps as f64, row, column))
    }
}
