//! Pure transformation steps between an assembled [`Volume`] and the
//! artifact uploaded back to the store.
//!
//! [`Volume`]: crate::volume::Volume

mod encoder;
mod model;
mod preprocess;

pub use encoder::{LABEL_MAP_SEGMENTATION_STORAGE, ResultEncoder, SegmentationEncoder};
pub use model::{LabelVolume, Model, ModelOutput, ThresholdModel, ZeroModel, infer};
pub use preprocess::preprocess;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Model output {found:?} does not match input dimensions {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        found: Vec<usize>,
    },

    #[error("Model failed: {0}")]
    Model(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),
}
