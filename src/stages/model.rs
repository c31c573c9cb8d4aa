use super::StageError;
use ndarray::{Array3, Array4, ArrayView3, Axis, Zip};
use rayon::prelude::*;

/// One label per voxel, same (depth, height, width) as the model input.
pub type LabelVolume = Array3<u8>;

pub enum ModelOutput {
    /// A label per voxel.
    Labels(LabelVolume),
    /// Per-class scores, channel axis first.
    Scores(Array4<f32>),
}

/// A segmentation model: accepts a normalized volume and labels its voxels.
///
/// Implementations may resample internally but must answer in the input's
/// spatial dimensions.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, volume: ArrayView3<'_, f32>) -> Result<ModelOutput, StageError>;
}

/// Labels nothing. Stands in where no trained model is deployed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroModel;

impl Model for ZeroModel {
    fn name(&self) -> &str {
        "zero"
    }

    fn predict(&self, volume: ArrayView3<'_, f32>) -> Result<ModelOutput, StageError> {
        Ok(ModelOutput::Labels(Array3::zeros(volume.raw_dim())))
    }
}

/// Labels every voxel at or above `threshold` as 1.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdModel {
    pub threshold: f32,
}

impl ThresholdModel {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Model for ThresholdModel {
    fn name(&self) -> &str {
        "threshold"
    }

    fn predict(&self, volume: ArrayView3<'_, f32>) -> Result<ModelOutput, StageError> {
        let threshold = self.threshold;
        let labels = Zip::from(&volume).par_map_collect(|&v| u8::from(v >= threshold));
        Ok(ModelOutput::Labels(labels))
    }
}

/// Run `model` and check its answer against the input's dimensions.
///
/// Channel-expanded scores are reduced to labels by arg-max over channels.
///
/// # Errors
///
/// Returns error if the model fails or answers in other spatial dimensions.
pub fn infer(volume: ArrayView3<'_, f32>, model: &dyn Model) -> Result<LabelVolume, StageError> {
    let expected = volume.dim();
    match model.predict(volume)? {
        ModelOutput::Labels(labels) if labels.dim() == expected => Ok(labels),
        ModelOutput::Labels(labels) => Err(StageError::ShapeMismatch {
            expected,
            found: labels.shape().to_vec(),
        }),
        ModelOutput::Scores(scores) => {
            let (channels, depth, height, width) = scores.dim();
            if (depth, height, width) != expected || channels == 0 {
                return Err(StageError::ShapeMismatch {
                    expected,
                    found: scores.shape().to_vec(),
                });
            }
            if channels > usize::from(u8::MAX) + 1 {
                return Err(StageError::Model(format!(
                    "{channels} classes do not fit an 8 bit label"
                )));
            }
            Ok(argmax_channels(&scores))
        }
    }
}

fn argmax_channels(scores: &Array4<f32>) -> LabelVolume {
    let (_, depth, height, width) = scores.dim();
    let mut labels = Array3::<u8>::zeros((depth, height, width));
    labels
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(z, mut plane)| {
            for ((y, x), label) in plane.indexed_iter_mut() {
                let mut best = 0;
                for c in 1..scores.dim().0 {
                    if scores[[c, z, y, x]] > scores[[best, z, y, x]] {
                        best = c;
                    }
                }
                // Bounded by the channel check in `infer`.
                *label = best as u8;
            }
        });
    labels
}
