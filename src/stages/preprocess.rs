use crate::{enums::Normalization, volume::Volume};
use ndarray::{Array3, Axis};
use rayon::prelude::*;

/// Convert stored values to `f32` modality units and normalize them.
///
/// Each slice gets its own rescale slope/intercept. The output always has
/// the input's shape; nothing is resampled here.
pub fn preprocess(volume: &Volume, normalization: Normalization) -> Array3<f32> {
    let mut data = volume.data().to_owned();

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(volume.slices.par_iter())
        .for_each(|(mut plane, slice)| {
            let rescale = slice.rescale;
            plane.mapv_inplace(|value| rescale.apply(value));
        });

    match normalization {
        Normalization::None => {}
        Normalization::MinMax => {
            let (min, max) = data
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
                    (min.min(v), max.max(v))
                });
            let range = max - min;
            if range > 0.0 {
                data.par_mapv_inplace(|v| (v - min) / range);
            } else {
                data.fill(0.0);
            }
        }
        Normalization::Window { center, width } => {
            let width = width.max(f32::EPSILON);
            let lower = center - width / 2.0;
            data.par_mapv_inplace(|v| ((v - lower) / width).clamp(0.0, 1.0));
        }
    }

    data
}
