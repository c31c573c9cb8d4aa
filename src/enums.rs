use serde::{Deserialize, Serialize};
use std::fmt;

/// How the identifier handed to the pipeline is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// The identifier is a store study id.
    #[default]
    ByStudy,
    /// The identifier is a store instance id; its parent study is processed.
    ByInstance,
}

/// Which series of a study contribute slices to the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesPolicy {
    /// Only the first series listed by the store.
    #[default]
    FirstSeries,
    /// Instances of every series pooled into one stack.
    AllSeries,
}

/// The key a slice was actually ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SortKey {
    SliceLocation(f64),
    InstanceNumber(i32),
    /// Neither attribute was present; the slice sorts as 0.
    Fallback,
}

impl SortKey {
    pub fn value(&self) -> f64 {
        match self {
            SortKey::SliceLocation(location) => *location,
            SortKey::InstanceNumber(number) => f64::from(*number),
            SortKey::Fallback => 0.0,
        }
    }

    /// Whether the slice was ordered by anything weaker than its location.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, SortKey::SliceLocation(_))
    }
}

/// One step of the pipeline; a failure is attributed to the step being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Assembly,
    Preprocess,
    Inference,
    Encoding,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Assembly => "assembly",
            Stage::Preprocess => "preprocess",
            Stage::Inference => "inference",
            Stage::Encoding => "encoding",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Intensity normalization applied after the modality rescale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    None,
    /// Linear map of the volume's min..max onto 0..1.
    MinMax,
    /// Window center/width mapped onto 0..1 and clamped.
    Window { center: f32, width: f32 },
}
