//! # DICOM-contour library
//!
//! This crate reassembles the DICOM instances of a study held in a PACS-like
//! store into an ordered volume and runs an auto-contouring pipeline over it.
//!
//! The pipeline runs in fixed steps, each of which may fail on its own:
//!  - Assembly: list the study's series and instances, download every slice
//!    concurrently, order and stack them
//!  - Preprocess: apply the modality rescale and an optional normalization
//!  - Inference: label every voxel with a pluggable [`Model`]
//!  - Encoding: wrap the labels in a DICOM segmentation referencing the
//!    source slices with a pluggable [`ResultEncoder`]
//!  - Upload: store the artifact as a new instance
//!
//! Slices are ordered by SliceLocation, then InstanceNumber. When neither
//! is present the listing order is kept and the volume is flagged as having
//! a degraded ordering; a warning is logged as well. Slices must all share
//! the same dimensions.
//!
//! Whether only the first series of a study or all of its series make up
//! the volume is chosen with [`SeriesPolicy`].
//!
//! # Examples
//!
//! ## Contouring a study held in Orthanc
//!
//! ```no_run
//! # use dicom_contour::{
//! #     config::{PipelineConfig, StoreConfig},
//! #     enums::ResolveMode,
//! #     pipeline::Orchestrator,
//! #     stages::{SegmentationEncoder, ZeroModel},
//! #     store::OrthancClient,
//! # };
//! # use std::sync::Arc;
//! # async fn contour() -> Result<(), Box<dyn std::error::Error>> {
//! let store = OrthancClient::new(StoreConfig::new("http://localhost:8042"))?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(store),
//!     Arc::new(ZeroModel),
//!     Arc::new(SegmentationEncoder::default()),
//!     PipelineConfig::default(),
//! );
//! let result = orchestrator.run("study-id", ResolveMode::ByStudy).await?;
//! println!("{:?} -> {:?}", result.volume_shape, result.artifact_id);
//! # Ok(())
//! # }
//! ```
//!
//! [`Model`]: stages::Model
//! [`ResultEncoder`]: stages::ResultEncoder
//! [`SeriesPolicy`]: enums::SeriesPolicy

pub mod config;
pub mod enums;
pub mod instance;
pub mod pipeline;
pub mod stages;
pub mod store;
#[cfg(test)]
mod testing;
pub mod volume;
pub mod volume_assembler;
