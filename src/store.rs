//! Access to the remote imaging store.
//!
//! [`InstanceStore`] is the contract the rest of the crate is written
//! against; [`OrthancClient`] implements it over the store's REST API:
//!
//!  - `GET {store}/studies/{id}/series` and `GET {store}/series/{id}/instances`
//!    for the study hierarchy
//!  - `GET {store}/instances/{id}/file` for the raw DICOM file
//!  - `POST {store}/instances` to upload a new DICOM object
//!  - `POST {store}/tools/find` to search studies
//!
//! Every call is bounded by [`StoreConfig::timeout`]. Upload is the only
//! operation that is not idempotent.

use crate::{
    config::StoreConfig,
    instance::{ImagingInstance, InstanceError},
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

pub const DICOM_CONTENT_TYPE: &str = "application/dicom";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Store rejected request with status {status}: {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("Malformed store response: {0}")]
    MalformedResponse(String),

    #[error("Instance {id} is not a usable image: {source}")]
    InvalidInstance {
        id: String,
        #[source]
        source: InstanceError,
    },
}

impl StoreError {
    /// Server-side rejections and transport failures may succeed on a later
    /// attempt; client errors will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::RemoteUnavailable(_) => true,
            StoreError::RemoteRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            StoreError::RemoteRejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            // Timeouts, refused connections, broken bodies.
            StoreError::RemoteUnavailable(err.to_string())
        }
    }
}

/// Query for [`InstanceStore::search`]; absent fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(rename = "PatientID", skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(rename = "StudyDate", skip_serializing_if = "Option::is_none")]
    pub study_date: Option<String>,
    #[serde(rename = "StudyInstanceUID", skip_serializing_if = "Option::is_none")]
    pub study_instance_uid: Option<String>,
}

impl SearchCriteria {
    pub fn patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            ..Self::default()
        }
    }

    pub fn study_uid(uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: Some(uid.into()),
            ..Self::default()
        }
    }

    pub fn with_study_date(mut self, date: impl Into<String>) -> Self {
        self.study_date = Some(date.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySummary {
    /// Store-assigned study identifier.
    pub id: String,
    pub study_instance_uid: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub series_ids: Vec<String>,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Series of a study in listing order. Fails with `NotFound` when empty.
    async fn list_series(&self, study_id: &str) -> Result<Vec<String>, StoreError>;

    /// Instances of a series in listing order. Fails with `NotFound` when empty.
    async fn list_instances(&self, series_id: &str) -> Result<Vec<String>, StoreError>;

    /// The raw DICOM file of an instance.
    async fn download(&self, instance_id: &str) -> Result<Vec<u8>, StoreError>;

    /// Download and decode an instance. Decoding runs on the blocking pool.
    async fn fetch_instance(&self, instance_id: &str) -> Result<ImagingInstance, StoreError> {
        let bytes = self.download(instance_id).await?;
        let id = instance_id.to_string();
        tokio::task::spawn_blocking(move || ImagingInstance::from_dicom_bytes(id, &bytes))
            .await
            .unwrap_or_else(|e| {
                Err(InstanceError::PixelData(format!("decoder task failed: {e}")))
            })
            .map_err(|source| StoreError::InvalidInstance {
                id: instance_id.to_string(),
                source,
            })
    }

    /// Store a new resource and return its identifier. Every call creates a
    /// new resource, so callers must not retry blindly.
    async fn upload_artifact(&self, bytes: Vec<u8>, content_type: &str)
    -> Result<String, StoreError>;

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<StudySummary>, StoreError>;
}

#[derive(Deserialize)]
struct Resource {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct ExpandedStudy {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "MainDicomTags", default)]
    main_tags: HashMap<String, serde_json::Value>,
    #[serde(rename = "PatientMainDicomTags", default)]
    patient_tags: HashMap<String, serde_json::Value>,
    #[serde(rename = "Series", default)]
    series: Vec<String>,
}

impl From<ExpandedStudy> for StudySummary {
    fn from(study: ExpandedStudy) -> Self {
        let tag = |tags: &HashMap<String, serde_json::Value>, name: &str| {
            tags.get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        Self {
            study_instance_uid: tag(&study.main_tags, "StudyInstanceUID"),
            patient_id: tag(&study.patient_tags, "PatientID"),
            study_date: tag(&study.main_tags, "StudyDate"),
            study_description: tag(&study.main_tags, "StudyDescription"),
            series_ids: study.series,
            id: study.id,
        }
    }
}

#[derive(Serialize)]
struct FindQuery<'a> {
    #[serde(rename = "Level")]
    level: &'static str,
    #[serde(rename = "Expand")]
    expand: bool,
    #[serde(rename = "Query")]
    query: &'a SearchCriteria,
}

/// [`InstanceStore`] over an Orthanc-compatible REST API.
///
/// Holds no per-study state; clone it or share it behind an `Arc` across
/// concurrent pipeline runs.
#[derive(Debug, Clone)]
pub struct OrthancClient {
    http: Client,
    config: StoreConfig,
}

impl OrthancClient {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| StoreError::RemoteUnavailable(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .http
            .request(method, self.url(path))
            .timeout(self.config.timeout());
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request.send().await.map_err(StoreError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::RemoteRejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn list_children(&self, path: &str, what: &str) -> Result<Vec<String>, StoreError> {
        debug!(path, "Listing {what}");
        let resources: Vec<Resource> = self
            .send(self.request(Method::GET, path))
            .await?
            .json()
            .await
            .map_err(StoreError::from_transport)?;
        if resources.is_empty() {
            return Err(StoreError::NotFound(format!("{path} lists no {what}")));
        }
        Ok(resources.into_iter().map(|resource| resource.id).collect())
    }
}

#[async_trait]
impl InstanceStore for OrthancClient {
    async fn list_series(&self, study_id: &str) -> Result<Vec<String>, StoreError> {
        self.list_children(&format!("studies/{study_id}/series"), "series")
            .await
    }

    async fn list_instances(&self, series_id: &str) -> Result<Vec<String>, StoreError> {
        self.list_children(&format!("series/{series_id}/instances"), "instances")
            .await
    }

    async fn download(&self, instance_id: &str) -> Result<Vec<u8>, StoreError> {
        debug!(instance_id, "Downloading instance");
        let response = self
            .send(self.request(Method::GET, &format!("instances/{instance_id}/file")))
            .await?;
        let bytes = response.bytes().await.map_err(StoreError::from_transport)?;
        Ok(bytes.to_vec())
    }

    async fn upload_artifact(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        debug!(size = bytes.len(), content_type, "Uploading artifact");
        let request = self
            .request(Method::POST, "instances")
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        let created: Resource = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(StoreError::from_transport)?;
        Ok(created.id)
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<StudySummary>, StoreError> {
        debug!(?criteria, "Searching studies");
        let query = FindQuery {
            level: "Study",
            expand: true,
            query: criteria,
        };
        let studies: Vec<ExpandedStudy> = self
            .send(self.request(Method::POST, "tools/find").json(&query))
            .await?
            .json()
            .await
            .map_err(StoreError::from_transport)?;
        Ok(studies.into_iter().map(StudySummary::from).collect())
    }
}
