//! Explicit configuration handed to the store client and the orchestrator
//! at construction time.

use crate::enums::{Normalization, SeriesPolicy};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

/// Connection settings for the imaging store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Upper bound for every remote call, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "http://localhost:8042".to_string()
}

fn default_timeout() -> f64 {
    30.0
}

fn default_user_agent() -> String {
    concat!("dicom-contour/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: None,
            password: None,
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Read `ORTHANC_URL`, `ORTHANC_USERNAME`, `ORTHANC_PASSWORD` and
    /// `ORTHANC_TIMEOUT_SECONDS`, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("ORTHANC_URL") {
            config.base_url = url;
        }
        config.username = env::var("ORTHANC_USERNAME").ok();
        config.password = env::var("ORTHANC_PASSWORD").ok();
        if let Some(seconds) = env::var("ORTHANC_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|seconds| *seconds > 0.0)
        {
            config.timeout_seconds = seconds;
        }
        config
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Falls back to the default when `timeout_seconds` is not a usable duration.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_timeout()))
    }
}

/// How a study is turned into a single stack of slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    #[serde(default)]
    pub series_policy: SeriesPolicy,
    /// Maximum number of instance downloads in flight at once.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

fn default_fetch_concurrency() -> usize {
    8
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            series_policy: SeriesPolicy::default(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

impl AssemblyConfig {
    pub fn with_series_policy(mut self, policy: SeriesPolicy) -> Self {
        self.series_policy = policy;
        self
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub normalization: Normalization,
    /// Upload the encoded artifact back to the store after a successful run.
    #[serde(default = "default_upload_result")]
    pub upload_result: bool,
}

fn default_upload_result() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            assembly: AssemblyConfig::default(),
            normalization: Normalization::default(),
            upload_result: default_upload_result(),
        }
    }
}

impl PipelineConfig {
    pub fn with_assembly(mut self, assembly: AssemblyConfig) -> Self {
        self.assembly = assembly;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_upload(mut self, upload: bool) -> Self {
        self.upload_result = upload;
        self
    }
}
