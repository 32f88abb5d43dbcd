// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::relabel::{RelabelConfig, RelabelError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("job_name must not be empty")]
  EmptyJobName,
  #[error("duplicate job_name {0:?}")]
  DuplicateJob(String),
  #[error("job {0:?}: scheme must be http or https, got {1:?}")]
  InvalidScheme(String, String),
  #[error("job {0:?}: metrics_path must start with '/', got {1:?}")]
  InvalidMetricsPath(String, String),
  #[error("job {0:?}: scrape_interval must be greater than zero")]
  ZeroInterval(String),
  #[error("job {job:?}: scrape_timeout {timeout:?} is greater than scrape_interval {interval:?}")]
  TimeoutExceedsInterval {
    job: String,
    timeout: Duration,
    interval: Duration,
  },
  #[error("job {0:?}: at most one of bearer_token, bearer_token_file and basic_auth may be set")]
  ConflictingAuth(String),
  #[error("job {0:?}: tls cert_file and key_file must be set together")]
  IncompleteClientCert(String),
  #[error("job {job:?}: relabel rule {index}: {source}")]
  Relabel {
    job: String,
    index: usize,
    source: RelabelError,
  },
}

const fn default_scrape_interval() -> Duration {
  Duration::from_secs(60)
}

const fn default_scrape_timeout() -> Duration {
  Duration::from_secs(10)
}

fn default_metrics_path() -> String {
  "/metrics".to_string()
}

fn default_scheme() -> String {
  "http".to_string()
}

const fn default_true() -> bool {
  true
}

//
// TlsConfig
//

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
  #[serde(default)]
  pub ca_file: Option<PathBuf>,
  #[serde(default)]
  pub cert_file: Option<PathBuf>,
  #[serde(default)]
  pub key_file: Option<PathBuf>,
  #[serde(default)]
  pub insecure_skip_verify: bool,
}

//
// BasicAuth
//

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuth {
  pub username: String,
  #[serde(default)]
  pub password: Option<String>,
  #[serde(default)]
  pub password_file: Option<PathBuf>,
}

//
// HttpClientConfig
//

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
  #[serde(default)]
  pub bearer_token: Option<String>,
  #[serde(default)]
  pub bearer_token_file: Option<PathBuf>,
  #[serde(default)]
  pub basic_auth: Option<BasicAuth>,
  #[serde(default)]
  pub tls_config: TlsConfig,
}

//
// ScrapeConfig
//

/// Configuration of a single scrape job.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeConfig {
  pub job_name: String,
  #[serde(default = "default_scrape_interval", with = "humantime_serde")]
  pub scrape_interval: Duration,
  #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
  pub scrape_timeout: Duration,
  #[serde(default = "default_metrics_path")]
  pub metrics_path: String,
  #[serde(default = "default_scheme")]
  pub scheme: String,
  #[serde(default)]
  pub params: BTreeMap<String, Vec<String>>,
  #[serde(default)]
  pub honor_labels: bool,
  #[serde(default = "default_true")]
  pub honor_timestamps: bool,
  // Zero means no limit.
  #[serde(default)]
  pub sample_limit: usize,
  #[serde(default)]
  pub relabel_configs: Vec<RelabelConfig>,
  #[serde(default)]
  pub metric_relabel_configs: Vec<RelabelConfig>,
  #[serde(default)]
  pub http_client_config: HttpClientConfig,
}

impl ScrapeConfig {
  #[must_use]
  pub fn new(job_name: impl Into<String>) -> Self {
    Self {
      job_name: job_name.into(),
      scrape_interval: default_scrape_interval(),
      scrape_timeout: default_scrape_timeout(),
      metrics_path: default_metrics_path(),
      scheme: default_scheme(),
      params: BTreeMap::new(),
      honor_labels: false,
      honor_timestamps: true,
      sample_limit: 0,
      relabel_configs: Vec::new(),
      metric_relabel_configs: Vec::new(),
      http_client_config: HttpClientConfig::default(),
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.job_name.is_empty() {
      return Err(ConfigError::EmptyJobName);
    }
    if self.scheme != "http" && self.scheme != "https" {
      return Err(ConfigError::InvalidScheme(
        self.job_name.clone(),
        self.scheme.clone(),
      ));
    }
    if !self.metrics_path.starts_with('/') {
      return Err(ConfigError::InvalidMetricsPath(
        self.job_name.clone(),
        self.metrics_path.clone(),
      ));
    }
    if self.scrape_interval.is_zero() {
      return Err(ConfigError::ZeroInterval(self.job_name.clone()));
    }
    if self.scrape_timeout > self.scrape_interval {
      return Err(ConfigError::TimeoutExceedsInterval {
        job: self.job_name.clone(),
        timeout: self.scrape_timeout,
        interval: self.scrape_interval,
      });
    }

    let http = &self.http_client_config;
    let auth_count = usize::from(http.bearer_token.is_some())
      + usize::from(http.bearer_token_file.is_some())
      + usize::from(http.basic_auth.is_some());
    if auth_count > 1 {
      return Err(ConfigError::ConflictingAuth(self.job_name.clone()));
    }
    if http.tls_config.cert_file.is_some() != http.tls_config.key_file.is_some() {
      return Err(ConfigError::IncompleteClientCert(self.job_name.clone()));
    }

    for (index, rule) in self
      .relabel_configs
      .iter()
      .chain(self.metric_relabel_configs.iter())
      .enumerate()
    {
      rule.validate().map_err(|source| ConfigError::Relabel {
        job: self.job_name.clone(),
        index,
        source,
      })?;
    }

    Ok(())
  }
}

/// Returns true if a scrape cache built under `old` remains valid under `new`. Settings that only
/// affect how and how often a target is contacted do not change the series it produces.
#[must_use]
pub fn reusable_cache(old: &ScrapeConfig, new: &ScrapeConfig) -> bool {
  fn zero_scrape_settings(config: &ScrapeConfig) -> ScrapeConfig {
    ScrapeConfig {
      scrape_interval: Duration::ZERO,
      scrape_timeout: Duration::ZERO,
      sample_limit: 0,
      http_client_config: HttpClientConfig::default(),
      ..config.clone()
    }
  }

  zero_scrape_settings(old) == zero_scrape_settings(new)
}

//
// ConfigFile
//

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
  #[serde(default)]
  scrape_configs: Vec<ScrapeConfig>,
}

/// Validates every config and checks that job names are unique.
pub fn validate_all(configs: &[ScrapeConfig]) -> Result<(), ConfigError> {
  let mut seen = HashSet::new();
  for config in configs {
    config.validate()?;
    if !seen.insert(config.job_name.as_str()) {
      return Err(ConfigError::DuplicateJob(config.job_name.clone()));
    }
  }
  Ok(())
}

/// Parses and validates a YAML document with a top level `scrape_configs` list.
pub fn from_yaml(yaml: &str) -> anyhow::Result<Vec<ScrapeConfig>> {
  let file: ConfigFile = serde_yaml::from_str(yaml)?;
  validate_all(&file.scrape_configs)?;
  Ok(file.scrape_configs)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<Vec<ScrapeConfig>> {
  let contents = std::fs::read_to_string(path)
    .with_context(|| format!("can't read config file {}", path.display()))?;
  from_yaml(&contents).with_context(|| format!("invalid config file {}", path.display()))
}
