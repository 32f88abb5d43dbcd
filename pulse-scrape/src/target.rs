// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./target_test.rs"]
mod target_test;

use crate::cache::MetadataStore;
use crate::config::ScrapeConfig;
use crate::labels::{
  ADDRESS_LABEL,
  INSTANCE_LABEL,
  JOB_LABEL,
  Labels,
  LabelsBuilder,
  META_LABEL_PREFIX,
  METRICS_PATH_LABEL,
  PARAM_LABEL_PREFIX,
  SCHEME_LABEL,
  SCRAPE_INTERVAL_LABEL,
  SCRAPE_TIMEOUT_LABEL,
  is_valid_label_name,
};
use crate::relabel;
use humantime_serde::re::humantime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
  #[error("no address")]
  MissingAddress,
  #[error("invalid address {0:?}")]
  InvalidAddress(String),
  #[error("invalid scheme {0:?}")]
  InvalidScheme(String),
  #[error("invalid label name {0:?}")]
  InvalidLabelName(String),
  #[error("invalid {label} value {value:?}")]
  InvalidDuration { label: &'static str, value: String },
  #[error("scrape interval cannot be zero")]
  ZeroInterval,
  #[error("scrape timeout {timeout} greater than scrape interval {interval}")]
  TimeoutExceedsInterval { timeout: String, interval: String },
  #[error("invalid url: {0}")]
  InvalidUrl(String),
}

//
// TargetGroup
//

/// A set of targets sharing common labels, as produced by a discovery backend. Each entry of
/// `targets` carries at least `__address__`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetGroup {
  pub source: String,
  pub targets: Vec<Labels>,
  pub labels: Labels,
}

//
// TargetHealth
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TargetHealth {
  #[default]
  Unknown,
  Up,
  Down,
}

impl Display for TargetHealth {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::Unknown => "unknown",
      Self::Up => "up",
      Self::Down => "down",
    })
  }
}

//
// TargetState
//

/// Outcome of the most recent scrape of a target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetState {
  pub health: TargetHealth,
  pub last_error: Option<String>,
  pub last_scrape: Option<OffsetDateTime>,
  pub last_scrape_duration: Duration,
}

//
// Target
//

/// A single scrape endpoint. Identity is the hash of its final label set.
#[derive(Debug)]
pub struct Target {
  labels: Labels,
  hash: u64,
  params: BTreeMap<String, Vec<String>>,
  discovered_labels: Mutex<Labels>,
  state: Mutex<TargetState>,
  metadata: Mutex<Option<Arc<MetadataStore>>>,
}

impl Target {
  #[must_use]
  pub fn new(
    labels: Labels,
    discovered_labels: Labels,
    params: BTreeMap<String, Vec<String>>,
  ) -> Self {
    Self {
      hash: labels.stable_hash(),
      labels,
      params,
      discovered_labels: Mutex::new(discovered_labels),
      state: Mutex::default(),
      metadata: Mutex::default(),
    }
  }

  #[must_use]
  pub const fn labels(&self) -> &Labels {
    &self.labels
  }

  #[must_use]
  pub const fn hash(&self) -> u64 {
    self.hash
  }

  #[must_use]
  pub fn discovered_labels(&self) -> Labels {
    self.discovered_labels.lock().clone()
  }

  pub fn set_discovered_labels(&self, labels: Labels) {
    *self.discovered_labels.lock() = labels;
  }

  #[must_use]
  pub fn health(&self) -> TargetHealth {
    self.state.lock().health
  }

  #[must_use]
  pub fn state(&self) -> TargetState {
    self.state.lock().clone()
  }

  /// Records the outcome of a scrape.
  pub fn report(&self, start: OffsetDateTime, duration: Duration, error: Option<String>) {
    let mut state = self.state.lock();
    state.health = if error.is_none() {
      TargetHealth::Up
    } else {
      TargetHealth::Down
    };
    state.last_error = error;
    state.last_scrape = Some(start);
    state.last_scrape_duration = duration;
  }

  pub fn set_metadata(&self, metadata: Arc<MetadataStore>) {
    *self.metadata.lock() = Some(metadata);
  }

  /// The metadata store of the loop currently scraping this target, if any.
  #[must_use]
  pub fn metadata(&self) -> Option<Arc<MetadataStore>> {
    self.metadata.lock().clone()
  }

  /// Interval and timeout for this target, taken from its labels and falling back to the given
  /// defaults.
  #[must_use]
  pub fn interval_and_timeout(&self, interval: Duration, timeout: Duration) -> (Duration, Duration) {
    let parse = |label, default| {
      self
        .labels
        .get(label)
        .and_then(|value| humantime::parse_duration(value).ok())
        .and_then(|value| Duration::try_from(value).ok())
        .unwrap_or(default)
    };
    (
      parse(SCRAPE_INTERVAL_LABEL, interval),
      parse(SCRAPE_TIMEOUT_LABEL, timeout),
    )
  }

  /// Builds the scrape URL. `__param_<name>` labels replace the first value of the matching
  /// configured query parameter.
  pub fn url(&self) -> Result<url::Url, TargetError> {
    let mut params = self.params.clone();
    for label in &self.labels {
      if let Some(name) = label.name.strip_prefix(PARAM_LABEL_PREFIX) {
        let values = params.entry(name.to_string()).or_default();
        match values.first_mut() {
          Some(first) => first.clone_from(&label.value),
          None => values.push(label.value.clone()),
        }
      }
    }

    let mut url = url::Url::parse(&format!(
      "{}://{}{}",
      self.labels.get(SCHEME_LABEL).unwrap_or_default(),
      self.labels.get(ADDRESS_LABEL).unwrap_or_default(),
      self.labels.get(METRICS_PATH_LABEL).unwrap_or_default(),
    ))
    .map_err(|e| TargetError::InvalidUrl(e.to_string()))?;
    if !params.is_empty() {
      let mut query = url.query_pairs_mut();
      for (name, values) in &params {
        for value in values {
          query.append_pair(name, value);
        }
      }
    }
    Ok(url)
  }

  /// Time to wait before the first scrape so that the target is scraped at a stable phase within
  /// the interval. The phase depends only on the target hash and the jitter seed.
  #[must_use]
  pub fn offset(&self, interval: Duration, jitter_seed: u64, now: OffsetDateTime) -> Duration {
    let interval_nanos = interval.whole_nanoseconds();
    if interval_nanos <= 0 {
      return Duration::ZERO;
    }

    let base = interval_nanos - now.unix_timestamp_nanos().rem_euclid(interval_nanos);
    let modulus = u64::try_from(interval_nanos).unwrap_or(u64::MAX);
    let mut next = base + i128::from((self.hash ^ jitter_seed) % modulus);
    if next > interval_nanos {
      next -= interval_nanos;
    }
    Duration::nanoseconds_i128(next)
  }
}

fn duration_label(builder: &LabelsBuilder, label: &'static str) -> Result<Duration, TargetError> {
  let value = builder.get(label).unwrap_or_default();
  humantime::parse_duration(value)
    .ok()
    .and_then(|value| Duration::try_from(value).ok())
    .ok_or_else(|| TargetError::InvalidDuration {
      label,
      value: value.to_string(),
    })
}

fn address_with_port(address: &str, scheme: &str) -> Result<String, TargetError> {
  let invalid = || TargetError::InvalidAddress(address.to_string());
  if address.is_empty() || address.contains('/') {
    return Err(invalid());
  }
  let parsed = url::Url::parse(&format!("{scheme}://{address}")).map_err(|_| invalid())?;
  if parsed.host_str().is_none_or(str::is_empty) || parsed.query().is_some() {
    return Err(invalid());
  }

  let port_separator = if address.starts_with('[') {
    address.find("]:").map(|index| index + 1)
  } else {
    address.rfind(':')
  };
  match port_separator {
    Some(index) => {
      address[index + 1 ..]
        .parse::<u16>()
        .map_err(|_| invalid())?;
      Ok(address.to_string())
    },
    None => Ok(format!(
      "{address}:{}",
      if scheme == "https" { 443 } else { 80 }
    )),
  }
}

/// Applies job defaults and target relabeling to a discovered label set. Returns the final labels
/// and the labels as they were before relabeling. The final labels are empty if relabeling
/// dropped the target.
pub fn populate_labels(
  labels: &Labels,
  config: &ScrapeConfig,
) -> Result<(Labels, Labels), TargetError> {
  let mut builder = LabelsBuilder::new(labels);
  let defaults = [
    (JOB_LABEL, config.job_name.clone()),
    (
      SCRAPE_INTERVAL_LABEL,
      humantime::format_duration(config.scrape_interval).to_string(),
    ),
    (
      SCRAPE_TIMEOUT_LABEL,
      humantime::format_duration(config.scrape_timeout).to_string(),
    ),
    (METRICS_PATH_LABEL, config.metrics_path.clone()),
    (SCHEME_LABEL, config.scheme.clone()),
  ];
  for (name, value) in defaults {
    if builder.get(name).is_none() {
      builder.set(name, value);
    }
  }
  for (name, values) in &config.params {
    let name = format!("{PARAM_LABEL_PREFIX}{name}");
    if builder.get(&name).is_none()
      && let Some(first) = values.first()
    {
      builder.set(name, first.as_str());
    }
  }

  let discovered = builder.labels();
  let Some(relabeled) = relabel::process(&discovered, &config.relabel_configs) else {
    return Ok((Labels::default(), discovered));
  };

  let mut builder = LabelsBuilder::new(&relabeled);
  let scheme = builder.get(SCHEME_LABEL).unwrap_or_default().to_string();
  if scheme != "http" && scheme != "https" {
    return Err(TargetError::InvalidScheme(scheme));
  }
  let address = address_with_port(
    builder.get(ADDRESS_LABEL).ok_or(TargetError::MissingAddress)?,
    &scheme,
  )?;
  builder.set(ADDRESS_LABEL, address.as_str());

  let interval = duration_label(&builder, SCRAPE_INTERVAL_LABEL)?;
  let timeout = duration_label(&builder, SCRAPE_TIMEOUT_LABEL)?;
  if interval.is_zero() {
    return Err(TargetError::ZeroInterval);
  }
  if timeout > interval {
    return Err(TargetError::TimeoutExceedsInterval {
      timeout: builder.get(SCRAPE_TIMEOUT_LABEL).unwrap_or_default().to_string(),
      interval: builder.get(SCRAPE_INTERVAL_LABEL).unwrap_or_default().to_string(),
    });
  }

  // Meta labels only exist for relabeling.
  builder.retain(|name, _| !name.starts_with(META_LABEL_PREFIX));
  if builder.get(INSTANCE_LABEL).is_none() {
    builder.set(INSTANCE_LABEL, address);
  }
  if let Some(name) = builder.names().find(|name| !is_valid_label_name(name)) {
    return Err(TargetError::InvalidLabelName(name.to_string()));
  }

  Ok((builder.labels(), discovered))
}

/// Converts a discovered group into targets. Targets dropped by relabeling are returned with empty
/// labels. Targets that fail validation are reported and skipped.
#[must_use]
pub fn targets_from_group(
  group: &TargetGroup,
  config: &ScrapeConfig,
) -> (Vec<Target>, Vec<TargetError>) {
  let mut targets = Vec::with_capacity(group.targets.len());
  let mut failures = Vec::new();
  for target_labels in &group.targets {
    let mut builder = LabelsBuilder::new(target_labels);
    for label in &group.labels {
      if builder.get(&label.name).is_none() {
        builder.set(label.name.as_str(), label.value.as_str());
      }
    }

    match populate_labels(&builder.labels(), config) {
      Ok((labels, discovered)) => {
        if !labels.is_empty() || !discovered.is_empty() {
          targets.push(Target::new(labels, discovered, config.params.clone()));
        }
      },
      Err(e) => failures.push(e),
    }
  }
  (targets, failures)
}
