// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./labels_test.rs"]
mod labels_test;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::Hasher;
use xxhash_rust::xxh64::Xxh64;

pub const METRIC_NAME_LABEL: &str = "__name__";
pub const ADDRESS_LABEL: &str = "__address__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const SCRAPE_INTERVAL_LABEL: &str = "__scrape_interval__";
pub const SCRAPE_TIMEOUT_LABEL: &str = "__scrape_timeout__";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const META_LABEL_PREFIX: &str = "__meta_";
pub const RESERVED_LABEL_PREFIX: &str = "__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";
pub const EXPORTED_LABEL_PREFIX: &str = "exported_";

// Separator used when hashing so that {a="bc"} and {ab="c"} never collide.
const HASH_SEPARATOR: u8 = 0xff;

/// Returns true if the name is a valid Prometheus label name.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true if the name is a valid Prometheus metric name.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

//
// Label
//

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
  pub name: String,
  pub value: String,
}

impl Label {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }
}

//
// Labels
//

/// An immutable label set, sorted by name with unique names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
  /// Builds a label set from arbitrary labels. On duplicate names the last value wins.
  #[must_use]
  pub fn new(mut labels: Vec<Label>) -> Self {
    // Stable sort keeps insertion order among duplicates so the dedup below keeps the last one.
    labels.sort_by(|a, b| a.name.cmp(&b.name));
    let mut deduped: Vec<Label> = Vec::with_capacity(labels.len());
    for label in labels {
      match deduped.last_mut() {
        Some(last) if last.name == label.name => *last = label,
        _ => deduped.push(label),
      }
    }
    Self(deduped)
  }

  #[must_use]
  pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Self {
    Self::new(
      pairs
        .iter()
        .map(|(k, v)| Label::new(k.as_ref(), v.as_ref()))
        .collect(),
    )
  }

  #[must_use]
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .binary_search_by(|l| l.name.as_str().cmp(name))
      .ok()
      .map(|index| self.0[index].value.as_str())
  }

  #[must_use]
  pub fn has(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  #[must_use]
  pub fn metric_name(&self) -> Option<&str> {
    self.get(METRIC_NAME_LABEL)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Label> {
    self.0.iter()
  }

  /// Stable 64-bit hash of the full label set.
  #[must_use]
  pub fn stable_hash(&self) -> u64 {
    let mut hasher = Xxh64::new(0);
    for label in &self.0 {
      hasher.write(label.name.as_bytes());
      hasher.write_u8(HASH_SEPARATOR);
      hasher.write(label.value.as_bytes());
      hasher.write_u8(HASH_SEPARATOR);
    }
    hasher.finish()
  }

  /// Returns the labels that do not carry the reserved `__` prefix.
  #[must_use]
  pub fn without_reserved(&self) -> Self {
    Self(
      self
        .0
        .iter()
        .filter(|l| !l.name.starts_with(RESERVED_LABEL_PREFIX))
        .cloned()
        .collect(),
    )
  }

  #[must_use]
  pub fn to_map(&self) -> BTreeMap<String, String> {
    self
      .0
      .iter()
      .map(|l| (l.name.clone(), l.value.clone()))
      .collect()
  }
}

impl Display for Labels {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str("{")?;
    for (i, label) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{}={:?}", label.name, label.value)?;
    }
    f.write_str("}")
  }
}

impl<'a> IntoIterator for &'a Labels {
  type Item = &'a Label;
  type IntoIter = std::slice::Iter<'a, Label>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.iter()
  }
}

//
// LabelsBuilder
//

/// Mutable view over a label set used by relabeling and sample label mutation. Setting an empty
/// value deletes the label.
#[derive(Clone, Debug, Default)]
pub struct LabelsBuilder {
  labels: BTreeMap<String, String>,
}

impl LabelsBuilder {
  #[must_use]
  pub fn new(base: &Labels) -> Self {
    Self {
      labels: base.to_map(),
    }
  }

  #[must_use]
  pub fn get(&self, name: &str) -> Option<&str> {
    self.labels.get(name).map(String::as_str)
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
    let value = value.into();
    let name = name.into();
    if value.is_empty() {
      self.labels.remove(&name);
    } else {
      self.labels.insert(name, value);
    }
    self
  }

  pub fn del(&mut self, name: &str) -> &mut Self {
    self.labels.remove(name);
    self
  }

  pub fn retain(&mut self, mut f: impl FnMut(&str, &str) -> bool) -> &mut Self {
    self.labels.retain(|name, value| f(name, value));
    self
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.labels.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .labels
      .iter()
      .map(|(name, value)| (name.as_str(), value.as_str()))
  }

  #[must_use]
  pub fn labels(&self) -> Labels {
    // BTreeMap iteration is already sorted and unique.
    Labels(
      self
        .labels
        .iter()
        .map(|(name, value)| Label::new(name.as_str(), value.as_str()))
        .collect(),
    )
  }
}
