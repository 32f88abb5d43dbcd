// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./relabel_test.rs"]
mod relabel_test;

use crate::labels::{Labels, LabelsBuilder, is_valid_label_name};
use itertools::Itertools;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::hash::Hasher;
use xxhash_rust::xxh64::Xxh64;

#[derive(thiserror::Error, Debug)]
pub enum RelabelError {
  #[error("invalid regex {0:?}: {1}")]
  Regex(String, regex::Error),
  #[error("relabel action {0:?} requires a target label")]
  MissingTargetLabel(Action),
  #[error("relabel action {0:?} requires a non-zero modulus")]
  MissingModulus(Action),
  #[error("{0:?} is not a valid target label for action {1:?}")]
  InvalidTargetLabel(String, Action),
  #[error("relabel action {0:?} requires source labels")]
  MissingSourceLabels(Action),
  #[error("relabel action {0:?} only supports the default separator, replacement and regex")]
  UnexpectedFields(Action),
}

//
// Action
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  #[default]
  Replace,
  Keep,
  Drop,
  HashMod,
  LabelMap,
  LabelDrop,
  LabelKeep,
  Lowercase,
  Uppercase,
  KeepEqual,
  DropEqual,
}

//
// RelabelRegex
//

/// A fully anchored regex that round trips through serde as its unanchored source.
#[derive(Clone, Debug)]
pub struct RelabelRegex {
  source: String,
  regex: Regex,
}

impl RelabelRegex {
  pub fn new(source: &str) -> Result<Self, RelabelError> {
    let regex = Regex::new(&format!("^(?s:{source})$"))
      .map_err(|e| RelabelError::Regex(source.to_string(), e))?;
    Ok(Self {
      source: source.to_string(),
      regex,
    })
  }

  #[must_use]
  pub fn as_str(&self) -> &str {
    &self.source
  }

  #[must_use]
  pub fn is_match(&self, haystack: &str) -> bool {
    self.regex.is_match(haystack)
  }

  fn is_default(&self) -> bool {
    self.source == DEFAULT_REGEX
  }
}

impl Default for RelabelRegex {
  fn default() -> Self {
    Self {
      source: DEFAULT_REGEX.to_string(),
      regex: Regex::new(&format!("^(?s:{DEFAULT_REGEX})$")).unwrap(),
    }
  }
}

impl PartialEq for RelabelRegex {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

impl<'de> Deserialize<'de> for RelabelRegex {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let source = String::deserialize(deserializer)?;
    Self::new(&source).map_err(D::Error::custom)
  }
}

impl Serialize for RelabelRegex {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.source)
  }
}

const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REPLACEMENT: &str = "$1";

fn default_separator() -> String {
  DEFAULT_SEPARATOR.to_string()
}

fn default_replacement() -> String {
  DEFAULT_REPLACEMENT.to_string()
}

//
// RelabelConfig
//

/// A single relabeling rule. Rules are applied in order and any rule may drop the label set.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelabelConfig {
  #[serde(default)]
  pub source_labels: Vec<String>,
  #[serde(default = "default_separator")]
  pub separator: String,
  #[serde(default)]
  pub regex: RelabelRegex,
  #[serde(default)]
  pub modulus: u64,
  #[serde(default)]
  pub target_label: String,
  #[serde(default = "default_replacement")]
  pub replacement: String,
  #[serde(default)]
  pub action: Action,
}

impl Default for RelabelConfig {
  fn default() -> Self {
    Self {
      source_labels: Vec::new(),
      separator: default_separator(),
      regex: RelabelRegex::default(),
      modulus: 0,
      target_label: String::new(),
      replacement: default_replacement(),
      action: Action::Replace,
    }
  }
}

impl RelabelConfig {
  pub fn validate(&self) -> Result<(), RelabelError> {
    match self.action {
      Action::Replace
      | Action::HashMod
      | Action::Lowercase
      | Action::Uppercase
      | Action::KeepEqual
      | Action::DropEqual
        if self.target_label.is_empty() =>
      {
        return Err(RelabelError::MissingTargetLabel(self.action));
      },
      _ => {},
    }

    // Replace allows templated target labels so only the expanded form can be checked.
    if matches!(
      self.action,
      Action::HashMod | Action::Lowercase | Action::Uppercase | Action::KeepEqual | Action::DropEqual
    ) && !is_valid_label_name(&self.target_label)
    {
      return Err(RelabelError::InvalidTargetLabel(
        self.target_label.clone(),
        self.action,
      ));
    }

    if self.action == Action::HashMod && self.modulus == 0 {
      return Err(RelabelError::MissingModulus(self.action));
    }

    if matches!(self.action, Action::KeepEqual | Action::DropEqual) {
      if self.source_labels.is_empty() {
        return Err(RelabelError::MissingSourceLabels(self.action));
      }
      if !self.regex.is_default() || self.replacement != DEFAULT_REPLACEMENT {
        return Err(RelabelError::UnexpectedFields(self.action));
      }
    }

    if matches!(self.action, Action::LabelDrop | Action::LabelKeep)
      && (!self.source_labels.is_empty()
        || !self.target_label.is_empty()
        || self.modulus != 0
        || self.separator != DEFAULT_SEPARATOR
        || self.replacement != DEFAULT_REPLACEMENT)
    {
      return Err(RelabelError::UnexpectedFields(self.action));
    }

    Ok(())
  }

  /// Applies this rule to the builder. Returns false if the label set must be dropped.
  fn apply(&self, builder: &mut LabelsBuilder) -> bool {
    let value = self
      .source_labels
      .iter()
      .map(|name| builder.get(name).unwrap_or_default())
      .join(&self.separator);

    match self.action {
      Action::Drop => {
        if self.regex.is_match(&value) {
          return false;
        }
      },
      Action::Keep => {
        if !self.regex.is_match(&value) {
          return false;
        }
      },
      Action::DropEqual => {
        if builder.get(&self.target_label).unwrap_or_default() == value {
          return false;
        }
      },
      Action::KeepEqual => {
        if builder.get(&self.target_label).unwrap_or_default() != value {
          return false;
        }
      },
      Action::Replace => {
        let Some(captures) = self.regex.regex.captures(&value) else {
          return true;
        };
        let mut target = String::new();
        captures.expand(&self.target_label, &mut target);
        if !is_valid_label_name(&target) {
          return true;
        }
        let mut replaced = String::new();
        captures.expand(&self.replacement, &mut replaced);
        builder.set(target, replaced);
      },
      Action::Lowercase => {
        builder.set(self.target_label.as_str(), value.to_lowercase());
      },
      Action::Uppercase => {
        builder.set(self.target_label.as_str(), value.to_uppercase());
      },
      Action::HashMod => {
        let mut hasher = Xxh64::new(0);
        hasher.write(value.as_bytes());
        builder.set(
          self.target_label.as_str(),
          (hasher.finish() % self.modulus).to_string(),
        );
      },
      Action::LabelMap => {
        let mapped: Vec<(String, String)> = builder
          .iter()
          .filter_map(|(name, value)| {
            let captures = self.regex.regex.captures(name)?;
            let mut target = String::new();
            captures.expand(&self.replacement, &mut target);
            Some((target, value.to_string()))
          })
          .collect();
        for (name, value) in mapped {
          builder.set(name, value);
        }
      },
      Action::LabelDrop => {
        builder.retain(|name, _| !self.regex.is_match(name));
      },
      Action::LabelKeep => {
        builder.retain(|name, _| self.regex.is_match(name));
      },
    }

    true
  }
}

/// Applies the rules in order. Returns `None` if the label set was dropped, either explicitly by a
/// rule or because no labels remain.
#[must_use]
pub fn process(labels: &Labels, configs: &[RelabelConfig]) -> Option<Labels> {
  if configs.is_empty() {
    return Some(labels.clone());
  }

  let mut builder = LabelsBuilder::new(labels);
  for config in configs {
    if !config.apply(&mut builder) {
      return None;
    }
  }

  let labels = builder.labels();
  if labels.is_empty() { None } else { Some(labels) }
}
