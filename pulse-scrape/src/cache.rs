// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./cache_test.rs"]
mod cache_test;

use crate::labels::Labels;
use crate::parser::MetricType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// Metadata survives this many flushing iterations after its metric was last described.
const METADATA_RETENTION_ITERATIONS: u64 = 10;

// Slack added to twice the last successful size before a flush is forced.
const FORCED_FLUSH_SLACK: usize = 1000;

//
// CacheEntry
//

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
  pub series_ref: u64,
  pub hash: u64,
  pub labels: Labels,
  last_iter: u64,
}

//
// Metadata
//

/// Metric family metadata as last described by the target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
  pub metric: String,
  pub metric_type: MetricType,
  pub help: String,
  pub unit: String,
}

#[derive(Debug)]
struct MetaEntry {
  last_iter: u64,
  metric_type: MetricType,
  help: String,
  unit: String,
}

//
// MetadataStore
//

/// Metadata half of the scrape cache. This is the only part of the cache that is shared outside
/// of the owning loop, so it carries its own lock.
#[derive(Debug, Default)]
pub struct MetadataStore {
  entries: Mutex<HashMap<String, MetaEntry>>,
}

impl MetadataStore {
  fn update(&self, metric: &str, iter: u64, f: impl FnOnce(&mut MetaEntry)) {
    let mut entries = self.entries.lock();
    if !entries.contains_key(metric) {
      entries.insert(
        metric.to_string(),
        MetaEntry {
          last_iter: iter,
          metric_type: MetricType::Unknown,
          help: String::new(),
          unit: String::new(),
        },
      );
    }
    if let Some(entry) = entries.get_mut(metric) {
      entry.last_iter = iter;
      f(entry);
    }
  }

  #[must_use]
  pub fn get(&self, metric: &str) -> Option<Metadata> {
    self.entries.lock().get(metric).map(|entry| Metadata {
      metric: metric.to_string(),
      metric_type: entry.metric_type,
      help: entry.help.clone(),
      unit: entry.unit.clone(),
    })
  }

  #[must_use]
  pub fn list(&self) -> Vec<Metadata> {
    let mut list: Vec<Metadata> = self
      .entries
      .lock()
      .iter()
      .map(|(metric, entry)| Metadata {
        metric: metric.clone(),
        metric_type: entry.metric_type,
        help: entry.help.clone(),
        unit: entry.unit.clone(),
      })
      .collect();
    list.sort_by(|a, b| a.metric.cmp(&b.metric));
    list
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

//
// ScrapeCache
//

/// Per-target memory of previously seen series. Only the owning scrape loop may use it; the pool
/// hands it to a replacement loop on reload once the previous owner has stopped.
#[derive(Debug, Default)]
pub struct ScrapeCache {
  // Advanced on every flushing iter_done().
  iter: u64,
  // Tracked entry count after the last successful scrape.
  successful_count: usize,
  next_ref: u64,

  series: HashMap<String, CacheEntry>,
  dropped_series: HashMap<String, u64>,

  // Series seen in the current and previous scrape, keyed by label hash, used to find series
  // that disappeared.
  series_cur: HashMap<u64, Labels>,
  series_prev: HashMap<u64, Labels>,

  metadata: Arc<MetadataStore>,
}

impl ScrapeCache {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn metadata(&self) -> Arc<MetadataStore> {
    self.metadata.clone()
  }

  #[must_use]
  pub const fn iteration(&self) -> u64 {
    self.iter
  }

  #[must_use]
  pub fn series_len(&self) -> usize {
    self.series.len()
  }

  #[must_use]
  pub fn dropped_len(&self) -> usize {
    self.dropped_series.len()
  }

  /// Looks up a series by its raw exposition string, marking it as used in this iteration.
  pub fn get(&mut self, metric: &str) -> Option<&CacheEntry> {
    let iter = self.iter;
    self.series.get_mut(metric).map(|entry| {
      entry.last_iter = iter;
      &*entry
    })
  }

  /// Caches the resolved labels for a series and returns its newly assigned ref.
  pub fn add_ref(&mut self, metric: &str, labels: Labels, hash: u64) -> u64 {
    self.next_ref += 1;
    let series_ref = self.next_ref;
    self.series.insert(
      metric.to_string(),
      CacheEntry {
        series_ref,
        hash,
        labels,
        last_iter: self.iter,
      },
    );
    series_ref
  }

  pub fn add_dropped(&mut self, metric: &str) {
    self.dropped_series.insert(metric.to_string(), self.iter);
  }

  /// Returns true if the series was dropped by relabeling, marking it as used in this iteration.
  pub fn get_dropped(&mut self, metric: &str) -> bool {
    match self.dropped_series.get_mut(metric) {
      Some(last_iter) => {
        *last_iter = self.iter;
        true
      },
      None => false,
    }
  }

  pub fn track_staleness(&mut self, hash: u64, labels: &Labels) {
    self.series_cur.insert(hash, labels.clone());
  }

  /// Calls `f` for every series seen in the previous scrape but not in the current one until
  /// `f` returns false.
  pub fn for_each_stale(&self, mut f: impl FnMut(&Labels) -> bool) {
    for (hash, labels) in &self.series_prev {
      if !self.series_cur.contains_key(hash) && !f(labels) {
        break;
      }
    }
  }

  pub fn set_type(&self, metric: &str, metric_type: MetricType) {
    self
      .metadata
      .update(metric, self.iter, |entry| entry.metric_type = metric_type);
  }

  pub fn set_help(&self, metric: &str, help: &str) {
    self.metadata.update(metric, self.iter, |entry| {
      if entry.help != help {
        entry.help = help.to_string();
      }
    });
  }

  pub fn set_unit(&self, metric: &str, unit: &str) {
    self.metadata.update(metric, self.iter, |entry| {
      if entry.unit != unit {
        entry.unit = unit.to_string();
      }
    });
  }

  /// Completes one scrape iteration. Returns true if a flush had to be forced because the cache
  /// grew well past the size of the last successful scrape.
  pub fn iter_done(&mut self, flush_cache: bool) -> bool {
    let count = self.series.len() + self.dropped_series.len() + self.metadata.len();

    let mut flush = flush_cache;
    let mut forced = false;
    if flush_cache {
      self.successful_count = count;
    } else if count > self.successful_count * 2 + FORCED_FLUSH_SLACK {
      // A target with churning labels whose scrapes keep failing would otherwise grow the cache
      // without bound.
      flush = true;
      forced = true;
    }

    if flush {
      let iter = self.iter;
      self.series.retain(|_, entry| entry.last_iter == iter);
      self.dropped_series.retain(|_, last_iter| *last_iter == iter);
      self
        .metadata
        .entries
        .lock()
        .retain(|_, entry| iter - entry.last_iter <= METADATA_RETENTION_ITERATIONS);
      self.iter += 1;
    }

    std::mem::swap(&mut self.series_cur, &mut self.series_prev);
    self.series_cur.clear();

    forced
  }
}
