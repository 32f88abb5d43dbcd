// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

fn add_series(cache: &mut ScrapeCache, prefix: &str, count: usize) {
  for i in 0 .. count {
    let metric = format!("{prefix}_{i}");
    let labels = Labels::from_pairs(&[("__name__", metric.as_str())]);
    let hash = labels.stable_hash();
    cache.add_ref(&metric, labels, hash);
  }
}

fn stale(cache: &ScrapeCache) -> Vec<Labels> {
  let mut stale = Vec::new();
  cache.for_each_stale(|labels| {
    stale.push(labels.clone());
    true
  });
  stale.sort();
  stale
}

#[test]
fn get_and_refs() {
  let mut cache = ScrapeCache::new();
  assert!(cache.get("foo").is_none());

  let labels = Labels::from_pairs(&[("__name__", "foo")]);
  let first = cache.add_ref("foo", labels.clone(), labels.stable_hash());
  let second = cache.add_ref("bar", labels.clone(), labels.stable_hash());
  assert!(second > first);

  let entry = cache.get("foo").unwrap();
  assert_eq!(first, entry.series_ref);
  assert_eq!(labels, entry.labels);
}

#[test]
fn dropped() {
  let mut cache = ScrapeCache::new();
  assert!(!cache.get_dropped("foo"));
  cache.add_dropped("foo");
  assert!(cache.get_dropped("foo"));
  assert_eq!(1, cache.dropped_len());
}

#[test]
fn flush_purges_untouched_entries() {
  let mut cache = ScrapeCache::new();
  add_series(&mut cache, "a", 2);
  cache.add_dropped("dropped");
  assert!(!cache.iter_done(true));
  assert_eq!(1, cache.iteration());

  // Only a_0 is seen in the next scrape.
  assert!(cache.get("a_0").is_some());
  assert!(!cache.iter_done(true));
  assert_eq!(1, cache.series_len());
  assert_eq!(0, cache.dropped_len());
  assert!(cache.get("a_1").is_none());
}

#[test]
fn empty_scrape_does_not_flush() {
  let mut cache = ScrapeCache::new();
  add_series(&mut cache, "a", 2);
  assert!(!cache.iter_done(false));
  assert_eq!(0, cache.iteration());
  assert_eq!(2, cache.series_len());
}

#[test]
fn forced_flush_without_successful_scrape() {
  let mut cache = ScrapeCache::new();
  add_series(&mut cache, "a", 1000);
  assert!(!cache.iter_done(false));
  assert_eq!(1000, cache.series_len());

  add_series(&mut cache, "b", 1);
  assert!(cache.iter_done(false));
  assert_eq!(1, cache.iteration());
}

#[test]
fn forced_flush_threshold_tracks_successful_count() {
  let mut cache = ScrapeCache::new();
  add_series(&mut cache, "a", 500);
  assert!(!cache.iter_done(true));

  // Threshold is now 2 * 500 + 1000.
  add_series(&mut cache, "b", 1500);
  assert!(!cache.iter_done(false));
  assert_eq!(2000, cache.series_len());

  add_series(&mut cache, "c", 1);
  assert!(cache.iter_done(false));
  // The a_* series were last touched in an earlier iteration and are purged.
  assert_eq!(1501, cache.series_len());
}

#[test]
fn staleness_diff() {
  let mut cache = ScrapeCache::new();
  let a = Labels::from_pairs(&[("__name__", "a")]);
  let b = Labels::from_pairs(&[("__name__", "b")]);

  cache.track_staleness(a.stable_hash(), &a);
  cache.track_staleness(b.stable_hash(), &b);
  assert!(stale(&cache).is_empty());
  cache.iter_done(true);

  cache.track_staleness(a.stable_hash(), &a);
  assert_eq!(vec![b.clone()], stale(&cache));
  cache.iter_done(true);

  // Swapping happens even without a flush.
  assert_eq!(vec![a.clone()], stale(&cache));
  cache.iter_done(false);
  assert!(stale(&cache).is_empty());
}

#[test]
fn metadata_retention() {
  let mut cache = ScrapeCache::new();
  cache.set_type("foo", MetricType::Counter);
  cache.set_help("foo", "help text");
  cache.set_unit("foo", "seconds");
  let metadata = cache.metadata();
  assert_eq!(
    Some(Metadata {
      metric: "foo".into(),
      metric_type: MetricType::Counter,
      help: "help text".into(),
      unit: "seconds".into(),
    }),
    metadata.get("foo")
  );

  for _ in 0 ..= 10 {
    cache.iter_done(true);
  }
  assert_eq!(1, metadata.len());

  cache.iter_done(true);
  assert!(metadata.is_empty());
}
