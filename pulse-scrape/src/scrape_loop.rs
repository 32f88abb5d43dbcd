// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./scrape_loop_test.rs"]
mod scrape_loop_test;

use crate::buffers::BufferPool;
use crate::cache::ScrapeCache;
use crate::config::ScrapeConfig;
use crate::labels::{EXPORTED_LABEL_PREFIX, Label, Labels, LabelsBuilder, METRIC_NAME_LABEL};
use crate::parser::{Entry, ParseError, Parser, parse_series};
use crate::relabel::{self, RelabelConfig};
use crate::scraper::Scraper;
use crate::target::Target;
use crate::writer::{MetricWriter, TimeSeries, stale_nan};
use async_trait::async_trait;
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use bd_time::TimeDurationExt;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::ext::NumericalDuration;
use time::{Duration, OffsetDateTime};
use tokio::time::{Instant, MissedTickBehavior};

pub type SharedCache = Arc<Mutex<ScrapeCache>>;

#[derive(thiserror::Error, Debug)]
pub enum AppendError {
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error("series {0:?} has no metric name after relabeling")]
  MissingMetricName(String),
  #[error("sample limit of {0} exceeded")]
  SampleLimit(usize),
}

fn unix_millis(time: OffsetDateTime) -> i64 {
  i64::try_from(time.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

//
// Ticker
//

// Own ticker abstraction so tests can control when scrapes happen.
#[async_trait]
pub trait Ticker: Send {
  async fn next(&mut self);
}

// An interval rather than a sleep so a slow target does not shift the scrape cadence.
#[async_trait]
impl Ticker for tokio::time::Interval {
  async fn next(&mut self) {
    self.tick().await;
  }
}

pub type TickerFactory = Arc<dyn Fn(Duration) -> Box<dyn Ticker> + Send + Sync>;

#[must_use]
pub fn interval_ticker_factory() -> TickerFactory {
  Arc::new(|interval: Duration| {
    Box::new(interval.interval(MissedTickBehavior::Delay)) as Box<dyn Ticker>
  })
}

//
// Stats
//

#[derive(Clone)]
pub struct Stats {
  scrape_attempt: IntCounter,
  scrape_failure: IntCounter,
  scrape_complete: IntCounter,
  parse_failure: IntCounter,
  missing_metric_name: IntCounter,
  sample_limit_exceeded: IntCounter,
  write_failure: IntCounter,
  stale_markers: IntCounter,
  cache_flush_forced: IntCounter,
}

impl Stats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      scrape_attempt: scope.counter("scrape_attempt"),
      scrape_failure: scope.counter("scrape_failure"),
      scrape_complete: scope.counter("scrape_complete"),
      parse_failure: scope.counter("parse_failure"),
      missing_metric_name: scope.counter("missing_metric_name"),
      sample_limit_exceeded: scope.counter("sample_limit_exceeded"),
      write_failure: scope.counter("write_failure"),
      stale_markers: scope.counter("stale_markers"),
      cache_flush_forced: scope.counter("cache_flush_forced"),
    }
  }
}

//
// LoopOptions
//

/// Per-target scrape settings resolved from the job configuration and the target's labels.
#[derive(Clone, Debug)]
pub struct LoopOptions {
  pub interval: Duration,
  pub timeout: Duration,
  pub honor_labels: bool,
  pub honor_timestamps: bool,
  pub sample_limit: usize,
  pub metric_relabel_configs: Arc<[RelabelConfig]>,
  pub jitter_seed: u64,
}

impl LoopOptions {
  #[must_use]
  pub fn new(config: &ScrapeConfig, target: &Target, jitter_seed: u64) -> Self {
    let to_time = |duration| Duration::try_from(duration).unwrap_or(Duration::MAX);
    let (interval, timeout) = target.interval_and_timeout(
      to_time(config.scrape_interval),
      to_time(config.scrape_timeout),
    );
    Self {
      interval,
      timeout,
      honor_labels: config.honor_labels,
      honor_timestamps: config.honor_timestamps,
      sample_limit: config.sample_limit,
      metric_relabel_configs: config.metric_relabel_configs.clone().into(),
      jitter_seed,
    }
  }
}

/// Attaches the target's labels to a scraped label set and applies metric relabeling. Returns
/// None if relabeling dropped the series.
///
/// With `honor_labels` scraped values win over target labels. Otherwise target labels win and
/// the colliding scraped labels are kept under an `exported_` prefix.
#[must_use]
pub fn mutate_sample_labels(
  labels: &Labels,
  target_labels: &Labels,
  honor_labels: bool,
  rules: &[RelabelConfig],
) -> Option<Labels> {
  let mut builder = LabelsBuilder::new(labels);
  if honor_labels {
    for label in target_labels {
      if !labels.has(&label.name) {
        builder.set(label.name.as_str(), label.value.as_str());
      }
    }
  } else {
    let mut conflicts = Vec::new();
    for label in target_labels {
      if let Some(existing) = labels.get(&label.name) {
        conflicts.push(Label::new(label.name.as_str(), existing));
      }
      builder.set(label.name.as_str(), label.value.as_str());
    }

    conflicts.sort_by_key(|label| label.name.len());
    for conflict in conflicts {
      let mut name = conflict.name;
      loop {
        name = format!("{EXPORTED_LABEL_PREFIX}{name}");
        if builder.get(&name).is_none() {
          builder.set(name, conflict.value);
          break;
        }
      }
    }
  }

  let labels = builder.labels();
  if rules.is_empty() {
    return (!labels.is_empty()).then_some(labels);
  }
  relabel::process(&labels, rules)
}

//
// Loop
//

/// A running scrape of a single target.
#[async_trait]
pub trait Loop: Send + Sync {
  /// Spawns the loop task. Calling this more than once has no effect.
  fn start(&self);

  /// Stops the loop and waits for its current tick to finish. A loop that was stopped
  /// individually may keep running in the background to emit staleness markers.
  async fn stop(&self);

  /// Skips staleness markers at the end of the run. Used when another loop takes over the cache.
  fn disable_end_of_run_staleness(&self);

  fn cache(&self) -> SharedCache;
}

/// Everything a loop factory needs to build the loop of one target.
pub struct LoopContext {
  pub target: Arc<Target>,
  pub scraper: Box<dyn Scraper>,
  pub cache: SharedCache,
  pub options: LoopOptions,
  // Cancelled when the whole pool stops.
  pub root_shutdown: ComponentShutdown,
}

pub type LoopFactory = Box<dyn Fn(LoopContext) -> Box<dyn Loop> + Send + Sync>;

//
// ScrapeLoop
//

pub struct ScrapeLoop {
  pending: Mutex<Option<(LoopTask, ComponentShutdown, ComponentShutdown)>>,
  stop_trigger: Mutex<Option<ComponentShutdownTrigger>>,
  end_of_run_staleness: Arc<AtomicBool>,
  cache: SharedCache,
}

impl ScrapeLoop {
  #[must_use]
  pub fn new(
    context: LoopContext,
    writer: Arc<dyn MetricWriter>,
    buffers: Arc<BufferPool>,
    stats: Stats,
    ticker_factory: TickerFactory,
  ) -> Self {
    let target_labels = context.target.labels().without_reserved();
    let mut up_labels: Vec<Label> = target_labels.iter().cloned().collect();
    up_labels.push(Label::new(METRIC_NAME_LABEL, "up"));

    context.target.set_metadata(context.cache.lock().metadata());
    let stop_trigger = ComponentShutdownTrigger::default();
    let end_of_run_staleness = Arc::new(AtomicBool::new(true));
    let task = LoopTask {
      id: context.target.labels().to_string(),
      scraper: context.scraper,
      cache: context.cache.clone(),
      writer,
      buffers,
      options: context.options,
      target_labels,
      up_labels: Labels::new(up_labels),
      stats,
      ticker_factory,
      end_of_run_staleness: end_of_run_staleness.clone(),
      last_scrape_size: 0,
    };

    Self {
      pending: Mutex::new(Some((
        task,
        stop_trigger.make_shutdown(),
        context.root_shutdown,
      ))),
      stop_trigger: Mutex::new(Some(stop_trigger)),
      end_of_run_staleness,
      cache: context.cache,
    }
  }

  /// Loop factory producing `ScrapeLoop`s that share the given writer, buffers and stats.
  #[must_use]
  pub fn factory(
    writer: Arc<dyn MetricWriter>,
    buffers: Arc<BufferPool>,
    stats: Stats,
    ticker_factory: TickerFactory,
  ) -> LoopFactory {
    Box::new(move |context| {
      Box::new(Self::new(
        context,
        writer.clone(),
        buffers.clone(),
        stats.clone(),
        ticker_factory.clone(),
      ))
    })
  }
}

#[async_trait]
impl Loop for ScrapeLoop {
  fn start(&self) {
    let pending = self.pending.lock().take();
    if let Some((task, shutdown, root_shutdown)) = pending {
      tokio::spawn(task.run(shutdown, root_shutdown));
    }
  }

  async fn stop(&self) {
    // Drops the shutdown handles of a loop that never started.
    drop(self.pending.lock().take());
    let stop_trigger = self.stop_trigger.lock().take();
    if let Some(stop_trigger) = stop_trigger {
      stop_trigger.shutdown().await;
    }
  }

  fn disable_end_of_run_staleness(&self) {
    self.end_of_run_staleness.store(false, Ordering::SeqCst);
  }

  fn cache(&self) -> SharedCache {
    self.cache.clone()
  }
}

//
// LoopTask
//

struct LoopTask {
  id: String,
  scraper: Box<dyn Scraper>,
  cache: SharedCache,
  writer: Arc<dyn MetricWriter>,
  buffers: Arc<BufferPool>,
  options: LoopOptions,
  target_labels: Labels,
  up_labels: Labels,
  stats: Stats,
  ticker_factory: TickerFactory,
  end_of_run_staleness: Arc<AtomicBool>,
  last_scrape_size: usize,
}

impl LoopTask {
  async fn run(mut self, mut shutdown: ComponentShutdown, mut root_shutdown: ComponentShutdown) {
    let offset = self
      .scraper
      .offset(self.options.interval, self.options.jitter_seed);
    log::debug!("starting scrape loop for {} with offset {offset}", self.id);

    tokio::select! {
      () = offset.sleep() => {},
      () = shutdown.cancelled() => {
        log::debug!("scrape loop for {} stopped while waiting for offset", self.id);
        return;
      },
      () = root_shutdown.cancelled() => return,
    }

    let mut ticker = (self.ticker_factory)(self.options.interval);
    let mut scraped = false;
    loop {
      tokio::select! {
        biased;
        () = root_shutdown.cancelled() => {
          log::debug!("scrape loop for {} cancelled", self.id);
          return;
        },
        () = shutdown.cancelled() => break,
        () = ticker.next() => {},
      }

      tokio::select! {
        biased;
        () = root_shutdown.cancelled() => {
          log::debug!("scrape loop for {} cancelled mid scrape", self.id);
          return;
        },
        () = self.scrape_and_report() => scraped = true,
      }
    }

    // Signals the stopper that the main loop is done.
    drop(shutdown);
    log::debug!("scrape loop for {} stopped", self.id);

    if scraped && self.end_of_run_staleness.load(Ordering::SeqCst) {
      self
        .drain_staleness(ticker.as_mut(), &mut root_shutdown)
        .await;
    }
  }

  async fn scrape_and_report(&mut self) {
    let start = OffsetDateTime::now_utc();
    let started = Instant::now();
    self.stats.scrape_attempt.inc();

    let mut buffer = self.buffers.get(self.last_scrape_size);
    let scrape_result = self
      .scraper
      .scrape(self.options.timeout, &mut buffer)
      .await;
    let duration = Duration::try_from(started.elapsed()).unwrap_or(Duration::MAX);

    let (content_type, mut error) = match scrape_result {
      Ok(content_type) => {
        self.last_scrape_size = buffer.len();
        (content_type, None)
      },
      Err(e) => {
        warn_every!(1.minutes(), "failed to scrape {}: {}", self.id, e);
        self.stats.scrape_failure.inc();
        buffer.clear();
        (String::new(), Some(e.to_string()))
      },
    };

    let timestamp = unix_millis(start);
    let mut batch = Vec::new();
    let added = match self.append(&mut batch, &buffer, &content_type, timestamp) {
      Ok(added) => {
        if error.is_none() {
          self.stats.scrape_complete.inc();
        }
        added
      },
      Err(e) => {
        warn_every!(1.minutes(), "failed to append scrape of {}: {}", self.id, e);
        match &e {
          AppendError::Parse(_) => self.stats.parse_failure.inc(),
          AppendError::MissingMetricName(_) => self.stats.missing_metric_name.inc(),
          AppendError::SampleLimit(_) => self.stats.sample_limit_exceeded.inc(),
        }
        let added = batch.len();
        // Retry with an empty payload so that series missing from this scrape go stale.
        if let Err(e) = self.append(&mut batch, &[], "", timestamp) {
          log::debug!("empty append for {} failed: {e}", self.id);
        }
        error.get_or_insert_with(|| e.to_string());
        added
      },
    };
    self.buffers.put(buffer);

    batch.push(TimeSeries::new(
      self.up_labels.clone(),
      timestamp,
      if added > 0 { 1.0 } else { 0.0 },
    ));
    self.scraper.report(start, duration, error);
    self.write(batch).await;
  }

  /// Waits until two more scrapes would have happened plus a safety margin and then marks every
  /// series of the last scrape as stale. If the target comes back in the meantime, its new loop
  /// will have written fresh samples by then.
  async fn drain_staleness(
    &mut self,
    ticker: &mut dyn Ticker,
    root_shutdown: &mut ComponentShutdown,
  ) {
    let stale_time = tokio::select! {
      () = root_shutdown.cancelled() => return,
      () = ticker.next() => OffsetDateTime::now_utc(),
    };
    tokio::select! {
      () = root_shutdown.cancelled() => return,
      () = ticker.next() => {},
    }
    tokio::select! {
      () = root_shutdown.cancelled() => return,
      () = (self.options.interval / 10).sleep() => {},
    }

    log::debug!("writing end of run staleness markers for {}", self.id);
    let timestamp = unix_millis(stale_time);
    let mut batch = Vec::new();
    if let Err(e) = self.append(&mut batch, &[], "", timestamp) {
      log::debug!("end of run append for {} failed: {e}", self.id);
    }
    batch.push(TimeSeries::new(
      self.up_labels.clone(),
      timestamp,
      stale_nan(),
    ));
    tokio::select! {
      () = root_shutdown.cancelled() => {},
      () = self.write(batch) => {},
    }
  }

  async fn write(&self, batch: Vec<TimeSeries>) {
    if let Err(e) = self.writer.write_metrics(batch).await {
      warn_every!(1.minutes(), "failed to write scrape of {}: {}", self.id, e);
      self.stats.write_failure.inc();
    }
  }

  /// Parses a payload and appends its series to `batch`. Returns the number of series added. On
  /// error the series accepted so far stay in `batch` and the cache iteration is left open.
  fn append(
    &self,
    batch: &mut Vec<TimeSeries>,
    payload: &[u8],
    content_type: &str,
    timestamp: i64,
  ) -> Result<usize, AppendError> {
    let mut cache = self.cache.lock();
    let mut added = 0;

    for entry in Parser::new(payload, content_type) {
      let (series, explicit_timestamp, value) = match entry? {
        Entry::Type { name, metric_type } => {
          cache.set_type(name, metric_type);
          continue;
        },
        Entry::Help { name, help } => {
          cache.set_help(name, help);
          continue;
        },
        Entry::Unit { name, unit } => {
          cache.set_unit(name, unit);
          continue;
        },
        Entry::Series {
          series,
          timestamp,
          value,
        } => (series, timestamp, value),
      };

      if cache.get_dropped(series) {
        continue;
      }

      let explicit_timestamp = explicit_timestamp.filter(|_| self.options.honor_timestamps);
      let (labels, hash) = if let Some(entry) = cache.get(series) {
        (entry.labels.clone(), entry.hash)
      } else {
        let Some(labels) = mutate_sample_labels(
          &parse_series(series)?,
          &self.target_labels,
          self.options.honor_labels,
          &self.options.metric_relabel_configs,
        ) else {
          cache.add_dropped(series);
          continue;
        };
        if labels.metric_name().is_none() {
          return Err(AppendError::MissingMetricName(series.to_string()));
        }
        let hash = labels.stable_hash();
        cache.add_ref(series, labels.clone(), hash);
        (labels, hash)
      };

      if self.options.sample_limit > 0 && added >= self.options.sample_limit {
        return Err(AppendError::SampleLimit(self.options.sample_limit));
      }
      // Series with explicit timestamps are not subject to staleness.
      if explicit_timestamp.is_none() {
        cache.track_staleness(hash, &labels);
      }
      batch.push(TimeSeries::new(
        labels,
        explicit_timestamp.unwrap_or(timestamp),
        value,
      ));
      added += 1;
    }

    let mut stale = 0;
    cache.for_each_stale(|labels| {
      batch.push(TimeSeries::new(labels.clone(), timestamp, stale_nan()));
      stale += 1;
      true
    });
    self.stats.stale_markers.inc_by(stale);

    if cache.iter_done(!payload.is_empty()) {
      self.stats.cache_flush_forced.inc();
    }
    Ok(added)
  }
}
