// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pool_test.rs"]
mod pool_test;

use crate::buffers::BufferPool;
use crate::config::{ScrapeConfig, reusable_cache};
use crate::scrape_loop::{self, Loop, LoopContext, LoopFactory, LoopOptions, ScrapeLoop};
use crate::scraper::{HttpClient, TargetScraper};
use crate::target::{Target, TargetGroup, targets_from_group};
use crate::writer::MetricWriter;
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdownTrigger;
use futures::future::join_all;
use prometheus::{IntCounter, IntGauge};
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use time::ext::NumericalDuration;

//
// Stats
//

struct Stats {
  reloads: IntCounter,
  reloads_failed: IntCounter,
  syncs: IntCounter,
  sync_group_failures: IntCounter,
  active_targets: IntGauge,
  dropped_targets: IntGauge,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      reloads: scope.counter("reloads"),
      reloads_failed: scope.counter("reloads_failed"),
      syncs: scope.counter("syncs"),
      sync_group_failures: scope.counter("sync_group_failures"),
      active_targets: scope.gauge("active_targets"),
      dropped_targets: scope.gauge("dropped_targets"),
    }
  }
}

// Both maps always cover the same hashes.
#[derive(Default)]
struct Maps {
  active: HashMap<u64, Arc<Target>>,
  loops: HashMap<u64, Box<dyn Loop>>,
  dropped: Vec<Arc<Target>>,
}

struct PoolState {
  config: ScrapeConfig,
  client: HttpClient,
  // Groups of the last sync_groups call, if the pool is fed by discovery.
  groups: Option<Vec<TargetGroup>>,
  // None once the pool has been stopped.
  root_trigger: Option<ComponentShutdownTrigger>,
}

//
// ScrapePool
//

/// Manages the scrape loops of every target of one job. Sync, reload and stop are serialized by
/// the async state lock. The maps sit behind a separate lock that is only held for bookkeeping,
/// so target listings never wait on loops being stopped.
pub struct ScrapePool {
  name: String,
  state: tokio::sync::Mutex<PoolState>,
  maps: parking_lot::Mutex<Maps>,
  buffers: Arc<BufferPool>,
  loop_factory: LoopFactory,
  jitter_seed: u64,
  stats: Stats,
}

impl ScrapePool {
  /// Creates a pool whose loops write into `writer`. Fails if the job's HTTP client cannot be
  /// built.
  pub fn new(
    config: ScrapeConfig,
    scope: &Scope,
    writer: Arc<dyn MetricWriter>,
    jitter_seed: u64,
  ) -> anyhow::Result<Self> {
    let buffers = Arc::new(BufferPool::default());
    let loop_factory = ScrapeLoop::factory(
      writer,
      buffers.clone(),
      scrape_loop::Stats::new(scope),
      scrape_loop::interval_ticker_factory(),
    );
    Self::with_loop_factory(config, scope, buffers, loop_factory, jitter_seed)
  }

  pub fn with_loop_factory(
    config: ScrapeConfig,
    scope: &Scope,
    buffers: Arc<BufferPool>,
    loop_factory: LoopFactory,
    jitter_seed: u64,
  ) -> anyhow::Result<Self> {
    let client = HttpClient::new(&config.http_client_config)?;
    Ok(Self {
      name: config.job_name.clone(),
      state: tokio::sync::Mutex::new(PoolState {
        config,
        client,
        groups: None,
        root_trigger: Some(ComponentShutdownTrigger::default()),
      }),
      maps: parking_lot::Mutex::default(),
      buffers,
      loop_factory,
      jitter_seed,
      stats: Stats::new(scope),
    })
  }

  /// Converts discovered groups into targets and syncs them. Targets that fail conversion are
  /// logged and skipped. The groups are kept so that a reload can rebuild the targets.
  pub async fn sync_groups(&self, groups: &[TargetGroup]) {
    let mut state = self.state.lock().await;
    if state.root_trigger.is_none() {
      log::debug!("({}) ignoring sync of stopped pool", self.name);
      return;
    }
    let targets = self.targets_from_groups(groups, &state.config);
    state.groups = Some(groups.to_vec());
    self.sync_locked(&state, targets).await;
  }

  /// Makes the set of running loops match `targets`. Targets with empty labels were dropped by
  /// relabeling and are only recorded. Known targets keep their loop and get their discovered
  /// labels refreshed. Loops of targets that went away are stopped before this returns.
  pub async fn sync(&self, targets: Vec<Target>) {
    let mut state = self.state.lock().await;
    state.groups = None;
    self.sync_locked(&state, targets).await;
  }

  fn targets_from_groups(&self, groups: &[TargetGroup], config: &ScrapeConfig) -> Vec<Target> {
    let mut all = Vec::new();
    for group in groups {
      let (targets, failures) = targets_from_group(group, config);
      for failure in failures {
        warn_every!(
          1.minutes(),
          "({}) skipping target from {}: {}",
          self.name,
          group.source,
          failure
        );
        self.stats.sync_group_failures.inc();
      }
      all.extend(targets);
    }
    all
  }

  async fn sync_locked(&self, state: &PoolState, targets: Vec<Target>) {
    let Some(root_trigger) = &state.root_trigger else {
      log::debug!("({}) ignoring sync of stopped pool", self.name);
      return;
    };
    self.stats.syncs.inc();

    let mut dropped = Vec::new();
    let mut current: HashMap<u64, Arc<Target>> = HashMap::new();
    for target in targets {
      if target.labels().is_empty() {
        dropped.push(Arc::new(target));
        continue;
      }
      match current.entry(target.hash()) {
        Entry::Occupied(_) => {
          log::debug!("({}) duplicate target {}", self.name, target.labels());
        },
        Entry::Vacant(entry) => {
          entry.insert(Arc::new(target));
        },
      }
    }

    let mut added = 0;
    let stale_loops = {
      let mut maps = self.maps.lock();
      for (hash, target) in &current {
        if let Some(existing) = maps.active.get(hash) {
          existing.set_discovered_labels(target.discovered_labels());
          continue;
        }

        let scraper = Box::new(TargetScraper::new(
          target.clone(),
          state.client.clone(),
          self.buffers.clone(),
        ));
        let scrape_loop = (self.loop_factory)(LoopContext {
          target: target.clone(),
          scraper,
          cache: scrape_loop::SharedCache::default(),
          options: LoopOptions::new(&state.config, target, self.jitter_seed),
          root_shutdown: root_trigger.make_shutdown(),
        });
        scrape_loop.start();
        maps.active.insert(*hash, target.clone());
        maps.loops.insert(*hash, scrape_loop);
        added += 1;
      }

      let mut removed = Vec::new();
      maps.active.retain(|hash, target| {
        let keep = current.contains_key(hash);
        if !keep {
          removed.push(target.labels().to_string());
        }
        keep
      });
      if !removed.is_empty() {
        log::info!("({}) removing: {:?}", self.name, removed);
      }
      let stale_hashes: Vec<u64> = maps
        .loops
        .keys()
        .filter(|hash| !current.contains_key(hash))
        .copied()
        .collect();
      let stale_loops: Vec<_> = stale_hashes
        .iter()
        .filter_map(|hash| maps.loops.remove(hash))
        .collect();

      maps.dropped = dropped;
      self.stats.active_targets.set(gauge_value(maps.active.len()));
      self.stats.dropped_targets.set(gauge_value(maps.dropped.len()));
      stale_loops
    };

    if added > 0 {
      log::info!("({}) added {added} targets", self.name);
    }
    join_all(stale_loops.iter().map(|scrape_loop| scrape_loop.stop())).await;
  }

  /// Applies a new configuration for the same job. Targets are rebuilt from the last synced
  /// groups, so label defaults such as the scrape interval follow the new settings. Targets whose
  /// labels are unchanged get a new loop, and the old loop is fully stopped before its replacement
  /// starts. If the change leaves parsing unaffected, the cache moves to the new loop and the old
  /// loop writes no staleness markers. Targets whose labels changed are then synced like any other
  /// discovery update.
  pub async fn reload(&self, config: ScrapeConfig) -> anyhow::Result<()> {
    self.stats.reloads.inc();
    let mut state = self.state.lock().await;
    let client = match HttpClient::new(&config.http_client_config) {
      Ok(client) => client,
      Err(e) => {
        self.stats.reloads_failed.inc();
        return Err(e);
      },
    };
    let Some(root_trigger) = &state.root_trigger else {
      anyhow::bail!("pool {} is stopped", self.name);
    };

    // None when the pool was synced with targets directly, which are kept as they are.
    let targets = state
      .groups
      .as_deref()
      .map(|groups| self.targets_from_groups(groups, &config));
    let kept: Option<HashSet<u64>> = targets.as_ref().map(|targets| {
      targets
        .iter()
        .filter(|target| !target.labels().is_empty())
        .map(Target::hash)
        .collect()
    });

    let reuse_cache = reusable_cache(&state.config, &config);
    let replacements: Vec<_> = {
      let mut maps = self.maps.lock();
      let hashes: Vec<u64> = maps
        .loops
        .keys()
        .filter(|hash| kept.as_ref().is_none_or(|kept| kept.contains(*hash)))
        .copied()
        .collect();
      log::info!(
        "({}) reloading {} targets, reusing caches: {reuse_cache}",
        self.name,
        hashes.len()
      );
      hashes
        .into_iter()
        .filter_map(|hash| {
          let target = maps.active.get(&hash)?.clone();
          let old_loop = maps.loops.remove(&hash)?;
          let cache = if reuse_cache {
            old_loop.disable_end_of_run_staleness();
            old_loop.cache()
          } else {
            scrape_loop::SharedCache::default()
          };
          let new_loop = (self.loop_factory)(LoopContext {
            target: target.clone(),
            scraper: Box::new(TargetScraper::new(
              target.clone(),
              client.clone(),
              self.buffers.clone(),
            )),
            cache,
            options: LoopOptions::new(&config, &target, self.jitter_seed),
            root_shutdown: root_trigger.make_shutdown(),
          });
          Some((hash, old_loop, new_loop))
        })
        .collect()
    };

    let replaced = join_all(
      replacements
        .into_iter()
        .map(|(hash, old_loop, new_loop)| async move {
          old_loop.stop().await;
          new_loop.start();
          (hash, new_loop)
        }),
    )
    .await;
    self.maps.lock().loops.extend(replaced);
    state.config = config;
    state.client = client;

    if let Some(targets) = targets {
      self.sync_locked(&state, targets).await;
    }
    Ok(())
  }

  /// Stops every loop. Pool-wide cancellation is signalled first so no loop writes end of run
  /// staleness markers. The pool ignores further syncs and reloads.
  pub async fn stop(&self) {
    let mut state = self.state.lock().await;
    let Some(root_trigger) = state.root_trigger.take() else {
      return;
    };

    let loops: Vec<_> = {
      let mut maps = self.maps.lock();
      log::info!("({}) stopping {} targets", self.name, maps.loops.len());
      maps.active.clear();
      maps.dropped.clear();
      maps.loops.drain().map(|(_, l)| l).collect()
    };
    tokio::join!(
      root_trigger.shutdown(),
      join_all(loops.iter().map(|scrape_loop| scrape_loop.stop()))
    );
    self.stats.active_targets.set(0);
    self.stats.dropped_targets.set(0);
  }

  /// Targets currently being scraped, ordered by labels.
  #[must_use]
  pub fn active_targets(&self) -> Vec<Arc<Target>> {
    let mut targets: Vec<_> = self.maps.lock().active.values().cloned().collect();
    targets.sort_by(|a, b| a.labels().cmp(b.labels()));
    targets
  }

  /// Targets that relabeling dropped during the last sync.
  #[must_use]
  pub fn dropped_targets(&self) -> Vec<Arc<Target>> {
    self.maps.lock().dropped.clone()
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }
}

fn gauge_value(len: usize) -> i64 {
  i64::try_from(len).unwrap_or(i64::MAX)
}
