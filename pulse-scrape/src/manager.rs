// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./manager_test.rs"]
mod manager_test;

use crate::config::{ScrapeConfig, validate_all};
use crate::pool::ScrapePool;
use crate::target::{Target, TargetGroup};
use crate::writer::MetricWriter;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use futures::future::join_all;
use prometheus::{IntCounter, IntGauge};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Discovered target groups keyed by job name.
pub type TargetGroups = HashMap<String, Vec<TargetGroup>>;

//
// Stats
//

struct Stats {
  config_applies: IntCounter,
  config_apply_failures: IntCounter,
  pools: IntGauge,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      config_applies: scope.counter("config_applies"),
      config_apply_failures: scope.counter("config_apply_failures"),
      pools: scope.gauge("pools"),
    }
  }
}

struct Job {
  config: ScrapeConfig,
  pool: ScrapePool,
}

//
// ScrapeManager
//

/// Owns one scrape pool per configured job and feeds them discovered targets.
pub struct ScrapeManager {
  scope: Scope,
  writer: Arc<dyn MetricWriter>,
  jitter_seed: u64,
  jobs: tokio::sync::Mutex<BTreeMap<String, Job>>,
  // Last groups received, used to seed pools created by a later config change.
  groups: parking_lot::Mutex<TargetGroups>,
  stats: Stats,
}

impl ScrapeManager {
  #[must_use]
  pub fn new(scope: &Scope, writer: Arc<dyn MetricWriter>, jitter_seed: u64) -> Self {
    Self {
      scope: scope.clone(),
      writer,
      jitter_seed,
      jobs: tokio::sync::Mutex::default(),
      groups: parking_lot::Mutex::default(),
      stats: Stats::new(scope),
    }
  }

  /// Brings the set of pools in line with `configs`. Pools of removed jobs are stopped, changed
  /// jobs are reloaded and new jobs get a pool seeded with the last known targets. An invalid
  /// config rejects the whole set without changing anything. A job whose pool cannot be created
  /// or reloaded keeps its previous state and is reported in the returned error.
  pub async fn apply_config(&self, configs: Vec<ScrapeConfig>) -> anyhow::Result<()> {
    self.stats.config_applies.inc();
    if let Err(e) = validate_all(&configs) {
      self.stats.config_apply_failures.inc();
      return Err(e.into());
    }

    let mut jobs = self.jobs.lock().await;
    let names: HashSet<&str> = configs.iter().map(|c| c.job_name.as_str()).collect();
    let removed: Vec<String> = jobs
      .keys()
      .filter(|name| !names.contains(name.as_str()))
      .cloned()
      .collect();
    let removed: Vec<Job> = removed
      .iter()
      .filter_map(|name| jobs.remove(name))
      .collect();
    if !removed.is_empty() {
      log::info!("stopping {} scrape pools", removed.len());
    }
    join_all(removed.iter().map(|job| job.pool.stop())).await;

    let mut failures = Vec::new();
    for config in configs {
      if let Some(job) = jobs.get_mut(&config.job_name) {
        if job.config == config {
          continue;
        }
        log::info!("reloading scrape pool {}", config.job_name);
        match job.pool.reload(config.clone()).await {
          Ok(()) => job.config = config,
          Err(e) => {
            log::error!("failed to reload scrape pool {}: {e}", config.job_name);
            failures.push(format!("{}: {e}", config.job_name));
          },
        }
        continue;
      }

      log::info!("creating scrape pool {}", config.job_name);
      let name = config.job_name.clone();
      match ScrapePool::new(
        config.clone(),
        &self.scope.scope(&name),
        self.writer.clone(),
        self.jitter_seed,
      ) {
        Ok(pool) => {
          let groups = self.groups.lock().get(&name).cloned().unwrap_or_default();
          pool.sync_groups(&groups).await;
          jobs.insert(name, Job { config, pool });
        },
        Err(e) => {
          log::error!("failed to create scrape pool {name}: {e}");
          failures.push(format!("{name}: {e}"));
        },
      }
    }

    self
      .stats
      .pools
      .set(i64::try_from(jobs.len()).unwrap_or(i64::MAX));
    if failures.is_empty() {
      Ok(())
    } else {
      self.stats.config_apply_failures.inc();
      anyhow::bail!("failed to apply scrape configs: {}", failures.join(", "))
    }
  }

  /// Syncs every pool whenever the discovery feed changes, until shutdown. All pools are stopped
  /// before this returns.
  pub async fn run(
    &self,
    mut updates: watch::Receiver<TargetGroups>,
    mut shutdown: ComponentShutdown,
  ) {
    loop {
      let groups = updates.borrow_and_update().clone();
      self.sync(groups).await;

      tokio::select! {
        () = shutdown.cancelled() => break,
        result = updates.changed() => {
          if result.is_err() {
            log::info!("target discovery closed, waiting for shutdown");
            shutdown.cancelled().await;
            break;
          }
        }
      }
    }

    log::info!("scrape manager shutting down");
    self.stop().await;
  }

  async fn sync(&self, groups: TargetGroups) {
    let jobs = self.jobs.lock().await;
    for name in groups.keys().filter(|name| !jobs.contains_key(*name)) {
      log::debug!("ignoring targets of unknown job {name}");
    }
    join_all(jobs.iter().map(|(name, job)| {
      job
        .pool
        .sync_groups(groups.get(name).map_or(&[], Vec::as_slice))
    }))
    .await;
    *self.groups.lock() = groups;
  }

  /// Stops every pool and forgets all jobs.
  pub async fn stop(&self) {
    let jobs = std::mem::take(&mut *self.jobs.lock().await);
    join_all(jobs.values().map(|job| job.pool.stop())).await;
    self.stats.pools.set(0);
  }

  /// Active targets by job.
  pub async fn active_targets(&self) -> BTreeMap<String, Vec<Arc<Target>>> {
    self
      .jobs
      .lock()
      .await
      .iter()
      .map(|(name, job)| (name.clone(), job.pool.active_targets()))
      .collect()
  }

  /// Targets dropped by relabeling, by job.
  pub async fn dropped_targets(&self) -> BTreeMap<String, Vec<Arc<Target>>> {
    self
      .jobs
      .lock()
      .await
      .iter()
      .map(|(name, job)| (name.clone(), job.pool.dropped_targets()))
      .collect()
  }
}
