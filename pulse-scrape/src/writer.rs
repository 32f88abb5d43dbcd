// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::labels::Labels;
use async_trait::async_trait;
use mockall::automock;

// Prometheus staleness marker. A specific NaN that is never produced by arithmetic.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

#[must_use]
pub const fn stale_nan() -> f64 {
  f64::from_bits(STALE_NAN_BITS)
}

#[must_use]
pub const fn is_stale_nan(value: f64) -> bool {
  value.to_bits() == STALE_NAN_BITS
}

//
// Sample
//

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
  /// Milliseconds since the Unix epoch.
  pub timestamp: i64,
  pub value: f64,
}

//
// TimeSeries
//

#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
  pub labels: Labels,
  pub samples: Vec<Sample>,
}

impl TimeSeries {
  #[must_use]
  pub fn new(labels: Labels, timestamp: i64, value: f64) -> Self {
    Self {
      labels,
      samples: vec![Sample { timestamp, value }],
    }
  }
}

//
// MetricWriter
//

/// Sink for scraped time series. Each scrape loop calls this once per tick. Batches from different
/// targets arrive interleaved and in no particular time order.
#[automock]
#[async_trait]
pub trait MetricWriter: Send + Sync {
  async fn write_metrics(&self, series: Vec<TimeSeries>) -> anyhow::Result<()>;
}
