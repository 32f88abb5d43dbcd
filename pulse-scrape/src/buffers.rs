// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./buffers_test.rs"]
mod buffers_test;

use parking_lot::Mutex;

// Max number of idle buffers retained per bucket.
const MAX_IDLE_PER_BUCKET: usize = 16;

//
// BufferPool
//

/// A pool of byte buffers bucketed by capacity. Shared by all scrape loops of a pool so that
/// scrape bodies of similar size reuse allocations across ticks.
pub struct BufferPool {
  sizes: Vec<usize>,
  buckets: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
  /// Creates bucket sizes from `min_size` growing by `factor` until `max_size` is covered.
  #[must_use]
  pub fn new(min_size: usize, max_size: usize, factor: usize) -> Self {
    let mut sizes = Vec::new();
    let mut size = min_size.max(1);
    while size < max_size {
      sizes.push(size);
      size = size.saturating_mul(factor.max(2));
    }
    sizes.push(max_size.max(min_size));

    Self {
      buckets: sizes.iter().map(|_| Mutex::new(Vec::new())).collect(),
      sizes,
    }
  }

  /// Returns an empty buffer with a capacity of at least `size`.
  #[must_use]
  pub fn get(&self, size: usize) -> Vec<u8> {
    let Some(index) = self.sizes.iter().position(|bucket| *bucket >= size) else {
      return Vec::with_capacity(size);
    };
    self.buckets[index]
      .lock()
      .pop()
      .unwrap_or_else(|| Vec::with_capacity(self.sizes[index]))
  }

  /// Returns a buffer to the pool. Buffers are filed under the largest bucket they can satisfy.
  pub fn put(&self, mut buffer: Vec<u8>) {
    let Some(index) = self
      .sizes
      .iter()
      .rposition(|bucket| *bucket <= buffer.capacity())
    else {
      return;
    };
    buffer.clear();
    let mut bucket = self.buckets[index].lock();
    if bucket.len() < MAX_IDLE_PER_BUCKET {
      bucket.push(buffer);
    }
  }
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new(1_000, 100_000_000, 3)
  }
}
