// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod buffers;
pub mod cache;
pub mod config;
pub mod labels;
pub mod manager;
pub mod parser;
pub mod pool;
pub mod relabel;
pub mod scrape_loop;
pub mod scraper;
pub mod target;
pub mod writer;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  bd_log::SwapLogger::initialize();
}
