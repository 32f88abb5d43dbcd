// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

#[test]
fn reuses_buffers() {
  let pool = BufferPool::new(10, 1000, 10);
  let mut buffer = pool.get(50);
  assert!(buffer.capacity() >= 50);
  buffer.extend_from_slice(b"hello");
  let ptr = buffer.as_ptr();
  pool.put(buffer);

  let buffer = pool.get(50);
  assert!(buffer.is_empty());
  assert_eq!(ptr, buffer.as_ptr());
}

#[test]
fn oversized_and_undersized() {
  let pool = BufferPool::new(10, 1000, 10);
  assert!(pool.get(5000).capacity() >= 5000);

  // Too small for any bucket, simply dropped.
  pool.put(Vec::with_capacity(5));
  assert!(pool.get(1).capacity() >= 10);
}
