// Copyright 2024 WinMux Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-capacity byte ring buffer used to replay recent PTY output to a
//! client that attaches after a session has already produced output.

use bytes::{Bytes, BytesMut};

/// A tail window over a byte stream: holds at most `capacity` bytes, and
/// once full, the oldest bytes are evicted to make room for new ones. Read
/// order is preserved; only history beyond `capacity` is lost.
pub struct RingBuffer {
    capacity: usize,
    buf: BytesMut,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer { capacity, buf: BytesMut::with_capacity(capacity.min(64 * 1024)) }
    }

    /// Append `data`, evicting the oldest bytes first if it would overflow
    /// capacity. If `data` alone exceeds capacity, only its tail survives.
    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            let _ = self.buf.split_to(overflow);
        }
        self.buf.extend_from_slice(data);
    }

    /// A snapshot of everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Bytes {
        self.buf.clone().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_everything_under_capacity() {
        let mut rb = RingBuffer::new(16);
        rb.push(b"hello");
        assert_eq!(&rb.snapshot()[..], b"hello");
    }

    #[test]
    fn evicts_oldest_bytes_once_full() {
        let mut rb = RingBuffer::new(8);
        rb.push(b"abcdefgh");
        rb.push(b"ij");
        assert_eq!(&rb.snapshot()[..], b"cdefghij");
    }

    #[test]
    fn a_single_push_larger_than_capacity_keeps_only_its_tail() {
        let mut rb = RingBuffer::new(4);
        rb.push(b"abcdefgh");
        assert_eq!(&rb.snapshot()[..], b"efgh");
    }

    #[test]
    fn never_exceeds_capacity_across_many_pushes() {
        let mut rb = RingBuffer::new(10);
        for _ in 0..100 {
            rb.push(b"abc");
        }
        assert!(rb.len() <= 10);
    }
}
