// Copyright 2022 The EvHttpd Developers
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

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
	deq: VecDeque<T>,
	closed: bool,
}

/// A bounded, thread-safe double-ended queue. Producers block while the
/// queue is full, consumers block while it is empty; `close` clears the
/// queue and unblocks every waiter for good.
pub struct BlockDeque<T> {
	inner: Mutex<Inner<T>>,
	capacity: usize,
	not_full: Condvar,
	not_empty: Condvar,
}

impl<T> BlockDeque<T> {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0);
		BlockDeque {
			inner: Mutex::new(Inner {
				deq: VecDeque::new(),
				closed: false,
			}),
			capacity,
			not_full: Condvar::new(),
			not_empty: Condvar::new(),
		}
	}

	/// Append at the tail, blocking while the queue is full. Returns false
	/// if the queue was closed instead.
	pub fn push_back(&self, item: T) -> bool {
		let mut inner = lockp!(self.inner);
		while inner.deq.len() >= self.capacity {
			if inner.closed {
				return false;
			}
			inner = match self.not_full.wait(inner) {
				Ok(guard) => guard,
				Err(e) => e.into_inner(),
			};
		}
		if inner.closed {
			return false;
		}
		inner.deq.push_back(item);
		self.not_empty.notify_one();
		true
	}

	/// Append at the head, blocking while the queue is full. Returns false
	/// if the queue was closed instead.
	pub fn push_front(&self, item: T) -> bool {
		let mut inner = lockp!(self.inner);
		while inner.deq.len() >= self.capacity {
			if inner.closed {
				return false;
			}
			inner = match self.not_full.wait(inner) {
				Ok(guard) => guard,
				Err(e) => e.into_inner(),
			};
		}
		if inner.closed {
			return false;
		}
		inner.deq.push_front(item);
		self.not_empty.notify_one();
		true
	}

	/// Pop the head, blocking while the queue is empty. `None` once closed.
	pub fn pop(&self) -> Option<T> {
		let mut inner = lockp!(self.inner);
		loop {
			if let Some(item) = inner.deq.pop_front() {
				self.not_full.notify_one();
				return Some(item);
			}
			if inner.closed {
				return None;
			}
			inner = match self.not_empty.wait(inner) {
				Ok(guard) => guard,
				Err(e) => e.into_inner(),
			};
		}
	}

	/// Pop the head, giving up after `timeout`. `None` on timeout or close.
	pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
		let mut inner = lockp!(self.inner);
		loop {
			if let Some(item) = inner.deq.pop_front() {
				self.not_full.notify_one();
				return Some(item);
			}
			if inner.closed {
				return None;
			}
			let (guard, res) = match self.not_empty.wait_timeout(inner, timeout) {
				Ok(r) => r,
				Err(e) => e.into_inner(),
			};
			inner = guard;
			if res.timed_out() {
				return inner.deq.pop_front();
			}
		}
	}

	/// Wake one consumer without enqueuing anything.
	pub fn flush(&self) {
		self.not_empty.notify_one();
	}

	/// Clear the queue, mark it closed and unblock all waiters.
	pub fn close(&self) {
		{
			let mut inner = lockp!(self.inner);
			inner.deq.clear();
			inner.closed = true;
		}
		self.not_full.notify_all();
		self.not_empty.notify_all();
	}

	pub fn len(&self) -> usize {
		lockp!(self.inner).deq.len()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn is_empty(&self) -> bool {
		lockp!(self.inner).deq.is_empty()
	}

	pub fn is_full(&self) -> bool {
		let inner = lockp!(self.inner);
		inner.deq.len() >= self.capacity
	}
}

impl<T: Clone> BlockDeque<T> {
	pub fn front(&self) -> Option<T> {
		lockp!(self.inner).deq.front().cloned()
	}

	pub fn back(&self) -> Option<T> {
		lockp!(self.inner).deq.back().cloned()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::Error;
	use std::sync::Arc;
	use std::thread;
	use std::time::Instant;

	#[test]
	fn test_fifo_and_bounds() -> Result<(), Error> {
		let deq = BlockDeque::new(4);
		assert!(deq.push_back(1));
		assert!(deq.push_back(2));
		assert!(deq.push_front(0));
		assert_eq!(deq.len(), 3);
		assert_eq!(deq.capacity(), 4);
		assert_eq!(deq.front(), Some(0));
		assert_eq!(deq.back(), Some(2));
		assert_eq!(deq.pop(), Some(0));
		assert_eq!(deq.pop(), Some(1));
		assert_eq!(deq.pop(), Some(2));
		assert!(deq.is_empty());
		Ok(())
	}

	#[test]
	fn test_producer_consumer() -> Result<(), Error> {
		let deq = Arc::new(BlockDeque::new(2));
		let deq_clone = deq.clone();

		// queue capacity (2) is far below the item count, so the producer
		// must block and resume as the consumer drains
		let producer = thread::spawn(move || {
			for i in 0..100 {
				assert!(deq_clone.push_back(i));
			}
		});

		let mut got = vec![];
		for _ in 0..100 {
			got.push(deq.pop().unwrap());
		}
		producer.join().expect("producer panicked");
		assert_eq!(got, (0..100).collect::<Vec<i32>>());
		Ok(())
	}

	#[test]
	fn test_close_unblocks_everyone() -> Result<(), Error> {
		let deq: Arc<BlockDeque<u32>> = Arc::new(BlockDeque::new(4));
		let deq_clone = deq.clone();

		let consumer = thread::spawn(move || deq_clone.pop());

		thread::sleep(Duration::from_millis(100));
		deq.close();
		assert_eq!(consumer.join().expect("consumer panicked"), None);

		// after close, pop always returns None and push always fails
		assert_eq!(deq.pop(), None);
		assert!(!deq.push_back(1));
		assert_eq!(deq.pop(), None);
		Ok(())
	}

	#[test]
	fn test_pop_timeout() -> Result<(), Error> {
		let deq: BlockDeque<u32> = BlockDeque::new(4);
		let start = Instant::now();
		assert_eq!(deq.pop_timeout(Duration::from_millis(100)), None);
		assert!(start.elapsed() >= Duration::from_millis(100));
		Ok(())
	}
}
