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

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Callback fired when a timer expires.
pub type TimeoutCb = Box<dyn FnMut() + Send>;

struct TimerNode {
	id: i32,
	expires: Instant,
	cb: TimeoutCb,
}

/// A binary min-heap on expiry time with an id -> index map so that
/// adjusting or cancelling an arbitrary entry is O(log n). Ids are file
/// descriptors; one entry per live connection.
pub struct HeapTimer {
	heap: Vec<TimerNode>,
	refs: HashMap<i32, usize>,
}

impl HeapTimer {
	pub fn new() -> Self {
		HeapTimer {
			heap: Vec::with_capacity(64),
			refs: HashMap::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	/// Add a timer for `id`, or reset expiry and callback if one exists.
	pub fn add(&mut self, id: i32, timeout_ms: u64, cb: TimeoutCb) {
		let expires = Instant::now() + Duration::from_millis(timeout_ms);
		match self.refs.get(&id) {
			Some(&i) => {
				self.heap[i].expires = expires;
				self.heap[i].cb = cb;
				if !self.sift_down(i) {
					self.sift_up(i);
				}
			}
			None => {
				let i = self.heap.len();
				self.refs.insert(id, i);
				self.heap.push(TimerNode { id, expires, cb });
				self.sift_up(i);
			}
		}
	}

	/// Push the expiry of `id` out to now + `timeout_ms`. Unknown ids are
	/// ignored (the entry may have fired already).
	pub fn adjust(&mut self, id: i32, timeout_ms: u64) {
		if let Some(&i) = self.refs.get(&id) {
			self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
			if !self.sift_down(i) {
				self.sift_up(i);
			}
		}
	}

	/// Run the callback of `id` and remove the entry.
	pub fn do_work(&mut self, id: i32) {
		if let Some(&i) = self.refs.get(&id) {
			(self.heap[i].cb)();
			self.del(i);
		}
	}

	/// Remove the entry of `id` without running its callback.
	pub fn cancel(&mut self, id: i32) {
		if let Some(&i) = self.refs.get(&id) {
			self.del(i);
		}
	}

	/// Remove the root.
	pub fn pop(&mut self) {
		if !self.heap.is_empty() {
			self.del(0);
		}
	}

	/// Fire every expired entry, earliest first.
	pub fn tick(&mut self) {
		let now = Instant::now();
		loop {
			match self.heap.first() {
				Some(node) if node.expires <= now => {}
				_ => break,
			}
			(self.heap[0].cb)();
			self.pop();
		}
	}

	/// Fire the expired entries, then report milliseconds until the next
	/// expiry, or -1 when no timer is armed.
	pub fn get_next_tick(&mut self) -> i64 {
		self.tick();
		match self.heap.first() {
			Some(node) => {
				let now = Instant::now();
				if node.expires <= now {
					0
				} else {
					node.expires.duration_since(now).as_millis() as i64
				}
			}
			None => -1,
		}
	}

	pub fn clear(&mut self) {
		self.heap.clear();
		self.refs.clear();
	}

	fn del(&mut self, i: usize) {
		debug_assert!(i < self.heap.len());
		let last = self.heap.len() - 1;
		self.swap_nodes(i, last);
		if let Some(node) = self.heap.pop() {
			self.refs.remove(&node.id);
		}
		if i < self.heap.len() && !self.sift_down(i) {
			self.sift_up(i);
		}
	}

	fn sift_up(&mut self, mut i: usize) {
		while i > 0 {
			let parent = (i - 1) / 2;
			if self.heap[parent].expires <= self.heap[i].expires {
				break;
			}
			self.swap_nodes(parent, i);
			i = parent;
		}
	}

	// returns true if the node moved
	fn sift_down(&mut self, mut i: usize) -> bool {
		let start = i;
		let n = self.heap.len();
		loop {
			let mut child = i * 2 + 1;
			if child >= n {
				break;
			}
			if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
				child += 1;
			}
			if self.heap[i].expires <= self.heap[child].expires {
				break;
			}
			self.swap_nodes(i, child);
			i = child;
		}
		i > start
	}

	fn swap_nodes(&mut self, i: usize, j: usize) {
		if i == j {
			return;
		}
		self.heap.swap(i, j);
		self.refs.insert(self.heap[i].id, i);
		self.refs.insert(self.heap[j].id, j);
	}

	#[cfg(test)]
	fn assert_heap_ok(&self) {
		for i in 0..self.heap.len() {
			let left = i * 2 + 1;
			let right = i * 2 + 2;
			if left < self.heap.len() {
				assert!(self.heap[i].expires <= self.heap[left].expires);
			}
			if right < self.heap.len() {
				assert!(self.heap[i].expires <= self.heap[right].expires);
			}
			assert_eq!(self.refs[&self.heap[i].id], i);
		}
		assert_eq!(self.refs.len(), self.heap.len());
	}
}

impl Default for HeapTimer {
	fn default() -> Self {
		HeapTimer::new()
	}
}
