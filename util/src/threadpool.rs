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

use crate::error::{Error, ErrorKind};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked when a task panics. The panic never escapes the worker.
pub type OnPanic = Box<dyn Fn(&str) + Send + Sync + 'static>;

struct PoolState {
	tasks: VecDeque<Task>,
	running: bool,
}

struct PoolShared {
	state: Mutex<PoolState>,
	cond: Condvar,
	on_panic: Mutex<Option<OnPanic>>,
}

/// A fixed-size pool of worker threads consuming closures from a shared
/// queue. Dropping the pool stops intake, drains the queued tasks and joins
/// every worker.
pub struct ThreadPool {
	shared: Arc<PoolShared>,
	workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
	pub fn new(size: usize) -> Result<Self, Error> {
		if size == 0 {
			return Err(ErrorKind::SetupError("thread pool size must be > 0".to_string()).into());
		}

		let shared = Arc::new(PoolShared {
			state: Mutex::new(PoolState {
				tasks: VecDeque::new(),
				running: true,
			}),
			cond: Condvar::new(),
			on_panic: Mutex::new(None),
		});

		let mut workers = vec![];
		for id in 0..size {
			let shared = shared.clone();
			let jh = thread::Builder::new()
				.name(format!("evhttpd-worker-{}", id))
				.spawn(move || Self::worker_loop(shared))?;
			workers.push(jh);
		}

		Ok(ThreadPool { shared, workers })
	}

	/// Register the hook that reports task panics.
	pub fn set_on_panic(&self, on_panic: OnPanic) {
		let mut guard = lockp!(self.shared.on_panic);
		*guard = Some(on_panic);
	}

	pub fn execute<F>(&self, task: F) -> Result<(), Error>
	where
		F: FnOnce() + Send + 'static,
	{
		{
			let mut state = lock!(self.shared.state);
			if !state.running {
				return Err(ErrorKind::SetupError("thread pool is stopped".to_string()).into());
			}
			state.tasks.push_back(Box::new(task));
		}
		self.shared.cond.notify_one();
		Ok(())
	}

	fn worker_loop(shared: Arc<PoolShared>) {
		loop {
			let task = {
				let mut state = lockp!(shared.state);
				loop {
					if let Some(task) = state.tasks.pop_front() {
						break task;
					}
					if !state.running {
						return;
					}
					state = match shared.cond.wait(state) {
						Ok(guard) => guard,
						Err(e) => e.into_inner(),
					};
				}
			};

			if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
				let msg = match e.downcast_ref::<&str>() {
					Some(s) => s.to_string(),
					None => match e.downcast_ref::<String>() {
						Some(s) => s.clone(),
						None => "unknown panic".to_string(),
					},
				};
				let guard = lockp!(shared.on_panic);
				if let Some(on_panic) = guard.as_ref() {
					on_panic(&msg);
				}
			}
		}
	}
}

impl Drop for ThreadPool {
	fn drop(&mut self) {
		{
			let mut state = lockp!(self.shared.state);
			state.running = false;
		}
		self.shared.cond.notify_all();
		for jh in self.workers.drain(..) {
			let _ = jh.join();
		}
	}
}
