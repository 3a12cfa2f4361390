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

use evhttpd_util::{lock, lockp, Error, ErrorKind};
use mysql::{Conn, OptsBuilder};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

/// Connection parameters for [`SqlPool::init`].
#[derive(Clone, Debug)]
pub struct SqlPoolConfig {
	pub host: String,
	pub port: u16,
	pub user: String,
	pub password: String,
	pub db_name: String,
	pub pool_size: usize,
}

/// A fixed-size pool of handles. The condition variable plays the role of a
/// counting semaphore whose value is the free count; acquire blocks while
/// every handle is handed out. Handles are returned through the RAII guard
/// on every path. Generic over the handle type so the queue/semaphore
/// discipline is testable without a live server.
pub struct ConnPool<T> {
	free: Mutex<VecDeque<T>>,
	cond: Condvar,
	capacity: usize,
}

/// The pool of open MySQL connections used by the request handlers.
pub type SqlPool = ConnPool<Conn>;

impl ConnPool<Conn> {
	/// Open `pool_size` connections. A single failed connection aborts the
	/// whole init; a pool never holds dead handles.
	pub fn init(config: &SqlPoolConfig) -> Result<SqlPool, Error> {
		if config.pool_size == 0 {
			return Err(ErrorKind::SetupError("sql pool size must be > 0".to_string()).into());
		}

		let mut handles = Vec::with_capacity(config.pool_size);
		for _ in 0..config.pool_size {
			let opts = OptsBuilder::new()
				.ip_or_hostname(Some(config.host.clone()))
				.tcp_port(config.port)
				.user(Some(config.user.clone()))
				.pass(Some(config.password.clone()))
				.db_name(Some(config.db_name.clone()));
			handles.push(Conn::new(opts)?);
		}

		Ok(ConnPool::with_handles(handles))
	}
}

impl<T> ConnPool<T> {
	fn with_handles(handles: Vec<T>) -> ConnPool<T> {
		ConnPool {
			capacity: handles.len(),
			free: Mutex::new(handles.into_iter().collect()),
			cond: Condvar::new(),
		}
	}

	/// Take a handle, blocking until one is free.
	pub fn acquire(&self) -> Result<SqlConnGuard<T>, Error> {
		let mut free = lock!(self.free);
		loop {
			if let Some(conn) = free.pop_front() {
				return Ok(SqlConnGuard {
					pool: self,
					conn: Some(conn),
				});
			}
			free = self.cond.wait(free).map_err(|e| {
				let error: Error =
					ErrorKind::PoisonError(format!("Poison Error: {}", e.to_string())).into();
				error
			})?;
		}
	}

	pub fn free_count(&self) -> usize {
		lockp!(self.free).len()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Drop every pooled handle. Outstanding guards return their handles to
	/// the queue afterwards, where they are simply dropped with the pool.
	pub fn close(&self) {
		lockp!(self.free).clear();
	}

	fn release(&self, conn: T) {
		lockp!(self.free).push_back(conn);
		self.cond.notify_one();
	}
}

/// RAII wrapper around an acquired handle; releases on drop.
pub struct SqlConnGuard<'a, T> {
	pool: &'a ConnPool<T>,
	conn: Option<T>,
}

impl<'a, T> Deref for SqlConnGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		self.conn.as_ref().expect("handle taken")
	}
}

impl<'a, T> DerefMut for SqlConnGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		self.conn.as_mut().expect("handle taken")
	}
}

impl<'a, T> Drop for SqlConnGuard<'a, T> {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			self.pool.release(conn);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Arc;
	use std::thread;
	use std::time::Duration;

	#[test]
	fn test_acquire_release_counts() -> Result<(), Error> {
		let pool = ConnPool::with_handles(vec![1u32, 2, 3]);
		assert_eq!(pool.capacity(), 3);
		assert_eq!(pool.free_count(), 3);

		let g1 = pool.acquire()?;
		let g2 = pool.acquire()?;
		assert_eq!(*g1, 1);
		assert_eq!(*g2, 2);
		// outstanding (2) + free (1) always equals the pool size
		assert_eq!(pool.free_count(), 1);

		drop(g1);
		assert_eq!(pool.free_count(), 2);
		drop(g2);
		assert_eq!(pool.free_count(), 3);
		Ok(())
	}

	#[test]
	fn test_concurrent_acquire() -> Result<(), Error> {
		let pool = Arc::new(ConnPool::with_handles(vec![0u32; 4]));
		let mut jhs = vec![];
		for _ in 0..8 {
			let pool = pool.clone();
			jhs.push(thread::spawn(move || {
				for _ in 0..50 {
					let mut guard = pool.acquire().unwrap();
					*guard += 1;
				}
			}));
		}
		for jh in jhs {
			jh.join().expect("worker panicked");
		}
		// every handle came home
		assert_eq!(pool.free_count(), pool.capacity());
		Ok(())
	}

	#[test]
	fn test_acquire_waits_for_release() -> Result<(), Error> {
		let pool = Arc::new(ConnPool::with_handles(vec![7u32]));
		let guard = pool.acquire()?;
		assert_eq!(pool.free_count(), 0);

		let pool_clone = pool.clone();
		let jh = thread::spawn(move || *pool_clone.acquire().unwrap());

		thread::sleep(Duration::from_millis(100));
		drop(guard);
		assert_eq!(jh.join().expect("acquirer panicked"), 7);
		Ok(())
	}

	#[test]
	fn test_close_empties_pool() -> Result<(), Error> {
		let pool = ConnPool::with_handles(vec![1u32, 2]);
		pool.close();
		assert_eq!(pool.free_count(), 0);
		assert_eq!(pool.capacity(), 2);
		Ok(())
	}

	#[test]
	fn test_init_aborts_on_connect_failure() -> Result<(), Error> {
		// nothing listens on the discard port
		let config = SqlPoolConfig {
			host: "127.0.0.1".to_string(),
			port: 9,
			user: "root".to_string(),
			password: "root".to_string(),
			db_name: "webserver".to_string(),
			pool_size: 2,
		};
		assert!(SqlPool::init(&config).is_err());
		Ok(())
	}

	#[test]
	fn test_zero_sized_pool_rejected() -> Result<(), Error> {
		let config = SqlPoolConfig {
			host: "127.0.0.1".to_string(),
			port: 3306,
			user: "root".to_string(),
			password: "root".to_string(),
			db_name: "webserver".to_string(),
			pool_size: 0,
		};
		assert!(SqlPool::init(&config).is_err());
		Ok(())
	}
}
