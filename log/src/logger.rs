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

use chrono::{Datelike, Local};
use evhttpd_util::{lockp, BlockDeque, Buffer, Error, ErrorKind};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// A new log file is started every time this many lines have been written
/// to the current one.
pub const MAX_LINES: u64 = 50_000;

// sentinel level used by [`Log::disabled`]; above every real level
const LEVEL_OFF: usize = 4;

/// Log levels, ordered least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum Level {
	Debug = 0,
	Info = 1,
	Warn = 2,
	Error = 3,
}

impl Level {
	pub fn from_usize(level: usize) -> Level {
		match level {
			0 => Level::Debug,
			1 => Level::Info,
			2 => Level::Warn,
			_ => Level::Error,
		}
	}

	fn tag(&self) -> &'static str {
		match self {
			Level::Debug => "[debug]: ",
			Level::Info => "[info] : ",
			Level::Warn => "[warn] : ",
			Level::Error => "[error]: ",
		}
	}
}

struct LogInner {
	file: Option<File>,
	today: u32,
	line_count: u64,
	buf: Buffer,
	path: String,
	suffix: String,
}

/// A file logger. Lines are formatted into a shared [`Buffer`] and either
/// written directly or handed to a dedicated writer thread through a bounded
/// [`BlockDeque`]. Files are named `<dir>/YYYY_MM_DD<suffix>` and rotated on
/// day change and every [`MAX_LINES`] lines.
///
/// There is no global instance; create one at startup with [`Log::init`]
/// and pass the `Arc` wherever logging is needed.
pub struct Log {
	level: AtomicUsize,
	inner: Arc<Mutex<LogInner>>,
	deque: Option<Arc<BlockDeque<String>>>,
	writer: Mutex<Option<JoinHandle<()>>>,
}

impl Log {
	/// Open today's log file under `path`, creating the directory if the
	/// first open fails. `max_queue_size > 0` enables the asynchronous
	/// writer thread.
	pub fn init(
		level: Level,
		path: &str,
		suffix: &str,
		max_queue_size: usize,
	) -> Result<Arc<Log>, Error> {
		let now = Local::now();
		let file_name = format!("{}/{}{}", path, now.format("%Y_%m_%d"), suffix);
		let file = match OpenOptions::new().append(true).create(true).open(&file_name) {
			Ok(file) => file,
			Err(_) => {
				create_dir_all(path)?;
				OpenOptions::new().append(true).create(true).open(&file_name)?
			}
		};

		let inner = Arc::new(Mutex::new(LogInner {
			file: Some(file),
			today: now.day(),
			line_count: 0,
			buf: Buffer::default(),
			path: path.to_string(),
			suffix: suffix.to_string(),
		}));

		let (deque, writer) = if max_queue_size > 0 {
			let deque = Arc::new(BlockDeque::<String>::new(max_queue_size));
			let deque_clone = deque.clone();
			let inner_clone = inner.clone();
			let jh = thread::Builder::new()
				.name("evhttpd-log".to_string())
				.spawn(move || {
					while let Some(line) = deque_clone.pop() {
						let mut inner = lockp!(inner_clone);
						if let Some(file) = inner.file.as_mut() {
							let _ = file.write_all(line.as_bytes());
						}
					}
				})?;
			(Some(deque), Some(jh))
		} else {
			(None, None)
		};

		Ok(Arc::new(Log {
			level: AtomicUsize::new(level as usize),
			inner,
			deque,
			writer: Mutex::new(writer),
		}))
	}

	/// A logger that swallows everything. Used when logging is switched off.
	pub fn disabled() -> Arc<Log> {
		Arc::new(Log {
			level: AtomicUsize::new(LEVEL_OFF),
			inner: Arc::new(Mutex::new(LogInner {
				file: None,
				today: 0,
				line_count: 0,
				buf: Buffer::new(1),
				path: String::new(),
				suffix: String::new(),
			})),
			deque: None,
			writer: Mutex::new(None),
		})
	}

	pub fn get_level(&self) -> usize {
		self.level.load(Ordering::Relaxed)
	}

	pub fn set_level(&self, level: Level) {
		self.level.store(level as usize, Ordering::Relaxed);
	}

	/// Format and emit one line. Errors are swallowed so that logging can
	/// never take the server down; see [`Log::try_write`] for the fallible
	/// form.
	pub fn write(&self, level: Level, args: fmt::Arguments) {
		let _ = self.try_write(level, args);
	}

	/// Format and emit one line, reporting a missing log target.
	pub fn try_write(&self, level: Level, args: fmt::Arguments) -> Result<(), Error> {
		if (level as usize) < self.get_level() {
			return Ok(());
		}

		let now = Local::now();
		let mut inner = lockp!(self.inner);
		if inner.file.is_none() {
			return Err(ErrorKind::LogNotConfigured("no log file open".to_string()).into());
		}

		// rotate on day change or every MAX_LINES lines
		let day = now.day();
		if inner.today != day || (inner.line_count > 0 && inner.line_count % MAX_LINES == 0) {
			let tail = now.format("%Y_%m_%d");
			let new_file = if inner.today != day {
				inner.today = day;
				inner.line_count = 0;
				format!("{}/{}{}", inner.path, tail, inner.suffix)
			} else {
				format!(
					"{}/{}-{}{}",
					inner.path,
					tail,
					inner.line_count / MAX_LINES,
					inner.suffix
				)
			};
			if let Some(file) = inner.file.as_mut() {
				let _ = file.flush();
			}
			if let Ok(file) = OpenOptions::new().append(true).create(true).open(&new_file) {
				inner.file = Some(file);
			}
		}

		inner.line_count += 1;
		let ts = format!("{} ", now.format("%Y-%m-%d %H:%M:%S%.6f"));
		inner.buf.append(ts.as_bytes());
		inner.buf.append(level.tag().as_bytes());
		let msg = format!("{}", args);
		inner.buf.append(msg.as_bytes());
		inner.buf.append(b"\n");

		let line = inner.buf.retrieve_all_to_string();
		match &self.deque {
			// hand off to the writer thread; fall back to a direct write
			// when the queue is full
			Some(deque) if !deque.is_full() => {
				deque.push_back(line);
			}
			_ => {
				if let Some(file) = inner.file.as_mut() {
					let _ = file.write_all(line.as_bytes());
				}
			}
		}
		Ok(())
	}

	pub fn flush(&self) {
		if let Some(deque) = &self.deque {
			deque.flush();
		}
		let mut inner = lockp!(self.inner);
		if let Some(file) = inner.file.as_mut() {
			let _ = file.flush();
		}
	}
}

impl Drop for Log {
	fn drop(&mut self) {
		if let Some(deque) = &self.deque {
			while !deque.is_empty() {
				deque.flush();
			}
			deque.close();
		}
		let writer = lockp!(self.writer).take();
		if let Some(jh) = writer {
			let _ = jh.join();
		}
		let mut inner = lockp!(self.inner);
		if let Some(file) = inner.file.as_mut() {
			let _ = file.flush();
		}
	}
}

/// Log at debug level. The first argument is the [`Log`] handle.
#[macro_export]
macro_rules! log_debug {
	($log:expr, $($arg:tt)*) => {
		$log.write($crate::Level::Debug, format_args!($($arg)*))
	};
}

/// Log at info level. The first argument is the [`Log`] handle.
#[macro_export]
macro_rules! log_info {
	($log:expr, $($arg:tt)*) => {
		$log.write($crate::Level::Info, format_args!($($arg)*))
	};
}

/// Log at warn level. The first argument is the [`Log`] handle.
#[macro_export]
macro_rules! log_warn {
	($log:expr, $($arg:tt)*) => {
		$log.write($crate::Level::Warn, format_args!($($arg)*))
	};
}

/// Log at error level. The first argument is the [`Log`] handle.
#[macro_export]
macro_rules! log_error {
	($log:expr, $($arg:tt)*) => {
		$log.write($crate::Level::Error, format_args!($($arg)*))
	};
}

#[cfg(test)]
mod test {
	use super::*;
	use std::fs::read_to_string;
	use std::path::PathBuf;

	fn test_dir(name: &str) -> (String, String) {
		let mut dir = PathBuf::from(std::env::temp_dir());
		dir.push(format!("evhttpd_log_{}_{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		let dir = dir.to_str().unwrap().to_string();
		let file = format!(
			"{}/{}{}",
			dir,
			Local::now().format("%Y_%m_%d"),
			".log"
		);
		(dir, file)
	}

	#[test]
	fn test_sync_write() -> Result<(), Error> {
		let (dir, file) = test_dir("sync");
		let log = Log::init(Level::Info, &dir, ".log", 0)?;
		log_info!(log, "hello {}", 123);
		log_debug!(log, "this line is below the configured level");
		log.flush();

		let content = read_to_string(&file)?;
		assert!(content.contains("[info] : hello 123\n"));
		assert!(!content.contains("below the configured level"));
		std::fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_async_write_drains_on_drop() -> Result<(), Error> {
		let (dir, file) = test_dir("async");
		let log = Log::init(Level::Debug, &dir, ".log", 64)?;
		for i in 0..200 {
			log_debug!(log, "line {}", i);
		}
		drop(log);

		let content = read_to_string(&file)?;
		for i in 0..200 {
			assert!(content.contains(&format!("line {}\n", i)));
		}
		std::fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_line_rotation() -> Result<(), Error> {
		let (dir, _file) = test_dir("rotate");
		let log = Log::init(Level::Info, &dir, ".log", 0)?;
		for i in 0..(MAX_LINES + 1) {
			log_info!(log, "{}", i);
		}
		drop(log);

		let rotated = format!("{}/{}-1{}", dir, Local::now().format("%Y_%m_%d"), ".log");
		let content = read_to_string(&rotated)?;
		assert!(content.contains(&format!("{}\n", MAX_LINES)));
		std::fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_disabled_logger() -> Result<(), Error> {
		let log = Log::disabled();
		log_error!(log, "goes nowhere");
		log.flush();
		Ok(())
	}

	#[test]
	fn test_unconfigured_log_reports() -> Result<(), Error> {
		// raising the level on a disabled logger exposes the missing target
		let log = Log::disabled();
		log.set_level(Level::Debug);
		let res = log.try_write(Level::Error, format_args!("nowhere"));
		assert!(matches!(
			res.map_err(|e| e.kind()),
			Err(ErrorKind::LogNotConfigured(_))
		));
		Ok(())
	}
}
