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

use nix::sys::uio::{readv, IoVec};
use nix::unistd::write;
use std::cell::RefCell;
use std::os::unix::io::RawFd;

const INITIAL_SIZE: usize = 1024;
const SPILL_SIZE: usize = 65536;

thread_local! {
	// scatter read spill area, shared by all buffers on this thread
	static SPILL: RefCell<Box<[u8; SPILL_SIZE]>> = RefCell::new(Box::new([0u8; SPILL_SIZE]));
}

/// A growable byte buffer with separate read and write cursors. Bytes are
/// appended at the write cursor and drained at the read cursor; the space in
/// front of the read cursor is reclaimed by compaction before the storage is
/// grown. Invariant: `read_pos <= write_pos <= storage.len()`.
pub struct Buffer {
	storage: Vec<u8>,
	read_pos: usize,
	write_pos: usize,
}

impl Buffer {
	pub fn new(init_size: usize) -> Self {
		Buffer {
			storage: vec![0u8; init_size],
			read_pos: 0,
			write_pos: 0,
		}
	}

	pub fn readable_bytes(&self) -> usize {
		self.write_pos - self.read_pos
	}

	pub fn writable_bytes(&self) -> usize {
		self.storage.len() - self.write_pos
	}

	pub fn prependable_bytes(&self) -> usize {
		self.read_pos
	}

	/// The readable region.
	pub fn peek(&self) -> &[u8] {
		&self.storage[self.read_pos..self.write_pos]
	}

	/// Drop `len` readable bytes. Cursors reset to zero on full drain.
	pub fn retrieve(&mut self, len: usize) {
		debug_assert!(len <= self.readable_bytes());
		self.read_pos += len;
		if self.read_pos == self.write_pos {
			self.retrieve_all();
		}
	}

	pub fn retrieve_all(&mut self) {
		self.read_pos = 0;
		self.write_pos = 0;
	}

	/// Drain the readable region into an owned byte vector.
	pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
		let ret = self.peek().to_vec();
		self.retrieve_all();
		ret
	}

	/// Convenience form of [`Buffer::retrieve_all_to_vec`] for content known
	/// to be text, e.g. formatted log lines.
	pub fn retrieve_all_to_string(&mut self) -> String {
		String::from_utf8_lossy(&self.retrieve_all_to_vec()).into_owned()
	}

	/// The writable region. Call [`Buffer::has_written`] after filling it.
	pub fn begin_write(&mut self) -> &mut [u8] {
		let write_pos = self.write_pos;
		&mut self.storage[write_pos..]
	}

	pub fn has_written(&mut self, len: usize) {
		debug_assert!(len <= self.writable_bytes());
		self.write_pos += len;
	}

	pub fn append(&mut self, data: &[u8]) {
		self.ensure_writable(data.len());
		let write_pos = self.write_pos;
		self.storage[write_pos..write_pos + data.len()].copy_from_slice(data);
		self.has_written(data.len());
	}

	/// Make room for `len` more bytes: compact when the already-read prefix
	/// is large enough, grow the storage otherwise.
	pub fn ensure_writable(&mut self, len: usize) {
		if self.writable_bytes() < len {
			self.make_space(len);
		}
		debug_assert!(self.writable_bytes() >= len);
	}

	/// Total allocated size of the backing storage.
	pub fn capacity(&self) -> usize {
		self.storage.len()
	}

	fn make_space(&mut self, len: usize) {
		if self.writable_bytes() + self.prependable_bytes() < len {
			self.storage.resize(self.write_pos + len + 1, 0);
		} else {
			let readable = self.readable_bytes();
			self.storage.copy_within(self.read_pos..self.write_pos, 0);
			self.read_pos = 0;
			self.write_pos = readable;
		}
	}

	/// Scatter read from `fd`: one vector points at the remaining writable
	/// area, the second at a 64 KiB thread local spill buffer, so a ready
	/// socket is drained with a single syscall in the common case. A spill
	/// tail is appended afterwards, growing the buffer as needed.
	pub fn read_from_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
		SPILL.with(|spill| {
			let mut spill = spill.borrow_mut();
			let writable = self.writable_bytes();
			let len = {
				let mut iov = [
					IoVec::from_mut_slice(self.begin_write()),
					IoVec::from_mut_slice(&mut spill[..]),
				];
				readv(fd, &mut iov)?
			};
			if len <= writable {
				self.write_pos += len;
			} else {
				self.write_pos = self.storage.len();
				self.append(&spill[..len - writable]);
			}
			Ok(len)
		})
	}

	/// Write the readable region to `fd` with a single syscall and drop
	/// whatever was accepted. The caller retries until drained or EAGAIN.
	pub fn write_to_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
		let len = write(fd, self.peek())?;
		self.retrieve(len);
		Ok(len)
	}
}

impl Default for Buffer {
	fn default() -> Self {
		Buffer::new(INITIAL_SIZE)
	}
}
