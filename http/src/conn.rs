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

use crate::request::{HttpRequest, Method, ParseStatus};
use crate::response::HttpResponse;
use evhttpd_log::{log_debug, log_error, Log};
use evhttpd_pool::SqlPool;
use evhttpd_util::{Buffer, Error};
use mysql::prelude::Queryable;
use nix::errno::Errno;
use nix::sys::uio::{writev, IoVec};
use nix::unistd::close;
use std::os::unix::io::RawFd;

const SELECT_USER: &str = "SELECT username, password FROM user WHERE username = ? LIMIT 1";
const INSERT_USER: &str = "INSERT INTO user (username, password) VALUES (?, ?)";

fn query_user(pool: &SqlPool, username: &str, password: &str, is_login: bool) -> Result<bool, Error> {
	let mut conn = pool.acquire()?;
	let row: Option<(String, String)> = conn.exec_first(SELECT_USER, (username,))?;
	match (is_login, row) {
		(true, Some((_, stored))) => Ok(stored == password),
		(true, None) => Ok(false),
		(false, Some(_)) => Ok(false),
		(false, None) => {
			conn.exec_drop(INSERT_USER, (username, password))?;
			Ok(true)
		}
	}
}

/// Check form credentials against the user table. A login verifies the
/// stored password; a register inserts the user when the name is free.
/// Database errors fail closed.
pub fn verify_user(
	pool: &SqlPool,
	log: &Log,
	username: &str,
	password: &str,
	is_login: bool,
) -> bool {
	if username.is_empty() || password.is_empty() {
		return false;
	}
	match query_user(pool, username, password, is_login) {
		Ok(verified) => verified,
		Err(e) => {
			log_error!(log, "sql error verifying '{}': {}", username, e);
			false
		}
	}
}

// "/login" carries login intent, "/register" carries register intent; both
// have been rewritten to their .html aliases by the parser
fn auth_tag(path: &str) -> Option<bool> {
	match path {
		"/login.html" => Some(true),
		"/register.html" => Some(false),
		_ => None,
	}
}

/// Per-connection state: the socket, both I/O buffers and the
/// request/response pair. Reads and writes absorb EAGAIN according to the
/// trigger mode; `process` drives the request state machine and reports
/// which readiness the connection needs next.
pub struct HttpConn {
	fd: RawFd,
	peer: String,
	src_dir: String,
	is_et: bool,
	is_close: bool,
	file_written: usize,
	read_buf: Buffer,
	write_buf: Buffer,
	request: HttpRequest,
	response: HttpResponse,
}

impl HttpConn {
	pub fn new(fd: RawFd, peer: String, src_dir: String, is_et: bool) -> Self {
		HttpConn {
			fd,
			peer,
			src_dir,
			is_et,
			is_close: false,
			file_written: 0,
			read_buf: Buffer::default(),
			write_buf: Buffer::default(),
			request: HttpRequest::new(),
			response: HttpResponse::new(),
		}
	}

	pub fn fd(&self) -> RawFd {
		self.fd
	}

	pub fn peer(&self) -> &str {
		&self.peer
	}

	pub fn is_keep_alive(&self) -> bool {
		self.response.keep_alive()
	}

	/// Unsent bytes across the header buffer and the mapped file.
	pub fn to_write_bytes(&self) -> usize {
		let file_rest = match self.response.file() {
			Some(file) => file.len() - self.file_written.min(file.len()),
			None => 0,
		};
		self.write_buf.readable_bytes() + file_rest
	}

	/// Read into the buffer; edge-triggered connections drain until EAGAIN.
	/// The boolean is true when the peer closed its end.
	pub fn read(&mut self) -> nix::Result<(usize, bool)> {
		let mut total = 0;
		loop {
			match self.read_buf.read_from_fd(self.fd) {
				Ok(0) => return Ok((total, true)),
				Ok(len) => {
					total += len;
					if !self.is_et {
						break;
					}
				}
				Err(Errno::EAGAIN) => break,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(e),
			}
		}
		Ok((total, false))
	}

	/// Gather-write [header buffer, mapped file] until drained; EAGAIN is
	/// returned to the caller, which re-arms for write.
	pub fn write(&mut self) -> nix::Result<usize> {
		let mut total = 0;
		loop {
			let len = {
				let head = self.write_buf.peek();
				let mut iov: Vec<IoVec<&[u8]>> = Vec::with_capacity(2);
				if !head.is_empty() {
					iov.push(IoVec::from_slice(head));
				}
				if let Some(file) = self.response.file() {
					if self.file_written < file.len() {
						iov.push(IoVec::from_slice(&file[self.file_written..]));
					}
				}
				if iov.is_empty() {
					return Ok(total);
				}
				match writev(self.fd, &iov) {
					Ok(len) => len,
					Err(Errno::EINTR) => continue,
					Err(e) => return Err(e),
				}
			};
			total += len;
			let head_len = self.write_buf.readable_bytes();
			if len >= head_len {
				self.write_buf.retrieve_all();
				self.file_written += len - head_len;
			} else {
				self.write_buf.retrieve(len);
			}
			if self.to_write_bytes() == 0 {
				return Ok(total);
			}
		}
	}

	/// Parse buffered bytes and, once a request is complete (or proven
	/// malformed), assemble the response. Returns true when a response is
	/// ready to be written, false when more input is needed.
	pub fn process(&mut self, db: Option<&SqlPool>, log: &Log) -> bool {
		if self.read_buf.readable_bytes() == 0 {
			return false;
		}
		let (code, keep_alive) = match self.request.parse(&mut self.read_buf) {
			ParseStatus::Incomplete => return false,
			ParseStatus::BadRequest => (400, false),
			ParseStatus::Complete => {
				let mut code = 200;
				if self.request.method() == Method::Post {
					if let Some(is_login) = auth_tag(self.request.path()) {
						let verified = match db {
							Some(pool) => {
								let username =
									self.request.post("username").unwrap_or("").to_string();
								let password =
									self.request.post("password").unwrap_or("").to_string();
								verify_user(pool, log, &username, &password, is_login)
							}
							None => false,
						};
						if verified {
							self.request.set_path("/welcome.html");
						} else {
							self.request.set_path("/error.html");
							code = 403;
						}
					}
				}
				(code, self.request.is_keep_alive())
			}
		};
		// a protocol error always closes; auth failures honour keep-alive
		let keep_alive = keep_alive && code != 400;

		log_debug!(
			log,
			"client[{}] {} -> {}",
			self.fd,
			self.request.path(),
			code
		);
		self.response
			.init(&self.src_dir, self.request.path(), keep_alive, code);
		self.response.make_response(&mut self.write_buf);
		self.file_written = 0;
		true
	}

	/// Start over for the next request on a kept-alive connection. The
	/// mapping is released; unread input stays buffered.
	pub fn reset(&mut self) {
		self.request = HttpRequest::new();
		self.response.unmap();
		self.write_buf.retrieve_all();
		self.file_written = 0;
	}

	/// Close the socket and release the mapping. Idempotent.
	pub fn close(&mut self) {
		if !self.is_close {
			self.is_close = true;
			self.response.unmap();
			let _ = close(self.fd);
		}
	}
}

impl Drop for HttpConn {
	fn drop(&mut self) {
		self.close();
	}
}
