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

use evhttpd_util::Buffer;
use lazy_static::lazy_static;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const ERROR_PAGE: &str = "/error.html";

lazy_static! {
	static ref SUFFIX_TYPE: HashMap<&'static str, &'static str> = {
		let mut m = HashMap::new();
		m.insert(".html", "text/html");
		m.insert(".xml", "text/xml");
		m.insert(".xhtml", "application/xhtml+xml");
		m.insert(".txt", "text/plain");
		m.insert(".rtf", "application/rtf");
		m.insert(".pdf", "application/pdf");
		m.insert(".word", "application/nsword");
		m.insert(".png", "image/png");
		m.insert(".gif", "image/gif");
		m.insert(".jpg", "image/jpeg");
		m.insert(".jpeg", "image/jpeg");
		m.insert(".au", "audio/basic");
		m.insert(".mpeg", "video/mpeg");
		m.insert(".mpg", "video/mpeg");
		m.insert(".avi", "video/x-msvideo");
		m.insert(".gz", "application/x-gzip");
		m.insert(".tar", "application/x-tar");
		m.insert(".css", "text/css");
		m.insert(".js", "text/javascript");
		m
	};
}

fn status_text(code: u16) -> &'static str {
	match code {
		200 => "OK",
		400 => "Bad Request",
		403 => "Forbidden",
		404 => "Not Found",
		_ => "Bad Request",
	}
}

/// Builds the response head into the connection's write buffer and owns the
/// memory mapping of the served file. The mapping is released whenever the
/// response is re-initialised or dropped, so keep-alive resets and closes
/// both unmap on every path.
pub struct HttpResponse {
	code: u16,
	keep_alive: bool,
	path: String,
	src_dir: String,
	mmap: Option<Mmap>,
}

impl HttpResponse {
	pub fn new() -> Self {
		HttpResponse {
			code: 200,
			keep_alive: false,
			path: String::new(),
			src_dir: String::new(),
			mmap: None,
		}
	}

	pub fn init(&mut self, src_dir: &str, path: &str, keep_alive: bool, code: u16) {
		self.mmap = None;
		self.src_dir = src_dir.to_string();
		self.path = path.to_string();
		self.keep_alive = keep_alive;
		// unrecognised codes degrade to a 400
		self.code = match code {
			200 | 400 | 403 | 404 => code,
			_ => 400,
		};
	}

	pub fn code(&self) -> u16 {
		self.code
	}

	pub fn keep_alive(&self) -> bool {
		self.keep_alive
	}

	/// The mapped file region, when the body is served from a file.
	pub fn file(&self) -> Option<&[u8]> {
		self.mmap.as_deref()
	}

	/// Release the mapping without touching the rest of the state.
	pub fn unmap(&mut self) {
		self.mmap = None;
	}

	/// Resolve the target under the document root and write the full
	/// response head (and, for generated error pages, the body) into `buf`.
	pub fn make_response(&mut self, buf: &mut Buffer) {
		if self.code == 200 {
			self.resolve_target();
		}
		// every error status serves the shared error page
		if let 400 | 403 | 404 = self.code {
			self.path = ERROR_PAGE.to_string();
		}
		self.add_state_line(buf);
		self.add_header(buf);
		self.add_content(buf);
	}

	fn full_path(&self) -> PathBuf {
		Path::new(&self.src_dir).join(self.path.trim_start_matches('/'))
	}

	fn resolve_target(&mut self) {
		match fs::metadata(self.full_path()) {
			Ok(md) if md.is_dir() => {
				// a directory request serves the index below it
				self.path = format!("{}/index.html", self.path.trim_end_matches('/'));
				if fs::metadata(self.full_path()).is_err() {
					self.code = 404;
				}
			}
			Ok(md) => {
				if md.permissions().mode() & 0o004 == 0 {
					self.code = 403;
				}
			}
			Err(_) => self.code = 404,
		}
	}

	fn add_state_line(&self, buf: &mut Buffer) {
		buf.append(format!("HTTP/1.1 {} {}\r\n", self.code, status_text(self.code)).as_bytes());
	}

	fn add_header(&self, buf: &mut Buffer) {
		if self.keep_alive {
			buf.append(b"Connection: keep-alive\r\n");
			buf.append(b"keep-alive: max=6 timeout=120\r\n");
		} else {
			buf.append(b"Connection: close\r\n");
		}
		buf.append(format!("Content-type: {}\r\n", self.file_type()).as_bytes());
	}

	fn add_content(&mut self, buf: &mut Buffer) {
		let file = match File::open(self.full_path()) {
			Ok(file) => file,
			Err(_) => return self.error_content(buf),
		};
		let len = match file.metadata() {
			Ok(md) => md.len(),
			Err(_) => return self.error_content(buf),
		};
		if len == 0 {
			buf.append(b"Content-length: 0\r\n\r\n");
			return;
		}
		match unsafe { Mmap::map(&file) } {
			Ok(mmap) => {
				buf.append(format!("Content-length: {}\r\n\r\n", mmap.len()).as_bytes());
				self.mmap = Some(mmap);
			}
			Err(_) => self.error_content(buf),
		}
	}

	// generated fallback body used when the error page itself is missing
	fn error_content(&mut self, buf: &mut Buffer) {
		let body = format!(
			"<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}<p>File NotFound!</p><hr><em>evhttpd</em></body></html>",
			self.code,
			status_text(self.code)
		);
		buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
		buf.append(body.as_bytes());
	}

	fn file_type(&self) -> &'static str {
		match self.path.rfind('.') {
			Some(idx) => SUFFIX_TYPE
				.get(&self.path[idx..])
				.copied()
				.unwrap_or("text/plain"),
			None => "text/plain",
		}
	}
}

impl Default for HttpResponse {
	fn default() -> Self {
		HttpResponse::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use evhttpd_util::Error;
	use std::io::Write;
	use std::path::PathBuf;

	fn test_root(name: &str) -> PathBuf {
		let mut dir = PathBuf::from(std::env::temp_dir());
		dir.push(format!("evhttpd_resp_{}_{}", name, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).expect("mkdir");
		dir
	}

	fn write_file(dir: &PathBuf, name: &str, content: &[u8]) {
		let mut file = File::create(dir.join(name)).expect("create");
		file.write_all(content).expect("write");
	}

	#[test]
	fn test_static_file_response() -> Result<(), Error> {
		let dir = test_root("static");
		let content = b"<html>hi there</html>";
		write_file(&dir, "index.html", content);

		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/index.html", true, 200);
		let mut buf = Buffer::default();
		resp.make_response(&mut buf);

		let head = String::from_utf8_lossy(buf.peek()).into_owned();
		let expect = format!(
			"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nkeep-alive: max=6 timeout=120\r\nContent-type: text/html\r\nContent-length: {}\r\n\r\n",
			content.len()
		);
		assert_eq!(head, expect);
		assert_eq!(resp.file(), Some(&content[..]));
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_missing_file_maps_to_error_page() -> Result<(), Error> {
		let dir = test_root("missing");
		let error_page = b"<html>error</html>";
		write_file(&dir, "error.html", error_page);

		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/nope.html", false, 200);
		let mut buf = Buffer::default();
		resp.make_response(&mut buf);

		assert_eq!(resp.code(), 404);
		let head = String::from_utf8_lossy(buf.peek()).into_owned();
		assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
		assert!(head.contains("Connection: close\r\n"));
		assert_eq!(resp.file(), Some(&error_page[..]));
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_error_page_fallback_body() -> Result<(), Error> {
		let dir = test_root("fallback");

		// no error.html in the document root
		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/nope.html", false, 200);
		let mut buf = Buffer::default();
		resp.make_response(&mut buf);

		assert_eq!(resp.code(), 404);
		assert!(resp.file().is_none());
		let head = String::from_utf8_lossy(buf.peek()).into_owned();
		assert!(head.contains("File NotFound!"));
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_unknown_code_degrades_to_400() -> Result<(), Error> {
		let dir = test_root("degrade");
		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/x.html", false, 999);
		assert_eq!(resp.code(), 400);
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_directory_serves_index() -> Result<(), Error> {
		let dir = test_root("dir");
		fs::create_dir_all(dir.join("sub"))?;
		write_file(&dir, "sub/index.html", b"sub index");

		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/sub", false, 200);
		let mut buf = Buffer::default();
		resp.make_response(&mut buf);

		assert_eq!(resp.code(), 200);
		assert_eq!(resp.file(), Some(&b"sub index"[..]));
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_content_type_table() -> Result<(), Error> {
		let dir = test_root("ctype");
		write_file(&dir, "a.css", b"body {}");
		let mut resp = HttpResponse::new();
		resp.init(dir.to_str().unwrap(), "/a.css", false, 200);
		let mut buf = Buffer::default();
		resp.make_response(&mut buf);
		let head = String::from_utf8_lossy(buf.peek()).into_owned();
		assert!(head.contains("Content-type: text/css\r\n"));
		fs::remove_dir_all(&dir)?;
		Ok(())
	}
}
