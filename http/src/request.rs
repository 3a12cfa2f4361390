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
use std::collections::HashMap;

const CRLF: &[u8] = b"\r\n";

// routes that resolve by appending ".html"
const DEFAULT_HTML: &[&str] = &[
	"/index",
	"/register",
	"/login",
	"/welcome",
	"/video",
	"/picture",
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Method {
	Get,
	Post,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ParseState {
	RequestLine,
	Headers,
	Body,
	Finish,
}

/// Outcome of feeding bytes to the parser.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParseStatus {
	/// A terminator has not arrived yet; re-arm for read.
	Incomplete,
	/// A full request is buffered in the request state.
	Complete,
	/// Malformed request line or header; answer 400 and close.
	BadRequest,
}

/// An incrementally parsed HTTP/1.1 request. The parser consumes bytes from
/// the connection's read buffer as each terminator arrives and never
/// re-scans committed bytes; state survives across readiness events.
pub struct HttpRequest {
	state: ParseState,
	method: Method,
	path: String,
	version: String,
	headers: HashMap<String, String>,
	body: Vec<u8>,
	content_length: usize,
	post: HashMap<String, String>,
}

impl HttpRequest {
	pub fn new() -> Self {
		HttpRequest {
			state: ParseState::RequestLine,
			method: Method::Get,
			path: String::new(),
			version: String::new(),
			headers: HashMap::new(),
			body: vec![],
			content_length: 0,
			post: HashMap::new(),
		}
	}

	pub fn method(&self) -> Method {
		self.method
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn set_path(&mut self, path: &str) {
		self.path = path.to_string();
	}

	pub fn version(&self) -> &str {
		&self.version
	}

	/// Header lookup, case-sensitive as received.
	pub fn header(&self, key: &str) -> Option<&str> {
		self.headers.get(key).map(|v| v.as_str())
	}

	/// Value of a urlencoded form field from a POST body.
	pub fn post(&self, key: &str) -> Option<&str> {
		self.post.get(key).map(|v| v.as_str())
	}

	pub fn is_keep_alive(&self) -> bool {
		self.header("Connection") == Some("keep-alive") && self.version == "1.1"
	}

	/// Advance the state machine as far as the buffered bytes allow.
	pub fn parse(&mut self, buf: &mut Buffer) -> ParseStatus {
		loop {
			match self.state {
				ParseState::RequestLine => {
					let line = match take_line(buf) {
						Some(line) => line,
						None => return ParseStatus::Incomplete,
					};
					if !self.parse_request_line(&line) {
						return ParseStatus::BadRequest;
					}
					self.parse_path();
					self.state = ParseState::Headers;
				}
				ParseState::Headers => {
					let line = match take_line(buf) {
						Some(line) => line,
						None => return ParseStatus::Incomplete,
					};
					if line.is_empty() {
						self.content_length = self
							.header("Content-Length")
							.and_then(|v| v.parse().ok())
							.unwrap_or(0);
						self.state = if self.method == Method::Post && self.content_length > 0 {
							ParseState::Body
						} else {
							ParseState::Finish
						};
					} else if !self.parse_header(&line) {
						return ParseStatus::BadRequest;
					}
				}
				ParseState::Body => {
					let need = self.content_length - self.body.len();
					let take = need.min(buf.readable_bytes());
					self.body.extend_from_slice(&buf.peek()[..take]);
					buf.retrieve(take);
					if self.body.len() < self.content_length {
						return ParseStatus::Incomplete;
					}
					self.parse_form();
					self.state = ParseState::Finish;
				}
				ParseState::Finish => return ParseStatus::Complete,
			}
		}
	}

	fn parse_request_line(&mut self, line: &[u8]) -> bool {
		let line = match std::str::from_utf8(line) {
			Ok(line) => line,
			Err(_) => return false,
		};
		let mut parts = line.split(' ');
		let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
		{
			(Some(m), Some(p), Some(v), None) => (m, p, v),
			_ => return false,
		};
		self.method = match method {
			"GET" => Method::Get,
			"POST" => Method::Post,
			_ => return false,
		};
		if !path.starts_with('/') {
			return false;
		}
		self.path = path.to_string();
		self.version = match version.strip_prefix("HTTP/") {
			Some(v) => v.to_string(),
			None => return false,
		};
		true
	}

	fn parse_path(&mut self) {
		if self.path == "/" {
			self.path = "/index.html".to_string();
		} else if DEFAULT_HTML.contains(&self.path.as_str()) {
			self.path.push_str(".html");
		}
	}

	fn parse_header(&mut self, line: &[u8]) -> bool {
		let line = match std::str::from_utf8(line) {
			Ok(line) => line,
			Err(_) => return false,
		};
		let idx = match line.find(':') {
			Some(idx) => idx,
			None => return false,
		};
		let key = &line[..idx];
		let value = line[idx + 1..].strip_prefix(' ').unwrap_or(&line[idx + 1..]);
		self.headers.insert(key.to_string(), value.to_string());
		true
	}

	fn parse_form(&mut self) {
		if self.header("Content-Type") != Some("application/x-www-form-urlencoded") {
			return;
		}
		for pair in self.body.split(|&b| b == b'&') {
			let mut kv = pair.splitn(2, |&b| b == b'=');
			let key = kv.next().unwrap_or(&[]);
			let value = kv.next().unwrap_or(&[]);
			if !key.is_empty() {
				self.post.insert(url_decode(key), url_decode(value));
			}
		}
	}
}

impl Default for HttpRequest {
	fn default() -> Self {
		HttpRequest::new()
	}
}

// take one CRLF-terminated line off the buffer, terminator included
fn take_line(buf: &mut Buffer) -> Option<Vec<u8>> {
	let idx = buf.peek().windows(2).position(|w| w == CRLF)?;
	let line = buf.peek()[..idx].to_vec();
	buf.retrieve(idx + 2);
	Some(line)
}

// decode '+' and "%XX" escapes from a urlencoded field
fn url_decode(data: &[u8]) -> String {
	let mut out = Vec::with_capacity(data.len());
	let mut i = 0;
	while i < data.len() {
		match data[i] {
			b'+' => out.push(b' '),
			b'%' => match (hex_val(data.get(i + 1)), hex_val(data.get(i + 2))) {
				(Some(hi), Some(lo)) => {
					out.push(hi * 16 + lo);
					i += 2;
				}
				_ => out.push(b'%'),
			},
			b => out.push(b),
		}
		i += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
	match b {
		Some(b @ b'0'..=b'9') => Some(b - b'0'),
		Some(b @ b'a'..=b'f') => Some(b - b'a' + 10),
		Some(b @ b'A'..=b'F') => Some(b - b'A' + 10),
		_ => None,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use evhttpd_util::Error;

	fn feed(req: &mut HttpRequest, bytes: &[u8]) -> ParseStatus {
		let mut buf = Buffer::default();
		buf.append(bytes);
		req.parse(&mut buf)
	}

	#[test]
	fn test_parse_get() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		let status = feed(
			&mut req,
			b"GET /hello.txt HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
		);
		assert_eq!(status, ParseStatus::Complete);
		assert_eq!(req.method(), Method::Get);
		assert_eq!(req.path(), "/hello.txt");
		assert_eq!(req.version(), "1.1");
		assert_eq!(req.header("Host"), Some("x"));
		assert!(req.is_keep_alive());
		Ok(())
	}

	#[test]
	fn test_root_and_aliases() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		feed(&mut req, b"GET / HTTP/1.1\r\n\r\n");
		assert_eq!(req.path(), "/index.html");

		let mut req = HttpRequest::new();
		feed(&mut req, b"GET /login HTTP/1.1\r\n\r\n");
		assert_eq!(req.path(), "/login.html");
		Ok(())
	}

	#[test]
	fn test_unknown_method_is_bad_request() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		assert_eq!(
			feed(&mut req, b"NOPE / HTTP/1.1\r\n\r\n"),
			ParseStatus::BadRequest
		);
		Ok(())
	}

	#[test]
	fn test_malformed_header_is_bad_request() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		assert_eq!(
			feed(&mut req, b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
			ParseStatus::BadRequest
		);
		Ok(())
	}

	#[test]
	fn test_incremental_parse_keeps_state() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		let mut buf = Buffer::default();

		buf.append(b"GET /a.html HT");
		assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);
		buf.append(b"TP/1.1\r\nHos");
		assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);
		buf.append(b"t: x\r\n\r\n");
		assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
		assert_eq!(req.path(), "/a.html");
		assert_eq!(req.header("Host"), Some("x"));
		Ok(())
	}

	#[test]
	fn test_post_form() -> Result<(), Error> {
		let body = b"username=na%40me&password=p+wd";
		let mut req = HttpRequest::new();
		let mut buf = Buffer::default();
		buf.append(
			format!(
				"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
				body.len()
			)
			.as_bytes(),
		);
		assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);

		// body split across two reads
		buf.append(&body[..10]);
		assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);
		buf.append(&body[10..]);
		assert_eq!(req.parse(&mut buf), ParseStatus::Complete);

		assert_eq!(req.post("username"), Some("na@me"));
		assert_eq!(req.post("password"), Some("p wd"));
		Ok(())
	}

	#[test]
	fn test_keep_alive_rules() -> Result<(), Error> {
		let mut req = HttpRequest::new();
		feed(&mut req, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
		assert!(!req.is_keep_alive());

		let mut req = HttpRequest::new();
		feed(&mut req, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
		assert!(!req.is_keep_alive());
		Ok(())
	}
}
