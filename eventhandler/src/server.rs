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

use crate::reactor::Reactor;
use evhttpd_http::HttpConn;
use evhttpd_log::{log_debug, log_error, log_info, log_warn, Log};
use evhttpd_pool::SqlPool;
use evhttpd_timer::HeapTimer;
use evhttpd_util::{lockp, Error, ErrorKind, ThreadPool};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::EpollFlags;
use nix::sys::socket::{
	accept, bind, getpeername, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr,
	SockAddr, SockFlag, SockType,
};
use nix::unistd::{close, pipe, read, write};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

const MAX_FD: usize = 65536;
const LISTEN_BACKLOG: usize = 6;
const BUSY_RESPONSE: &[u8] = b"Server busy!";

/// Startup parameters of the acceptor/event loop.
#[derive(Clone, Debug)]
pub struct ServerConfig {
	/// Address to bind, e.g. "0.0.0.0".
	pub host: String,
	/// Port to bind, in [1024, 65535].
	pub port: u16,
	/// 0: both level-triggered, 1: connections edge-triggered,
	/// 2: listener edge-triggered, 3: both edge-triggered.
	pub trig_mode: u8,
	/// Idle eviction timeout per connection; 0 disables the timer.
	pub timeout_ms: u64,
	/// Lingering close on the listener.
	pub open_linger: bool,
	/// Document root.
	pub src_dir: String,
	/// Worker pool size.
	pub threads: usize,
}

// completion reports flowing back to the loop thread; workers and timer
// callbacks are the producers
enum Action {
	ModRead(RawFd),
	ModWrite(RawFd),
	Close(RawFd),
	Shutdown,
}

struct PendingState {
	actions: Vec<Action>,
	wakeup_scheduled: bool,
}

struct ServerShared {
	state: Mutex<PendingState>,
	wakeup_tx: RawFd,
}

impl ServerShared {
	fn push(&self, action: Action) {
		let need_wake = {
			let mut state = lockp!(self.state);
			state.actions.push(action);
			if state.wakeup_scheduled {
				false
			} else {
				state.wakeup_scheduled = true;
				true
			}
		};
		if need_wake {
			let _ = write(self.wakeup_tx, &[1u8]);
		}
	}

	fn take_actions(&self) -> Vec<Action> {
		let mut state = lockp!(self.state);
		state.wakeup_scheduled = false;
		std::mem::take(&mut state.actions)
	}
}

/// Cloneable handle used to stop a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
	shared: Arc<ServerShared>,
}

impl ServerHandle {
	pub fn stop(&self) {
		self.shared.push(Action::Shutdown);
	}
}

/// The acceptor/event loop. One thread owns the reactor, the timer and the
/// connection table; request I/O runs on the worker pool. A worker never
/// touches the reactor: it reports back through the shared action list and
/// the wakeup pipe, and the loop thread re-arms the fd. Together with
/// one-shot interest this keeps at most one worker per connection.
pub struct Server {
	config: ServerConfig,
	listen_fd: RawFd,
	listen_event: EpollFlags,
	conn_event: EpollFlags,
	reactor: Reactor,
	timer: HeapTimer,
	pool: ThreadPool,
	users: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
	shared: Arc<ServerShared>,
	wakeup_rx: RawFd,
	db: Option<Arc<SqlPool>>,
	log: Arc<Log>,
	is_close: bool,
}

impl Server {
	pub fn new(
		config: ServerConfig,
		db: Option<Arc<SqlPool>>,
		log: Arc<Log>,
	) -> Result<Server, Error> {
		if config.port < 1024 {
			return Err(ErrorKind::SetupError(format!("port {} out of range", config.port)).into());
		}

		let (listen_event, conn_event) = Self::event_mode(config.trig_mode);

		let listen_fd = Self::init_socket(&config)?;
		let reactor = Reactor::new()?;
		reactor.add_fd(listen_fd, EpollFlags::EPOLLIN | listen_event)?;
		Self::set_nonblocking(listen_fd)?;

		let (wakeup_rx, wakeup_tx) = pipe()?;
		Self::set_nonblocking(wakeup_rx)?;
		Self::set_nonblocking(wakeup_tx)?;
		reactor.add_fd(wakeup_rx, EpollFlags::EPOLLIN)?;

		let pool = ThreadPool::new(config.threads)?;
		let panic_log = log.clone();
		pool.set_on_panic(Box::new(move |msg| {
			log_error!(panic_log, "worker task panicked: {}", msg);
		}));

		let shared = Arc::new(ServerShared {
			state: Mutex::new(PendingState {
				actions: vec![],
				wakeup_scheduled: false,
			}),
			wakeup_tx,
		});

		log_info!(log, "========== server init ==========");
		log_info!(
			log,
			"port: {}, linger: {}, listen mode: {}, conn mode: {}",
			config.port,
			config.open_linger,
			if listen_event.contains(EpollFlags::EPOLLET) { "ET" } else { "LT" },
			if conn_event.contains(EpollFlags::EPOLLET) { "ET" } else { "LT" },
		);
		log_info!(
			log,
			"src dir: {}, thread pool: {}, sql pool: {}",
			config.src_dir,
			config.threads,
			db.as_ref().map(|p| p.capacity()).unwrap_or(0),
		);

		Ok(Server {
			config,
			listen_fd,
			listen_event,
			conn_event,
			reactor,
			timer: HeapTimer::new(),
			pool,
			users: HashMap::new(),
			shared,
			wakeup_rx,
			db,
			log,
			is_close: false,
		})
	}

	/// A handle that can stop the loop from another thread.
	pub fn handle(&self) -> ServerHandle {
		ServerHandle {
			shared: self.shared.clone(),
		}
	}

	fn event_mode(trig_mode: u8) -> (EpollFlags, EpollFlags) {
		let mut listen_event = EpollFlags::EPOLLRDHUP;
		let mut conn_event = EpollFlags::EPOLLONESHOT | EpollFlags::EPOLLRDHUP;
		match trig_mode {
			0 => {}
			1 => conn_event |= EpollFlags::EPOLLET,
			2 => listen_event |= EpollFlags::EPOLLET,
			_ => {
				listen_event |= EpollFlags::EPOLLET;
				conn_event |= EpollFlags::EPOLLET;
			}
		}
		(listen_event, conn_event)
	}

	fn init_socket(config: &ServerConfig) -> Result<RawFd, Error> {
		let addr: SocketAddr = format!("{}:{}", config.host, config.port)
			.parse()
			.map_err(|e| {
				let error: Error =
					ErrorKind::SetupError(format!("bad bind address: {}", e)).into();
				error
			})?;

		let fd = socket(
			AddressFamily::Inet,
			SockType::Stream,
			SockFlag::empty(),
			None,
		)?;
		let res = (|| -> Result<(), Error> {
			setsockopt(fd, sockopt::ReuseAddr, &true)?;
			if config.open_linger {
				// graceful close: wait up to a second for unsent data
				let linger = libc::linger {
					l_onoff: 1,
					l_linger: 1,
				};
				setsockopt(fd, sockopt::Linger, &linger)?;
			}
			bind(fd, &SockAddr::new_inet(InetAddr::from_std(&addr)))?;
			listen(fd, LISTEN_BACKLOG)?;
			Ok(())
		})();
		if let Err(e) = res {
			let _ = close(fd);
			return Err(e);
		}
		Ok(fd)
	}

	fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
		fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
		Ok(())
	}

	/// Run the event loop until a shutdown action arrives.
	pub fn start(&mut self) -> Result<(), Error> {
		log_info!(self.log, "========== server start ==========");
		while !self.is_close {
			self.drain_pending();
			if self.is_close {
				break;
			}
			let timeout = if self.config.timeout_ms > 0 {
				let next = self.timer.get_next_tick();
				// expired timers may have queued close actions just now
				self.drain_pending();
				next as isize
			} else {
				-1
			};
			let n = match self.reactor.wait(timeout) {
				Ok(n) => n,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(e.into()),
			};

			let mut ready = Vec::with_capacity(n);
			for i in 0..n {
				ready.push((self.reactor.event_fd(i)?, self.reactor.events(i)?));
			}
			for (fd, events) in ready {
				if fd == self.listen_fd {
					self.deal_listen();
				} else if fd == self.wakeup_rx {
					self.drain_wakeup();
					self.drain_pending();
				} else if events
					.intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
				{
					self.close_conn(fd);
				} else if events.contains(EpollFlags::EPOLLIN) {
					self.deal_read(fd);
				} else if events.contains(EpollFlags::EPOLLOUT) {
					self.deal_write(fd);
				} else {
					log_error!(self.log, "unexpected event on fd {}: {:?}", fd, events);
				}
			}
		}
		log_info!(self.log, "========== server quit ==========");
		Ok(())
	}

	fn drain_pending(&mut self) {
		for action in self.shared.take_actions() {
			match action {
				Action::ModRead(fd) => {
					if self.users.contains_key(&fd) {
						let interest = EpollFlags::EPOLLIN | self.conn_event;
						if let Err(e) = self.reactor.mod_fd(fd, interest) {
							log_error!(self.log, "mod_fd read error on {}: {}", fd, e);
							self.close_conn(fd);
						}
					}
				}
				Action::ModWrite(fd) => {
					if self.users.contains_key(&fd) {
						let interest = EpollFlags::EPOLLOUT | self.conn_event;
						if let Err(e) = self.reactor.mod_fd(fd, interest) {
							log_error!(self.log, "mod_fd write error on {}: {}", fd, e);
							self.close_conn(fd);
						}
					}
				}
				Action::Close(fd) => self.close_conn(fd),
				Action::Shutdown => self.is_close = true,
			}
		}
	}

	fn drain_wakeup(&self) {
		let mut buf = [0u8; 64];
		while let Ok(len) = read(self.wakeup_rx, &mut buf) {
			if len < buf.len() {
				break;
			}
		}
	}

	fn deal_listen(&mut self) {
		loop {
			let fd = match accept(self.listen_fd) {
				Ok(fd) => fd,
				Err(Errno::EAGAIN) => break,
				Err(Errno::EINTR) => continue,
				Err(e) => {
					log_error!(self.log, "accept error: {}", e);
					break;
				}
			};
			if self.users.len() >= MAX_FD {
				let _ = write(fd, BUSY_RESPONSE);
				let _ = close(fd);
				log_warn!(self.log, "clients are full");
			} else {
				self.add_client(fd);
			}
			if !self.listen_event.contains(EpollFlags::EPOLLET) {
				break;
			}
		}
	}

	fn add_client(&mut self, fd: RawFd) {
		let peer = match getpeername(fd) {
			Ok(addr) => addr.to_string(),
			Err(_) => "unknown".to_string(),
		};
		let is_et = self.conn_event.contains(EpollFlags::EPOLLET);
		let conn = Arc::new(Mutex::new(HttpConn::new(
			fd,
			peer.clone(),
			self.config.src_dir.clone(),
			is_et,
		)));
		self.users.insert(fd, conn);

		if self.config.timeout_ms > 0 {
			let shared = self.shared.clone();
			self.timer.add(
				fd,
				self.config.timeout_ms,
				Box::new(move || shared.push(Action::Close(fd))),
			);
		}
		if let Err(e) = Self::set_nonblocking(fd) {
			log_error!(self.log, "set nonblocking error on {}: {}", fd, e);
			self.close_conn(fd);
			return;
		}
		if let Err(e) = self
			.reactor
			.add_fd(fd, EpollFlags::EPOLLIN | self.conn_event)
		{
			log_error!(self.log, "add_fd error on {}: {}", fd, e);
			self.close_conn(fd);
			return;
		}
		log_info!(
			self.log,
			"client[{}]({}) in, user count: {}",
			fd,
			peer,
			self.users.len()
		);
	}

	fn extend_time(&mut self, fd: RawFd) {
		if self.config.timeout_ms > 0 {
			self.timer.adjust(fd, self.config.timeout_ms);
		}
	}

	fn deal_read(&mut self, fd: RawFd) {
		let conn = match self.users.get(&fd) {
			Some(conn) => conn.clone(),
			None => return,
		};
		self.extend_time(fd);
		let shared = self.shared.clone();
		let db = self.db.clone();
		let log = self.log.clone();
		let res = self.pool.execute(move || {
			let mut conn = lockp!(conn);
			match conn.read() {
				Ok((_, true)) => shared.push(Action::Close(fd)),
				Ok(_) => {
					if conn.process(db.as_deref(), &log) {
						shared.push(Action::ModWrite(fd));
					} else {
						shared.push(Action::ModRead(fd));
					}
				}
				Err(e) => {
					log_debug!(log, "read error on {}: {}", fd, e);
					shared.push(Action::Close(fd));
				}
			}
		});
		if let Err(e) = res {
			log_error!(self.log, "submit read task error: {}", e);
			self.close_conn(fd);
		}
	}

	fn deal_write(&mut self, fd: RawFd) {
		let conn = match self.users.get(&fd) {
			Some(conn) => conn.clone(),
			None => return,
		};
		self.extend_time(fd);
		let shared = self.shared.clone();
		let db = self.db.clone();
		let log = self.log.clone();
		let res = self.pool.execute(move || {
			let mut conn = lockp!(conn);
			match conn.write() {
				Ok(_) => {
					if conn.to_write_bytes() == 0 {
						if conn.is_keep_alive() {
							// next request on the same connection
							conn.reset();
							if conn.process(db.as_deref(), &log) {
								shared.push(Action::ModWrite(fd));
							} else {
								shared.push(Action::ModRead(fd));
							}
						} else {
							shared.push(Action::Close(fd));
						}
					} else {
						shared.push(Action::ModWrite(fd));
					}
				}
				Err(Errno::EAGAIN) => shared.push(Action::ModWrite(fd)),
				Err(e) => {
					log_debug!(log, "write error on {}: {}", fd, e);
					shared.push(Action::Close(fd));
				}
			}
		});
		if let Err(e) = res {
			log_error!(self.log, "submit write task error: {}", e);
			self.close_conn(fd);
		}
	}

	fn close_conn(&mut self, fd: RawFd) {
		if let Some(conn) = self.users.remove(&fd) {
			// cancel first so a stale timeout can never fire for this fd
			if self.config.timeout_ms > 0 {
				self.timer.cancel(fd);
			}
			let _ = self.reactor.del_fd(fd);
			let mut conn = lockp!(conn);
			log_info!(
				self.log,
				"client[{}]({}) quit, user count: {}",
				fd,
				conn.peer(),
				self.users.len()
			);
			conn.close();
		}
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		let _ = close(self.listen_fd);
		let _ = close(self.wakeup_rx);
		let _ = close(self.shared.wakeup_tx);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::fs;
	use std::io::{Read, Write};
	use std::net::TcpStream;
	use std::path::PathBuf;
	use std::thread;
	use std::time::Duration;

	const INDEX: &[u8] = b"<html><body>test index</body></html>";
	const ERROR_PAGE: &[u8] = b"<html><body>test error</body></html>";

	fn test_root(name: &str) -> PathBuf {
		let mut dir = PathBuf::from(std::env::temp_dir());
		dir.push(format!("evhttpd_srv_{}_{}", name, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).expect("mkdir");
		fs::write(dir.join("index.html"), INDEX).expect("write");
		fs::write(dir.join("error.html"), ERROR_PAGE).expect("write");
		fs::write(dir.join("welcome.html"), b"welcome").expect("write");
		dir
	}

	fn start_server(
		name: &str,
		port: u16,
		trig_mode: u8,
		timeout_ms: u64,
	) -> Result<
		(
			ServerHandle,
			thread::JoinHandle<Result<(), Error>>,
			PathBuf,
		),
		Error,
	> {
		let dir = test_root(name);
		let config = ServerConfig {
			host: "127.0.0.1".to_string(),
			port,
			trig_mode,
			timeout_ms,
			open_linger: false,
			src_dir: dir.to_str().unwrap().to_string(),
			threads: 4,
		};
		let mut server = Server::new(config, None, Log::disabled())?;
		let handle = server.handle();
		let jh = thread::spawn(move || server.start());
		thread::sleep(Duration::from_millis(200));
		Ok((handle, jh, dir))
	}

	fn connect(port: u16) -> Result<TcpStream, Error> {
		let stream = TcpStream::connect(("127.0.0.1", port))?;
		stream.set_read_timeout(Some(Duration::from_secs(5)))?;
		Ok(stream)
	}

	fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>), Error> {
		let mut data = vec![];
		let mut buf = [0u8; 4096];
		let head_end;
		loop {
			let len = stream.read(&mut buf)?;
			if len == 0 {
				return Err(
					ErrorKind::ConnectionCloseError("eof before response head".to_string()).into(),
				);
			}
			data.extend_from_slice(&buf[..len]);
			match data.windows(4).position(|w| w == b"\r\n\r\n") {
				Some(pos) => {
					head_end = pos + 4;
					break;
				}
				None => continue,
			}
		}
		let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
		let content_length: usize = head
			.lines()
			.find_map(|line| line.strip_prefix("Content-length: "))
			.map(|v| v.trim().parse().unwrap())
			.unwrap_or(0);
		let mut body = data[head_end..].to_vec();
		while body.len() < content_length {
			let len = stream.read(&mut buf)?;
			if len == 0 {
				break;
			}
			body.extend_from_slice(&buf[..len]);
		}
		Ok((head, body))
	}

	#[test]
	fn test_get_index_keep_alive() -> Result<(), Error> {
		let (handle, jh, dir) = start_server("keepalive", 19831, 3, 60_000)?;

		let mut stream = connect(19831)?;
		stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")?;
		let (head, body) = read_response(&mut stream)?;
		let expect = format!(
			"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nkeep-alive: max=6 timeout=120\r\nContent-type: text/html\r\nContent-length: {}\r\n\r\n",
			INDEX.len()
		);
		assert_eq!(head, expect);
		assert_eq!(body, INDEX);

		// the connection stays usable for a second exchange
		stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")?;
		let (head, body) = read_response(&mut stream)?;
		assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
		assert_eq!(body, INDEX);

		handle.stop();
		jh.join().expect("server thread panicked")?;
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_missing_file_is_404_and_closes() -> Result<(), Error> {
		let (handle, jh, dir) = start_server("missing", 19832, 3, 60_000)?;

		let mut stream = connect(19832)?;
		stream.write_all(b"GET /nope.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")?;
		let (head, body) = read_response(&mut stream)?;
		assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
		assert!(head.contains("Connection: close\r\n"));
		assert_eq!(body, ERROR_PAGE);

		// the server closes its end after the response
		let mut buf = [0u8; 16];
		assert_eq!(stream.read(&mut buf)?, 0);

		handle.stop();
		jh.join().expect("server thread panicked")?;
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_malformed_request_is_400_and_closes() -> Result<(), Error> {
		let (handle, jh, dir) = start_server("malformed", 19833, 3, 60_000)?;

		let mut stream = connect(19833)?;
		stream.write_all(b"NOPE / HTTP/1.1\r\n\r\n")?;
		let (head, _body) = read_response(&mut stream)?;
		assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
		assert!(head.contains("Connection: close\r\n"));

		let mut buf = [0u8; 16];
		assert_eq!(stream.read(&mut buf)?, 0);

		handle.stop();
		jh.join().expect("server thread panicked")?;
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_idle_connection_is_evicted() -> Result<(), Error> {
		let (handle, jh, dir) = start_server("evict", 19834, 3, 300)?;

		let mut stream = connect(19834)?;
		// say nothing; the timer must close the connection
		thread::sleep(Duration::from_millis(800));
		let mut buf = [0u8; 16];
		assert_eq!(stream.read(&mut buf)?, 0);

		handle.stop();
		jh.join().expect("server thread panicked")?;
		fs::remove_dir_all(&dir)?;
		Ok(())
	}

	#[test]
	fn test_level_triggered_mode() -> Result<(), Error> {
		let (handle, jh, dir) = start_server("lt", 19835, 0, 60_000)?;

		let mut stream = connect(19835)?;
		stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")?;
		let (head, body) = read_response(&mut stream)?;
		assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
		assert_eq!(body, INDEX);

		handle.stop();
		jh.join().expect("server thread panicked")?;
		fs::remove_dir_all(&dir)?;
		Ok(())
	}
}
