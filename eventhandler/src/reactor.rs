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

use evhttpd_util::{Error, ErrorKind};
use nix::sys::epoll::{
	epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;
use std::os::unix::io::RawFd;

const MAX_EVENTS: usize = 1024;

/// Thin wrapper around an epoll instance. Interest is an [`EpollFlags`]
/// mask; the fd is carried in the event payload. `wait` fills an internal
/// array of up to 1024 events which are then read back by index.
pub struct Reactor {
	epfd: RawFd,
	events: Vec<EpollEvent>,
}

impl Reactor {
	pub fn new() -> Result<Self, Error> {
		let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
		Ok(Reactor {
			epfd,
			events: vec![EpollEvent::empty(); MAX_EVENTS],
		})
	}

	pub fn add_fd(&self, fd: RawFd, interest: EpollFlags) -> Result<(), Error> {
		let mut event = EpollEvent::new(interest, fd as u64);
		epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)?;
		Ok(())
	}

	pub fn mod_fd(&self, fd: RawFd, interest: EpollFlags) -> Result<(), Error> {
		let mut event = EpollEvent::new(interest, fd as u64);
		epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)?;
		Ok(())
	}

	pub fn del_fd(&self, fd: RawFd) -> Result<(), Error> {
		epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)?;
		Ok(())
	}

	/// Block for up to `timeout_ms` milliseconds (-1 blocks indefinitely).
	/// Returns the number of ready events.
	pub fn wait(&mut self, timeout_ms: isize) -> nix::Result<usize> {
		epoll_wait(self.epfd, &mut self.events, timeout_ms)
	}

	pub fn event_fd(&self, i: usize) -> Result<RawFd, Error> {
		if i >= self.events.len() {
			return Err(ErrorKind::ArrayIndexOutofBounds(format!(
				"event index {} out of bounds",
				i
			))
			.into());
		}
		Ok(self.events[i].data() as RawFd)
	}

	pub fn events(&self, i: usize) -> Result<EpollFlags, Error> {
		if i >= self.events.len() {
			return Err(ErrorKind::ArrayIndexOutofBounds(format!(
				"event index {} out of bounds",
				i
			))
			.into());
		}
		Ok(self.events[i].events())
	}
}

impl Drop for Reactor {
	fn drop(&mut self) {
		let _ = close(self.epfd);
	}
}
