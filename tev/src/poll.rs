//! Thin wrapper around an epoll instance.
//!
//! Entries are keyed by a caller-chosen `u64` carried in `data.u64`; the
//! dispatcher stores the event id there and reserves one key for its timer
//! fd. Waiting goes through `epoll_pwait` so a signal mask can be applied
//! atomically for the duration of the wait.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use log::debug;

/// Readiness kinds, used both to register interest and to report what
/// actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
  bits: u32,
}

impl Interest {
  /// Registered but silenced; an armed timeout stays active.
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  pub const HANGUP: Self = Self { bits: 1 << 2 };
  pub const ERROR: Self = Self { bits: 1 << 3 };
  pub const PRIORITY: Self = Self { bits: 1 << 4 };

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn is_hangup(self) -> bool {
    self.bits & Self::HANGUP.bits != 0
  }

  pub const fn is_error(self) -> bool {
    self.bits & Self::ERROR.bits != 0
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }

  pub(crate) fn to_epoll(self) -> u32 {
    let mut events = 0u32;
    if self.is_readable() {
      events |= libc::EPOLLIN as u32;
    }
    if self.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }
    if self.is_hangup() {
      events |= libc::EPOLLHUP as u32;
    }
    if self.is_error() {
      events |= libc::EPOLLERR as u32;
    }
    if self.bits & Self::PRIORITY.bits != 0 {
      events |= libc::EPOLLPRI as u32;
    }
    events
  }

  pub(crate) fn from_epoll(events: u32) -> Self {
    let mut interest = Self::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
      interest |= Self::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
      interest |= Self::WRITE;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
      interest |= Self::HANGUP;
    }
    if events & libc::EPOLLERR as u32 != 0 {
      interest |= Self::ERROR;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
      interest |= Self::PRIORITY;
    }
    interest
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl std::ops::BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}

pub(crate) struct Poller {
  epoll_fd: OwnedFd,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    let epoll_fd = {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      unsafe { OwnedFd::from_raw_fd(fd) }
    };
    debug!("created epoll fd {}", epoll_fd.as_raw_fd());
    Ok(Self { epoll_fd })
  }

  pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    let mut event =
      libc::epoll_event { events: interest.to_epoll(), u64: key };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(())
  }

  pub fn modify(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut event =
      libc::epoll_event { events: interest.to_epoll(), u64: key };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_MOD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(())
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    // Event pointer may be NULL for EPOLL_CTL_DEL since Linux 2.6.9.
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    ))?;
    Ok(())
  }

  /// Block until at least one registered entry is ready, with `sigmask`
  /// applied for the duration of the wait. Returns the number of entries
  /// written into `events`.
  pub fn wait(
    &self,
    events: &mut [libc::epoll_event],
    sigmask: Option<&libc::sigset_t>,
  ) -> io::Result<usize> {
    let n = syscall!(epoll_pwait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      -1,
      sigmask.map(|m| m as *const libc::sigset_t).unwrap_or(ptr::null()),
    ))?;

    Ok(n as usize)
  }
}

impl AsRawFd for Poller {
  fn as_raw_fd(&self) -> RawFd {
    self.epoll_fd.as_raw_fd()
  }
}
