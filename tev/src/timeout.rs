//! The timeout engine: an ordered list of pending expiries backed by a
//! single timerfd.
//!
//! The list holds `(absolute expiry, event id)` pairs sorted ascending; the
//! timerfd is always armed to the front entry (or disarmed when the list is
//! empty). Relative timeouts are converted to absolute once, on insertion,
//! against the clock the queue was created with. The queue never owns event
//! records; entries are identified by event id.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use log::{debug, error};

use crate::event::{Event, EventFlags, EventId};
use crate::os_err;
use crate::time::{self, TimeSpec};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
  pub at: TimeSpec,
  pub id: EventId,
}

pub(crate) struct TimeoutQueue {
  source: libc::clockid_t,
  timer: OwnedFd,
  entries: Vec<Deadline>,
  /// Expiry the timerfd is currently programmed with; zero when disarmed.
  /// Lets [`TimeoutQueue::rearm`] skip redundant `timerfd_settime` calls.
  armed: TimeSpec,
}

impl TimeoutQueue {
  pub fn new(source: libc::clockid_t) -> io::Result<Self> {
    let timer = {
      let fd =
        syscall!(timerfd_create(source, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC))?;
      unsafe { OwnedFd::from_raw_fd(fd) }
    };
    debug!("created timerfd {} on clock {source}", timer.as_raw_fd());
    Ok(Self { source, timer, entries: Vec::new(), armed: TimeSpec::ZERO })
  }

  pub fn timer_fd(&self) -> RawFd {
    self.timer.as_raw_fd()
  }

  pub fn clock_source(&self) -> libc::clockid_t {
    self.source
  }

  pub fn now(&self) -> io::Result<TimeSpec> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    syscall!(clock_gettime(self.source, &mut ts))?;
    Ok(TimeSpec::from_raw(ts))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn head(&self) -> Option<TimeSpec> {
    self.entries.first().map(|d| d.at)
  }

  pub fn contains(&self, id: EventId) -> bool {
    self.entries.iter().any(|d| d.id == id)
  }

  /// Program the timerfd to the front entry, or disarm it when the list is
  /// empty. Elided entirely when the expiry did not change.
  pub fn rearm(&mut self) -> io::Result<()> {
    let value = self.head().unwrap_or(TimeSpec::ZERO);
    if value == self.armed {
      return Ok(());
    }

    debug!("arming timer: {} pending, expire {value}", self.entries.len());
    let new_val = libc::itimerspec {
      it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
      it_value: value.into_raw(),
    };
    if let Err(err) = syscall!(timerfd_settime(
      self.timer.as_raw_fd(),
      libc::TFD_TIMER_ABSTIME,
      &new_val,
      ptr::null_mut(),
    )) {
      error!("timerfd_settime: {err}");
      return Err(err);
    }
    self.armed = value;
    Ok(())
  }

  /// Queue `ev`'s timeout. A zero timeout is a no-op. Converts a relative
  /// timeout to absolute in place and re-arms the timerfd if the new entry
  /// became the earliest.
  pub fn add(&mut self, id: EventId, ev: &mut Event) -> io::Result<()> {
    if ev.timeout.is_zero() {
      return Ok(());
    }
    if self.contains(id) {
      debug!("event {id} exists already ({} pending)", self.entries.len());
      return Err(os_err(libc::EEXIST));
    }

    if !ev.flags.contains(EventFlags::ABSOLUTE) {
      ev.timeout += self.now()?;
    }

    let mut at = ev.timeout;
    let pos = time::search_by(&self.entries, |d| d.at, &mut at);
    ev.timeout = at;
    self.entries.insert(pos, Deadline { at, id });
    debug!("new timeout at pos {pos}/{}: {at}", self.entries.len());

    if pos == 0 {
      let _ = self.rearm();
    }
    Ok(())
  }

  /// Drop `ev`'s pending timeout and zero its timeout field. Returns
  /// `ENOENT` when the entry is not queued, which is normal when called
  /// after the timeout already expired and was dequeued.
  pub fn cancel(&mut self, id: EventId, ev: &mut Event) -> io::Result<()> {
    if ev.timeout.is_zero() {
      return Ok(());
    }

    let Some(pos) = self.entries.iter().position(|d| d.id == id) else {
      debug!("{id}: not found");
      ev.timeout = TimeSpec::ZERO;
      return Err(os_err(libc::ENOENT));
    };

    debug!("timeout {pos} cancelled, {}", ev.timeout);
    ev.timeout = TimeSpec::ZERO;
    self.entries.remove(pos);
    if pos == 0 {
      let _ = self.rearm();
    }
    Ok(())
  }

  /// Move `ev`'s pending timeout to `new` (relative unless the event's
  /// absolute flag is set). Falls back to [`TimeoutQueue::add`] when the
  /// event has no queued entry, which is normal from a timeout callback.
  pub fn modify(
    &mut self,
    id: EventId,
    ev: &mut Event,
    new: TimeSpec,
  ) -> io::Result<()> {
    if ev.timeout.is_zero() || self.entries.is_empty() {
      ev.timeout = new;
      return self.add(id, ev);
    }

    if new.is_zero() {
      return self.cancel(id, ev);
    }

    if new == ev.timeout {
      return Ok(());
    }

    // Several entries may share an expiry: bisect to the first match on
    // value, then scan forward for the identity.
    let mut cur = ev.timeout;
    let pmin = time::search_by(&self.entries, |d| d.at, &mut cur);
    let mut pos = pmin;
    while pos < self.entries.len() && self.entries[pos].at == ev.timeout {
      if self.entries[pos].id == id {
        break;
      }
      pos += 1;
    }
    if pos == self.entries.len() || self.entries[pos].id != id {
      debug!("{id}: not found");
      ev.timeout = new;
      return self.add(id, ev);
    }

    let mut at = new;
    if !ev.flags.contains(EventFlags::ABSOLUTE) {
      at += self.now()?;
    }
    let mut pnew = time::search_by(&self.entries, |d| d.at, &mut at);

    if pnew > pos + 1 {
      // pnew is the index the new expiry would be inserted at; everything
      // from there on is >= it. The entry at pos moves away, so the slot
      // it lands in is one lower.
      pnew -= 1;
      self.entries[pos..=pnew].rotate_left(1);
      self.entries[pnew] = Deadline { at, id };
    } else if pnew < pos {
      self.entries[pnew..=pos].rotate_right(1);
      self.entries[pnew] = Deadline { at, id };
    } else {
      self.entries[pos].at = at;
    }
    debug!("timeout {pos} now at pos {pnew}, {} -> {at}", ev.timeout);
    ev.timeout = at;

    if pnew == 0 {
      let _ = self.rearm();
    }
    Ok(())
  }

  /// Detach the prefix of entries with `expiry <= now` into a fresh buffer
  /// and shrink the list. Detaching before invoking is mandatory: callbacks
  /// may mutate the list.
  pub fn take_expired(&mut self, now: TimeSpec) -> Vec<EventId> {
    let mut pos = 0;
    while pos < self.entries.len() && self.entries[pos].at <= now {
      pos += 1;
    }
    self.entries.drain(..pos).map(|d| d.id).collect()
  }

  /// Read and discard the timerfd expiration counter. `EAGAIN` is normal:
  /// the most recent timer may have been cancelled and re-armed before we
  /// got here.
  pub fn drain_fd(&self) {
    let mut val = 0u64;
    if let Err(err) = syscall!(read(
      self.timer.as_raw_fd(),
      &mut val as *mut u64 as *mut libc::c_void,
      std::mem::size_of::<u64>(),
    )) {
      if err.raw_os_error() == Some(libc::EAGAIN) {
        debug!("failed to read timerfd: {err}");
      } else {
        error!("failed to read timerfd: {err}");
      }
    }
  }

  /// Drop all entries and disarm the timerfd.
  pub fn reset(&mut self) -> io::Result<()> {
    self.entries.clear();
    self.rearm()
  }

  #[cfg(test)]
  fn check_sorted(&self) {
    assert!(
      self.entries.windows(2).all(|w| w[0].at <= w[1].at),
      "timeout list out of order"
    );
  }
}
