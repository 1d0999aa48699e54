//! The event record: a file descriptor, an interest mask, a timeout, a
//! callback, and an optional cleanup, joined into the unit the dispatcher
//! registers and drives.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::dispatcher::Dispatcher;
use crate::poll::Interest;
use crate::time::TimeSpec;

/// Opaque identity of a registered event, assigned by
/// [`Dispatcher::event_add`]. Ids are never reused within a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) u64);

impl fmt::Display for EventId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Why a callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
  /// One of the readiness kinds the event asked for occurred.
  ///
  /// Races between readiness and timeout expiry cannot be fully avoided:
  /// even when invoked with [`Reason::Timeout`], a callback should treat
  /// the fd as possibly ready and handle the data as if it had arrived
  /// before the timeout.
  Event,
  /// The event's timeout expired. If the event is to be monitored further,
  /// the timeout *must* be re-armed with
  /// [`Dispatcher::event_mod_timeout`]; otherwise it implicitly becomes
  /// infinite.
  Timeout,
}

impl fmt::Display for Reason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Reason::Event => "event occurred",
      Reason::Timeout => "timeout",
    })
  }
}

/// What the dispatcher should do with the event after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  /// Keep the registration.
  Continue,
  /// Unlink the event after this wake-up's callback batch completes.
  Remove,
  /// Like [`Action::Remove`], but also run the cleanup callback.
  Cleanup,
}

/// A timeout request. `In` counts from "now" on the dispatcher's clock;
/// `At` is an absolute time on that clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
  Off,
  In(TimeSpec),
  At(TimeSpec),
}

/// What a callback is told about its wake-up.
#[derive(Debug, Clone, Copy)]
pub struct Wakeup {
  pub id: EventId,
  pub reason: Reason,
  /// Observed readiness bits; [`Interest::NONE`] for timeouts.
  pub ready: Interest,
}

pub(crate) type Callback = Box<dyn FnMut(&mut Dispatcher, Wakeup) -> Action>;
pub(crate) type CleanupFn = Box<dyn FnOnce(Event)>;

/// The file descriptor an event monitors.
///
/// `Owned` descriptors close when the event is dropped (after cleanup);
/// `Borrowed` descriptors are left to the caller. `None` makes a pure timer.
#[derive(Debug)]
pub enum Fd {
  None,
  Borrowed(RawFd),
  Owned(OwnedFd),
}

impl Fd {
  pub fn raw(&self) -> Option<RawFd> {
    match self {
      Fd::None => None,
      Fd::Borrowed(fd) => Some(*fd),
      Fd::Owned(fd) => Some(fd.as_raw_fd()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EventFlags {
  bits: u16,
}

impl EventFlags {
  /// The timeout is an absolute time, not a duration from now.
  pub const ABSOLUTE: Self = Self { bits: 1 };
  /// Callback asked for removal; honored by the post-wake-up sweep.
  pub const REMOVE_PENDING: Self = Self { bits: 1 << 14 };
  /// Callback asked for removal plus cleanup.
  pub const CLEANUP_PENDING: Self = Self { bits: 1 << 15 };

  pub const fn contains(self, other: Self) -> bool {
    self.bits & other.bits == other.bits
  }

  pub fn insert(&mut self, other: Self) {
    self.bits |= other.bits;
  }

  pub fn remove(&mut self, other: Self) {
    self.bits &= !other.bits;
  }

  /// Either of the post-callback retirement bits.
  pub const fn pending(self) -> bool {
    self.bits & (Self::REMOVE_PENDING.bits | Self::CLEANUP_PENDING.bits) != 0
  }

  pub fn clear_pending(&mut self) {
    self.remove(Self::REMOVE_PENDING);
    self.remove(Self::CLEANUP_PENDING);
  }
}

/// A registrable event source.
///
/// Built with [`Event::new`] and the chained setters, then handed to
/// [`Dispatcher::event_add`], which takes ownership and returns an
/// [`EventId`]. [`Dispatcher::event_remove`] hands the record back so it can
/// be registered elsewhere.
pub struct Event {
  pub(crate) id: Option<EventId>,
  pub(crate) fd: Fd,
  pub(crate) interest: Interest,
  pub(crate) timeout: TimeSpec,
  pub(crate) flags: EventFlags,
  pub(crate) reason: Option<Reason>,
  pub(crate) callback: Option<Callback>,
  pub(crate) cleanup: Option<CleanupFn>,
}

impl fmt::Debug for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Event")
      .field("id", &self.id)
      .field("fd", &self.fd)
      .field("interest", &self.interest)
      .field("timeout", &self.timeout)
      .field("flags", &self.flags)
      .field("reason", &self.reason)
      .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
      .field("cleanup", &self.cleanup.as_ref().map(|_| "<cleanup>"))
      .finish()
  }
}

impl Event {
  pub fn new<F>(callback: F) -> Self
  where
    F: FnMut(&mut Dispatcher, Wakeup) -> Action + 'static,
  {
    Self {
      id: None,
      fd: Fd::None,
      interest: Interest::NONE,
      timeout: TimeSpec::ZERO,
      flags: EventFlags::default(),
      reason: None,
      callback: Some(Box::new(callback)),
      cleanup: None,
    }
  }

  /// Monitor `fd` without taking ownership of it.
  pub fn fd(mut self, fd: RawFd) -> Self {
    self.fd = Fd::Borrowed(fd);
    self
  }

  /// Monitor `fd` and close it when the event is retired.
  pub fn owned_fd(mut self, fd: OwnedFd) -> Self {
    self.fd = Fd::Owned(fd);
    self
  }

  /// Readiness kinds to observe. [`Interest::NONE`] registers the event
  /// for timeout only.
  pub fn interest(mut self, interest: Interest) -> Self {
    self.interest = interest;
    self
  }

  pub fn timeout(mut self, tmo: Timeout) -> Self {
    match tmo {
      Timeout::Off => {
        self.timeout = TimeSpec::ZERO;
        self.flags.remove(EventFlags::ABSOLUTE);
      }
      Timeout::In(ts) => {
        self.timeout = ts;
        self.flags.remove(EventFlags::ABSOLUTE);
      }
      Timeout::At(ts) => {
        self.timeout = ts;
        self.flags.insert(EventFlags::ABSOLUTE);
      }
    }
    self
  }

  /// Run `f` when the event is retired, either because a callback returned
  /// [`Action::Cleanup`] or because the dispatcher is being torn down. By
  /// the time `f` runs the record has been unlinked and is passed by value.
  pub fn on_cleanup<F>(mut self, f: F) -> Self
  where
    F: FnOnce(Event) + 'static,
  {
    self.cleanup = Some(Box::new(f));
    self
  }

  /// A single-shot timer: `f` fires once after `delay`, then the event
  /// retires itself (including cleanup, if any).
  ///
  /// A zero delay is bumped to one nanosecond so the timer still arms and
  /// fires on the next wake-up.
  pub fn timer<F>(delay: TimeSpec, f: F) -> Self
  where
    F: FnOnce(&mut Dispatcher) + 'static,
  {
    let mut f = Some(f);
    let delay =
      if delay.is_zero() { TimeSpec { sec: 0, nsec: 1 } } else { delay };
    Event::new(move |dsp, _wake| {
      if let Some(f) = f.take() {
        f(dsp);
      }
      Action::Cleanup
    })
    .timeout(Timeout::In(delay))
  }

  pub fn raw_fd(&self) -> Option<RawFd> {
    self.fd.raw()
  }

  pub fn into_fd(self) -> Fd {
    self.fd
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_defaults() {
    let ev = Event::new(|_, _| Action::Continue);
    assert!(ev.raw_fd().is_none());
    assert!(ev.interest.is_none());
    assert!(ev.timeout.is_zero());
    assert!(ev.callback.is_some());
    assert!(ev.cleanup.is_none());
  }

  #[test]
  fn timeout_setter_tracks_absolute_flag() {
    let ev = Event::new(|_, _| Action::Continue)
      .timeout(Timeout::At(TimeSpec::from_secs(5)));
    assert!(ev.flags.contains(EventFlags::ABSOLUTE));

    let ev = ev.timeout(Timeout::In(TimeSpec::from_secs(1)));
    assert!(!ev.flags.contains(EventFlags::ABSOLUTE));
    assert_eq!(ev.timeout, TimeSpec::from_secs(1));

    let ev = ev.timeout(Timeout::Off);
    assert!(ev.timeout.is_zero());
  }

  #[test]
  fn timer_arms_even_with_zero_delay() {
    let ev = Event::timer(TimeSpec::ZERO, |_| {});
    assert_eq!(ev.timeout, TimeSpec { sec: 0, nsec: 1 });
    assert!(ev.interest.is_none());
  }

  #[test]
  fn pending_flags() {
    let mut flags = EventFlags::default();
    assert!(!flags.pending());
    flags.insert(EventFlags::REMOVE_PENDING);
    assert!(flags.pending());
    flags.clear_pending();
    assert!(!flags.pending());
    flags.insert(EventFlags::ABSOLUTE);
    assert!(!flags.pending());
  }
}
