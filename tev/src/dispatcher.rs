//! The dispatcher: one epoll instance, one timeout queue, one registration
//! table, driven by a cooperative single-threaded loop.
//!
//! Each wake-up processes readiness callbacks first, then timeout fan-out,
//! then a deferred-removal sweep. At most one of [`Reason::Event`] and
//! [`Reason::Timeout`] is delivered to a given event per wake-up; readiness
//! wins because it is processed first and the event's `reason` field blocks
//! the later timeout delivery for the same cycle.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use log::{debug, error, trace, warn};

use crate::event::{Action, Event, EventFlags, EventId, Reason, Timeout, Wakeup};
use crate::os_err;
use crate::poll::{Interest, Poller};
use crate::table::Table;
use crate::time::TimeSpec;
use crate::timeout::TimeoutQueue;

/// Size of the event array per `epoll_pwait` call.
const MAX_EVENTS: usize = 8;

/// Reserved key for the dispatcher's own timer fd. Never collides with an
/// event id (ids count up from 1).
const TIMER_KEY: u64 = u64::MAX;

/// What a loop error handler wants [`Dispatcher::run_with`] to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
  Continue,
  Quit,
}

pub struct Dispatcher {
  poller: Poller,
  timeouts: TimeoutQueue,
  table: Table,
  exiting: bool,
  next_id: u64,
}

impl Dispatcher {
  /// A dispatcher on `CLOCK_MONOTONIC`.
  pub fn new() -> io::Result<Self> {
    Self::with_clock(libc::CLOCK_MONOTONIC)
  }

  /// A dispatcher whose timeouts live on the given clock (see
  /// `clock_gettime(2)`). Absolute timeouts must be expressed in this
  /// clock's frame.
  pub fn with_clock(clock_source: libc::clockid_t) -> io::Result<Self> {
    let poller = Poller::new()?;
    let timeouts = TimeoutQueue::new(clock_source)?;

    // The timer fd participates in the readiness model under a reserved
    // key; it is never placed in the registration table.
    poller.add(timeouts.timer_fd(), TIMER_KEY, Interest::READ)?;

    Ok(Self {
      poller,
      timeouts,
      table: Table::new(),
      exiting: false,
      next_id: 1,
    })
  }

  pub fn clock_source(&self) -> libc::clockid_t {
    self.timeouts.clock_source()
  }

  /// Whether `id` is currently registered.
  pub fn contains(&self, id: EventId) -> bool {
    self.table.find(id).is_some()
  }

  pub fn live_events(&self) -> usize {
    self.table.live()
  }

  pub fn event_fd(&self, id: EventId) -> Option<RawFd> {
    self.table.get(id).and_then(|ev| ev.fd.raw())
  }

  pub fn event_interest(&self, id: EventId) -> Option<Interest> {
    self.table.get(id).map(|ev| ev.interest)
  }

  /// The event's current timeout. Once armed this is the absolute expiry
  /// on the dispatcher's clock; zero means no timeout.
  pub fn event_timeout(&self, id: EventId) -> Option<TimeSpec> {
    self.table.get(id).map(|ev| ev.timeout)
  }

  /// Register an event. The dispatcher takes ownership of the record and
  /// returns its id.
  ///
  /// Fails with `EBUSY` while the dispatcher is tearing down, and with the
  /// underlying errno when the fd cannot be installed into epoll (in which
  /// case the registration is rolled back completely).
  pub fn event_add(&mut self, mut ev: Event) -> io::Result<EventId> {
    if ev.callback.is_none() {
      return Err(os_err(libc::EINVAL));
    }
    if self.exiting {
      return Err(os_err(libc::EBUSY));
    }
    if ev.id.is_some() {
      return Err(os_err(libc::EEXIST));
    }

    let id = EventId(self.next_id);
    ev.id = Some(id);
    ev.reason = None;
    ev.flags.clear_pending();
    let fd = ev.fd.raw();
    let interest = ev.interest;

    self.table.add(ev)?;
    self.next_id += 1;

    if let Some(fd) = fd {
      if let Err(err) = self.poller.add(fd, id.0, interest) {
        error!("failed to add event: {err}");
        self.table.remove(id, false);
        return Err(err);
      }
    }

    let result = match self.table.get_mut(id) {
      Some(ev) => self.timeouts.add(id, ev),
      None => Ok(()),
    };
    if let Err(err) = result {
      if let Some(fd) = fd {
        let _ = self.poller.delete(fd);
      }
      self.table.remove(id, false);
      return Err(err);
    }

    Ok(id)
  }

  /// Unregister an event and hand the record back, cancelling its timeout.
  ///
  /// Must not be called from inside a callback; callbacks request removal
  /// through [`Action::Remove`] / [`Action::Cleanup`] instead.
  pub fn event_remove(&mut self, id: EventId) -> io::Result<Event> {
    if self.exiting {
      return Err(os_err(libc::EBUSY));
    }
    let mut ev =
      self.table.remove(id, true).ok_or_else(|| os_err(libc::EINVAL))?;

    if let Some(fd) = ev.fd.raw() {
      if let Err(err) = self.poller.delete(fd) {
        warn!("failed to remove event {id} from epoll: {err}");
      }
    }
    let _ = self.timeouts.cancel(id, &mut ev);
    ev.id = None;
    ev.reason = None;
    ev.flags.clear_pending();
    Ok(ev)
  }

  /// Re-submit the event's readiness mask to epoll. [`Interest::NONE`]
  /// silences the event; an armed timeout stays active.
  pub fn event_modify(
    &mut self,
    id: EventId,
    interest: Interest,
  ) -> io::Result<()> {
    if self.exiting {
      return Err(os_err(libc::EBUSY));
    }
    let Some(ev) = self.table.get_mut(id) else {
      warn!("attempt to modify non-existing event");
      return Err(os_err(libc::EEXIST));
    };
    ev.interest = interest;
    match ev.fd.raw() {
      Some(fd) => self.poller.modify(fd, id.0, interest),
      None => Ok(()),
    }
  }

  /// Modify, re-arm, or clear the event's timeout.
  ///
  /// A callback invoked with [`Reason::Timeout`] must call this to re-arm
  /// if the event is to be monitored further; an expired timeout is
  /// implicitly infinite otherwise.
  pub fn event_mod_timeout(
    &mut self,
    id: EventId,
    tmo: Timeout,
  ) -> io::Result<()> {
    if self.exiting {
      return Err(os_err(libc::EBUSY));
    }
    if self.table.find(id).is_none() {
      warn!("attempt to modify non-existing event");
      return Err(os_err(libc::EEXIST));
    }

    let new = match tmo {
      Timeout::Off => TimeSpec::ZERO,
      Timeout::In(ts) | Timeout::At(ts) => ts,
    };
    let ev = match self.table.get_mut(id) {
      Some(ev) => ev,
      None => return Err(os_err(libc::EEXIST)),
    };
    match tmo {
      Timeout::In(_) => ev.flags.remove(EventFlags::ABSOLUTE),
      Timeout::At(_) => ev.flags.insert(EventFlags::ABSOLUTE),
      Timeout::Off => {}
    }
    self.timeouts.modify(id, ev, new)
  }

  /// Invoke `id`'s callback for `reason`, honoring the per-wake-up
  /// delivery contract: skipped when another reason is already being
  /// processed for this event, or when the record is scheduled for
  /// removal. The callback's return value is translated into the pending
  /// retirement flags.
  fn invoke(
    &mut self,
    id: EventId,
    reason: Reason,
    ready: Interest,
    reset_reason: bool,
  ) {
    let Some(ev) = self.table.get_mut(id) else {
      return;
    };
    if ev.reason.is_some() {
      return;
    }
    if ev.flags.pending() {
      return;
    }
    let Some(mut callback) = ev.callback.take() else {
      return;
    };
    ev.reason = Some(reason);

    let action = callback(self, Wakeup { id, reason, ready });

    if let Some(ev) = self.table.get_mut(id) {
      ev.callback = Some(callback);
      match action {
        Action::Continue => {}
        Action::Remove => ev.flags.insert(EventFlags::REMOVE_PENDING),
        Action::Cleanup => ev.flags.insert(EventFlags::CLEANUP_PENDING),
      }
      if reset_reason {
        ev.reason = None;
      }
    }
  }

  /// Timeout fan-out: drain the timerfd counter, then repeatedly detach
  /// and fire the expired prefix. Callbacks may queue new, already-expired
  /// timers, hence the loop. Each timeout callback sets and resets its own
  /// reason, so an event that already took a readiness delivery this
  /// wake-up is skipped by the invoke guard.
  fn fire_timeouts(&mut self) -> io::Result<()> {
    self.timeouts.drain_fd();
    let now = self.timeouts.now()?;

    loop {
      let expired = self.timeouts.take_expired(now);
      if expired.is_empty() {
        break;
      }
      trace!("{} timeouts expired", expired.len());
      for id in expired {
        debug!("timeout for event {id}");
        self.invoke(id, Reason::Timeout, Interest::NONE, true);
      }
    }

    let _ = self.timeouts.rearm();
    Ok(())
  }

  /// Retire every entry whose callback requested removal during this
  /// wake-up, then run one compaction pass if anything went.
  fn sweep(&mut self) {
    let n = self.table.high_water();
    let mut removed = false;

    for i in 0..n {
      let pending = self.table.slot(i).map(|ev| {
        (ev.flags.pending(), ev.flags.contains(EventFlags::CLEANUP_PENDING))
      });
      let Some((true, cleanup)) = pending else {
        continue;
      };
      let Some(mut ev) = self.table.take_at(i) else {
        continue;
      };
      let id = ev.id;
      if let Some(fd) = ev.fd.raw() {
        let _ = self.poller.delete(fd);
      }
      if let Some(id) = id {
        debug!("retiring event {id}");
        let _ = self.timeouts.cancel(id, &mut ev);
      }
      ev.id = None;
      ev.reason = None;
      ev.flags.clear_pending();
      if cleanup {
        if let Some(f) = ev.cleanup.take() {
          f(ev);
        }
      }
      removed = true;
    }

    if removed {
      self.table.gc();
    }
  }

  /// Wait for readiness or timeouts, once, and dispatch callbacks.
  ///
  /// A single `epoll_pwait` call is made with `sigmask` applied
  /// atomically; block everything except the signals the application wants
  /// to observe. Returns the number of raw epoll events, or the negated
  /// errno as an [`io::Error`] — `EINTR` included; whether that is fatal
  /// is the caller's (or the loop error handler's) decision.
  ///
  /// With nothing registered this blocks until a signal is caught.
  pub fn wait(
    &mut self,
    sigmask: Option<&libc::sigset_t>,
  ) -> io::Result<usize> {
    if self.exiting {
      return Err(os_err(libc::EBUSY));
    }

    let mut events =
      [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    let n = match self.poller.wait(&mut events, sigmask) {
      Ok(n) => n,
      Err(err) => {
        if err.raw_os_error() == Some(libc::EINTR) {
          debug!("epoll_pwait: {err}");
        } else {
          warn!("epoll_pwait: {err}");
        }
        return Err(err);
      }
    };
    trace!("received {n} events");

    let mut ready = [(EventId(0), Interest::NONE); MAX_EVENTS];
    let mut count = 0;
    let mut timer_fired = false;
    for raw in &events[..n] {
      if raw.u64 == TIMER_KEY {
        timer_fired = true;
      } else {
        ready[count] = (EventId(raw.u64), Interest::from_epoll(raw.events));
        count += 1;
      }
    }

    // Readiness before timeouts: genuine I/O completion preempts a
    // timeout that fired in the same wake-up cycle.
    for &(id, bits) in &ready[..count] {
      self.invoke(id, Reason::Event, bits, false);
    }

    if timer_fired {
      self.fire_timeouts()?;
    }

    for &(id, _) in &ready[..count] {
      if let Some(ev) = self.table.get_mut(id) {
        ev.reason = None;
      }
    }

    self.sweep();
    Ok(n)
  }

  /// Call [`Dispatcher::wait`] in a loop, returning the first error.
  pub fn run(&mut self, sigmask: Option<&libc::sigset_t>) -> io::Result<()> {
    loop {
      self.wait(sigmask)?;
    }
  }

  /// Call [`Dispatcher::wait`] in a loop, consulting `err_handler` on
  /// errors: [`LoopAction::Continue`] keeps looping (e.g. after a handled
  /// `EINTR`), [`LoopAction::Quit`] returns `Ok(())`, and an error from
  /// the handler aborts the loop with it.
  pub fn run_with<H>(
    &mut self,
    sigmask: Option<&libc::sigset_t>,
    mut err_handler: H,
  ) -> io::Result<()>
  where
    H: FnMut(io::Error) -> io::Result<LoopAction>,
  {
    loop {
      if let Err(err) = self.wait(sigmask) {
        match err_handler(err)? {
          LoopAction::Continue => continue,
          LoopAction::Quit => return Ok(()),
        }
      }
    }
  }

  /// Remove every event and timeout, running each event's cleanup
  /// callback. Deletes the fds from epoll and disarms the timer, so this
  /// variant is *not* fork-safe: the epoll set is shared with a fork
  /// parent. The dispatcher itself stays usable and accepts new
  /// registrations afterwards. Calling it again is a no-op.
  pub fn cleanup(&mut self) -> io::Result<()> {
    if self.exiting {
      return Ok(());
    }
    self.exiting = true;
    debug!("cleaning up {} events", self.table.live());

    for i in 0..self.table.high_water() {
      let Some(mut ev) = self.table.take_at(i) else {
        continue;
      };
      if let Some(fd) = ev.fd.raw() {
        let _ = self.poller.delete(fd);
      }
      ev.id = None;
      ev.reason = None;
      if let Some(f) = ev.cleanup.take() {
        f(ev);
      }
    }
    self.table.reset();
    let _ = self.timeouts.reset();
    self.exiting = false;
    Ok(())
  }
}

impl AsRawFd for Dispatcher {
  /// The epoll fd, for callers implementing a custom wait loop.
  fn as_raw_fd(&self) -> RawFd {
    self.poller.as_raw_fd()
  }
}

impl Drop for Dispatcher {
  /// Runs every event's cleanup callback and closes the dispatcher's own
  /// file descriptors, nothing else. No `EPOLL_CTL_DEL`, no timer re-arm:
  /// the epoll set and timer arming are shared across `fork`, so dropping
  /// in a child must not disturb the parent.
  fn drop(&mut self) {
    self.exiting = true;
    for i in 0..self.table.high_water() {
      let Some(mut ev) = self.table.take_at(i) else {
        continue;
      };
      ev.id = None;
      ev.reason = None;
      if let Some(f) = ev.cleanup.take() {
        f(ev);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_assigns_distinct_ids() {
    let mut dsp = Dispatcher::new().unwrap();
    let a = dsp.event_add(Event::new(|_, _| Action::Continue)).unwrap();
    let b = dsp.event_add(Event::new(|_, _| Action::Continue)).unwrap();
    assert_ne!(a, b);
    assert!(dsp.contains(a));
    assert!(dsp.contains(b));
    assert_eq!(dsp.live_events(), 2);
  }

  #[test]
  fn remove_returns_the_record() {
    let mut dsp = Dispatcher::new().unwrap();
    let id = dsp
      .event_add(
        Event::new(|_, _| Action::Continue)
          .timeout(Timeout::In(TimeSpec::from_secs(60))),
      )
      .unwrap();
    assert!(dsp.event_timeout(id).is_some_and(|t| !t.is_zero()));

    let ev = dsp.event_remove(id).unwrap();
    assert!(ev.id.is_none());
    assert!(ev.timeout.is_zero());
    assert!(!dsp.contains(id));

    // The record can be registered again.
    let id2 = dsp.event_add(ev).unwrap();
    assert_ne!(id, id2);
  }

  #[test]
  fn remove_of_unknown_id_is_invalid() {
    let mut dsp = Dispatcher::new().unwrap();
    assert_eq!(
      dsp.event_remove(EventId(42)).unwrap_err().raw_os_error(),
      Some(libc::EINVAL)
    );
  }

  #[test]
  fn modify_of_unknown_id_reports_eexist() {
    let mut dsp = Dispatcher::new().unwrap();
    assert_eq!(
      dsp
        .event_modify(EventId(42), Interest::READ)
        .unwrap_err()
        .raw_os_error(),
      Some(libc::EEXIST)
    );
    assert_eq!(
      dsp
        .event_mod_timeout(EventId(42), Timeout::Off)
        .unwrap_err()
        .raw_os_error(),
      Some(libc::EEXIST)
    );
  }

  #[test]
  fn failed_epoll_install_rolls_back() {
    let mut dsp = Dispatcher::new().unwrap();
    // A fd that cannot be valid.
    let err = dsp
      .event_add(Event::new(|_, _| Action::Continue).fd(-2).interest(
        Interest::READ,
      ))
      .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    assert_eq!(dsp.live_events(), 0);
  }

  #[test]
  fn add_during_teardown_is_busy() {
    let mut dsp = Dispatcher::new().unwrap();
    dsp.exiting = true;
    assert_eq!(
      dsp
        .event_add(Event::new(|_, _| Action::Continue))
        .unwrap_err()
        .raw_os_error(),
      Some(libc::EBUSY)
    );
    dsp.exiting = false;
  }

  #[test]
  fn mod_timeout_arms_and_clears() {
    let mut dsp = Dispatcher::new().unwrap();
    let id = dsp.event_add(Event::new(|_, _| Action::Continue)).unwrap();
    assert!(dsp.event_timeout(id).unwrap().is_zero());

    dsp
      .event_mod_timeout(id, Timeout::In(TimeSpec::from_secs(30)))
      .unwrap();
    let armed = dsp.event_timeout(id).unwrap();
    assert!(!armed.is_zero());

    dsp.event_mod_timeout(id, Timeout::Off).unwrap();
    assert!(dsp.event_timeout(id).unwrap().is_zero());
  }

  #[test]
  fn cleanup_runs_cleanups_and_is_idempotent() {
    use std::cell::Cell;
    use std::rc::Rc;

    let cleaned = Rc::new(Cell::new(0));
    let mut dsp = Dispatcher::new().unwrap();
    for _ in 0..3 {
      let cleaned = Rc::clone(&cleaned);
      dsp
        .event_add(
          Event::new(|_, _| Action::Continue)
            .on_cleanup(move |_| cleaned.set(cleaned.get() + 1)),
        )
        .unwrap();
    }

    dsp.cleanup().unwrap();
    assert_eq!(cleaned.get(), 3);
    assert_eq!(dsp.live_events(), 0);

    dsp.cleanup().unwrap();
    assert_eq!(cleaned.get(), 3);

    // Still usable afterwards.
    let id = dsp.event_add(Event::new(|_, _| Action::Continue)).unwrap();
    assert!(dsp.contains(id));
  }
}
