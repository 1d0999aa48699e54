//! # tev - Tiny Event Dispatcher with Timeouts
//!
//! tev is a small, strictly single-threaded event dispatcher built on
//! `epoll` and `timerfd` (Linux only). An application registers event
//! sources — each bound to an optional file descriptor, an optional
//! timeout, a callback, and an optional cleanup — and drives them in a
//! cooperative loop.
//!
//! ## Key Characteristics
//!
//! - **Single-threaded**: callbacks run to completion, one at a time, on
//!   the thread driving the loop. The only suspension point is the
//!   blocking `epoll_pwait`.
//! - **Integrated timeouts**: one kernel timer fd serves every event's
//!   timeout; the dispatcher keeps it armed to the earliest pending expiry.
//! - **Race-aware delivery**: when a fd becomes ready and its timeout
//!   expires in the same wake-up, the callback is invoked exactly once,
//!   with [`Reason::Event`] — readiness wins.
//! - **Cooperative removal**: callbacks retire events through their return
//!   value ([`Action::Remove`] / [`Action::Cleanup`]); the dispatcher
//!   unlinks them after the wake-up's callback batch completes.
//!
//! ## Getting Started
//!
//! ```no_run
//! use tev::{Dispatcher, Event, TimeSpec};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut dsp = Dispatcher::new()?;
//!
//!     // A single-shot 10 ms timer.
//!     dsp.event_add(Event::timer(TimeSpec::from_millis(10), |_| {
//!         println!("tick");
//!     }))?;
//!
//!     // One wake-up: fires the timer, retires the event.
//!     dsp.wait(None)?;
//!     Ok(())
//! }
//! ```
//!
//! An event watching a socket with a receive timeout:
//!
//! ```no_run
//! use tev::{Action, Dispatcher, Event, Interest, Reason, TimeSpec, Timeout};
//! # fn accept_fd() -> std::os::fd::RawFd { 0 }
//!
//! # fn main() -> std::io::Result<()> {
//! let mut dsp = Dispatcher::new()?;
//! let fd = accept_fd();
//!
//! dsp.event_add(
//!     Event::new(move |dsp, wake| {
//!         match wake.reason {
//!             Reason::Timeout => return Action::Cleanup,
//!             Reason::Event => { /* read from fd, handle data */ }
//!         }
//!         // An expired timeout must be re-armed to stay active.
//!         let _ = dsp.event_mod_timeout(
//!             wake.id,
//!             Timeout::In(TimeSpec::from_secs(2)),
//!         );
//!         Action::Continue
//!     })
//!     .fd(fd)
//!     .interest(Interest::READ | Interest::HANGUP)
//!     .timeout(Timeout::In(TimeSpec::from_secs(2))),
//! )?;
//!
//! dsp.run(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Ownership
//!
//! [`Dispatcher::event_add`] takes the [`Event`] by value and returns an
//! [`EventId`]; [`Dispatcher::event_remove`] hands the record back. Cleanup
//! callbacks receive the retired record by value. File descriptors are
//! either borrowed ([`Event::fd`]) or owned ([`Event::owned_fd`], closed on
//! drop).
//!
//! ## Teardown
//!
//! [`Dispatcher::cleanup`] retires every event (running cleanups), deletes
//! the fds from epoll and disarms the timer; the dispatcher stays usable.
//! Dropping the dispatcher also runs cleanups but touches no shared kernel
//! state, which makes it the right teardown after `fork` — the parent's
//! epoll registrations and timer stay intact.

#[macro_use]
mod macros;

mod dispatcher;
mod event;
mod poll;
mod table;
mod timeout;

pub mod time;

pub use dispatcher::{Dispatcher, LoopAction};
pub use event::{Action, Event, EventId, Fd, Reason, Timeout, Wakeup};
pub use poll::Interest;
pub use time::TimeSpec;

pub(crate) fn os_err(code: libc::c_int) -> std::io::Error {
  std::io::Error::from_raw_os_error(code)
}
