mod common;

use std::cell::Cell;
use std::rc::Rc;

use tev::{Action, Dispatcher, Event, Reason, TimeSpec, Timeout};

// The child tears its dispatcher down by dropping it, which must not
// touch the epoll registrations or the timer arming it shares with the
// parent. The parent proves the point by still receiving its timer fire.
#[test]
fn dropping_in_forked_child_leaves_parent_intact() {
  common::init_logging();
  let mut dsp = Dispatcher::new().unwrap();

  let fired = Rc::new(Cell::new(0));
  {
    let fired = Rc::clone(&fired);
    dsp
      .event_add(
        Event::new(move |dsp, wake| {
          assert_eq!(wake.reason, Reason::Timeout);
          fired.set(fired.get() + 1);
          dsp
            .event_mod_timeout(wake.id, Timeout::In(TimeSpec::from_millis(20)))
            .unwrap();
          Action::Continue
        })
        .timeout(Timeout::In(TimeSpec::from_millis(20))),
      )
      .unwrap();
  }

  let pid = unsafe { libc::fork() };
  assert!(pid >= 0, "fork failed");
  if pid == 0 {
    // Child: the fork-safe teardown, then straight out without touching
    // the test harness.
    drop(dsp);
    unsafe { libc::_exit(0) };
  }

  // Parent: the timer must still be armed and firing.
  while fired.get() < 2 {
    dsp.wait(None).unwrap();
  }

  let mut status = 0;
  assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
  assert!(libc::WIFEXITED(status));
  assert_eq!(libc::WEXITSTATUS(status), 0);
}
