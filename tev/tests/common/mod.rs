//! Signal plumbing shared by the integration tests: block everything on
//! the driving thread, install flag-setting handlers for the interrupters,
//! and unblock them only inside the dispatcher's wait.

#![allow(dead_code)]

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

pub static MUST_EXIT: AtomicBool = AtomicBool::new(false);
pub static GOT_SIGCHLD: AtomicBool = AtomicBool::new(false);

extern "C" fn int_handler(_sig: libc::c_int) {
  MUST_EXIT.store(true, Ordering::SeqCst);
}

extern "C" fn chld_handler(_sig: libc::c_int) {
  GOT_SIGCHLD.store(true, Ordering::SeqCst);
}

pub fn install_handler(
  sig: libc::c_int,
  handler: extern "C" fn(libc::c_int),
) -> io::Result<()> {
  unsafe {
    let mut sa: libc::sigaction = mem::zeroed();
    sa.sa_sigaction = handler as usize;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(sig, &sa, ptr::null_mut()) == -1 {
      return Err(io::Error::last_os_error());
    }
  }
  Ok(())
}

pub fn install_exit_handler(sig: libc::c_int) -> io::Result<()> {
  install_handler(sig, int_handler)
}

/// Block all signals on the calling thread. They get unblocked only for
/// the duration of the dispatcher's wait, through the wait mask.
pub fn block_all_signals() -> io::Result<()> {
  unsafe {
    let mut mask: libc::sigset_t = mem::zeroed();
    libc::sigfillset(&mut mask);
    if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) != 0 {
      return Err(io::Error::last_os_error());
    }
  }
  Ok(())
}

pub fn init_signals() -> io::Result<()> {
  block_all_signals()?;
  install_handler(libc::SIGTERM, int_handler)?;
  install_handler(libc::SIGINT, int_handler)?;
  install_handler(libc::SIGALRM, int_handler)?;
  install_handler(libc::SIGCHLD, chld_handler)?;
  Ok(())
}

/// Everything blocked except the interrupters the tests want to observe.
pub fn wait_mask() -> libc::sigset_t {
  unsafe {
    let mut mask: libc::sigset_t = mem::zeroed();
    libc::sigfillset(&mut mask);
    libc::sigdelset(&mut mask, libc::SIGTERM);
    libc::sigdelset(&mut mask, libc::SIGINT);
    libc::sigdelset(&mut mask, libc::SIGCHLD);
    mask
  }
}

/// Interrupt this thread's next wait. `raise` targets the calling thread,
/// so the signal stays pending until the wait mask unblocks it.
pub fn exit_main_loop() {
  unsafe {
    libc::raise(libc::SIGINT);
  }
}

pub fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}
