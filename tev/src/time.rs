//! Nanosecond-precision time values and sorted-array helpers.
//!
//! [`TimeSpec`] mirrors `struct timespec`: whole seconds plus a nanosecond
//! remainder, both signed. Arithmetic normalizes its result, so values built
//! through [`TimeSpec::new`] or the operators always satisfy
//! `0 <= nsec < NSEC_PER_SEC`. The comparison order is lexicographic on
//! `(sec, nsec)` and assumes normalized operands.
//!
//! The free functions at the bottom maintain ascending arrays of time values:
//! `search` bisects for an insertion point, `insert` is a shift-right insert
//! at that point, and `sort` is the bulk equivalent. The timeout engine keys
//! its deadline list with `search_by` using an expiry projection.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A second/nanosecond pair, the unit of all timeout arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
  pub sec: i64,
  pub nsec: i64,
}

impl TimeSpec {
  /// The zero value. As a timeout it means "no timeout".
  pub const ZERO: Self = Self { sec: 0, nsec: 0 };

  pub fn new(sec: i64, nsec: i64) -> Self {
    let mut ts = Self { sec, nsec };
    ts.normalize();
    ts
  }

  pub const fn is_zero(self) -> bool {
    self.sec == 0 && self.nsec == 0
  }

  /// Redistribute nanosecond carry/borrow into the seconds field so that
  /// `0 <= nsec < NSEC_PER_SEC`.
  pub fn normalize(&mut self) {
    if self.nsec >= 0 && self.nsec < NSEC_PER_SEC {
      return;
    }
    let mut quot = self.nsec / NSEC_PER_SEC;
    let mut rem = self.nsec % NSEC_PER_SEC;
    if rem < 0 {
      rem += NSEC_PER_SEC;
      quot -= 1;
    }
    self.sec += quot;
    self.nsec = rem;
  }

  pub fn from_secs(sec: i64) -> Self {
    Self { sec, nsec: 0 }
  }

  pub fn from_millis(ms: i64) -> Self {
    Self::new(ms / 1_000, ms % 1_000 * 1_000_000)
  }

  pub fn from_micros(us: i64) -> Self {
    Self::new(us / 1_000_000, us % 1_000_000 * 1_000)
  }

  /// Microseconds, truncating. Meaningful for normalized values.
  pub fn as_micros(self) -> i64 {
    self.sec * 1_000_000 + self.nsec / 1_000
  }

  pub(crate) fn into_raw(self) -> libc::timespec {
    libc::timespec { tv_sec: self.sec as _, tv_nsec: self.nsec as _ }
  }

  pub(crate) fn from_raw(ts: libc::timespec) -> Self {
    Self { sec: ts.tv_sec as i64, nsec: ts.tv_nsec as i64 }
  }
}

impl PartialOrd for TimeSpec {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for TimeSpec {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
  }
}

impl Add for TimeSpec {
  type Output = Self;

  fn add(self, rhs: Self) -> Self {
    Self::new(self.sec + rhs.sec, self.nsec + rhs.nsec)
  }
}

impl AddAssign for TimeSpec {
  fn add_assign(&mut self, rhs: Self) {
    *self = *self + rhs;
  }
}

impl Sub for TimeSpec {
  type Output = Self;

  fn sub(self, rhs: Self) -> Self {
    Self::new(self.sec - rhs.sec, self.nsec - rhs.nsec)
  }
}

impl SubAssign for TimeSpec {
  fn sub_assign(&mut self, rhs: Self) {
    *self = *self - rhs;
  }
}

impl From<Duration> for TimeSpec {
  fn from(d: Duration) -> Self {
    Self { sec: d.as_secs() as i64, nsec: d.subsec_nanos() as i64 }
  }
}

impl fmt::Display for TimeSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:06}s", self.sec, self.nsec / 1_000)
  }
}

/// Bisect a sorted slice for the insertion point of `new`: the first index
/// `i` with `key(&items[i]) >= new`, or `items.len()` if every element is
/// smaller. Normalizes `new` as a side effect.
pub fn search_by<T, F>(items: &[T], key: F, new: &mut TimeSpec) -> usize
where
  F: Fn(&T) -> TimeSpec,
{
  new.normalize();

  if items.is_empty() {
    return 0;
  }

  let mut high = items.len() - 1;
  if *new > key(&items[high]) {
    return items.len();
  }

  let mut low = 0;
  while high - low > 1 {
    let mid = low + (high - low) / 2;
    if *new <= key(&items[mid]) {
      high = mid;
    } else {
      low = mid;
    }
  }
  if high > low && *new > key(&items[low]) { high } else { low }
}

/// [`search_by`] with the identity projection.
pub fn search(items: &[TimeSpec], new: &mut TimeSpec) -> usize {
  search_by(items, |ts| *ts, new)
}

/// Insert `new` into an ascending array, keeping it sorted. Returns the
/// position it was placed at.
pub fn insert(items: &mut Vec<TimeSpec>, mut new: TimeSpec) -> usize {
  let pos = search(items, &mut new);
  items.insert(pos, new);
  pos
}

/// Bulk sort, consistent with the comparison order `insert` maintains.
pub fn sort(items: &mut [TimeSpec]) {
  items.sort_unstable();
}
