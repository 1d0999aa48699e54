//! The dispatcher's registration table: a growable slot array with hole
//! reuse and compaction.
//!
//! `n` is the high-water mark (index just past the last used slot), `free`
//! counts null slots below it. Lookup is a linear identity scan; the working
//! set is expected to stay in the tens-to-low-hundreds and slot order has no
//! semantic meaning.

use std::io;

use log::{debug, info, warn};

use crate::event::{Event, EventId};
use crate::os_err;

pub(crate) const LEN_CHUNK: usize = 8;
const MAX_CAPACITY: usize = u32::MAX as usize;

pub(crate) struct Table {
  slots: Vec<Option<Event>>,
  n: usize,
  free: usize,
}

impl Table {
  pub fn new() -> Self {
    Self { slots: Vec::new(), n: 0, free: 0 }
  }

  pub fn high_water(&self) -> usize {
    self.n
  }

  pub fn live(&self) -> usize {
    self.n - self.free
  }

  pub fn find(&self, id: EventId) -> Option<usize> {
    self.slots[..self.n]
      .iter()
      .position(|slot| slot.as_ref().is_some_and(|ev| ev.id == Some(id)))
  }

  pub fn get(&self, id: EventId) -> Option<&Event> {
    self.slots[self.find(id)?].as_ref()
  }

  pub fn get_mut(&mut self, id: EventId) -> Option<&mut Event> {
    let i = self.find(id)?;
    self.slots[i].as_mut()
  }

  pub fn slot(&self, i: usize) -> Option<&Event> {
    self.slots.get(i).and_then(|slot| slot.as_ref())
  }

  fn grow(&mut self) -> io::Result<()> {
    if self.slots.len() >= MAX_CAPACITY - LEN_CHUNK {
      return Err(os_err(libc::EOVERFLOW));
    }
    self.slots.resize_with(self.slots.len() + LEN_CHUNK, || None);
    debug!("new size: {}", self.slots.len());
    Ok(())
  }

  pub fn add(&mut self, ev: Event) -> io::Result<()> {
    let Some(id) = ev.id else {
      return Err(os_err(libc::EINVAL));
    };
    if self.find(id).is_some() {
      return Err(os_err(libc::EEXIST));
    }

    if self.free > 0 {
      match self.slots[..self.n].iter().position(|slot| slot.is_none()) {
        Some(i) => {
          self.slots[i] = Some(ev);
          self.free -= 1;
          debug!(
            "new event {id} @{i}, {}/{}/{} free",
            self.free,
            self.n,
            self.slots.len()
          );
          return Ok(());
        }
        None => {
          // Accounting got out of step; repair and fall through to append.
          warn!("free={}, but no empty slot found", self.free);
          self.free = 0;
        }
      }
    }

    if self.n == self.slots.len() {
      self.grow()?;
    }
    self.slots[self.n] = Some(ev);
    self.n += 1;
    debug!(
      "new event {id} @{}, {}/{}/{} free",
      self.n - 1,
      self.free,
      self.n,
      self.slots.len()
    );
    Ok(())
  }

  /// Null out slot `i` and maintain the high-water/hole accounting.
  pub fn take_at(&mut self, i: usize) -> Option<Event> {
    let ev = self.slots.get_mut(i)?.take()?;
    if i == self.n - 1 {
      self.n -= 1;
    } else {
      self.free += 1;
    }
    debug!(
      "removed event @{i}, {}/{}/{} free",
      self.free,
      self.n,
      self.slots.len()
    );
    Some(ev)
  }

  pub fn remove(&mut self, id: EventId, do_gc: bool) -> Option<Event> {
    let i = self.find(id)?;
    let ev = self.take_at(i);
    if do_gc {
      self.gc();
    }
    ev
  }

  /// Close all null gaps, preserving the relative order of live entries,
  /// then halve the capacity if the table is well below half-full. The
  /// hysteresis (only above 2x chunk, only below half-full) prevents
  /// grow/shrink oscillation.
  pub fn gc(&mut self) {
    if self.free <= self.n / 4 {
      return;
    }

    let mut w = 0;
    for r in 0..self.n {
      if self.slots[r].is_some() {
        if w != r {
          self.slots.swap(w, r);
        }
        w += 1;
      }
    }
    debug!("collected {} slots", self.n - w);
    self.n = w;
    self.free = 0;

    if self.slots.len() <= 2 * LEN_CHUNK || self.n >= self.slots.len() / 2 {
      return;
    }
    let half = self.slots.len() / 2;
    self.slots.truncate(half);
    self.slots.shrink_to(half);
    info!("new size: {}/{}", self.n, half);
  }

  /// Drop all bookkeeping and release the backing storage. Callers are
  /// responsible for having drained the entries first.
  pub fn reset(&mut self) {
    self.slots = Vec::new();
    self.n = 0;
    self.free = 0;
  }

  #[cfg(test)]
  fn check_invariants(&self) {
    assert!(self.n <= self.slots.len(), "high-water past capacity");
    let holes = self.slots[..self.n].iter().filter(|s| s.is_none()).count();
    assert_eq!(holes, self.free, "hole count out of step");
    assert!(
      self.slots[self.n..].iter().all(|s| s.is_none()),
      "live entry above high-water mark"
    );
    let mut ids: Vec<_> = self.slots[..self.n]
      .iter()
      .flatten()
      .map(|ev| ev.id.unwrap())
      .collect();
    ids.sort_by_key(|id| id.0);
    ids.dedup();
    assert_eq!(ids.len(), self.live(), "duplicate id in table");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::Action;
  use proptest::prelude::*;
  use std::collections::BTreeSet;

  fn ev(id: u64) -> Event {
    let mut ev = Event::new(|_, _| Action::Continue);
    ev.id = Some(EventId(id));
    ev
  }

  #[test]
  fn add_find_remove() {
    let mut table = Table::new();
    table.add(ev(1)).unwrap();
    table.add(ev(2)).unwrap();
    assert_eq!(table.find(EventId(1)), Some(0));
    assert_eq!(table.find(EventId(2)), Some(1));
    assert_eq!(table.live(), 2);

    let removed = table.remove(EventId(1), false).unwrap();
    assert_eq!(removed.id, Some(EventId(1)));
    assert_eq!(table.find(EventId(1)), None);
    assert_eq!(table.free, 1);
    table.check_invariants();
  }

  #[test]
  fn duplicate_add_rejected() {
    let mut table = Table::new();
    table.add(ev(7)).unwrap();
    assert_eq!(
      table.add(ev(7)).unwrap_err().raw_os_error(),
      Some(libc::EEXIST)
    );
  }

  #[test]
  fn unassigned_id_rejected() {
    let mut table = Table::new();
    let stray = Event::new(|_, _| Action::Continue);
    assert_eq!(
      table.add(stray).unwrap_err().raw_os_error(),
      Some(libc::EINVAL)
    );
  }

  #[test]
  fn tail_removal_lowers_high_water() {
    let mut table = Table::new();
    table.add(ev(1)).unwrap();
    table.add(ev(2)).unwrap();
    table.remove(EventId(2), false);
    assert_eq!(table.high_water(), 1);
    assert_eq!(table.free, 0);
    table.check_invariants();
  }

  #[test]
  fn holes_are_reused() {
    let mut table = Table::new();
    for i in 1..=4 {
      table.add(ev(i)).unwrap();
    }
    table.remove(EventId(2), false);
    assert_eq!(table.free, 1);

    table.add(ev(5)).unwrap();
    assert_eq!(table.free, 0);
    assert_eq!(table.find(EventId(5)), Some(1));
    table.check_invariants();
  }

  #[test]
  fn gc_compacts_preserving_order() {
    let mut table = Table::new();
    for i in 1..=12 {
      table.add(ev(i)).unwrap();
    }
    for i in [1u64, 3, 5, 7, 9] {
      table.remove(EventId(i), false);
    }
    table.gc();
    assert_eq!(table.free, 0);
    let order: Vec<_> = (0..table.high_water())
      .filter_map(|i| table.slot(i).and_then(|e| e.id))
      .map(|id| id.0)
      .collect();
    assert_eq!(order, vec![2, 4, 6, 8, 10, 11, 12]);
    table.check_invariants();
  }

  #[test]
  fn gc_halves_when_sparse() {
    let mut table = Table::new();
    for i in 1..=40 {
      table.add(ev(i)).unwrap();
    }
    assert_eq!(table.slots.len(), 40);
    for i in 5..=40 {
      table.remove(EventId(i), false);
    }
    table.gc();
    assert_eq!(table.live(), 4);
    assert_eq!(table.slots.len(), 20);
    table.check_invariants();
  }

  #[test]
  fn gc_below_threshold_is_a_noop() {
    let mut table = Table::new();
    for i in 1..=8 {
      table.add(ev(i)).unwrap();
    }
    table.remove(EventId(3), false);
    let n_before = table.high_water();
    table.gc();
    // One hole out of eight is below the free > n/4 threshold.
    assert_eq!(table.free, 1);
    assert_eq!(table.high_water(), n_before);
    table.check_invariants();
  }

  proptest! {
    // Random add/remove sequences against a shadow set; invariants hold
    // after every step and the final live count matches the shadow.
    #[test]
    fn random_add_remove(ops in prop::collection::vec((any::<bool>(), 1..200u64), 1..500)) {
      let mut table = Table::new();
      let mut shadow = BTreeSet::new();

      for (is_add, id) in ops {
        if is_add {
          match table.add(ev(id)) {
            Ok(()) => assert!(shadow.insert(id)),
            Err(e) => {
              assert_eq!(e.raw_os_error(), Some(libc::EEXIST));
              assert!(shadow.contains(&id));
            }
          }
        } else {
          let removed = table.remove(EventId(id), true).is_some();
          assert_eq!(removed, shadow.remove(&id));
        }
        table.check_invariants();
      }

      assert_eq!(table.live(), shadow.len());
      for id in &shadow {
        assert!(table.find(EventId(*id)).is_some());
      }
    }
  }
}
