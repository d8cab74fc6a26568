//! I/O units and the lists they move through
//!
//! An I/O unit is one metadata block plus the pages it describes. Units live
//! in a fixed-size arena owned by [`IoLists`]; stripes refer to their unit
//! by [`UnitId`]. `IoLists` is only ever reached through the log's list
//! lock, so every state transition happens under that lock.

use std::collections::VecDeque;
use std::sync::Arc;

use raidlog_common::{Error, Result, Sector};

use crate::ring::JournalPos;
use crate::stripe::Stripe;

/// Lifecycle of an I/O unit. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoUnitState {
    /// Accepting stripes
    Running,
    /// Submitted to the journal device
    IoStart,
    /// Journal write completed
    IoEnd,
    /// Every carried stripe reached the member disks
    StripeEnd,
}

/// Handle of an I/O unit in the arena. The generation makes a stale handle
/// miss instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
pub struct IoUnit {
    seq: u64,
    log_start: Sector,
    log_end: Sector,
    state: IoUnitState,
    stripes: Vec<Arc<Stripe>>,
    pending_stripes: usize,
}

impl IoUnit {
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Sector of the unit's metadata block
    #[must_use]
    pub const fn log_start(&self) -> Sector {
        self.log_start
    }

    /// First sector after the unit's last page
    #[must_use]
    pub const fn log_end(&self) -> Sector {
        self.log_end
    }

    #[must_use]
    pub const fn state(&self) -> IoUnitState {
        self.state
    }

    #[must_use]
    pub const fn pending_stripes(&self) -> usize {
        self.pending_stripes
    }

    fn transition(&mut self, to: IoUnitState) -> Result<()> {
        if to <= self.state {
            return Err(Error::invariant(format!(
                "I/O unit {} moving from {:?} to {:?}",
                self.seq, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    unit: Option<IoUnit>,
}

/// The unit arena and the four ordered lifecycle lists
#[derive(Debug)]
pub struct IoLists {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Opened or submitted, in log order
    pub(crate) running: VecDeque<UnitId>,
    /// Written, waiting for the next cache flush
    pub(crate) io_end: VecDeque<UnitId>,
    /// Covered by the flush in flight
    pub(crate) flushing: VecDeque<UnitId>,
    /// Stripes released to the array, waiting for them to finish
    pub(crate) finished: VecDeque<UnitId>,
    /// Where the tail can move once the units in flight retire
    pub(crate) next_checkpoint: JournalPos,
    /// Stripes parked because every slot was taken
    pub(crate) no_mem_stripes: VecDeque<Arc<Stripe>>,
}

impl IoLists {
    #[must_use]
    pub fn new(capacity: usize, checkpoint: JournalPos) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    unit: None,
                })
                .collect(),
            free: (0..capacity as u32).rev().collect(),
            running: VecDeque::new(),
            io_end: VecDeque::new(),
            flushing: VecDeque::new(),
            finished: VecDeque::new(),
            next_checkpoint: checkpoint,
            no_mem_stripes: VecDeque::new(),
        }
    }

    /// Open a unit at `log_start` and queue it on the running list.
    /// `None` when every slot is in use.
    pub fn alloc(&mut self, seq: u64, log_start: Sector, log_end: Sector) -> Option<UnitId> {
        let slot = self.free.pop()?;
        let entry = &mut self.slots[slot as usize];
        entry.unit = Some(IoUnit {
            seq,
            log_start,
            log_end,
            state: IoUnitState::Running,
            stripes: Vec::new(),
            pending_stripes: 0,
        });
        let id = UnitId {
            slot,
            generation: entry.generation,
        };
        self.running.push_back(id);
        Some(id)
    }

    #[must_use]
    pub fn get(&self, id: UnitId) -> Option<&IoUnit> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.unit.as_ref())
    }

    fn get_mut(&mut self, id: UnitId) -> Result<&mut IoUnit> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.unit.as_mut())
            .ok_or_else(|| Error::invariant(format!("stale I/O unit handle {id:?}")))
    }

    fn state_of(&self, id: UnitId) -> Option<IoUnitState> {
        self.get(id).map(IoUnit::state)
    }

    /// Move a unit forward in its lifecycle
    pub fn set_state(&mut self, id: UnitId, to: IoUnitState) -> Result<()> {
        self.get_mut(id)?.transition(to)
    }

    /// Hand the finished contents of an open unit over at submit time
    pub fn seal(&mut self, id: UnitId, log_end: Sector, stripes: Vec<Arc<Stripe>>) -> Result<()> {
        let unit = self.get_mut(id)?;
        unit.log_end = log_end;
        unit.pending_stripes = stripes.len();
        unit.stripes = stripes;
        unit.transition(IoUnitState::IoStart)
    }

    /// Pop units off the head of the running list while their journal write
    /// has completed. Units behind one still in flight stay put.
    pub fn pop_written(&mut self) -> Vec<UnitId> {
        let mut done = Vec::new();
        while let Some(&id) = self.running.front() {
            if self.state_of(id).is_none_or(|s| s < IoUnitState::IoEnd) {
                break;
            }
            self.running.pop_front();
            done.push(id);
        }
        done
    }

    /// Take the stripes a unit carries so they can be released
    pub fn take_stripes(&mut self, id: UnitId) -> Result<Vec<Arc<Stripe>>> {
        Ok(std::mem::take(&mut self.get_mut(id)?.stripes))
    }

    /// Account one stripe of `id` as finished. Returns true once the last one
    /// is done and the unit reached [`IoUnitState::StripeEnd`].
    pub fn stripe_finished(&mut self, id: UnitId) -> Result<bool> {
        let unit = self.get_mut(id)?;
        if unit.pending_stripes == 0 {
            return Err(Error::invariant(format!(
                "I/O unit {} has no stripe left to finish",
                unit.seq
            )));
        }
        unit.pending_stripes -= 1;
        if unit.pending_stripes > 0 {
            return Ok(false);
        }
        unit.transition(IoUnitState::StripeEnd)?;
        Ok(true)
    }

    /// Retire fully finished units from the head of the finished list,
    /// moving the next checkpoint to the last one retired. Returns how many
    /// retired and the parked stripes that may now get a slot, one per unit.
    pub fn complete_finished(&mut self) -> (usize, Vec<Arc<Stripe>>) {
        let mut retired = 0;
        let mut wake = Vec::new();
        while let Some(&id) = self.finished.front() {
            let Some(unit) = self.get(id) else {
                self.finished.pop_front();
                continue;
            };
            if unit.state < IoUnitState::StripeEnd {
                break;
            }
            let checkpoint = JournalPos::new(unit.log_start, unit.seq);
            self.next_checkpoint = checkpoint;
            self.finished.pop_front();
            self.release(id);
            retired += 1;
            if let Some(stripe) = self.no_mem_stripes.pop_front() {
                wake.push(stripe);
            }
        }
        (retired, wake)
    }

    fn release(&mut self, id: UnitId) {
        if let Some(slot) = self.slots.get_mut(id.slot as usize) {
            slot.unit = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.slot);
        }
    }

    /// No unit is anywhere between open and retired
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
            && self.io_end.is_empty()
            && self.flushing.is_empty()
            && self.finished.is_empty()
    }

    /// Units currently allocated
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
