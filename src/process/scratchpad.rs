//! Scratch pad: device-side array of slots that keep objects allocated on behalf of the host
//! (evaluation arguments and results) alive.
//!
//! Each slot has a generation counter. A slot is reusable only after an explicit
//! release, a [`ScratchSlot`] that outlived its release is detected as stale.

use crate::error::Error;

const MIN_CAPACITY: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScratchSlot {
    pub index: u32,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct SlotState {
    generation: u32,
    in_use: bool,
}

#[derive(Debug, Default)]
pub struct ScratchPad {
    slots: Vec<SlotState>,
}

impl ScratchPad {
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Take a free slot. Second value is a new capacity if device pad must be resized first.
    pub fn allocate(&mut self) -> (ScratchSlot, Option<u32>) {
        if let Some(index) = self.slots.iter().position(|s| !s.in_use) {
            let state = &mut self.slots[index];
            state.in_use = true;
            return (
                ScratchSlot {
                    index: index as u32,
                    generation: state.generation,
                },
                None,
            );
        }

        let index = self.slots.len();
        let capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        self.slots.resize(capacity as usize, SlotState::default());
        self.slots[index].in_use = true;
        (
            ScratchSlot {
                index: index as u32,
                generation: self.slots[index].generation,
            },
            Some(capacity),
        )
    }

    pub fn validate(&self, slot: ScratchSlot) -> Result<(), Error> {
        match self.slots.get(slot.index as usize) {
            Some(state) if state.in_use && state.generation == slot.generation => Ok(()),
            _ => Err(Error::StaleScratchSlot(slot.index)),
        }
    }

    pub fn release(&mut self, slot: ScratchSlot) -> Result<(), Error> {
        self.validate(slot)?;
        let state = &mut self.slots[slot.index as usize];
        state.in_use = false;
        state.generation = state.generation.wrapping_add(1);
        Ok(())
    }

    /// Undo a grow the device rejected: release `slot`, the first slot of the grow,
    /// and shrink back to the previous capacity unless the new slots are taken meanwhile.
    pub fn cancel_grow(&mut self, slot: ScratchSlot) -> Result<(), Error> {
        self.release(slot)?;
        let previous = slot.index as usize;
        while self.slots.len() > previous && self.slots.last().is_some_and(|s| !s.in_use) {
            self.slots.pop();
        }
        Ok(())
    }

    /// Forget all slots, device pad is gone (process exit or reboot).
    pub fn reset(&mut self) {
        for state in &mut self.slots {
            if state.in_use {
                state.in_use = false;
                state.generation = state.generation.wrapping_add(1);
            }
        }
    }
}
