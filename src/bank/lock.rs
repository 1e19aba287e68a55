//! Block group lock bitmaps.
//!
//! Each block group carries a 32-bit lock bitmap whose bit semantics are
//! the controller's business; the driver only knows that clearing bits
//! unlocks, and which bits the geometry mapper needs cleared.  The bitmap
//! is read and written by one remote algorithm invocation each, with the
//! descriptor re-uploaded every call - no caching.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::bank::FlashBank;
use crate::io::FlashTarget;
use crate::runner::Runner;
use crate::Result;

const LOCK_STACK_BYTES: u32 = 0x100;

/// One lockable block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSpace {
    Low,
    Mid,
    High,
    LargeFirst,
    LargeSecond,
}

impl BlockSpace {
    /// Group id as the lock algorithms take it.
    pub(crate) fn wire_id(self) -> u32 {
        match self {
            BlockSpace::Low => 0,
            BlockSpace::Mid => 1,
            BlockSpace::High => 2,
            BlockSpace::LargeFirst => 3,
            BlockSpace::LargeSecond => 4,
        }
    }

    /// Fixed mask ANDed into the lock bitmap to unlock the group's blocks.
    /// Clearing is monotonic: the result is always a subset of the input.
    pub(crate) fn unlock_mask(self) -> u32 {
        match self {
            BlockSpace::Low => 0xFFFF_FC00,
            BlockSpace::Mid => 0xFFFF_FFFC,
            BlockSpace::High => 0xFFFF_FFF0,
            BlockSpace::LargeFirst => 0xFFFF_FFC0,
            BlockSpace::LargeSecond => 0xFFFF_FFFF,
        }
    }
}

impl FlashBank<'_> {
    /// Read one block group's lock bitmap.
    ///
    /// One algorithm invocation: the getlock blob takes the descriptor,
    /// the group id and a 4-byte out area it stores the bitmap through.
    pub fn get_lock<T: FlashTarget>(&self, target: &mut T, space: BlockSpace) -> Result<u32> {
        let mut runner = Runner::new(target)?;
        let ssd_area = runner.upload(&self.ssd_bytes())?;

        let out = runner.alloc(4)?;
        runner.write_memory(out.address, &0u32.to_le_bytes())?;

        let code = runner.load_code(self.algorithms().get_lock)?;
        let stack = runner.alloc(LOCK_STACK_BYTES)?;
        runner.execute(
            &code,
            &[ssd_area.address, space.wire_id(), out.address],
            &stack,
            self.config().algorithm_timeout_ms,
        )?;

        let mut word = [0u8; 4];
        runner.read_memory(out.address, &mut word)?;
        let lock_state = u32::from_le_bytes(word);

        debug!("get_lock {space:?}: {lock_state:#010X}");
        Ok(lock_state)
    }

    /// Write one block group's lock bitmap.
    pub fn set_lock<T: FlashTarget>(
        &self,
        target: &mut T,
        space: BlockSpace,
        lock_state: u32,
    ) -> Result<()> {
        debug!("set_lock {space:?}: {lock_state:#010X}");

        let mut runner = Runner::new(target)?;
        let ssd_area = runner.upload(&self.ssd_bytes())?;
        let code = runner.load_code(self.algorithms().set_lock)?;
        let stack = runner.alloc(LOCK_STACK_BYTES)?;
        runner.execute(
            &code,
            &[ssd_area.address, space.wire_id(), lock_state],
            &stack,
            self.config().algorithm_timeout_ms,
        )?;

        Ok(())
    }
}
