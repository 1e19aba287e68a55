//! Trait seam to the host's debug probe stack.
//!
//! This module contains the one trait the embedding application must
//! implement, [`FlashTarget`], plus the small value types it trades in.
//! The driver never talks to hardware directly - every halt check, scratch
//! allocation, memory transfer and algorithm execution goes through this
//! seam.
//!
//! # Possible implementations
//!
//! - For debug probes: forward to an SWD/JTAG stack's halt state, working
//!   area allocator and memory access primitives
//! - For tests: an in-memory fake with a bump allocator and a scripted
//!   execution primitive
//!
//! # Address Space
//!
//! All addresses are absolute addresses as they appear in the target's
//! memory map.  The implementation is responsible for translating them to
//! whatever internal representation it uses (AP transactions, command
//! packets, etc.).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::Result;

/// A scratch region in target memory, granted by the host's working area
/// allocator for the lifetime of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingArea {
    /// Absolute target address of the region
    pub address: u32,
    /// Size of the region in bytes
    pub size: u32,
}

impl WorkingArea {
    /// One past the last byte of the region.  Stack working areas grow down
    /// from here.
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Core registers the driver binds when launching a remote algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreReg {
    R0,
    R1,
    R2,
    R3,
    /// Stack pointer - bound to the spill slot in the stack working area
    Sp,
    /// Link register - bound to the trap instruction at the end of the blob
    Lr,
}

/// Registers read back after a remote algorithm ran to its trap.
///
/// r0 carries the algorithm's return code by convention; the rest are kept
/// for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
}

/// Host probe stack seam.
///
/// All methods return the crate [`Result`]; implementations map their own
/// failures onto the driver taxonomy (`NoWorkingArea` for allocator
/// exhaustion, `Transfer` for memory access failures, `Execution` for a
/// fault or timeout in [`Self::run_algorithm`]).
pub trait FlashTarget {
    /// Whether the target CPU is currently halted.
    ///
    /// Every driver operation that executes code checks this first and
    /// fails fast without touching scratch memory if the answer is no.
    fn is_halted(&mut self) -> bool;

    /// Request a scratch region of `size` bytes in target memory.
    ///
    /// Live regions never overlap.  Every granted region is released with
    /// exactly one [`Self::free_working_area`] call.
    fn alloc_working_area(&mut self, size: u32) -> Result<WorkingArea>;

    /// Release a region previously granted by [`Self::alloc_working_area`].
    fn free_working_area(&mut self, area: &WorkingArea) -> Result<()>;

    /// Read bytes from an absolute target address.
    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write bytes to an absolute target address.
    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Set the listed registers, resume the halted CPU at `entry`, and wait
    /// until it reaches the trap instruction bound to LR or the timeout
    /// expires.  Returns the final register state.
    ///
    /// The CPU is halted again when this returns, whatever the outcome.
    fn run_algorithm(
        &mut self,
        entry: u32,
        regs: &[(CoreReg, u32)],
        timeout_ms: u32,
    ) -> Result<RegisterFile>;
}
