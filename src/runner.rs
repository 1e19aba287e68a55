//! Remote algorithm execution with scoped scratch ownership.
//!
//! A [`Runner`] exclusively borrows the target connection for the duration
//! of one driver operation.  Every working area it hands out is recorded
//! and released when the runner drops, so teardown is exhaustive by
//! construction - there is no way to return early and leave a region
//! allocated, even when a later allocation in the same operation fails.
//!
//! Execution follows the flash driver calling convention: the first four
//! arguments in r0-r3, any excess spilled in order to the top of a
//! dedicated stack working area with SP bound to the spill address, and LR
//! bound to the trap instruction occupying the blob's last two bytes, with
//! the Thumb execute bit applied.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::{CoreReg, FlashTarget, RegisterFile, WorkingArea};
use crate::{Error, Result};

/// Thumb execute bit, ORed into code addresses the CPU branches to.
const THUMB_BIT: u32 = 0x1;

/// Size of the trap (breakpoint) instruction terminating every blob.
const TRAP_LEN: u32 = 2;

/// A code blob uploaded into a working area, ready to execute.
#[derive(Debug, Clone, Copy)]
pub struct LoadedCode {
    entry: u32,
    len: u32,
}

impl LoadedCode {
    /// Entry address of the blob in target memory.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Entry address with the Thumb execute bit applied, as stored in
    /// function pointers the algorithms branch through.
    pub fn thumb_entry(&self) -> u32 {
        self.entry | THUMB_BIT
    }

    /// Address bound to LR: the trap instruction in the blob's last two
    /// bytes, execute bit applied.
    fn return_address(&self) -> u32 {
        (self.entry + self.len - TRAP_LEN) | THUMB_BIT
    }
}

/// Scoped remote algorithm runner.
///
/// Short-lived by design: create one per driver operation, run the
/// operation's uploads and executions through it, drop it.  Dropping frees
/// every working area allocated through the scope, on success and failure
/// paths alike.
pub struct Runner<'t, T: FlashTarget> {
    target: &'t mut T,
    areas: Vec<WorkingArea>,
}

impl<'t, T: FlashTarget> Runner<'t, T> {
    /// Open a scope on a halted target.
    ///
    /// Fails with [`Error::NotHalted`] - before any scratch allocation -
    /// if the target is running.
    pub fn new(target: &'t mut T) -> Result<Self> {
        if !target.is_halted() {
            error!("Target not halted");
            return Err(Error::NotHalted);
        }

        Ok(Self {
            target,
            areas: Vec::new(),
        })
    }

    /// One-shot execution: upload `code`, run it with `args` and a
    /// dedicated stack of `stack_bytes`, and release everything before
    /// returning, whatever the outcome.
    ///
    /// The multi-call operations (erase, chunked programming) drive the
    /// scope methods directly instead, sharing uploads across executions.
    pub fn run(
        target: &'t mut T,
        code: &[u8],
        args: &[u32],
        stack_bytes: u32,
        timeout_ms: u32,
    ) -> Result<RegisterFile> {
        let mut runner = Self::new(target)?;
        let loaded = runner.load_code(code)?;
        let stack = runner.alloc(stack_bytes)?;
        runner.execute(&loaded, args, &stack, timeout_ms)
    }

    /// Allocate a working area, tracked by this scope.
    pub fn alloc(&mut self, size: u32) -> Result<WorkingArea> {
        match self.target.alloc_working_area(size) {
            Ok(area) => {
                trace!("Working area {size} bytes at {:#010X}", area.address);
                self.areas.push(area);
                Ok(area)
            }
            Err(err) => {
                warn!("No working area available for {size} byte allocation");
                Err(err)
            }
        }
    }

    /// Allocate a working area and fill it with `data`.
    ///
    /// The area stays tracked even if the fill fails, so it is still
    /// released on drop.
    pub fn upload(&mut self, data: &[u8]) -> Result<WorkingArea> {
        let area = self.alloc(data.len() as u32)?;
        self.target.write_memory(area.address, data)?;
        Ok(area)
    }

    /// Upload an algorithm blob and remember its entry point and length.
    pub fn load_code(&mut self, code: &[u8]) -> Result<LoadedCode> {
        let area = self.upload(code)?;
        debug!("Loaded {} byte algorithm at {:#010X}", code.len(), area.address);
        Ok(LoadedCode {
            entry: area.address,
            len: code.len() as u32,
        })
    }

    /// Read bytes from target memory.
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.target.read_memory(addr, buf)
    }

    /// Write bytes to target memory.
    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.target.write_memory(addr, data)
    }

    /// Execute a loaded algorithm with the given argument list.
    ///
    /// Arguments:
    /// - `code` - blob previously loaded with [`Self::load_code`]
    /// - `args` - machine word arguments; the first four bind to r0-r3,
    ///   the rest spill to the top of `stack`
    /// - `stack` - dedicated stack working area for this execution; SP is
    ///   bound to its top minus the spill
    /// - `timeout_ms` - bound on the execution itself
    ///
    /// Returns the final register file; r0 is the algorithm's return code.
    /// A fault or timeout maps to [`Error::Execution`].
    pub fn execute(
        &mut self,
        code: &LoadedCode,
        args: &[u32],
        stack: &WorkingArea,
        timeout_ms: u32,
    ) -> Result<RegisterFile> {
        const ARG_REGS: [CoreReg; 4] = [CoreReg::R0, CoreReg::R1, CoreReg::R2, CoreReg::R3];

        let mut regs: Vec<(CoreReg, u32)> = Vec::with_capacity(args.len() + 2);
        for (reg, value) in ARG_REGS.iter().zip(args) {
            regs.push((*reg, *value));
        }

        // Excess arguments go to the target-resident stack, in declared
        // order, at a fixed negative offset from its top.
        let spill = args.get(ARG_REGS.len()..).unwrap_or(&[]);
        let spill_bytes = (spill.len() * 4) as u32;
        if spill_bytes > stack.size {
            error!(
                "{} spilled words exceed {} byte stack area",
                spill.len(),
                stack.size
            );
            return Err(Error::OutOfRange);
        }
        let sp = stack.end() - spill_bytes;
        for (i, word) in spill.iter().enumerate() {
            self.target
                .write_memory(sp + (i as u32 * 4), &word.to_le_bytes())?;
        }

        regs.push((CoreReg::Lr, code.return_address()));
        regs.push((CoreReg::Sp, sp));

        trace!(
            "Executing algorithm at {:#010X}, {} register args, {} spilled",
            code.entry,
            args.len().min(ARG_REGS.len()),
            spill.len()
        );

        match self.target.run_algorithm(code.entry, &regs, timeout_ms) {
            Ok(out) => {
                debug!("Algorithm at {:#010X} returned r0={:#010X}", code.entry, out.r0);
                Ok(out)
            }
            Err(_) => {
                error!("Algorithm at {:#010X} faulted or timed out", code.entry);
                Err(Error::Execution)
            }
        }
    }
}

impl<T: FlashTarget> Drop for Runner<'_, T> {
    fn drop(&mut self) {
        for area in self.areas.drain(..) {
            if self.target.free_working_area(&area).is_err() {
                warn!("Leaked working area at {:#010X}", area.address);
            }
        }
    }
}
