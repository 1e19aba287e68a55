//! Chunked flash programming.
//!
//! The program algorithm consumes at most one chunk of source data per
//! invocation, staged in a source working area on the target.  A write is
//! therefore a loop: fill the source area, run the algorithm at the next
//! destination, advance.  Everything - descriptor, algorithm, source,
//! context and stack areas - is allocated once per write call and lives in
//! one runner scope.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::bank::{EraseState, FlashBank, CONTEXT_DATA_BYTES};
use crate::descriptor::{SsdConfig, PROGRAMMABLE_SIZE};
use crate::io::{FlashTarget, WorkingArea};
use crate::runner::{LoadedCode, Runner};
use crate::{Error, Result};

/// Source working area size: the most one program invocation consumes.
pub const CHUNK_SIZE: u32 = 0x400;

/// Base stack cost of the program algorithm, before the per-unit cost.
const WRITE_STACK_BYTES: u32 = 0x200;

/// Stack cost per programmable unit in the chunk.
const PER_UNIT_STACK_BYTES: u32 = 0x70;

/// Normal programming; the factory margin path is never used.
const FACTORY_PROGRAM_OFF: u32 = 0;

/// Offset in the context area of the helper entry pointer the program
/// algorithm branches through (BLX) to check controller status.
const CONTEXT_HELPER_OFFSET: u32 = 32;

/// Split a byte count into (bytes per full iteration, full iteration
/// count, tail bytes).
fn chunk_plan(count: u32) -> (u32, u32, u32) {
    if count > CHUNK_SIZE {
        (CHUNK_SIZE, count / CHUNK_SIZE, count % CHUNK_SIZE)
    } else {
        (count, 1, 0)
    }
}

impl FlashBank<'_> {
    /// Program `buffer` at `offset` from the bank base.
    ///
    /// All or nothing: any failure aborts the whole write with
    /// [`Error::Program`] carrying the byte offset of the first chunk that
    /// did not complete, and all scratch memory released.  Bytes before
    /// that offset have been programmed; bytes at or after it have not.
    ///
    /// Successfully programmed sectors are marked dirty - they are no
    /// longer known to be erased.
    pub fn write<T: FlashTarget>(
        &mut self,
        target: &mut T,
        buffer: &[u8],
        offset: u32,
    ) -> Result<()> {
        if !target.is_halted() {
            error!("Target not halted");
            return Err(Error::NotHalted);
        }
        self.require_probed()?;

        let count = buffer.len() as u32;
        if count == 0 {
            trace!("Zero length write, nothing to do");
            return Ok(());
        }
        if offset.checked_add(count).is_none_or(|end| end > self.size()) {
            error!(
                "Write of {count} bytes at {offset:#010X} exceeds {} byte bank",
                self.size()
            );
            return Err(Error::OutOfRange);
        }

        info!("Writing {count} bytes at offset {offset:#010X}");
        self.log_covered_sectors(offset, count);

        let (size, chunks, tail) = chunk_plan(count);
        debug!("{chunks} iterations of {size} bytes, {tail} byte tail");

        let mut runner = Runner::new(target)?;
        let ssd_area = runner.upload(&self.ssd_bytes())?;
        let code = runner.load_code(self.algorithms().program)?;
        let source = runner.alloc(CHUNK_SIZE)?;

        // The program algorithm calls its status helper through a function
        // pointer stored in the context area.
        let ctx = runner.alloc(CONTEXT_DATA_BYTES)?;
        runner.write_memory(
            ctx.address + CONTEXT_HELPER_OFFSET,
            &code.thumb_entry().to_le_bytes(),
        )?;

        let stack_bytes = WRITE_STACK_BYTES + (CHUNK_SIZE / PROGRAMMABLE_SIZE) * PER_UNIT_STACK_BYTES;
        let stack = runner.alloc(stack_bytes)?;

        for i in 0..chunks {
            let at = i * CHUNK_SIZE;
            let chunk = &buffer[at as usize..][..size as usize];
            self.program_chunk(&mut runner, &code, ssd_area.address, &source, &ctx, &stack, chunk, offset + at)
                .map_err(|err| Self::program_fault(err, offset + at))?;
        }
        if tail != 0 {
            let at = chunks * CHUNK_SIZE;
            self.program_chunk(
                &mut runner,
                &code,
                ssd_area.address,
                &source,
                &ctx,
                &stack,
                &buffer[at as usize..],
                offset + at,
            )
            .map_err(|err| Self::program_fault(err, offset + at))?;
        }

        let mut blob = [0u8; SsdConfig::SIZE];
        runner.read_memory(ssd_area.address, &mut blob)?;
        drop(runner);
        self.set_ssd(SsdConfig::from_bytes(&blob));

        // Programmed sectors are no longer known erased.
        let end = offset + count;
        for sector in self.sectors_mut() {
            if sector.offset < end && offset < sector.offset + sector.size {
                sector.erased = EraseState::Dirty;
            }
        }

        info!("Wrote {count} bytes at offset {offset:#010X}");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn program_chunk<T: FlashTarget>(
        &self,
        runner: &mut Runner<'_, T>,
        code: &LoadedCode,
        ssd_addr: u32,
        source: &WorkingArea,
        ctx: &WorkingArea,
        stack: &WorkingArea,
        chunk: &[u8],
        offset: u32,
    ) -> Result<()> {
        runner.write_memory(source.address, chunk)?;

        let dest = self.config().base + offset;
        trace!("Programming {} bytes to {dest:#010X}", chunk.len());
        runner.execute(
            code,
            &[
                ssd_addr,
                FACTORY_PROGRAM_OFF,
                dest,
                chunk.len() as u32,
                source.address,
                ctx.address,
            ],
            stack,
            self.config().program_timeout_ms,
        )?;

        Ok(())
    }

    fn program_fault(err: Error, offset: u32) -> Error {
        error!("Programming failed at offset {offset:#010X}: {err:?}");
        Error::Program(offset)
    }

    fn log_covered_sectors(&self, offset: u32, count: u32) {
        let end = offset + count;
        for (index, sector) in self.sectors().iter().enumerate() {
            if sector.offset < end && offset < sector.offset + sector.size {
                info!(
                    "Covers sector {index}: offset {:#010X}, {} KiB, {:?}",
                    sector.offset,
                    sector.size / 1024,
                    sector.erased
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::support::{self, MockTarget};
    use crate::io::CoreReg;

    fn probed_bank(target: &mut MockTarget) -> FlashBank<'static> {
        let mut bank = support::bank(0x0800_0000);
        bank.probe(target).unwrap();
        bank
    }

    #[test]
    fn chunk_plan_splits_counts() {
        assert_eq!(chunk_plan(2500), (1024, 2, 452));
        assert_eq!(chunk_plan(1024), (1024, 1, 0));
        assert_eq!(chunk_plan(800), (800, 1, 0));
    }

    #[test]
    fn write_programs_chunks_then_tail() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);

        let buffer: alloc::vec::Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        bank.write(&mut target, &buffer, 0x100).unwrap();

        // Probe plus three program executions.
        assert_eq!(target.runs, 4);
        for (i, (dest, len)) in [(0x0800_0100, 1024), (0x0800_0500, 1024), (0x0800_0900, 452)]
            .iter()
            .enumerate()
        {
            let regs = &target.reg_log[i + 1];
            assert_eq!(MockTarget::reg(regs, CoreReg::R1), Some(0));
            assert_eq!(MockTarget::reg(regs, CoreReg::R2), Some(*dest));
            assert_eq!(MockTarget::reg(regs, CoreReg::R3), Some(*len));
        }
        assert!(target.balanced());
    }

    #[test]
    fn write_stages_source_and_context_through_the_stack() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);

        let buffer = [0xA5u8; 800];
        bank.write(&mut target, &buffer, 0).unwrap();

        assert_eq!(target.runs, 2);
        let regs = &target.reg_log[1];
        assert_eq!(MockTarget::reg(regs, CoreReg::R3), Some(800));

        // Spilled words: source area address, then context area address.
        let sp = MockTarget::reg(regs, CoreReg::Sp).unwrap();
        let source_addr = target.read_word(sp);
        let ctx_addr = target.read_word(sp + 4);
        assert_eq!(target.mem.get(&source_addr).copied(), Some(0xA5));
        assert_eq!(target.mem.get(&(source_addr + 799)).copied(), Some(0xA5));

        // The context area carries the algorithm's Thumb entry at +32.
        let lr = MockTarget::reg(regs, CoreReg::Lr).unwrap();
        let entry = (lr & !1) - (support::PROGRAM_CODE.len() as u32 - 2);
        assert_eq!(target.read_word(ctx_addr + 32), entry | 1);
    }

    #[test]
    fn write_marks_covered_sectors_dirty() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);

        // Spans the end of sector 0 and the start of sector 1.
        bank.write(&mut target, &[0u8; 2048], 63 * 1024).unwrap();

        assert_eq!(bank.sectors()[0].erased, EraseState::Dirty);
        assert_eq!(bank.sectors()[1].erased, EraseState::Dirty);
        assert!(bank.sectors()[2..]
            .iter()
            .all(|s| s.erased == EraseState::Unknown));
    }

    #[test]
    fn write_reports_offset_of_first_failed_chunk() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.fail_run_at = Some(2); // second program execution

        let buffer = [0u8; 2500];
        assert_eq!(
            bank.write(&mut target, &buffer, 0),
            Err(Error::Program(1024))
        );
        assert!(target.balanced());

        // A failed source transfer reports the same way.
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.fail_write_at = Some(8); // second chunk's source fill
        assert_eq!(
            bank.write(&mut target, &buffer, 0),
            Err(Error::Program(1024))
        );
        assert!(target.balanced());
    }

    #[test]
    fn write_validates_before_touching_scratch() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        let allocs_after_probe = target.allocs;

        target.halted = false;
        assert_eq!(
            bank.write(&mut target, &[0u8; 16], 0),
            Err(Error::NotHalted)
        );
        target.halted = true;
        assert_eq!(
            bank.write(&mut target, &[0u8; 16], 960 * 1024),
            Err(Error::OutOfRange)
        );
        assert_eq!(target.allocs, allocs_after_probe);

        let mut fresh = support::bank(0x0800_0000);
        assert_eq!(
            fresh.write(&mut target, &[0u8; 16], 0),
            Err(Error::NotProbed)
        );
    }

    #[test]
    fn write_scratch_balanced_on_injected_failures() {
        // Allocation order after probe's three: descriptor, program code,
        // source, context, stack.
        for fail_at in 3..8 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_alloc_at = Some(fail_at);

            assert_eq!(
                bank.write(&mut target, &[0u8; 2500], 0),
                Err(Error::NoWorkingArea)
            );
            assert!(target.balanced(), "unbalanced with alloc {fail_at} failed");
        }

        for fail_at in 2..14 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_write_at = Some(fail_at);

            assert!(bank.write(&mut target, &[0u8; 2500], 0).is_err());
            assert!(target.balanced(), "unbalanced with write {fail_at} failed");
        }

        for fail_at in 1..4 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_run_at = Some(fail_at);

            assert!(bank.write(&mut target, &[0u8; 2500], 0).is_err());
            assert!(target.balanced(), "unbalanced with run {fail_at} failed");
        }
    }
}
