//! Block erase orchestration.
//!
//! An erase is four phases against the target: best-effort unlock of every
//! block group the sector range maps into, one erase-start algorithm run
//! with the block-select masks, a bounded status-poll loop, and the final
//! verdict.  All scratch lives in one runner scope; the erase stack area
//! is shared with the status polls.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::bank::lock::BlockSpace;
use crate::bank::{
    EraseState, FlashBank, CONTEXT_DATA_BYTES, ERASE_MAIN_SPACE, MODE_OP_ERASE, STATUS_IN_PROGRESS,
    STATUS_OK,
};
use crate::descriptor::SsdConfig;
use crate::io::FlashTarget;
use crate::runner::Runner;
use crate::{Error, Result};

/// Stack area for the erase-start call: room for the algorithm itself plus
/// the three spilled mask arguments at the top.
const ERASE_STACK_BYTES: u32 = 52;

impl FlashBank<'_> {
    /// Erase an inclusive sector index range.
    ///
    /// Unlocks every affected block group first.  The cleared lock bits
    /// are deliberately not restored afterwards: the bank stays unlocked,
    /// which a following program pass needs anyway.
    ///
    /// On success every sector in range is marked erased; on any failure
    /// no sector is, and all scratch memory has been released.
    pub fn erase<T: FlashTarget>(&mut self, target: &mut T, first: u32, last: u32) -> Result<()> {
        if !target.is_halted() {
            error!("Target not halted");
            return Err(Error::NotHalted);
        }
        let layout = self.require_probed()?;
        if first > last || last >= layout.sector_count() {
            error!(
                "Sector range {first}..={last} outside bank of {} sectors",
                layout.sector_count()
            );
            return Err(Error::OutOfRange);
        }

        info!("Erasing sectors {first}..={last}");
        let select = layout.block_select(first, last);
        debug!(
            "Block select: low={:#010X} mid={:#010X} high={:#010X} large={:#010X}/{:#010X}",
            select.low, select.mid, select.high, select.large_first, select.large_second
        );

        // Unlock the affected groups.
        let groups = [
            (select.low, BlockSpace::Low),
            (select.mid, BlockSpace::Mid),
            (select.high, BlockSpace::High),
            (select.large_first, BlockSpace::LargeFirst),
        ];
        for (mask, space) in groups {
            if mask == 0 {
                continue;
            }
            let lock_state = self.get_lock(target, space)?;
            self.set_lock(target, space, lock_state & space.unlock_mask())?;
        }

        let mut runner = Runner::new(target)?;
        let ssd_area = runner.upload(&self.ssd_bytes())?;
        let erase_code = runner.load_code(self.algorithms().erase)?;
        let stack = runner.alloc(ERASE_STACK_BYTES)?;
        runner.execute(
            &erase_code,
            &[
                ssd_area.address,
                ERASE_MAIN_SPACE,
                select.low,
                select.mid,
                select.high,
                select.large_first,
                select.large_second,
            ],
            &stack,
            self.config().algorithm_timeout_ms,
        )?;

        // Poll the status algorithm until it reports a terminal code.
        let status_code = runner.load_code(self.algorithms().check_status)?;
        let ctx = runner.alloc(CONTEXT_DATA_BYTES)?;
        let result = runner.alloc(8)?;

        let mut polls = 0u32;
        let verdict = loop {
            runner.write_memory(result.address, &[0u8; 8])?;
            let regs = runner.execute(
                &status_code,
                &[ssd_area.address, MODE_OP_ERASE, result.address, ctx.address],
                &stack,
                self.config().algorithm_timeout_ms,
            )?;
            if regs.r0 != STATUS_IN_PROGRESS {
                break regs.r0;
            }
            polls += 1;
            if polls >= self.config().max_status_polls {
                error!("Erase still in progress after {polls} status polls, giving up");
                return Err(Error::Execution);
            }
        };

        // The status algorithm writes discovered state back into the
        // descriptor and its verdict into the two-word result buffer.
        let mut blob = [0u8; SsdConfig::SIZE];
        runner.read_memory(ssd_area.address, &mut blob)?;
        let mut words = [0u8; 8];
        runner.read_memory(result.address, &mut words)?;
        drop(runner);

        self.set_ssd(SsdConfig::from_bytes(&blob));
        let op_result = u32::from_le_bytes([words[0], words[1], words[2], words[3]]);
        let detail = u32::from_le_bytes([words[4], words[5], words[6], words[7]]);
        debug!("Erase verdict: r0={verdict:#010X} result={op_result:#010X} detail={detail:#010X}");

        if verdict == STATUS_OK && op_result == STATUS_OK {
            for sector in &mut self.sectors_mut()[first as usize..=last as usize] {
                sector.erased = EraseState::Erased;
            }
            info!("Erased sectors {first}..={last}");
            Ok(())
        } else {
            let code = if op_result != STATUS_OK { op_result } else { verdict };
            error!("Device reported erase failure {code:#010X}");
            Err(Error::Device(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::support::{self, MockTarget, Step};
    use crate::io::CoreReg;

    fn probed_bank(target: &mut MockTarget) -> FlashBank<'static> {
        let mut bank = support::bank(0x0800_0000);
        bank.probe(target).unwrap();
        bank
    }

    #[test]
    fn erase_polls_until_terminal_ok() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.script = [
            Step::store(0, 0xFFFF_FFFF),      // get_lock Low
            Step::ret(0),                     // set_lock Low
            Step::ret(0),                     // erase start
            Step::ret(STATUS_IN_PROGRESS),
            Step::ret(STATUS_IN_PROGRESS),
            Step::ret(STATUS_OK),
        ]
        .into_iter()
        .collect();

        bank.erase(&mut target, 0, 2).unwrap();

        // Probe, two lock calls, erase start, three status polls.
        assert_eq!(target.runs, 7);
        assert!(bank.sectors()[..3]
            .iter()
            .all(|s| s.erased == EraseState::Erased));
        assert!(bank.sectors()[3..]
            .iter()
            .all(|s| s.erased == EraseState::Unknown));
        assert!(target.balanced());
    }

    #[test]
    fn erase_reports_device_error_and_marks_nothing() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.script = [
            Step::store(0, 0xFFFF_FFFF),
            Step::ret(0),
            Step::ret(0),
            Step::ret(STATUS_IN_PROGRESS),
            Step::ret(7), // terminal error code
        ]
        .into_iter()
        .collect();

        assert_eq!(bank.erase(&mut target, 0, 2), Err(Error::Device(7)));

        // Exactly two status polls after the erase start.
        assert_eq!(target.runs, 6);
        assert!(bank
            .sectors()
            .iter()
            .all(|s| s.erased == EraseState::Unknown));
        assert!(target.balanced());
    }

    #[test]
    fn erase_gives_up_after_configured_poll_bound() {
        let mut target = MockTarget::halted();
        let mut config = crate::bank::BankConfig::new(0x0800_0000, 0x100000);
        config.max_status_polls = 3;
        let mut bank = FlashBank::new(config, support::algorithms());
        bank.probe(&mut target).unwrap();

        // A device that never reaches a terminal status.
        target.script = core::iter::repeat(Step::ret(STATUS_IN_PROGRESS))
            .take(32)
            .collect();

        assert_eq!(bank.erase(&mut target, 3, 5), Err(Error::Execution));
        assert!(target.balanced());
    }

    #[test]
    fn erase_unlock_only_clears_lock_bits() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.script = [
            Step::store(0, 0xFFFF_FFFF),
            Step::ret(0),
            Step::ret(0),
            Step::ret(STATUS_OK),
        ]
        .into_iter()
        .collect();

        bank.erase(&mut target, 0, 1).unwrap();

        // Run 2 is the set_lock call; its r2 carries the new bitmap.
        let get_lock = 0xFFFF_FFFFu32;
        let set_lock = MockTarget::reg(&target.reg_log[2], CoreReg::R2).unwrap();
        assert_eq!(set_lock & !get_lock, 0);
        assert_eq!(set_lock, 0xFFFF_FC00);
    }

    #[test]
    fn erase_passes_masks_in_registers_and_stack() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        target.script = [
            Step::store(0, 0xFFFF_FFFF), // get_lock Low
            Step::ret(0),                // set_lock Low
            Step::store(0, 0xFFFF_FFFF), // get_lock LargeFirst
            Step::ret(0),                // set_lock LargeFirst
            Step::ret(0),                // erase start
            Step::ret(STATUS_OK),
        ]
        .into_iter()
        .collect();

        bank.erase(&mut target, 0, 5).unwrap();

        // Run 5 is the erase start: low and mid masks in r2/r3, the rest
        // spilled to the stack area in declared order.
        let regs = &target.reg_log[5];
        assert_eq!(MockTarget::reg(regs, CoreReg::R2), Some(0b1110));
        assert_eq!(MockTarget::reg(regs, CoreReg::R3), Some(0));
        let sp = MockTarget::reg(regs, CoreReg::Sp).unwrap();
        assert_eq!(target.read_word(sp), 0); // high
        assert_eq!(target.read_word(sp + 4), 0b111); // large first
        assert_eq!(target.read_word(sp + 8), 0); // large second
        assert!(target.balanced());
    }

    #[test]
    fn erase_needs_halted_target_and_probed_bank() {
        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        let allocs_after_probe = target.allocs;

        target.halted = false;
        assert_eq!(bank.erase(&mut target, 0, 1), Err(Error::NotHalted));
        assert_eq!(target.allocs, allocs_after_probe);

        let mut fresh = support::bank(0x0800_0000);
        let mut target = MockTarget::halted();
        assert_eq!(fresh.erase(&mut target, 0, 1), Err(Error::NotProbed));

        let mut target = MockTarget::halted();
        let mut bank = probed_bank(&mut target);
        assert_eq!(bank.erase(&mut target, 4, 2), Err(Error::OutOfRange));
        assert_eq!(bank.erase(&mut target, 0, 6), Err(Error::OutOfRange));
    }

    #[test]
    fn erase_scratch_balanced_on_injected_failures() {
        // Allocation order after probe's three: get_lock 4, set_lock 3,
        // then ssd, erase code, stack, status code, ctx, result.
        for fail_at in 3..16 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_alloc_at = Some(fail_at);

            assert!(bank.erase(&mut target, 0, 2).is_err());
            assert!(target.balanced(), "unbalanced with alloc {fail_at} failed");
        }

        for fail_at in 1..5 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_run_at = Some(fail_at);

            assert_eq!(bank.erase(&mut target, 0, 2), Err(Error::Execution));
            assert!(target.balanced(), "unbalanced with run {fail_at} failed");
        }

        for fail_at in 2..12 {
            let mut target = MockTarget::halted();
            let mut bank = probed_bank(&mut target);
            target.fail_write_at = Some(fail_at);

            assert!(bank.erase(&mut target, 0, 2).is_err());
            assert!(target.balanced(), "unbalanced with write {fail_at} failed");
        }
    }
}
