//! Bank layout table and block-select mask mapping.
//!
//! Geometry is never discovered from hardware.  Each supported bank base
//! address has one row in [`LAYOUTS`] describing its sector runs, its band
//! thresholds and how a sector index maps to a bit position in the
//! per-band block-select masks the erase algorithm consumes.  The five
//! known hardware variants differ only in that index-to-bit mapping, never
//! in the banding algorithm itself, so a variant is a table row and
//! nothing else.
//!
//! Everything in this module is pure: no I/O, no target access.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::vec::Vec;

use crate::bank::{EraseState, Sector};

/// How a sector index becomes a bit position within one band's mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitBase {
    /// Bit position is the sector index itself
    Raw,
    /// Bit position is the index rebased past the low band
    LowRelative,
    /// Bit position is the index rebased past the mid band
    MidRelative,
}

/// Band thresholds, in classification priority order.
///
/// A sector index is classified by the first threshold it falls under:
/// low, then large, then mid, then high.  An index at or above a band's
/// threshold is never reconsidered for that band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub low_max: u32,
    pub large_max: u32,
    pub mid_max: u32,
    pub high_max: u32,
}

/// A run of equally sized sectors.
#[derive(Debug, Clone, Copy)]
pub struct SectorRun {
    pub count: u32,
    pub size: u32,
}

/// One hardware variant: a bank base address and everything keyed on it.
#[derive(Debug, Clone, Copy)]
pub struct BankLayout {
    /// Bank base address this row applies to
    pub base: u32,
    /// Sector runs, lowest offset first
    pub runs: &'static [SectorRun],
    /// Band thresholds for classification
    pub thresholds: Thresholds,
    /// Constant added to a low-band sector index to get its bit position
    pub low_shift: u32,
    /// Bit position strategy for the first large block band
    pub large_bits: BitBase,
    /// Bit position strategy for the mid band
    pub mid_bits: BitBase,
    /// Bit position strategy for the high band
    pub high_bits: BitBase,
}

/// Block-select masks for one erase call, one bit per selected sector.
///
/// `large_second` is part of the erase ABI but no known variant maps
/// sectors into it; it is always zero here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockSelect {
    pub low: u32,
    pub mid: u32,
    pub high: u32,
    pub large_first: u32,
    pub large_second: u32,
}

/// The known hardware variants.  Adding a variant is an entry here.
pub const LAYOUTS: &[BankLayout] = &[
    BankLayout {
        base: 0x0800_0000,
        runs: &[
            SectorRun { count: 3, size: 64 * 1024 },
            SectorRun { count: 3, size: 256 * 1024 },
        ],
        thresholds: Thresholds { low_max: 3, large_max: 6, mid_max: 0, high_max: 0 },
        low_shift: 1,
        large_bits: BitBase::LowRelative,
        mid_bits: BitBase::LowRelative,
        high_bits: BitBase::MidRelative,
    },
    BankLayout {
        base: 0x080F_0000,
        runs: &[
            SectorRun { count: 3, size: 64 * 1024 },
            SectorRun { count: 3, size: 256 * 1024 },
        ],
        thresholds: Thresholds { low_max: 3, large_max: 6, mid_max: 0, high_max: 0 },
        low_shift: 4,
        large_bits: BitBase::Raw,
        mid_bits: BitBase::LowRelative,
        high_bits: BitBase::MidRelative,
    },
    BankLayout {
        base: 0x08F0_0000,
        runs: &[SectorRun { count: 4, size: 16 * 1024 }],
        thresholds: Thresholds { low_max: 0, large_max: 0, mid_max: 0, high_max: 4 },
        low_shift: 4,
        large_bits: BitBase::Raw,
        mid_bits: BitBase::LowRelative,
        high_bits: BitBase::Raw,
    },
    BankLayout {
        base: 0x1800_0000,
        runs: &[
            SectorRun { count: 1, size: 32 * 1024 },
            SectorRun { count: 2, size: 64 * 1024 },
        ],
        thresholds: Thresholds { low_max: 3, large_max: 0, mid_max: 0, high_max: 0 },
        low_shift: 7,
        large_bits: BitBase::Raw,
        mid_bits: BitBase::Raw,
        high_bits: BitBase::Raw,
    },
    BankLayout {
        base: 0x18F0_0000,
        runs: &[SectorRun { count: 2, size: 16 * 1024 }],
        thresholds: Thresholds { low_max: 0, large_max: 0, mid_max: 2, high_max: 0 },
        low_shift: 4,
        large_bits: BitBase::Raw,
        mid_bits: BitBase::Raw,
        high_bits: BitBase::Raw,
    },
];

/// Look up the layout row for a bank base address.
pub fn layout_for(base: u32) -> Option<&'static BankLayout> {
    LAYOUTS.iter().find(|layout| layout.base == base)
}

impl BankLayout {
    /// Number of sectors in the bank.
    pub fn sector_count(&self) -> u32 {
        self.runs.iter().map(|run| run.count).sum()
    }

    /// Total bank size in bytes.
    pub fn total_size(&self) -> u32 {
        self.runs.iter().map(|run| run.count * run.size).sum()
    }

    /// Expand the sector runs into a sector table with cumulative offsets.
    /// Erase state starts unknown, nothing protected.
    pub fn build_sectors(&self) -> Vec<Sector> {
        let mut sectors = Vec::with_capacity(self.sector_count() as usize);
        let mut offset = 0;
        for run in self.runs {
            for _ in 0..run.count {
                sectors.push(Sector {
                    offset,
                    size: run.size,
                    erased: EraseState::Unknown,
                    protected: false,
                });
                offset += run.size;
            }
        }
        sectors
    }

    /// Map the inclusive sector index range to block-select masks.
    ///
    /// Every index in `[first, last]` lands in exactly one band by the
    /// priority chain low, large, mid, high and contributes one bit to
    /// that band's mask.
    pub fn block_select(&self, first: u32, last: u32) -> BlockSelect {
        let t = &self.thresholds;
        let mut select = BlockSelect::default();

        for i in first..=last {
            if i < t.low_max {
                select.low |= 1 << (i + self.low_shift);
            } else if i < t.large_max {
                select.large_first |= 1 << self.bit_for(i, self.large_bits);
            } else if i < t.mid_max {
                select.mid |= 1 << self.bit_for(i, self.mid_bits);
            } else if i < t.high_max {
                select.high |= 1 << self.bit_for(i, self.high_bits);
            }
        }

        select
    }

    fn bit_for(&self, index: u32, base: BitBase) -> u32 {
        match base {
            BitBase::Raw => index,
            BitBase::LowRelative => index - self.thresholds.low_max,
            BitBase::MidRelative => index - self.thresholds.mid_max,
        }
    }
}
