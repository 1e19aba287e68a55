//! Fixed-layout device descriptor (SSD) blob.
//!
//! Every remote algorithm takes the address of a resident copy of this
//! descriptor in r0, and some mutate it - the init algorithm reports
//! discovered block counts into it.  The driver therefore uploads a fresh
//! copy into a working area before each call and downloads it again after
//! the calls whose algorithms write it back (init, erase, program).
//!
//! The serialized form is 19 little-endian words; see the field order in
//! [`SsdConfig::to_bytes`].  The two mode flags stay separate words in the
//! blob even though the host side folds them into one [`SsdFlags`] value.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Flash controller register base, fixed for the supported family.
pub const REG_BASE: u32 = 0xFFFE_0000;

/// Main array base as the controller sees it.
pub const MAIN_ARRAY_BASE: u32 = 0x0800_0000;

/// UTest array base.
pub const UTEST_ARRAY_BASE: u32 = 0x0040_0000;

/// Smallest programmable unit in bytes.  The program algorithm's stack
/// cost scales with the number of these units per chunk.
pub const PROGRAMMABLE_SIZE: u32 = 0x80;

bitflags! {
    /// Descriptor mode flags.
    ///
    /// Serialized as two separate words to keep the blob layout fixed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SsdFlags: u32 {
        /// Algorithms use the main controller interface
        const MAIN_INTERFACE = 1 << 0;
        /// Background debug mode stays enabled during operations
        const BDM_ENABLE = 1 << 1;
    }
}

/// Block counts for one address space, by block size class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub n_16k: u32,
    pub n_32k: u32,
    pub n_64k: u32,
    pub n_128k: u32,
}

impl BlockInfo {
    fn put(&self, out: &mut BlobWriter<'_>) {
        out.word(self.n_16k);
        out.word(self.n_32k);
        out.word(self.n_64k);
        out.word(self.n_128k);
    }

    fn take(input: &mut BlobReader<'_>) -> Self {
        Self {
            n_16k: input.word(),
            n_32k: input.word(),
            n_64k: input.word(),
            n_128k: input.word(),
        }
    }
}

/// Device descriptor consumed by every remote algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsdConfig {
    /// Flash controller register base
    pub reg_base: u32,
    /// Main array base address
    pub main_array_base: u32,
    /// UTest array base address
    pub utest_array_base: u32,
    /// Smallest programmable unit in bytes
    pub programmable_size: u32,
    /// Low address space block counts
    pub low_blocks: BlockInfo,
    /// Mid address space block counts
    pub mid_blocks: BlockInfo,
    /// High address space block counts
    pub high_blocks: BlockInfo,
    /// Number of large blocks
    pub n_large_blocks: u32,
    /// Mode flags
    pub flags: SsdFlags,
}

impl SsdConfig {
    /// Serialized size in bytes: 19 words.
    pub const SIZE: usize = 76;

    /// Descriptor the probe sequence uploads before running the init
    /// algorithm: fixed bases, zeroed block counts (init reports the
    /// discovered values into them), both mode flags set.
    pub fn for_bank() -> Self {
        Self {
            reg_base: REG_BASE,
            main_array_base: MAIN_ARRAY_BASE,
            utest_array_base: UTEST_ARRAY_BASE,
            programmable_size: PROGRAMMABLE_SIZE,
            low_blocks: BlockInfo::default(),
            mid_blocks: BlockInfo::default(),
            high_blocks: BlockInfo::default(),
            n_large_blocks: 0,
            flags: SsdFlags::MAIN_INTERFACE | SsdFlags::BDM_ENABLE,
        }
    }

    /// Serialize to the fixed blob layout, target byte order.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut out = BlobWriter { buf: &mut buf, at: 0 };

        out.word(self.reg_base);
        out.word(self.main_array_base);
        out.word(self.utest_array_base);
        out.word(self.programmable_size);
        self.low_blocks.put(&mut out);
        self.mid_blocks.put(&mut out);
        self.high_blocks.put(&mut out);
        out.word(self.n_large_blocks);
        out.word(self.flags.contains(SsdFlags::MAIN_INTERFACE) as u32);
        out.word(self.flags.contains(SsdFlags::BDM_ENABLE) as u32);

        buf
    }

    /// Deserialize from the fixed blob layout.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let mut input = BlobReader { buf, at: 0 };

        let reg_base = input.word();
        let main_array_base = input.word();
        let utest_array_base = input.word();
        let programmable_size = input.word();
        let low_blocks = BlockInfo::take(&mut input);
        let mid_blocks = BlockInfo::take(&mut input);
        let high_blocks = BlockInfo::take(&mut input);
        let n_large_blocks = input.word();

        let mut flags = SsdFlags::empty();
        flags.set(SsdFlags::MAIN_INTERFACE, input.word() != 0);
        flags.set(SsdFlags::BDM_ENABLE, input.word() != 0);

        Self {
            reg_base,
            main_array_base,
            utest_array_base,
            programmable_size,
            low_blocks,
            mid_blocks,
            high_blocks,
            n_large_blocks,
            flags,
        }
    }

    /// Dump the descriptor at debug level, field by field.  Used after the
    /// init algorithm wrote its discovered values back.
    pub fn log_fields(&self) {
        debug!("SSD reg_base          = {:#010X}", self.reg_base);
        debug!("SSD main_array_base   = {:#010X}", self.main_array_base);
        debug!("SSD utest_array_base  = {:#010X}", self.utest_array_base);
        debug!("SSD programmable_size = {:#010X}", self.programmable_size);
        debug!("SSD low_blocks        = {:?}", self.low_blocks);
        debug!("SSD mid_blocks        = {:?}", self.mid_blocks);
        debug!("SSD high_blocks       = {:?}", self.high_blocks);
        debug!("SSD n_large_blocks    = {:#010X}", self.n_large_blocks);
        debug!("SSD flags             = {:?}", self.flags);
    }
}

struct BlobWriter<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl BlobWriter<'_> {
    fn word(&mut self, value: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&value.to_le_bytes());
        self.at += 4;
    }
}

struct BlobReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl BlobReader<'_> {
    fn word(&mut self) -> u32 {
        let at = self.at;
        self.at += 4;
        u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }
}
