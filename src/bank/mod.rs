//! Flash bank state and operations.
//!
//! A [`FlashBank`] owns everything the driver knows about one bank: the
//! configured base and size, the device descriptor the remote algorithms
//! consume, and the sector table built during probe.  The operations -
//! probe, erase, write, lock query/update, protect - each borrow the
//! target connection for their duration and run entirely through a
//! [`crate::runner::Runner`] scope.
//!
//! Lock query/update, erase and chunked programming live in this module's
//! children; probe and the pass-through entry points live here.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

mod erase;
mod lock;
mod write;

pub use lock::BlockSpace;
pub use write::CHUNK_SIZE;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::descriptor::SsdConfig;
use crate::geometry::{self, BankLayout};
use crate::io::FlashTarget;
use crate::runner::Runner;
use crate::{Error, Result};

/// Default per-algorithm execution timeout.
pub const DEFAULT_ALGORITHM_TIMEOUT_MS: u32 = 5_000;

/// Default programming execution timeout.  Effectively unbounded: one
/// program call can legitimately run for minutes on this hardware.
pub const DEFAULT_PROGRAM_TIMEOUT_MS: u32 = 2_000_000_000;

/// Default bound on erase status polls before the device is declared hung.
pub const DEFAULT_MAX_STATUS_POLLS: u32 = 10_000;

/// Terminal status code meaning the operation completed cleanly.
pub const STATUS_OK: u32 = 0;

/// Status algorithm r0 while the operation is still running.
pub const STATUS_IN_PROGRESS: u32 = 1;

/// Mode argument selecting erase progress in the status algorithm.
pub(crate) const MODE_OP_ERASE: u32 = 1;

/// Erase option selecting the main array.
pub(crate) const ERASE_MAIN_SPACE: u32 = 0;

/// Size of the context data area the status and program algorithms use.
pub(crate) const CONTEXT_DATA_BYTES: u32 = 36;

const INIT_STACK_BYTES: u32 = 0x200;

/// The vendor algorithm blobs one bank runs.
///
/// Each blob is position independent code ending in a trap (breakpoint)
/// instruction in its last two bytes.  Blobs are built from the vendor
/// flash driver and supplied by the embedding application; they must
/// follow the status codes documented on [`STATUS_OK`] and
/// [`STATUS_IN_PROGRESS`].
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmSet<'d> {
    /// Initializes the controller; reports discovered counts into the
    /// descriptor
    pub init: &'d [u8],
    /// Starts a main array erase of the selected blocks
    pub erase: &'d [u8],
    /// Reports erase progress and verdict
    pub check_status: &'d [u8],
    /// Reads one block group's lock bitmap through an out-pointer
    pub get_lock: &'d [u8],
    /// Writes one block group's lock bitmap
    pub set_lock: &'d [u8],
    /// Programs up to one chunk from a source working area
    pub program: &'d [u8],
}

/// Per-bank configuration.  Config only - nothing here touches the target.
#[derive(Debug, Clone, Copy)]
pub struct BankConfig {
    /// Bank base address; must match a geometry table row
    pub base: u32,
    /// Configured bank size in bytes; replaced by the table value on probe
    pub size: u32,
    /// Timeout for init, lock, erase-start and status executions
    pub algorithm_timeout_ms: u32,
    /// Timeout for each program execution
    pub program_timeout_ms: u32,
    /// Bound on status polls per erase before giving up
    pub max_status_polls: u32,
}

impl BankConfig {
    /// Config with the default timeouts and poll bound.
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            algorithm_timeout_ms: DEFAULT_ALGORITHM_TIMEOUT_MS,
            program_timeout_ms: DEFAULT_PROGRAM_TIMEOUT_MS,
            max_status_polls: DEFAULT_MAX_STATUS_POLLS,
        }
    }
}

/// Erase state of one sector, tracked host-side for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseState {
    /// Not known to be erased or written since probe
    Unknown,
    /// Covered by a completed erase
    Erased,
    /// Written since the last known erase
    Dirty,
}

/// One sector of the bank.
#[derive(Debug, Clone, Copy)]
pub struct Sector {
    /// Byte offset from the bank base
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// Host-side erase tracking
    pub erased: EraseState,
    /// Host-side protection tracking; not enforced by this driver
    pub protected: bool,
}

/// One flash bank and the operations on it.
pub struct FlashBank<'d> {
    config: BankConfig,
    algorithms: AlgorithmSet<'d>,
    size: u32,
    ssd: SsdConfig,
    sectors: Vec<Sector>,
    layout: Option<&'static BankLayout>,
    probed: bool,
}

impl<'d> FlashBank<'d> {
    /// Create a bank from config and the vendor algorithm blobs.
    ///
    /// Config only: the target is first touched by [`Self::probe`].
    pub fn new(config: BankConfig, algorithms: AlgorithmSet<'d>) -> Self {
        Self {
            size: config.size,
            config,
            algorithms,
            ssd: SsdConfig::for_bank(),
            sectors: Vec::new(),
            layout: None,
            probed: false,
        }
    }

    /// Bank base address.
    pub fn base(&self) -> u32 {
        self.config.base
    }

    /// Effective bank size: the configured size until probe, the geometry
    /// table value afterwards.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The sector table.  Empty until probed.
    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// Whether a probe has completed.
    pub fn is_probed(&self) -> bool {
        self.probed
    }

    /// Current descriptor state, including fields the init and status
    /// algorithms reported back.
    pub fn ssd(&self) -> &SsdConfig {
        &self.ssd
    }

    /// Probe the bank: run the init algorithm and build the sector table
    /// from the geometry table row for the configured base address.
    ///
    /// The init algorithm reports discovered block counts into the
    /// descriptor; they are kept for diagnostics, but geometry always
    /// comes from the table.
    pub fn probe<T: FlashTarget>(&mut self, target: &mut T) -> Result<()> {
        self.probed = false;

        let Some(layout) = geometry::layout_for(self.config.base) else {
            error!("No known layout for bank base {:#010X}", self.config.base);
            return Err(Error::UnknownBank);
        };

        info!(
            "flash: {} KiB @ {:#010X}",
            self.config.size / 1024,
            self.config.base
        );

        self.ssd = SsdConfig::for_bank();
        let mut runner = Runner::new(target)?;
        let ssd_area = runner.upload(&self.ssd.to_bytes())?;
        let init = runner.load_code(self.algorithms.init)?;
        let stack = runner.alloc(INIT_STACK_BYTES)?;
        runner.execute(
            &init,
            &[ssd_area.address],
            &stack,
            self.config.algorithm_timeout_ms,
        )?;

        let mut blob = [0u8; SsdConfig::SIZE];
        runner.read_memory(ssd_area.address, &mut blob)?;
        drop(runner);

        self.ssd = SsdConfig::from_bytes(&blob);
        self.ssd.log_fields();

        self.sectors = layout.build_sectors();
        self.size = layout.total_size();
        self.layout = Some(layout);
        self.probed = true;

        Ok(())
    }

    /// Probe unless a probe has already completed.  Idempotent: the second
    /// and later calls are no-op successes.
    pub fn auto_probe<T: FlashTarget>(&mut self, target: &mut T) -> Result<()> {
        if self.probed {
            trace!("Bank at {:#010X} already probed", self.config.base);
            return Ok(());
        }
        self.probe(target)
    }

    /// Set or clear protection on a sector range.
    ///
    /// Protection is managed through the lock bitmaps on this family; this
    /// entry point only validates the target state and succeeds.
    pub fn protect<T: FlashTarget>(
        &mut self,
        target: &mut T,
        set: bool,
        first: u32,
        last: u32,
    ) -> Result<()> {
        if !target.is_halted() {
            error!("Target not halted");
            return Err(Error::NotHalted);
        }
        debug!("protect set={set} sectors {first}..={last}: nothing to do");
        Ok(())
    }

    /// Protection check.  Nothing to verify on this family.
    pub fn protect_check(&self) -> Result<()> {
        Ok(())
    }

    /// One-line diagnostic summary of the bank.
    pub fn info(&self) -> String {
        format!(
            "c55 bank @ {:#010X}: {} KiB, {} sectors",
            self.config.base,
            self.size / 1024,
            self.sectors.len()
        )
    }

    /// Layout row for this bank, available once probed.
    pub(crate) fn require_probed(&self) -> Result<&'static BankLayout> {
        match self.layout {
            Some(layout) if self.probed => Ok(layout),
            _ => {
                error!("Bank at {:#010X} not probed", self.config.base);
                Err(Error::NotProbed)
            }
        }
    }

    pub(crate) fn config(&self) -> &BankConfig {
        &self.config
    }

    pub(crate) fn algorithms(&self) -> &AlgorithmSet<'d> {
        &self.algorithms
    }

    pub(crate) fn ssd_bytes(&self) -> [u8; SsdConfig::SIZE] {
        self.ssd.to_bytes()
    }

    pub(crate) fn set_ssd(&mut self, ssd: SsdConfig) {
        self.ssd = ssd;
    }

    pub(crate) fn sectors_mut(&mut self) -> &mut [Sector] {
        &mut self.sectors
    }
}
