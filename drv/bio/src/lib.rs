// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block I/O registry
//!
//! [`Bio`] owns a fixed-capacity pool of block devices. A device is a window
//! `first_lba..=last_lba` onto some physical medium, named by a [`Uuid`] and
//! addressed by a [`DevHandle`] that stays valid for the life of the
//! registry. Devices allocated with [`Bio::allocate_parent`] are partitions:
//! they share their parent's [`BlockDriver`] but have their own window and
//! flags.
//!
//! All reads and writes take an LBA *relative* to the device window and are
//! bounds checked against the window, not against the physical medium.
//!
//! A partition table manager can attach itself to a raw device as a
//! [`PartitionTable`]; the registry then routes
//! [`Bio::install_partition_table`] and [`Bio::resize`] to it.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "ramdisk"))]
mod ramdisk;
#[cfg(any(test, feature = "ramdisk"))]
pub use ramdisk::{DiskProbe, RamDisk};

use bitflags::bitflags;
use boot_api::{BootError, Uuid, Watchdog};
use heapless::{String, Vec};
use ringbuf::{ringbuf_entry, Ringbuf};

/// Number of devices (raw disks plus partitions) the registry can hold.
pub const MAX_DEVICES: usize = 32;

/// Number of distinct physical drivers that can be attached.
pub const MAX_DRIVERS: usize = 4;

/// Longest device description kept, in bytes.
pub const DESCRIPTION_LEN: usize = 36;

const HAL_FLAGS_SHIFT: u32 = 24;
const HAL_FLAGS_MASK: u32 = 0xff << HAL_FLAGS_SHIFT;
const FLAGS_MASK: u32 = 0xffff;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BioFlags: u16 {
        const BOOTABLE = 1 << 0;
        const WRITABLE = 1 << 2;
        const VISIBLE = 1 << 5;
        const READABLE = 1 << 6;
        const OTP = 1 << 7;
        const ERASE_BEFORE_WRITE = 1 << 8;
    }
}

/// Index of a device in a [`Bio`] registry.
///
/// A handle is only meaningful to the registry that issued it; every
/// accessor revalidates it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DevHandle(u8);

impl DevHandle {
    /// Rebuilds a handle from its raw index, e.g. one received over the
    /// command protocol.
    pub const fn from_raw(index: u8) -> Self {
        Self(index)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Physical medium access, keyed by absolute LBA.
pub trait BlockDriver {
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError>;
    fn write(&mut self, lba: u64, buf: &[u8]) -> Result<(), BootError>;
}

/// A partition table manager attached to a raw device.
pub trait PartitionTable {
    /// Writes the default table `variant` to `dev`.
    fn install(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
        variant: usize,
    ) -> Result<(), BootError>;

    /// Resizes the partition `part` (a child of the device this manager is
    /// attached to) to `blocks` blocks.
    fn resize(
        &mut self,
        bio: &mut Bio<'_>,
        part: DevHandle,
        blocks: u64,
    ) -> Result<(), BootError>;
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Allocated { dev: DevHandle, first_lba: u64, last_lba: u64 },
    Moved { dev: DevHandle, first_lba: u64, last_lba: u64 },
    OutOfRange { dev: DevHandle, lba: u64, len: usize },
    ReadFailed(DevHandle, BootError),
    WriteFailed(DevHandle, BootError),
    TableInstall(DevHandle, usize),
    TableResize(DevHandle, u64),
}

struct BioDevice<'a> {
    uu: Uuid,
    description: String<DESCRIPTION_LEN>,
    first_lba: u64,
    last_lba: u64,
    block_size: usize,
    flags: u32,
    parent: Option<DevHandle>,
    driver: Option<usize>,
    table: Option<&'a mut dyn PartitionTable>,
}

impl BioDevice<'_> {
    fn block_count(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }

    /// Checks that `len` bytes starting at relative block `lba` fit in the
    /// window and returns the absolute LBA.
    fn absolute(&self, lba: u64, len: usize) -> Option<u64> {
        let blocks = (len as u64).div_ceil(self.block_size as u64);
        let count = self.block_count();
        if lba > count || blocks > count - lba {
            return None;
        }
        self.first_lba.checked_add(lba)
    }
}

pub struct Bio<'a> {
    devs: Vec<BioDevice<'a>, MAX_DEVICES>,
    drivers: Vec<&'a mut dyn BlockDriver, MAX_DRIVERS>,
    watchdog: Option<&'a mut dyn Watchdog>,
    trace: Ringbuf<Trace, 32>,
}

impl Default for Bio<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Bio<'a> {
    pub fn new() -> Self {
        Self {
            devs: Vec::new(),
            drivers: Vec::new(),
            watchdog: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    pub fn set_watchdog(&mut self, wdog: &'a mut dyn Watchdog) {
        self.watchdog = Some(wdog);
    }

    fn dev(&self, h: DevHandle) -> Result<&BioDevice<'a>, BootError> {
        self.devs.get(h.index()).ok_or(BootError::Param)
    }

    fn dev_mut(
        &mut self,
        h: DevHandle,
    ) -> Result<&mut BioDevice<'a>, BootError> {
        self.devs.get_mut(h.index()).ok_or(BootError::Param)
    }

    /// Registers a new device covering `first_lba..=last_lba`.
    ///
    /// The device starts with no driver and no flags. Descriptions longer
    /// than [`DESCRIPTION_LEN`] are truncated.
    pub fn allocate(
        &mut self,
        first_lba: u64,
        last_lba: u64,
        block_size: usize,
        uu: Uuid,
        description: &str,
    ) -> Result<DevHandle, BootError> {
        if self.devs.is_full() {
            return Err(BootError::Mem);
        }
        if block_size == 0 || first_lba > last_lba {
            return Err(BootError::Param);
        }

        let mut desc = String::new();
        for c in description.chars() {
            if desc.push(c).is_err() {
                break;
            }
        }

        let dev = DevHandle(self.devs.len() as u8);
        self.devs
            .push(BioDevice {
                uu,
                description: desc,
                first_lba,
                last_lba,
                block_size,
                flags: 0,
                parent: None,
                driver: None,
                table: None,
            })
            .map_err(|_| BootError::Mem)?;

        ringbuf_entry!(
            self.trace,
            Trace::Allocated {
                dev,
                first_lba,
                last_lba
            }
        );
        Ok(dev)
    }

    /// Registers a partition of `parent`. The new device inherits the
    /// parent's driver and flags.
    pub fn allocate_parent(
        &mut self,
        parent: DevHandle,
        first_lba: u64,
        last_lba: u64,
        block_size: usize,
        uu: Uuid,
        description: &str,
    ) -> Result<DevHandle, BootError> {
        let (flags, driver) = {
            let p = self.dev(parent)?;
            (p.flags, p.driver)
        };
        let dev =
            self.allocate(first_lba, last_lba, block_size, uu, description)?;
        let d = self.dev_mut(dev)?;
        d.flags = flags;
        d.driver = driver;
        d.parent = Some(parent);
        Ok(dev)
    }

    /// Attaches `driver` to `dev`. Partitions allocated from `dev` afterwards
    /// share it.
    pub fn set_ios(
        &mut self,
        dev: DevHandle,
        driver: &'a mut dyn BlockDriver,
    ) -> Result<(), BootError> {
        self.dev(dev)?;
        let slot = self.drivers.len();
        self.drivers.push(driver).map_err(|_| BootError::Mem)?;
        self.dev_mut(dev)?.driver = Some(slot);
        Ok(())
    }

    /// Moves the window of an existing device, e.g. after its partition
    /// table entry was rewritten.
    pub fn set_lba_range(
        &mut self,
        dev: DevHandle,
        first_lba: u64,
        last_lba: u64,
    ) -> Result<(), BootError> {
        if first_lba > last_lba {
            return Err(BootError::Param);
        }
        let d = self.dev_mut(dev)?;
        d.first_lba = first_lba;
        d.last_lba = last_lba;
        ringbuf_entry!(
            self.trace,
            Trace::Moved {
                dev,
                first_lba,
                last_lba
            }
        );
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at block `lba` of `dev`.
    pub fn read(
        &mut self,
        dev: DevHandle,
        lba: u64,
        buf: &mut [u8],
    ) -> Result<(), BootError> {
        let (abs, slot) = self.prepare_io(dev, lba, buf.len())?;
        let driver = self
            .drivers
            .get_mut(slot)
            .ok_or(BootError::NotSupported)?;
        driver.read(abs, buf).inspect_err(|&e| {
            ringbuf_entry!(self.trace, Trace::ReadFailed(dev, e));
        })
    }

    /// Writes `buf` starting at block `lba` of `dev`.
    pub fn write(
        &mut self,
        dev: DevHandle,
        lba: u64,
        buf: &[u8],
    ) -> Result<(), BootError> {
        let (abs, slot) = self.prepare_io(dev, lba, buf.len())?;
        let driver = self
            .drivers
            .get_mut(slot)
            .ok_or(BootError::NotSupported)?;
        driver.write(abs, buf).inspect_err(|&e| {
            ringbuf_entry!(self.trace, Trace::WriteFailed(dev, e));
        })
    }

    fn prepare_io(
        &mut self,
        dev: DevHandle,
        lba: u64,
        len: usize,
    ) -> Result<(u64, usize), BootError> {
        let d = self.dev(dev)?;
        let slot = d.driver.ok_or(BootError::NotSupported)?;
        let Some(abs) = d.absolute(lba, len) else {
            ringbuf_entry!(self.trace, Trace::OutOfRange { dev, lba, len });
            return Err(BootError::Param);
        };
        if let Some(wdog) = self.watchdog.as_mut() {
            wdog.kick();
        }
        Ok((abs, slot))
    }

    pub fn flags(&self, dev: DevHandle) -> Result<BioFlags, BootError> {
        let raw = self.dev(dev)?.flags & FLAGS_MASK;
        Ok(BioFlags::from_bits_retain(raw as u16))
    }

    pub fn set_flags(
        &mut self,
        dev: DevHandle,
        flags: BioFlags,
    ) -> Result<(), BootError> {
        let d = self.dev_mut(dev)?;
        d.flags = (d.flags & !FLAGS_MASK) | u32::from(flags.bits());
        Ok(())
    }

    pub fn clear_set_flags(
        &mut self,
        dev: DevHandle,
        clear: BioFlags,
        set: BioFlags,
    ) -> Result<(), BootError> {
        let flags = (self.flags(dev)? & !clear) | set;
        self.set_flags(dev, flags)
    }

    pub fn hal_flags(&self, dev: DevHandle) -> Result<u8, BootError> {
        Ok((self.dev(dev)?.flags >> HAL_FLAGS_SHIFT) as u8)
    }

    pub fn set_hal_flags(
        &mut self,
        dev: DevHandle,
        flags: u8,
    ) -> Result<(), BootError> {
        let d = self.dev_mut(dev)?;
        d.flags =
            (d.flags & !HAL_FLAGS_MASK) | (u32::from(flags) << HAL_FLAGS_SHIFT);
        Ok(())
    }

    pub fn clear_set_hal_flags(
        &mut self,
        dev: DevHandle,
        clear: u8,
        set: u8,
    ) -> Result<(), BootError> {
        let flags = (self.hal_flags(dev)? & !clear) | set;
        self.set_hal_flags(dev, flags)
    }

    /// Returns the first device registered under `uu`.
    pub fn get_part_by_uu(&self, uu: &Uuid) -> Result<DevHandle, BootError> {
        self.devs
            .iter()
            .position(|d| d.uu == *uu)
            .map(|i| DevHandle(i as u8))
            .ok_or(BootError::NotFound)
    }

    pub fn get_part_by_uu_str(&self, uu: &str) -> Result<DevHandle, BootError> {
        let uu = Uuid::parse(uu).ok_or(BootError::Param)?;
        self.get_part_by_uu(&uu)
    }

    pub fn is_valid(&self, dev: DevHandle) -> bool {
        dev.index() < self.devs.len()
    }

    pub fn uuid(&self, dev: DevHandle) -> Result<Uuid, BootError> {
        Ok(self.dev(dev)?.uu)
    }

    pub fn description(&self, dev: DevHandle) -> Result<&str, BootError> {
        Ok(self.dev(dev)?.description.as_str())
    }

    pub fn first_block(&self, dev: DevHandle) -> Result<u64, BootError> {
        Ok(self.dev(dev)?.first_lba)
    }

    pub fn last_block(&self, dev: DevHandle) -> Result<u64, BootError> {
        Ok(self.dev(dev)?.last_lba)
    }

    pub fn block_size(&self, dev: DevHandle) -> Result<usize, BootError> {
        Ok(self.dev(dev)?.block_size)
    }

    pub fn block_count(&self, dev: DevHandle) -> Result<u64, BootError> {
        Ok(self.dev(dev)?.block_count())
    }

    /// Size of the device in bytes.
    pub fn size(&self, dev: DevHandle) -> Result<u64, BootError> {
        let d = self.dev(dev)?;
        Ok(d.block_count() * d.block_size as u64)
    }

    pub fn parent(
        &self,
        dev: DevHandle,
    ) -> Result<Option<DevHandle>, BootError> {
        Ok(self.dev(dev)?.parent)
    }

    /// Iterates over the handles of every registered device.
    pub fn handles(&self) -> impl Iterator<Item = DevHandle> {
        (0..self.devs.len()).map(|i| DevHandle(i as u8))
    }

    /// Attaches a partition table manager to `dev`.
    pub fn set_partition_table(
        &mut self,
        dev: DevHandle,
        table: &'a mut dyn PartitionTable,
    ) -> Result<(), BootError> {
        self.dev_mut(dev)?.table = Some(table);
        Ok(())
    }

    /// Installs default table `variant` on the device named `uu`.
    pub fn install_partition_table(
        &mut self,
        uu: &Uuid,
        variant: usize,
    ) -> Result<(), BootError> {
        let dev = self.get_part_by_uu(uu)?;
        self.install_on(dev, variant)
    }

    /// Installs the first default table on every device that has a
    /// partition table manager attached.
    pub fn install_partition_tables(&mut self) -> Result<(), BootError> {
        for i in 0..self.devs.len() {
            let dev = DevHandle(i as u8);
            if self.dev(dev)?.table.is_some() {
                self.install_on(dev, 0)?;
            }
        }
        Ok(())
    }

    fn install_on(
        &mut self,
        dev: DevHandle,
        variant: usize,
    ) -> Result<(), BootError> {
        let table = self.dev_mut(dev)?.table.take();
        let Some(table) = table else {
            return Err(BootError::NotSupported);
        };
        ringbuf_entry!(self.trace, Trace::TableInstall(dev, variant));
        let rc = table.install(self, dev, variant);
        self.dev_mut(dev)?.table = Some(table);
        rc
    }

    /// Resizes the partition named `uu` to `blocks` blocks, through the
    /// partition table manager of its parent device.
    pub fn resize(&mut self, uu: &Uuid, blocks: u64) -> Result<(), BootError> {
        let part = self.get_part_by_uu(uu)?;
        let parent = self.dev(part)?.parent.ok_or(BootError::NotSupported)?;
        let table = self.dev_mut(parent)?.table.take();
        let Some(table) = table else {
            return Err(BootError::NotSupported);
        };
        ringbuf_entry!(self.trace, Trace::TableResize(part, blocks));
        let rc = table.resize(self, part, blocks);
        self.dev_mut(parent)?.table = Some(table);
        rc
    }
}
