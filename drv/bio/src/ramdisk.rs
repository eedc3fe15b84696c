// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-backed block driver for host testing.

use core::cell::Cell;

use boot_api::BootError;

use crate::BlockDriver;

/// Observes and perturbs a [`RamDisk`] from outside the registry.
#[derive(Default)]
pub struct DiskProbe {
    pub reads: Cell<u32>,
    pub writes: Cell<u32>,
    /// Any write touching this absolute LBA fails with [`BootError::Io`].
    pub fail_write_lba: Cell<Option<u64>>,
}

pub struct RamDisk<'d> {
    data: &'d mut [u8],
    block_size: usize,
    probe: Option<&'d DiskProbe>,
}

impl<'d> RamDisk<'d> {
    pub fn new(data: &'d mut [u8], block_size: usize) -> Self {
        Self {
            data,
            block_size,
            probe: None,
        }
    }

    pub fn with_probe(
        data: &'d mut [u8],
        block_size: usize,
        probe: &'d DiskProbe,
    ) -> Self {
        Self {
            data,
            block_size,
            probe: Some(probe),
        }
    }

    fn range(
        &self,
        lba: u64,
        len: usize,
    ) -> Result<core::ops::Range<usize>, BootError> {
        let start = usize::try_from(lba)
            .ok()
            .and_then(|l| l.checked_mul(self.block_size))
            .ok_or(BootError::Io)?;
        let end = start.checked_add(len).ok_or(BootError::Io)?;
        if end > self.data.len() {
            return Err(BootError::Io);
        }
        Ok(start..end)
    }
}

impl BlockDriver for RamDisk<'_> {
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError> {
        let r = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        if let Some(p) = self.probe {
            p.reads.set(p.reads.get() + 1);
        }
        Ok(())
    }

    fn write(&mut self, lba: u64, buf: &[u8]) -> Result<(), BootError> {
        let r = self.range(lba, buf.len())?;
        if let Some(p) = self.probe {
            let blocks = buf.len().div_ceil(self.block_size) as u64;
            if let Some(bad) = p.fail_write_lba.get() {
                if (lba..lba + blocks).contains(&bad) {
                    return Err(BootError::Io);
                }
            }
            p.writes.set(p.writes.get() + 1);
        }
        self.data[r].copy_from_slice(buf);
        Ok(())
    }
}
