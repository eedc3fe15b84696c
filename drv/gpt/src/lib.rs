// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPT partition table manager
//!
//! [`Gpt`] keeps the primary and backup copies of a GUID partition table for
//! one raw block device. On [`Gpt::init`] both copies are read and checked
//! independently; when exactly one is damaged it is rebuilt from the other
//! and written back, and when both are damaged the disk is reported as
//! corrupt. Every partition in a good table is then registered in the
//! [`Bio`] registry as a child of the raw device.
//!
//! The manager also attaches itself to the raw device as its
//! [`PartitionTable`], so that a factory flow can lay down one of the
//! board's default tables (see [`TableVariant`]) or resize a partition.
//!
//! Layout on a disk whose last block is `L` (512-byte blocks only):
//!
//! ```text
//! 0           protective MBR
//! 1           primary header
//! 2..=33      primary entry array
//! 34..=L-33   partitions
//! L-32..=L-1  backup entry array
//! L           backup header
//! ```

#![cfg_attr(not(test), no_std)]

pub mod layout;

use core::ops::RangeInclusive;

use boot_api::{BootError, Uuid};
use drv_bio::{Bio, BioFlags, DevHandle, PartitionTable};
use layout::{
    protective_mbr, BackupTable, GptEntry, Invalid, PrimaryTable,
    ATTR_NOT_BOOTABLE, ATTR_OK, BLOCK_SIZE, ENTRY_BLOCKS, ENTRY_SIZE,
    FIRST_USABLE_LBA, HEADER_SIZE, NAME_LEN, NUM_ENTRIES, PRIMARY_LBA,
    REVISION, SIGNATURE, TABLE_BLOCKS,
};
use ringbuf::{ringbuf_entry, Ringbuf};
use zerocopy::{FromZeros, IntoBytes};

/// One partition of a default table.
#[derive(Copy, Clone, Debug)]
pub struct TableEntry<'t> {
    pub uu: Uuid,
    pub description: &'t str,
    /// Rounded up to whole blocks.
    pub size_bytes: u64,
    /// Registry flags given to the partition when it is registered.
    pub flags: BioFlags,
}

/// A named default partition table. Partitions are laid out back to back,
/// in order, from the first usable block.
#[derive(Copy, Clone, Debug)]
pub struct TableVariant<'t> {
    pub name: &'t str,
    pub entries: &'t [TableEntry<'t>],
}

/// Outcome of a successful [`Gpt::init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableStatus {
    Valid,
    /// The primary copy was rebuilt from the backup.
    RecoveredPrimary,
    /// The backup copy was rebuilt from the primary.
    RecoveredBackup,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Init(DevHandle),
    PrimaryInvalid(Invalid),
    BackupInvalid(Invalid),
    Recovered(TableStatus),
    Unrecoverable,
    Wrote { lba: u64, blocks: u64 },
    Child(DevHandle),
    Installed { variant: usize, parts: usize },
    Resized { part: DevHandle, delta: i64 },
}

pub struct Gpt<'t> {
    tables: &'t [TableVariant<'t>],
    primary: PrimaryTable,
    backup: BackupTable,
    prng: u32,
    trace: Ringbuf<Trace, 16>,
}

impl<'t> Gpt<'t> {
    /// Creates a manager for the board's default `tables`.
    ///
    /// `seed` feeds the generator used for new disk GUIDs; a free-running
    /// tick counter is good enough, since those only need to be unique.
    pub fn new(tables: &'t [TableVariant<'t>], seed: u32) -> Self {
        Self {
            tables,
            primary: PrimaryTable::new_zeroed(),
            backup: BackupTable::new_zeroed(),
            prng: if seed == 0 { 0x2545_f491 } else { seed },
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Loads, validates and if needed repairs the table on `dev`, registers
    /// its partitions, and attaches this manager to `dev`.
    ///
    /// The manager is attached even when the table is unrecoverable, so a
    /// blank disk can still be formatted through
    /// [`Bio::install_partition_table`].
    pub fn init<'a>(
        &'a mut self,
        bio: &mut Bio<'a>,
        dev: DevHandle,
    ) -> Result<TableStatus, BootError> {
        let rc = self.load(bio, dev).and_then(|status| {
            self.register_children(bio, dev)?;
            Ok(status)
        });
        bio.set_partition_table(dev, self)?;
        rc
    }

    fn load(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
    ) -> Result<TableStatus, BootError> {
        ringbuf_entry!(self.trace, Trace::Init(dev));
        let last = last_lba(bio, dev)?;

        bio.read(dev, PRIMARY_LBA, self.primary.as_mut_bytes())?;
        bio.read(dev, last - ENTRY_BLOCKS, self.backup.as_mut_bytes())?;

        let primary = self.primary.header.validate(&self.primary.entries);
        if let Err(why) = primary {
            ringbuf_entry!(self.trace, Trace::PrimaryInvalid(why));
        }
        let backup = self.backup.header.validate(&self.backup.entries);
        if let Err(why) = backup {
            ringbuf_entry!(self.trace, Trace::BackupInvalid(why));
        }

        let status = match (primary, backup) {
            (Ok(()), Ok(())) => return Ok(TableStatus::Valid),
            (Err(_), Ok(())) => {
                self.primary.header = self.backup.header;
                self.primary.entries = self.backup.entries;
                TableStatus::RecoveredPrimary
            }
            (Ok(()), Err(_)) => TableStatus::RecoveredBackup,
            (Err(_), Err(_)) => {
                ringbuf_entry!(self.trace, Trace::Unrecoverable);
                return Err(BootError::Corrupt);
            }
        };

        // The good copy is now in `primary`; rewriting both copies from it
        // fixes up the damaged one's location fields and checksums.
        self.write_tables(bio, dev, last)?;
        ringbuf_entry!(self.trace, Trace::Recovered(status));
        Ok(status)
    }

    fn write_tables(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
        last: u64,
    ) -> Result<(), BootError> {
        self.primary.header.relocate(true, last);
        self.primary.header.seal(&self.primary.entries);

        self.backup.entries = self.primary.entries;
        self.backup.header = self.primary.header;
        self.backup.header.relocate(false, last);
        self.backup.header.seal(&self.backup.entries);

        bio.write(dev, 0, &protective_mbr(last))?;

        bio.write(dev, PRIMARY_LBA, self.primary.as_bytes())?;
        ringbuf_entry!(
            self.trace,
            Trace::Wrote {
                lba: PRIMARY_LBA,
                blocks: TABLE_BLOCKS
            }
        );

        let backup_lba = last - ENTRY_BLOCKS;
        bio.write(dev, backup_lba, self.backup.as_bytes())?;
        ringbuf_entry!(
            self.trace,
            Trace::Wrote {
                lba: backup_lba,
                blocks: TABLE_BLOCKS
            }
        );
        Ok(())
    }

    /// Registers (or moves) one child device per used entry.
    fn register_children(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
    ) -> Result<(), BootError> {
        let base = bio.first_block(dev)?;
        let block_size = bio.block_size(dev)?;
        let hdr = &self.primary.header;
        let usable = hdr.first_usable_lba.get()..=hdr.last_usable_lba.get();
        let used = || self.primary.entries.iter().take_while(|e| e.is_used());

        // A table can carry good checksums and still describe nonsense.
        if !used().all(|e| fits(e, &usable)) {
            return Err(BootError::Param);
        }

        for entry in used() {
            let uu = entry.uuid();
            let first = base
                .checked_add(entry.first_lba.get())
                .ok_or(BootError::Param)?;
            let last = base
                .checked_add(entry.last_lba.get())
                .ok_or(BootError::Param)?;

            let mut name = [0u8; NAME_LEN];
            let mut len = 0;
            for (slot, b) in name.iter_mut().zip(entry.name_bytes()) {
                *slot = if b.is_ascii() { b } else { b'?' };
                len += 1;
            }
            let name = core::str::from_utf8(&name[..len]).unwrap_or("");

            let child = match bio.get_part_by_uu(&uu) {
                Ok(h) if bio.parent(h)? == Some(dev) => {
                    bio.set_lba_range(h, first, last)?;
                    h
                }
                _ => bio
                    .allocate_parent(dev, first, last, block_size, uu, name)?,
            };
            if let Some(flags) = flags_for(self.tables, &uu) {
                bio.set_flags(child, flags)?;
            }
            ringbuf_entry!(self.trace, Trace::Child(child));
        }
        Ok(())
    }

    /// Low-entropy xorshift32; only ever used for disk GUID uniqueness.
    fn next_random(&mut self) -> u32 {
        let mut x = self.prng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.prng = x;
        x
    }

    fn install_variant(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
        variant: usize,
    ) -> Result<(), BootError> {
        let table = self.tables.get(variant).ok_or(BootError::Param)?;
        let last = last_lba(bio, dev)?;
        let last_usable = last - TABLE_BLOCKS;

        if table.entries.len() > NUM_ENTRIES {
            return Err(BootError::Param);
        }
        // Check the whole layout before touching the live table.
        let mut next = FIRST_USABLE_LBA;
        for part in table.entries {
            let blocks = part.size_bytes.div_ceil(BLOCK_SIZE as u64);
            if blocks == 0 || next + blocks - 1 > last_usable {
                return Err(BootError::Param);
            }
            next += blocks;
        }

        let mut guid = [0u8; 16];
        for b in guid.iter_mut() {
            *b = self.next_random() as u8;
        }

        self.primary = PrimaryTable::new_zeroed();
        let hdr = &mut self.primary.header;
        hdr.signature.set(SIGNATURE);
        hdr.revision.set(REVISION);
        hdr.header_size.set(HEADER_SIZE);
        hdr.first_usable_lba.set(FIRST_USABLE_LBA);
        hdr.last_usable_lba.set(last_usable);
        hdr.disk_guid = Uuid::from_bytes(guid);
        hdr.num_entries.set(NUM_ENTRIES as u32);
        hdr.entry_size.set(ENTRY_SIZE as u32);

        let mut next = FIRST_USABLE_LBA;
        for (slot, part) in self.primary.entries.iter_mut().zip(table.entries)
        {
            let blocks = part.size_bytes.div_ceil(BLOCK_SIZE as u64);
            slot.type_guid = part.uu.to_guid();
            slot.guid = part.uu.to_guid();
            slot.first_lba.set(next);
            slot.last_lba.set(next + blocks - 1);
            slot.attributes[6] = ATTR_OK;
            slot.attributes[7] = ATTR_NOT_BOOTABLE;
            slot.set_name(part.description);
            next += blocks;
        }

        self.write_tables(bio, dev, last)?;
        ringbuf_entry!(
            self.trace,
            Trace::Installed {
                variant,
                parts: table.entries.len()
            }
        );
        self.register_children(bio, dev)
    }

    fn resize_part(
        &mut self,
        bio: &mut Bio<'_>,
        part: DevHandle,
        blocks: u64,
    ) -> Result<(), BootError> {
        let dev = bio.parent(part)?.ok_or(BootError::Param)?;
        let last = last_lba(bio, dev)?;
        if blocks == 0 {
            return Err(BootError::Param);
        }

        let guid = bio.uuid(part)?.to_guid();
        let used = self
            .primary
            .entries
            .iter()
            .take_while(|e| e.is_used())
            .count();
        let entries = &self.primary.entries[..used];
        let idx = entries
            .iter()
            .position(|e| e.guid == guid)
            .ok_or(BootError::NotFound)?;

        let old = entries[idx]
            .last_lba
            .get()
            .checked_sub(entries[idx].first_lba.get())
            .and_then(|n| i64::try_from(n).ok()?.checked_add(1))
            .ok_or(BootError::Param)?;
        let new = i64::try_from(blocks).map_err(|_| BootError::Param)?;
        let delta = new.checked_sub(old).ok_or(BootError::Param)?;

        // Lay the new extents out in a copy; everything after the resized
        // partition moves by the same amount.
        let mut moved = self.primary.entries;
        for (i, e) in moved[idx..used].iter_mut().enumerate() {
            if i != 0 {
                let first = e.first_lba.get().checked_add_signed(delta);
                e.first_lba.set(first.ok_or(BootError::Param)?);
            }
            let end = e.last_lba.get().checked_add_signed(delta);
            e.last_lba.set(end.ok_or(BootError::Param)?);
        }
        let usable = FIRST_USABLE_LBA..=last - TABLE_BLOCKS;
        if !moved[..used].iter().all(|e| fits(e, &usable)) {
            return Err(BootError::Param);
        }

        let saved = (self.primary.clone(), self.backup.clone());
        self.primary.entries = moved;
        if let Err(e) = self.write_tables(bio, dev, last) {
            (self.primary, self.backup) = saved;
            return Err(e);
        }
        ringbuf_entry!(self.trace, Trace::Resized { part, delta });
        self.register_children(bio, dev)
    }
}

impl PartitionTable for Gpt<'_> {
    fn install(
        &mut self,
        bio: &mut Bio<'_>,
        dev: DevHandle,
        variant: usize,
    ) -> Result<(), BootError> {
        self.install_variant(bio, dev, variant)
    }

    fn resize(
        &mut self,
        bio: &mut Bio<'_>,
        part: DevHandle,
        blocks: u64,
    ) -> Result<(), BootError> {
        self.resize_part(bio, part, blocks)
    }
}

/// Whether `e` is a non-empty extent inside `usable`.
fn fits(e: &GptEntry, usable: &RangeInclusive<u64>) -> bool {
    let (first, last) = (e.first_lba.get(), e.last_lba.get());
    first <= last && usable.contains(&first) && usable.contains(&last)
}

fn flags_for(tables: &[TableVariant<'_>], uu: &Uuid) -> Option<BioFlags> {
    tables
        .iter()
        .flat_map(|t| t.entries)
        .find(|e| e.uu == *uu)
        .map(|e| e.flags)
}

/// Returns the last block of `dev`, relative to the device, after checking
/// that the device can hold two table copies and at least one block of data.
fn last_lba(bio: &Bio<'_>, dev: DevHandle) -> Result<u64, BootError> {
    if bio.block_size(dev)? != BLOCK_SIZE {
        return Err(BootError::Param);
    }
    let count = bio.block_count(dev)?;
    if count < FIRST_USABLE_LBA + TABLE_BLOCKS + 1 {
        return Err(BootError::Param);
    }
    Ok(count - 1)
}
