// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk GPT structures.

use boot_api::crc::{crc32_skipping, efi_crc32, EFI};
use boot_api::Uuid;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian as le;
use zerocopy::IntoBytes;

pub const SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART"
pub const REVISION: u32 = 0x0001_0000;
pub const HEADER_SIZE: u32 = 92;
pub const NUM_ENTRIES: usize = 128;
pub const ENTRY_SIZE: usize = 128;
pub const BLOCK_SIZE: usize = 512;

/// Blocks occupied by the partition entry array.
pub const ENTRY_BLOCKS: u64 = (NUM_ENTRIES * ENTRY_SIZE / BLOCK_SIZE) as u64;

/// Blocks occupied by one header plus its entry array.
pub const TABLE_BLOCKS: u64 = ENTRY_BLOCKS + 1;

pub const PRIMARY_LBA: u64 = 1;
pub const FIRST_USABLE_LBA: u64 = PRIMARY_LBA + TABLE_BLOCKS;

/// Longest partition name, in characters.
pub const NAME_LEN: usize = 36;

/// Attribute byte 6, bit 7 (bit 55 overall): partition contents are OK.
pub const ATTR_OK: u8 = 1 << 7;
/// Attribute byte 7, bit 7: legacy BIOS must not boot this partition.
pub const ATTR_NOT_BOOTABLE: u8 = 1 << 7;

const HEADER_CRC_OFFSET: usize = 16;

#[derive(
    Copy,
    Clone,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct GptHeader {
    pub signature: le::U64,
    pub revision: le::U32,
    pub header_size: le::U32,
    pub header_crc: le::U32,
    pub _reserved: le::U32,
    pub current_lba: le::U64,
    pub backup_lba: le::U64,
    pub first_usable_lba: le::U64,
    pub last_usable_lba: le::U64,
    /// Stored in GUID order.
    pub disk_guid: Uuid,
    pub entries_start_lba: le::U64,
    pub num_entries: le::U32,
    pub entry_size: le::U32,
    pub entries_crc: le::U32,
    pub _reserved2: [u8; 420],
}

const_assert_eq!(core::mem::size_of::<GptHeader>(), BLOCK_SIZE);

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct GptEntry {
    /// Stored in GUID order.
    pub type_guid: Uuid,
    /// Stored in GUID order.
    pub guid: Uuid,
    pub first_lba: le::U64,
    pub last_lba: le::U64,
    pub attributes: [u8; 8],
    /// UTF-16LE.
    pub name: [u8; 72],
}

const_assert_eq!(core::mem::size_of::<GptEntry>(), ENTRY_SIZE);

/// Header at LBA 1 followed by its entry array.
#[derive(
    Clone,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct PrimaryTable {
    pub header: GptHeader,
    pub entries: [GptEntry; NUM_ENTRIES],
}

/// Entry array followed by its header, ending at the last LBA.
#[derive(
    Clone,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct BackupTable {
    pub entries: [GptEntry; NUM_ENTRIES],
    pub header: GptHeader,
}

const_assert_eq!(
    core::mem::size_of::<PrimaryTable>(),
    TABLE_BLOCKS as usize * BLOCK_SIZE
);
const_assert_eq!(
    core::mem::size_of::<BackupTable>(),
    TABLE_BLOCKS as usize * BLOCK_SIZE
);

/// Why a table copy was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Invalid {
    Signature,
    HeaderCrc,
    /// Reserved header bytes outside the CRC are not zero.
    Reserved,
    Geometry,
    EntriesCrc,
}

impl GptHeader {
    pub fn compute_header_crc(&self) -> u32 {
        let core = &self.as_bytes()[..HEADER_SIZE as usize];
        crc32_skipping(&EFI, core, HEADER_CRC_OFFSET)
    }

    /// Recomputes both checksums for `entries`.
    pub fn seal(&mut self, entries: &[GptEntry; NUM_ENTRIES]) {
        self.entries_crc.set(efi_crc32(entries.as_bytes()));
        self.header_crc.set(self.compute_header_crc());
    }

    pub fn validate(
        &self,
        entries: &[GptEntry; NUM_ENTRIES],
    ) -> Result<(), Invalid> {
        if self.signature.get() != SIGNATURE {
            return Err(Invalid::Signature);
        }
        if self.header_size.get() != HEADER_SIZE
            || self.compute_header_crc() != self.header_crc.get()
        {
            return Err(Invalid::HeaderCrc);
        }
        if self._reserved2.iter().any(|&b| b != 0) {
            return Err(Invalid::Reserved);
        }
        if self.num_entries.get() as usize != NUM_ENTRIES
            || self.entry_size.get() as usize != ENTRY_SIZE
        {
            return Err(Invalid::Geometry);
        }
        if efi_crc32(entries.as_bytes()) != self.entries_crc.get() {
            return Err(Invalid::EntriesCrc);
        }
        Ok(())
    }

    /// Rewrites the location fields for the primary (or backup) copy on a
    /// disk whose last block is `last_lba`.
    pub fn relocate(&mut self, primary: bool, last_lba: u64) {
        if primary {
            self.current_lba.set(PRIMARY_LBA);
            self.backup_lba.set(last_lba);
            self.entries_start_lba.set(PRIMARY_LBA + 1);
        } else {
            self.current_lba.set(last_lba);
            self.backup_lba.set(PRIMARY_LBA);
            self.entries_start_lba.set(last_lba - ENTRY_BLOCKS);
        }
    }
}

impl GptEntry {
    pub fn is_used(&self) -> bool {
        self.first_lba.get() != 0
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_guid(self.guid)
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; 72];
        for (i, b) in name.bytes().take(NAME_LEN).enumerate() {
            self.name[i * 2] = b;
        }
    }

    /// Iterates over the low bytes of the UTF-16 name up to the first NUL.
    pub fn name_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.name
            .chunks_exact(2)
            .take(NAME_LEN)
            .map(|c| c[0])
            .take_while(|&b| b != 0)
    }
}

/// Builds the protective MBR for a disk whose last block is `last_lba`.
pub fn protective_mbr(last_lba: u64) -> [u8; BLOCK_SIZE] {
    let mut mbr = [0u8; BLOCK_SIZE];
    // Single partition record: start CHS 0/0/2, type 0xEE, end CHS maxed.
    mbr[448] = 0x02;
    mbr[450] = 0xee;
    mbr[451] = 0xff;
    mbr[452] = 0xff;
    mbr[453] = 0xff;
    mbr[454] = 0x01;
    let size = u32::try_from(last_lba).unwrap_or(u32::MAX);
    mbr[458..462].copy_from_slice(&size.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xaa;
    mbr
}
