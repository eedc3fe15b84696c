// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use boot_api::{BootError, Uuid};
use drv_bio::{Bio, BioFlags, DevHandle, RamDisk};
use drv_gpt::layout::{
    GptEntry, GptHeader, PrimaryTable, BLOCK_SIZE,
};
use drv_gpt::{Gpt, TableEntry, TableStatus, TableVariant};
use proptest::prelude::*;
use zerocopy::{FromBytes, IntoBytes};

const DISK: Uuid = Uuid::must_parse("1aad85a9-75cd-426d-8dc4-e9bdfeeb6875");
const SYS_A: Uuid = Uuid::must_parse("2af755d8-8de5-45d5-a862-014cfa735ce0");
const SYS_B: Uuid = Uuid::must_parse("c046ccd8-0f2e-4036-984d-76c14dc73992");
const STATE: Uuid = Uuid::must_parse("f5f8c9ae-efb5-4071-9ba9-d313b082281e");
const STRAY: Uuid = Uuid::must_parse("ff4ddc6c-ad7a-47e8-8773-6729392dd1b5");

const SYS_FLAGS: BioFlags = BioFlags::BOOTABLE
    .union(BioFlags::WRITABLE)
    .union(BioFlags::VISIBLE);

const DEFAULT: &[TableEntry<'static>] = &[
    TableEntry {
        uu: SYS_A,
        description: "System A",
        size_bytes: 32 * 1024,
        flags: SYS_FLAGS,
    },
    TableEntry {
        uu: SYS_B,
        description: "System B",
        // Not a whole number of blocks; rounds up to 64.
        size_bytes: 32 * 1024 - 100,
        flags: SYS_FLAGS,
    },
    TableEntry {
        uu: STATE,
        description: "Boot state",
        size_bytes: 512,
        flags: BioFlags::WRITABLE,
    },
];

const TABLES: &[TableVariant<'static>] = &[
    TableVariant {
        name: "default",
        entries: DEFAULT,
    },
    TableVariant {
        name: "too-big",
        entries: &[TableEntry {
            uu: SYS_A,
            description: "huge",
            size_bytes: 1 << 30,
            flags: BioFlags::empty(),
        }],
    },
];

const DISK_BLOCKS: usize = 256;
const PRIMARY_BYTES: core::ops::Range<usize> = BLOCK_SIZE..34 * BLOCK_SIZE;
const BACKUP_BYTES: core::ops::Range<usize> =
    (DISK_BLOCKS - 33) * BLOCK_SIZE..DISK_BLOCKS * BLOCK_SIZE;

#[derive(Debug, PartialEq)]
struct Child {
    uu: Uuid,
    first: u64,
    last: u64,
    description: String,
    flags: BioFlags,
}

fn children(bio: &Bio<'_>, disk: DevHandle) -> Vec<Child> {
    bio.handles()
        .filter(|&h| bio.parent(h).unwrap() == Some(disk))
        .map(|h| Child {
            uu: bio.uuid(h).unwrap(),
            first: bio.first_block(h).unwrap(),
            last: bio.last_block(h).unwrap(),
            description: bio.description(h).unwrap().to_string(),
            flags: bio.flags(h).unwrap(),
        })
        .collect()
}

/// Registers `data` as a raw disk, runs the table manager over it and hands
/// the registry to `f`.
fn mount<R>(
    data: &mut [u8],
    f: impl FnOnce(&mut Bio<'_>, DevHandle, Result<TableStatus, BootError>) -> R,
) -> R {
    let blocks = (data.len() / BLOCK_SIZE) as u64;
    let mut disk = RamDisk::new(data, BLOCK_SIZE);
    let mut gpt = Gpt::new(TABLES, 0x1234_5678);
    let mut bio = Bio::new();
    let dev = bio.allocate(0, blocks - 1, BLOCK_SIZE, DISK, "disk").unwrap();
    bio.set_ios(dev, &mut disk).unwrap();
    let status = gpt.init(&mut bio, dev);
    f(&mut bio, dev, status)
}

fn formatted() -> Vec<u8> {
    let mut data = vec![0u8; DISK_BLOCKS * BLOCK_SIZE];
    mount(&mut data, |bio, _, status| {
        assert_eq!(status, Err(BootError::Corrupt));
        bio.install_partition_table(&DISK, 0).unwrap();
    });
    data
}

fn expected() -> Vec<Child> {
    vec![
        Child {
            uu: SYS_A,
            first: 34,
            last: 97,
            description: "System A".into(),
            flags: SYS_FLAGS,
        },
        Child {
            uu: SYS_B,
            first: 98,
            last: 161,
            description: "System B".into(),
            flags: SYS_FLAGS,
        },
        Child {
            uu: STATE,
            first: 162,
            last: 162,
            description: "Boot state".into(),
            flags: BioFlags::WRITABLE,
        },
    ]
}

#[test]
fn install_registers_children() {
    let mut data = vec![0u8; DISK_BLOCKS * BLOCK_SIZE];
    mount(&mut data, |bio, disk, _| {
        bio.install_partition_table(&DISK, 0).unwrap();
        assert_eq!(children(bio, disk), expected());

        // Installing again moves the same children rather than adding more.
        bio.install_partition_tables().unwrap();
        assert_eq!(children(bio, disk), expected());
    });
}

#[test]
fn install_then_init_round_trips() {
    let mut data = formatted();
    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Ok(TableStatus::Valid));
        assert_eq!(children(bio, disk), expected());
    });
}

#[test]
fn on_disk_format() {
    let data = formatted();

    // Protective MBR.
    assert_eq!(data[450], 0xee);
    assert_eq!(&data[458..462], &255u32.to_le_bytes());
    assert_eq!(&data[510..512], &[0x55, 0xaa]);

    let primary = GptHeader::read_from_bytes(&data[512..1024]).unwrap();
    assert_eq!(&primary.signature.get().to_le_bytes(), b"EFI PART");
    assert_eq!(primary.current_lba.get(), 1);
    assert_eq!(primary.backup_lba.get(), 255);
    assert_eq!(primary.entries_start_lba.get(), 2);
    assert_eq!(primary.first_usable_lba.get(), 34);
    assert_eq!(primary.last_usable_lba.get(), 222);

    let backup =
        GptHeader::read_from_bytes(&data[255 * 512..256 * 512]).unwrap();
    assert_eq!(backup.current_lba.get(), 255);
    assert_eq!(backup.backup_lba.get(), 1);
    assert_eq!(backup.entries_start_lba.get(), 223);
    assert_eq!(backup.disk_guid, primary.disk_guid);
    assert_eq!(backup.entries_crc.get(), primary.entries_crc.get());
    assert!(!backup.disk_guid.is_nil());

    let entry = GptEntry::read_from_bytes(&data[1024..1024 + 128]).unwrap();
    assert_eq!(entry.guid, SYS_A.to_guid());
    assert_eq!(entry.type_guid, SYS_A.to_guid());
    assert_eq!(entry.uuid(), SYS_A);
    assert_eq!(entry.attributes, [0, 0, 0, 0, 0, 0, 0x80, 0x80]);
    assert_eq!(&entry.name[..6], &[b'S', 0, b'y', 0, b's', 0]);

    // The backup array is a copy of the primary one.
    assert_eq!(&data[1024..1024 + 128], &data[223 * 512..223 * 512 + 128]);
}

#[test]
fn backup_recovered_from_primary() {
    let golden = formatted();
    let mut data = golden.clone();
    data[BACKUP_BYTES.start + 40] ^= 0x01;
    data[BACKUP_BYTES.end - 512] ^= 0xff;

    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Ok(TableStatus::RecoveredBackup));
        assert_eq!(children(bio, disk), expected());
    });
    assert!(data == golden);
}

#[test]
fn both_copies_bad_is_fatal_but_installable() {
    let mut data = formatted();
    data[PRIMARY_BYTES.start + 20] ^= 0x01;
    data[BACKUP_BYTES.start + 20] ^= 0x01;

    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Err(BootError::Corrupt));
        assert!(children(bio, disk).is_empty());
        bio.install_partition_table(&DISK, 0).unwrap();
        assert_eq!(children(bio, disk), expected());
    });
    mount(&mut data, |_, _, status| {
        assert_eq!(status, Ok(TableStatus::Valid));
    });
}

#[test]
fn resize_moves_later_partitions() {
    let mut data = formatted();
    mount(&mut data, |bio, disk, _| {
        bio.resize(&SYS_A, 16).unwrap();
        let mut want = expected();
        want[0].last = 49;
        want[1].first = 50;
        want[1].last = 113;
        want[2].first = 114;
        want[2].last = 114;
        assert_eq!(children(bio, disk), want);

        bio.resize(&SYS_A, 64).unwrap();
        assert_eq!(children(bio, disk), expected());

        bio.resize(&SYS_B, 80).unwrap();
    });
    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Ok(TableStatus::Valid));
        let got = children(bio, disk);
        assert_eq!((got[1].first, got[1].last), (98, 177));
        assert_eq!((got[2].first, got[2].last), (178, 178));
    });
}

#[test]
fn resize_errors() {
    let mut data = formatted();
    mount(&mut data, |bio, disk, _| {
        // Would push the last partition past the backup table.
        assert_eq!(bio.resize(&SYS_A, 200), Err(BootError::Param));
        assert_eq!(bio.resize(&SYS_A, 0), Err(BootError::Param));
        assert_eq!(bio.resize(&DISK, 8), Err(BootError::NotSupported));

        bio.allocate_parent(disk, 200, 201, 512, STRAY, "stray").unwrap();
        assert_eq!(bio.resize(&STRAY, 8), Err(BootError::NotFound));

        // Nothing moved.
        assert_eq!(children(bio, disk)[..3], expected()[..]);
    });
}

#[test]
fn huge_resize_leaves_disk_alone() {
    let golden = formatted();
    let mut data = golden.clone();
    mount(&mut data, |bio, disk, _| {
        for blocks in [u64::MAX, 1 << 63, (1 << 63) - 1] {
            assert_eq!(bio.resize(&SYS_A, blocks), Err(BootError::Param));
        }
        assert_eq!(children(bio, disk), expected());
    });
    assert!(data == golden);
    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Ok(TableStatus::Valid));
        assert_eq!(children(bio, disk), expected());
    });
}

#[test]
fn entries_outside_usable_area_are_refused() {
    fn rewrite(data: &mut [u8], last_lba: u64) {
        let bytes = &mut data[PRIMARY_BYTES];
        let mut table = PrimaryTable::read_from_bytes(bytes).unwrap();
        table.entries[2].last_lba.set(last_lba);
        table.header.seal(&table.entries);
        bytes.copy_from_slice(table.as_bytes());
    }

    let mut data = formatted();
    // Runs into the backup entry array.
    rewrite(&mut data, 240);

    mount(&mut data, |bio, disk, status| {
        assert_eq!(status, Err(BootError::Param));
        assert!(children(bio, disk).is_empty());
    });

    // Ends before it starts.
    rewrite(&mut data, 113);
    mount(&mut data, |_, _, status| {
        assert_eq!(status, Err(BootError::Param));
    });
}

#[test]
fn oversized_table_rejected() {
    let mut data = vec![0u8; DISK_BLOCKS * BLOCK_SIZE];
    mount(&mut data, |bio, _, _| {
        assert_eq!(bio.install_partition_table(&DISK, 1), Err(BootError::Param));
        assert_eq!(bio.install_partition_table(&DISK, 2), Err(BootError::Param));
    });
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn needs_512_byte_blocks_and_room() {
    let mut data = vec![0u8; 64 * 4096];
    let mut disk = RamDisk::new(&mut data, 4096);
    let mut gpt = Gpt::new(TABLES, 1);
    let mut bio = Bio::new();
    let dev = bio.allocate(0, 63, 4096, DISK, "disk").unwrap();
    bio.set_ios(dev, &mut disk).unwrap();
    assert_eq!(gpt.init(&mut bio, dev), Err(BootError::Param));

    let mut small = vec![0u8; 67 * BLOCK_SIZE];
    mount(&mut small, |_, _, status| {
        assert_eq!(status, Err(BootError::Param));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_primary_byte_flip_is_repaired(
        offset in 0..PRIMARY_BYTES.len(),
        mask in 1u8..=255,
    ) {
        let golden = formatted();
        let mut data = golden.clone();
        data[PRIMARY_BYTES.start + offset] ^= mask;

        let got = mount(&mut data, |bio, disk, status| {
            (status, children(bio, disk))
        });
        prop_assert_eq!(got.0, Ok(TableStatus::RecoveredPrimary));
        prop_assert_eq!(got.1, expected());
        prop_assert!(data == golden);
    }
}
