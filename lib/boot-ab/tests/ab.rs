// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use boot_ab::{AbConfig, AbState, BootState, RollbackMode, Systems};
use boot_api::{BootError, Uuid};
use drv_bio::{Bio, BioFlags, DiskProbe, RamDisk};
use zerocopy::{FromBytes, IntoBytes};

const DISK: Uuid = Uuid::must_parse("1aad85a9-75cd-426d-8dc4-e9bdfeeb6875");
const SYS_A: Uuid = Uuid::must_parse("2af755d8-8de5-45d5-a862-014cfa735ce0");
const SYS_B: Uuid = Uuid::must_parse("c046ccd8-0f2e-4036-984d-76c14dc73992");
const PRIMARY: Uuid = Uuid::must_parse("f5f8c9ae-efb5-4071-9ba9-d313b082281e");
const BACKUP: Uuid = Uuid::must_parse("656ab3fc-5856-4a5e-a2ae-5a018313b3ee");

const PRIMARY_BLOCK: usize = 4;
const BACKUP_BLOCK: usize = 5;

fn config(rollback_mode: RollbackMode) -> AbConfig {
    AbConfig {
        primary_state: PRIMARY,
        backup_state: BACKUP,
        sys_a: SYS_A,
        sys_b: SYS_B,
        rollback_mode,
    }
}

fn record(enable: Systems, verified: Systems, attempts: u32) -> BootState {
    let mut s = BootState::default();
    s.set_enable(enable);
    s.set_verified(verified);
    s.set_remaining_boot_attempts(attempts);
    s.seal();
    s
}

fn block(data: &[u8], n: usize) -> &[u8] {
    &data[n * 512..(n + 1) * 512]
}

fn stored(data: &[u8], n: usize) -> BootState {
    BootState::read_from_bytes(block(data, n)).unwrap()
}

fn disk_with(state: Option<&BootState>, backup: Option<&BootState>) -> Vec<u8> {
    let mut data = vec![0u8; 8 * 512];
    if let Some(s) = state {
        data[PRIMARY_BLOCK * 512..][..512].copy_from_slice(s.as_bytes());
    }
    if let Some(s) = backup {
        data[BACKUP_BLOCK * 512..][..512].copy_from_slice(s.as_bytes());
    }
    data
}

/// Lays out A, B and the two state partitions on a small RAM disk and runs
/// `f` against a freshly initialized store.
fn with_store<R>(
    data: &mut [u8],
    probe: &DiskProbe,
    mode: RollbackMode,
    f: impl FnOnce(&mut Bio<'_>, Result<AbState, BootError>) -> R,
) -> R {
    let mut disk = RamDisk::with_probe(data, 512, probe);
    let mut bio = Bio::new();
    let d = bio.allocate(0, 7, 512, DISK, "disk").unwrap();
    bio.set_ios(d, &mut disk).unwrap();
    bio.allocate_parent(d, 0, 1, 512, SYS_A, "System A").unwrap();
    bio.allocate_parent(d, 2, 3, 512, SYS_B, "System B").unwrap();
    bio.allocate_parent(d, 4, 4, 512, PRIMARY, "State").unwrap();
    bio.allocate_parent(d, 5, 5, 512, BACKUP, "State backup").unwrap();
    let store = AbState::init(&mut bio, config(mode));
    f(&mut bio, store)
}

#[test]
fn blank_disk_gets_defaults() {
    let mut data = disk_with(None, None);
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        assert_eq!(
            st.get_boot_partition(bio),
            Err(BootError::NoActiveBootPartition)
        );
        assert!(st.active_partition().is_nil());
        assert_eq!(bio.flags(bio.get_part_by_uu(&SYS_A).unwrap()).unwrap(),
            BioFlags::BOOTABLE);
        assert_eq!(bio.flags(bio.get_part_by_uu(&SYS_B).unwrap()).unwrap(),
            BioFlags::BOOTABLE);
    });
    assert_eq!(probe.writes.get(), 2);
    assert!(stored(&data, PRIMARY_BLOCK) == BootState::default());
    assert!(stored(&data, BACKUP_BLOCK) == BootState::default());
}

#[test]
fn unverified_system_spends_an_attempt() {
    let s = record(Systems::A, Systems::empty(), 2);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        let a = bio.get_part_by_uu(&SYS_A).unwrap();
        assert_eq!(st.get_boot_partition(bio), Ok(a));
        assert_eq!(st.state().remaining_boot_attempts(), 1);
        assert_eq!(st.active_partition(), SYS_A);
    });
    assert_eq!(probe.writes.get(), 2);
    for n in [PRIMARY_BLOCK, BACKUP_BLOCK] {
        let got = stored(&data, n);
        assert!(got.is_valid());
        assert_eq!(got.remaining_boot_attempts(), 1);
    }
}

#[test]
fn exhausted_attempts_roll_back_to_verified_b() {
    let s = record(Systems::A, Systems::B, 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        let b = bio.get_part_by_uu(&SYS_B).unwrap();
        assert_eq!(st.get_boot_partition(bio), Ok(b));
        assert_eq!(st.state().enable(), Systems::B);
        assert_eq!(st.state().error(), Systems::A);
        assert_eq!(st.active_partition(), SYS_B);

        // B is verified, so booting it again changes nothing.
        let writes = probe.writes.get();
        assert_eq!(st.get_boot_partition(bio), Ok(b));
        assert_eq!(probe.writes.get(), writes);
    });
    assert_eq!(stored(&data, BACKUP_BLOCK).enable(), Systems::B);
}

#[test]
fn exhausted_attempts_without_fallback_fail_in_normal_mode() {
    let s = record(Systems::A, Systems::empty(), 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        assert_eq!(
            st.get_boot_partition(bio),
            Err(BootError::NoActiveBootPartition)
        );
        assert_eq!(st.state().enable(), Systems::A);
    });
    assert_eq!(probe.writes.get(), 0);
}

#[test]
fn speculative_rollback_ping_pongs() {
    let s = record(Systems::A, Systems::empty(), 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Speculative, |bio, st| {
        let mut st = st.unwrap();
        let a = bio.get_part_by_uu(&SYS_A).unwrap();
        let b = bio.get_part_by_uu(&SYS_B).unwrap();

        assert_eq!(st.get_boot_partition(bio), Ok(b));
        assert_eq!(st.state().remaining_boot_attempts(), 1);
        assert_eq!(st.state().enable(), Systems::B);
        assert_eq!(st.state().error(), Systems::A);

        assert_eq!(st.get_boot_partition(bio), Ok(b));
        assert_eq!(st.state().remaining_boot_attempts(), 0);

        assert_eq!(st.get_boot_partition(bio), Ok(a));
        assert_eq!(st.state().remaining_boot_attempts(), 1);
        assert_eq!(st.state().enable(), Systems::A);
        assert_eq!(st.state().error(), Systems::B);
    });
    assert_eq!(probe.writes.get(), 6);
}

#[test]
fn b_rolls_back_to_a() {
    let s = record(Systems::B, Systems::A, 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        let a = bio.get_part_by_uu(&SYS_A).unwrap();
        assert_eq!(st.get_boot_partition(bio), Ok(a));
        assert_eq!(st.state().enable(), Systems::A);
        assert_eq!(st.state().error(), Systems::B);
    });
}

#[test]
fn verified_boot_does_not_write() {
    let s = record(Systems::A, Systems::A, 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        let a = bio.get_part_by_uu(&SYS_A).unwrap();
        assert_eq!(st.get_boot_partition(bio), Ok(a));
        assert_eq!(st.get_boot_partition(bio), Ok(a));
    });
    assert_eq!(probe.writes.get(), 0);
}

#[test]
fn bad_primary_is_repaired_from_backup() {
    let s = record(Systems::B, Systems::B, 0);
    let mut data = disk_with(None, Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |_, st| {
        assert_eq!(st.unwrap().active_partition(), SYS_B);
    });
    assert_eq!(probe.writes.get(), 2);
    assert_eq!(block(&data, PRIMARY_BLOCK), s.as_bytes());
}

#[test]
fn bad_backup_is_repaired_from_primary() {
    let s = record(Systems::A, Systems::A, 0);
    let mut broken = s.clone();
    broken.set_remaining_boot_attempts(9);
    let mut data = disk_with(Some(&s), Some(&broken));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |_, st| {
        assert_eq!(st.unwrap().active_partition(), SYS_A);
    });
    assert_eq!(block(&data, BACKUP_BLOCK), s.as_bytes());
}

#[test]
fn failed_primary_write_leaves_backup_alone() {
    let s = record(Systems::A, Systems::A, 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    probe.fail_write_lba.set(Some(PRIMARY_BLOCK as u64));
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        assert_eq!(st.set_boot_partition(bio, &SYS_B), Err(BootError::Io));
    });
    assert_eq!(probe.writes.get(), 0);
    assert_eq!(block(&data, BACKUP_BLOCK), s.as_bytes());
}

#[test]
fn torn_commit_prefers_primary() {
    let s = record(Systems::A, Systems::A, 0);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    probe.fail_write_lba.set(Some(BACKUP_BLOCK as u64));
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        assert_eq!(st.set_boot_partition(bio, &SYS_B), Err(BootError::Io));
    });

    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |_, st| {
        assert_eq!(st.unwrap().active_partition(), SYS_B);
    });
    assert_eq!(probe.writes.get(), 0);
}

#[test]
fn explicit_activation() {
    let s = record(Systems::A, Systems::empty(), 3);
    let mut data = disk_with(Some(&s), Some(&s));
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();

        st.set_boot_partition(bio, &SYS_B).unwrap();
        assert_eq!(st.state().enable(), Systems::B);
        assert_eq!(st.state().verified(), Systems::B);
        assert_eq!(st.state().error(), Systems::empty());
        assert_eq!(st.active_partition(), SYS_B);

        let writes = probe.writes.get();
        assert_eq!(
            st.set_boot_partition(bio, &PRIMARY),
            Err(BootError::PartNotBootable)
        );
        assert_eq!(probe.writes.get(), writes);
        assert_eq!(st.active_partition(), SYS_B);

        st.set_boot_partition(bio, &Uuid::NIL).unwrap();
        assert!(st.active_partition().is_nil());
        assert_eq!(
            st.get_boot_partition(bio),
            Err(BootError::NoActiveBootPartition)
        );

        assert_eq!(st.partition_name(&SYS_A), "A");
        assert_eq!(st.partition_name(&SYS_B), "B");
        assert_eq!(st.partition_name(&PRIMARY), "?");
    });
    assert_eq!(stored(&data, PRIMARY_BLOCK).enable(), Systems::empty());
}

#[test]
fn board_registers_persist() {
    let mut data = disk_with(None, None);
    let probe = DiskProbe::default();
    with_store(&mut data, &probe, RollbackMode::Normal, |bio, st| {
        let mut st = st.unwrap();
        st.write_board_reg(bio, 0, 0xdead_beef).unwrap();
        st.write_board_reg(bio, 3, 42).unwrap();
        assert_eq!(st.write_board_reg(bio, 4, 1), Err(BootError::Param));
        assert_eq!(st.read_board_reg(4), Err(BootError::Param));
    });
    with_store(&mut data, &probe, RollbackMode::Normal, |_, st| {
        let st = st.unwrap();
        assert_eq!(st.read_board_reg(0), Ok(0xdead_beef));
        assert_eq!(st.read_board_reg(1), Ok(0));
        assert_eq!(st.read_board_reg(3), Ok(42));
    });
}

#[test]
fn missing_partitions() {
    let mut data = vec![0u8; 8 * 512];
    let mut disk = RamDisk::new(&mut data, 512);
    let mut bio = Bio::new();
    let d = bio.allocate(0, 7, 512, DISK, "disk").unwrap();
    bio.set_ios(d, &mut disk).unwrap();
    bio.allocate_parent(d, 0, 1, 512, SYS_A, "System A").unwrap();
    bio.allocate_parent(d, 2, 3, 512, SYS_B, "System B").unwrap();
    assert_eq!(
        AbState::init(&mut bio, config(RollbackMode::Normal)).err(),
        Some(BootError::NotFound)
    );
}

#[test]
fn config_from_toml() {
    let cfg: AbConfig = toml::from_str(
        r#"
        primary_state = "f5f8c9ae-efb5-4071-9ba9-d313b082281e"
        backup_state = "656ab3fc-5856-4a5e-a2ae-5a018313b3ee"
        sys_a = "2af755d8-8de5-45d5-a862-014cfa735ce0"
        sys_b = "c046ccd8-0f2e-4036-984d-76c14dc73992"
        rollback_mode = "speculative"
        "#,
    )
    .unwrap();
    assert_eq!(cfg, config(RollbackMode::Speculative));

    let cfg: AbConfig = toml::from_str(
        r#"
        primary_state = "f5f8c9ae-efb5-4071-9ba9-d313b082281e"
        backup_state = "656ab3fc-5856-4a5e-a2ae-5a018313b3ee"
        sys_a = "2af755d8-8de5-45d5-a862-014cfa735ce0"
        sys_b = "c046ccd8-0f2e-4036-984d-76c14dc73992"
        "#,
    )
    .unwrap();
    assert_eq!(cfg.rollback_mode, RollbackMode::Normal);
}
