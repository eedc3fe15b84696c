// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A/B boot state
//!
//! Two systems (A and B) live in two partitions. Which one boots next is
//! decided from a small [`BootState`] record kept in two further partitions,
//! a primary and a backup copy, each protected by its own CRC.
//!
//! A freshly installed system is enabled but not verified, with a budget of
//! boot attempts. Each boot of an unverified system spends one attempt. Once
//! the budget is gone the store rolls back to the other system if that one
//! is verified; in [`RollbackMode::Speculative`] it also rolls back to an
//! unverified system, giving it a single attempt, so a device with two bad
//! images alternates between them rather than stopping.
//!
//! Every change to the record is committed immediately: primary first, then
//! backup. A failed primary write leaves the backup untouched. The two writes
//! are not atomic with respect to each other; the next [`AbState::init`]
//! sorts out a torn commit through the per-copy CRC.

#![cfg_attr(not(test), no_std)]

mod record;

pub use record::{BootState, Systems, BOARD_REGS, STATE_MAGIC};

use boot_api::{BootError, Uuid};
use drv_bio::{Bio, BioFlags, DevHandle};
use ringbuf::{ringbuf_entry, Ringbuf};
use serde::Deserialize;
use zerocopy::{FromZeros, IntoBytes};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackMode {
    /// Roll back only to a verified system.
    #[default]
    Normal,
    /// Roll back to the other system even if it was never verified.
    Speculative,
}

/// Board description of the A/B layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AbConfig {
    pub primary_state: Uuid,
    pub backup_state: Uuid,
    pub sys_a: Uuid,
    pub sys_b: Uuid,
    #[serde(default)]
    pub rollback_mode: RollbackMode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum System {
    A,
    B,
}

impl System {
    fn bit(self) -> Systems {
        match self {
            System::A => Systems::A,
            System::B => Systems::B,
        }
    }

    fn other(self) -> Self {
        match self {
            System::A => System::B,
            System::B => System::A,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Loaded { primary_ok: bool, backup_ok: bool },
    Defaults,
    Selected { system: System, attempts: u32 },
    Rollback { from: System, speculative: bool },
    NoActiveSystem,
    Activated(Option<System>),
    Committed,
    CommitFailed { primary: bool, err: BootError },
}

pub struct AbState {
    config: AbConfig,
    primary: DevHandle,
    backup: DevHandle,
    state: BootState,
    trace: Ringbuf<Trace, 16>,
}

impl AbState {
    /// Loads the record from both state partitions, repairing one copy from
    /// the other (or installing defaults when neither is usable), and marks
    /// both system partitions bootable.
    pub fn init(
        bio: &mut Bio<'_>,
        config: AbConfig,
    ) -> Result<Self, BootError> {
        for uu in [&config.sys_a, &config.sys_b] {
            let dev = bio.get_part_by_uu(uu)?;
            bio.clear_set_flags(dev, BioFlags::empty(), BioFlags::BOOTABLE)?;
        }

        let primary = bio.get_part_by_uu(&config.primary_state)?;
        let backup = bio.get_part_by_uu(&config.backup_state)?;

        let mut this = Self {
            config,
            primary,
            backup,
            state: BootState::new_zeroed(),
            trace: Ringbuf::new(Trace::None),
        };

        let mut from_backup = BootState::new_zeroed();
        let primary_ok = bio
            .read(primary, 0, this.state.as_mut_bytes())
            .is_ok()
            && this.state.is_valid();
        let backup_ok = bio
            .read(backup, 0, from_backup.as_mut_bytes())
            .is_ok()
            && from_backup.is_valid();
        ringbuf_entry!(
            this.trace,
            Trace::Loaded {
                primary_ok,
                backup_ok
            }
        );

        match (primary_ok, backup_ok) {
            (true, true) => (),
            (true, false) => this.commit(bio)?,
            (false, true) => {
                this.state = from_backup;
                this.commit(bio)?;
            }
            (false, false) => {
                ringbuf_entry!(this.trace, Trace::Defaults);
                this.state = BootState::default();
                this.commit(bio)?;
            }
        }
        Ok(this)
    }

    pub fn config(&self) -> &AbConfig {
        &self.config
    }

    pub fn state(&self) -> &BootState {
        &self.state
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 16> {
        &self.trace
    }

    fn system_uu(&self, system: System) -> Uuid {
        match system {
            System::A => self.config.sys_a,
            System::B => self.config.sys_b,
        }
    }

    fn active_system(&self) -> Option<System> {
        let enable = self.state.enable();
        if enable.contains(Systems::A) {
            Some(System::A)
        } else if enable.contains(Systems::B) {
            Some(System::B)
        } else {
            None
        }
    }

    /// Decides which system boots now, returning it and whether the record
    /// changed.
    fn select(&mut self) -> Result<(System, bool), BootError> {
        let Some(active) = self.active_system() else {
            ringbuf_entry!(self.trace, Trace::NoActiveSystem);
            return Err(BootError::NoActiveBootPartition);
        };
        let verified = self.state.verified();

        if verified.contains(active.bit()) {
            return Ok((active, false));
        }

        let attempts = self.state.remaining_boot_attempts();
        if attempts > 0 {
            self.state.set_remaining_boot_attempts(attempts - 1);
            ringbuf_entry!(
                self.trace,
                Trace::Selected {
                    system: active,
                    attempts: attempts - 1
                }
            );
            return Ok((active, true));
        }

        let other = active.other();
        if verified.contains(other.bit()) {
            ringbuf_entry!(
                self.trace,
                Trace::Rollback {
                    from: active,
                    speculative: false
                }
            );
            self.state.set_enable(other.bit());
            self.state.set_error(active.bit());
            Ok((other, true))
        } else if self.config.rollback_mode == RollbackMode::Speculative {
            ringbuf_entry!(
                self.trace,
                Trace::Rollback {
                    from: active,
                    speculative: true
                }
            );
            self.state.set_enable(other.bit());
            self.state.set_remaining_boot_attempts(1);
            self.state.set_error(active.bit());
            Ok((other, true))
        } else {
            ringbuf_entry!(self.trace, Trace::NoActiveSystem);
            Err(BootError::NoActiveBootPartition)
        }
    }

    /// Runs the boot decision and returns the partition to boot.
    ///
    /// The record is only written when the decision changed it, so booting
    /// an already verified system does not wear the state partitions.
    pub fn get_boot_partition(
        &mut self,
        bio: &mut Bio<'_>,
    ) -> Result<DevHandle, BootError> {
        let (system, changed) = self.select()?;
        if changed {
            self.commit(bio)?;
        }
        bio.get_part_by_uu(&self.system_uu(system))
    }

    /// Makes `uu` the active, verified system; the nil UUID disables both.
    pub fn set_boot_partition(
        &mut self,
        bio: &mut Bio<'_>,
        uu: &Uuid,
    ) -> Result<(), BootError> {
        let system = if *uu == self.config.sys_a {
            Some(System::A)
        } else if *uu == self.config.sys_b {
            Some(System::B)
        } else if uu.is_nil() {
            None
        } else {
            return Err(BootError::PartNotBootable);
        };

        let bits = system.map_or(Systems::empty(), System::bit);
        self.state.set_enable(bits);
        self.state.set_verified(bits);
        self.state.set_error(Systems::empty());
        ringbuf_entry!(self.trace, Trace::Activated(system));
        self.commit(bio)
    }

    /// Returns the UUID of the enabled system, or nil when neither is.
    pub fn active_partition(&self) -> Uuid {
        self.active_system()
            .map_or(Uuid::NIL, |s| self.system_uu(s))
    }

    /// Short human name for a system partition.
    pub fn partition_name(&self, uu: &Uuid) -> &'static str {
        if *uu == self.config.sys_a {
            "A"
        } else if *uu == self.config.sys_b {
            "B"
        } else {
            "?"
        }
    }

    pub fn read_board_reg(&self, index: usize) -> Result<u32, BootError> {
        self.state.board_reg(index).ok_or(BootError::Param)
    }

    pub fn write_board_reg(
        &mut self,
        bio: &mut Bio<'_>,
        index: usize,
        value: u32,
    ) -> Result<(), BootError> {
        self.state
            .set_board_reg(index, value)
            .ok_or(BootError::Param)?;
        self.commit(bio)
    }

    /// Seals the record and writes it to the primary, then the backup
    /// partition.
    pub fn commit(&mut self, bio: &mut Bio<'_>) -> Result<(), BootError> {
        self.state.seal();
        for (dev, primary) in [(self.primary, true), (self.backup, false)] {
            if let Err(err) = bio.write(dev, 0, self.state.as_bytes()) {
                ringbuf_entry!(
                    self.trace,
                    Trace::CommitFailed { primary, err }
                );
                return Err(err);
            }
        }
        ringbuf_entry!(self.trace, Trace::Committed);
        Ok(())
    }
}
