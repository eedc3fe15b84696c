// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot sequencing.
//!
//! [`Boot::load`] runs the board's early hook, finds an image through the
//! configured [`BootSource`], authenticates its header, loads and hashes the
//! payload, checks the payload hash and hands the result to the board's
//! prepare hook. [`Boot::jump`] runs the late hook and transfers control.
//! Any failure ends the attempt; nothing is jumped to unless both the header
//! signature and the payload hash checked out.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use boot_ab::AbState;
use boot_api::{BootError, Uuid};
use bpak::header::HEADER_SIZE;
use bpak::{Authenticator, BpakHeader, LoadMemory, PayloadReader};
use drv_bio::{Bio, BioFlags, DevHandle};
use ringbuf::{ringbuf_entry, Ringbuf};
use serde::Deserialize;
use zerocopy::IntoBytes;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BootFlags: u32 {
        /// Boot was requested over the command interface.
        const CMD = 1 << 0;
        const VERBOSE = 1 << 1;
    }
}

fn default_load_chunk() -> usize {
    512 * 1024
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BootConfig {
    /// Bytes read and hashed per step while loading a payload. Must be a
    /// multiple of 512.
    #[serde(default = "default_load_chunk")]
    pub load_chunk: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            load_chunk: default_load_chunk(),
        }
    }
}

/// Board hooks.
pub trait BootDriver {
    fn early(&mut self) -> Result<(), BootError> {
        Ok(())
    }

    /// Copies the header of an image that is already in memory into `hdr`.
    fn in_mem_image(&mut self, _hdr: &mut BpakHeader) -> Result<(), BootError> {
        Err(BootError::NotSupported)
    }

    /// Loads and fully verifies an image by board-specific means.
    fn authenticate_custom(
        &mut self,
        _hdr: &mut BpakHeader,
    ) -> Result<(), BootError> {
        Err(BootError::NotSupported)
    }

    /// Last chance to fix up the loaded image before it is committed to.
    fn prepare(
        &mut self,
        _hdr: &BpakHeader,
        _part: &Uuid,
    ) -> Result<(), BootError> {
        Ok(())
    }

    fn late(
        &mut self,
        _hdr: &BpakHeader,
        _part: &Uuid,
    ) -> Result<(), BootError> {
        Ok(())
    }

    /// Transfers control to the loaded image. Does not return on success.
    fn jump(&mut self, hdr: &BpakHeader);

    /// Memory the image is loaded into.
    fn load_memory(&mut self) -> &mut dyn LoadMemory;

    /// Free-running tick counter for stage timestamps.
    fn ticks(&mut self) -> u64 {
        0
    }
}

/// Host-driven image transfer, e.g. a RAM boot over the command interface.
pub trait ImageReader {
    fn read_header(&mut self, buf: &mut [u8]) -> Result<(), BootError>;

    /// Reads payload data starting `lba` 512-byte blocks past the header.
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError>;

    /// Sees the outcome of header authentication, each part and payload
    /// verification; the returned value replaces it.
    fn result(&mut self, r: Result<(), BootError>) -> Result<(), BootError> {
        r
    }
}

pub enum BootSource<'a> {
    /// The A/B selected (or an explicitly named) partition.
    Bio,
    InMemory,
    Callback(&'a mut dyn ImageReader),
    Custom,
}

impl BootSource<'_> {
    fn kind(&self) -> SourceKind {
        match self {
            BootSource::Bio => SourceKind::Bio,
            BootSource::InMemory => SourceKind::InMemory,
            BootSource::Callback(_) => SourceKind::Callback,
            BootSource::Custom => SourceKind::Custom,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Bio,
    InMemory,
    Callback,
    Custom,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Early,
    Load(SourceKind),
    Prepare,
    Late,
    Jump,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Enter { stage: Stage, ticks: u64 },
    Device(DevHandle),
    Failed { stage: Stage, err: BootError },
    Loaded,
}

/// Payload reads from a partition whose last blocks hold the header.
struct BioStream<'b, 'd> {
    bio: &'b mut Bio<'d>,
    dev: DevHandle,
    block_size: u64,
}

impl PayloadReader for BioStream<'_, '_> {
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError> {
        let byte = lba * bpak::auth::READ_BLOCK;
        if byte % self.block_size != 0 {
            return Err(BootError::Param);
        }
        self.bio.read(self.dev, byte / self.block_size, buf)
    }
}

struct CallbackStream<'r>(&'r mut dyn ImageReader);

impl PayloadReader for CallbackStream<'_> {
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError> {
        self.0.read(lba, buf)
    }

    fn result(&mut self, r: Result<(), BootError>) -> Result<(), BootError> {
        self.0.result(r)
    }
}

pub struct Boot<'a, D: BootDriver> {
    driver: D,
    auth: Authenticator<'a>,
    ab: Option<AbState>,
    config: BootConfig,
    source: BootSource<'a>,
    flags: BootFlags,
    header: BpakHeader,
    boot_part: Uuid,
    loaded: bool,
    trace: Ringbuf<Trace, 32>,
}

impl<'a, D: BootDriver> Boot<'a, D> {
    pub fn new(driver: D, auth: Authenticator<'a>, config: BootConfig) -> Self {
        Self {
            driver,
            auth,
            ab: None,
            config,
            source: BootSource::Bio,
            flags: BootFlags::empty(),
            header: BpakHeader::new(),
            boot_part: Uuid::NIL,
            loaded: false,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Lets the block device source ask the A/B store which system to boot.
    pub fn set_ab_state(&mut self, ab: AbState) {
        self.ab = Some(ab);
    }

    pub fn ab_state(&self) -> Option<&AbState> {
        self.ab.as_ref()
    }

    pub fn set_source(&mut self, source: BootSource<'a>) {
        self.source = source;
    }

    pub fn source(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn flags(&self) -> BootFlags {
        self.flags
    }

    pub fn clear_set_flags(&mut self, clear: BootFlags, set: BootFlags) {
        self.flags = (self.flags - clear) | set;
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn authenticator(&self) -> &Authenticator<'a> {
        &self.auth
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// Header of the most recently loaded image.
    pub fn header(&self) -> &BpakHeader {
        &self.header
    }

    /// Partition the most recently loaded image came from; nil for sources
    /// other than [`BootSource::Bio`].
    pub fn boot_partition(&self) -> Uuid {
        self.boot_part
    }

    pub fn set_boot_partition(
        &mut self,
        bio: &mut Bio<'_>,
        uu: &Uuid,
    ) -> Result<(), BootError> {
        self.ab
            .as_mut()
            .ok_or(BootError::NotSupported)?
            .set_boot_partition(bio, uu)
    }

    /// The system the A/B store will try next, or nil without one.
    pub fn get_boot_partition(&self) -> Uuid {
        self.ab.as_ref().map_or(Uuid::NIL, AbState::active_partition)
    }

    fn enter(&mut self, stage: Stage) {
        let ticks = self.driver.ticks();
        ringbuf_entry!(self.trace, Trace::Enter { stage, ticks });
    }

    fn fail(&mut self, stage: Stage, err: BootError) -> BootError {
        ringbuf_entry!(self.trace, Trace::Failed { stage, err });
        err
    }

    /// Loads and verifies an image. `part` overrides the A/B choice for the
    /// block device source. Boot flags are cleared whatever the outcome.
    pub fn load(
        &mut self,
        bio: &mut Bio<'_>,
        part: Option<&Uuid>,
    ) -> Result<(), BootError> {
        self.loaded = false;
        let r = self.run_load(bio, part);
        self.flags = BootFlags::empty();
        r
    }

    fn run_load(
        &mut self,
        bio: &mut Bio<'_>,
        part: Option<&Uuid>,
    ) -> Result<(), BootError> {
        self.enter(Stage::Early);
        self.driver
            .early()
            .map_err(|e| self.fail(Stage::Early, e))?;

        self.boot_part = part.copied().unwrap_or(Uuid::NIL);

        let stage = Stage::Load(self.source.kind());
        self.enter(stage);
        let r = match self.source {
            BootSource::Bio => self.load_from_bio(bio),
            BootSource::InMemory => self.load_in_mem(),
            BootSource::Callback(_) => self.load_from_callback(),
            BootSource::Custom => {
                self.driver.authenticate_custom(&mut self.header)
            }
        };
        r.map_err(|e| self.fail(stage, e))?;

        self.enter(Stage::Prepare);
        self.driver
            .prepare(&self.header, &self.boot_part)
            .map_err(|e| self.fail(Stage::Prepare, e))?;

        self.loaded = true;
        ringbuf_entry!(self.trace, Trace::Loaded);
        Ok(())
    }

    fn select_device(
        &mut self,
        bio: &mut Bio<'_>,
    ) -> Result<DevHandle, BootError> {
        let dev = if self.boot_part.is_nil() {
            let dev = self
                .ab
                .as_mut()
                .ok_or(BootError::NotSupported)?
                .get_boot_partition(bio)?;
            self.boot_part = bio.uuid(dev)?;
            dev
        } else {
            bio.get_part_by_uu(&self.boot_part)?
        };
        ringbuf_entry!(self.trace, Trace::Device(dev));

        if !bio.flags(dev)?.contains(BioFlags::BOOTABLE) {
            return Err(BootError::PartNotBootable);
        }
        Ok(dev)
    }

    fn load_from_bio(&mut self, bio: &mut Bio<'_>) -> Result<(), BootError> {
        let dev = self.select_device(bio)?;

        let block_size = bio.block_size(dev)? as u64;
        let header_blocks = (HEADER_SIZE as u64).div_ceil(block_size);
        let header_lba = bio
            .block_count(dev)?
            .checked_sub(header_blocks)
            .ok_or(BootError::Param)?;
        bio.read(dev, header_lba, self.header.as_mut_bytes())?;

        self.auth.auth_header(&mut self.header)?;
        self.auth.verify_parts(&self.header)?;

        let mut stream = BioStream {
            bio,
            dev,
            block_size,
        };
        let digest = self.auth.load_and_hash(
            &self.header,
            self.config.load_chunk,
            self.driver.load_memory(),
            Some(&mut stream),
        )?;
        self.auth.verify_payload(&self.header, &digest)
    }

    fn load_in_mem(&mut self) -> Result<(), BootError> {
        self.driver.in_mem_image(&mut self.header)?;
        self.auth.auth_header(&mut self.header)?;
        self.auth.verify_parts(&self.header)?;
        let digest = self.auth.load_and_hash(
            &self.header,
            self.config.load_chunk,
            self.driver.load_memory(),
            None,
        )?;
        self.auth.verify_payload(&self.header, &digest)
    }

    fn load_from_callback(&mut self) -> Result<(), BootError> {
        let BootSource::Callback(reader) = &mut self.source else {
            return Err(BootError::Param);
        };
        reader.read_header(self.header.as_mut_bytes())?;

        let r = self
            .auth
            .auth_header(&mut self.header)
            .and_then(|()| self.auth.verify_parts(&self.header));
        reader.result(r)?;

        let mut stream = CallbackStream(&mut **reader);
        let digest = self.auth.load_and_hash(
            &self.header,
            self.config.load_chunk,
            self.driver.load_memory(),
            Some(&mut stream),
        )?;

        let r = self.auth.verify_payload(&self.header, &digest);
        reader.result(r)
    }

    /// Runs the late hook and jumps to the loaded image.
    ///
    /// Only returns on failure: the late hook's error, [`BootError::Param`]
    /// when nothing has been loaded, or [`BootError::Jumped`] when the
    /// platform jump came back.
    pub fn jump(&mut self) -> BootError {
        if !self.loaded {
            return BootError::Param;
        }

        self.enter(Stage::Late);
        if let Err(e) = self.driver.late(&self.header, &self.boot_part) {
            return self.fail(Stage::Late, e);
        }

        self.enter(Stage::Jump);
        self.driver.jump(&self.header);
        self.fail(Stage::Jump, BootError::Jumped)
    }

    /// [`Boot::load`] followed by [`Boot::jump`].
    pub fn boot(
        &mut self,
        bio: &mut Bio<'_>,
        part: Option<&Uuid>,
    ) -> BootError {
        match self.load(bio, part) {
            Ok(()) => self.jump(),
            Err(e) => e,
        }
    }
}
