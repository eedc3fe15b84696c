// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two-stage image verification.
//!
//! The header is authenticated first: its signature is checked against a
//! key from the built-in keystore over a hash of the header taken with the
//! signature slot zeroed. The payload is not signed. It is streamed into
//! place and hashed, and the result is compared with the payload hash
//! carried in the (now trusted) header.
//!
//! Nothing loaded by [`Authenticator::load_and_hash`] may be used until
//! [`Authenticator::verify_payload`] has accepted its digest.

use core::ops::Range;

use boot_api::{BootError, Watchdog};
use ringbuf::{ringbuf_entry, Ringbuf};
use zerocopy::IntoBytes;

use crate::crypto::{Crypto, Digest};
use crate::header::{BpakHeader, HEADER_SIZE, SIGNATURE_MAX};
use crate::keystore::{KeyKind, Keystore, TrustState};
use crate::BpakError;

/// Unit of [`PayloadReader::read`] addresses.
pub const READ_BLOCK: u64 = 512;

/// Destination memory for loaded parts.
pub trait LoadMemory {
    /// Returns the `len` bytes at physical address `addr`.
    fn region(&mut self, addr: u64, len: usize) -> Result<&mut [u8], BootError>;
}

/// A buffer standing in for the physical range starting at `base`.
pub struct RamWindow<'m> {
    base: u64,
    mem: &'m mut [u8],
}

impl<'m> RamWindow<'m> {
    pub fn new(base: u64, mem: &'m mut [u8]) -> Self {
        Self { base, mem }
    }
}

impl LoadMemory for RamWindow<'_> {
    fn region(
        &mut self,
        addr: u64,
        len: usize,
    ) -> Result<&mut [u8], BootError> {
        let start = addr
            .checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or(BootError::Mem)?;
        let end = start.checked_add(len).ok_or(BootError::Mem)?;
        self.mem.get_mut(start..end).ok_or(BootError::Mem)
    }
}

/// Source of payload bytes for parts that are not already in memory.
pub trait PayloadReader {
    /// Fills `buf` from the payload, starting `lba` blocks of
    /// [`READ_BLOCK`] bytes after the end of the header.
    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BootError>;

    /// Called with the outcome of each part; the returned value replaces
    /// it.
    fn result(
        &mut self,
        r: Result<(), BootError>,
    ) -> Result<(), BootError> {
        r
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    BadHeader(BpakError),
    KeystoreMismatch { expected: u32, found: u32 },
    KeyNotFound(u32),
    KeyRevoked(u32),
    UnknownHash(u8),
    Authenticated { key_id: u32 },
    SignatureRejected { key_id: u32 },
    MissingLoadAddr { part: u32 },
    Overlap { part: u32, addr: u64 },
    PartLoaded { part: u32, bytes: u64 },
    PartFailed { part: u32, err: BootError },
    PayloadVerified,
    PayloadMismatch,
}

pub struct Authenticator<'a> {
    crypto: &'a mut dyn Crypto,
    keystore: &'a Keystore<'a>,
    trust: &'a mut dyn TrustState,
    /// Memory the bootloader itself occupies.
    reserved: &'a [Range<u64>],
    watchdog: Option<&'a mut dyn Watchdog>,
    trace: Ringbuf<Trace, 16>,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        crypto: &'a mut dyn Crypto,
        keystore: &'a Keystore<'a>,
        trust: &'a mut dyn TrustState,
        reserved: &'a [Range<u64>],
    ) -> Self {
        Self {
            crypto,
            keystore,
            trust,
            reserved,
            watchdog: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Kicked once per loaded chunk.
    pub fn set_watchdog(&mut self, wdog: &'a mut dyn Watchdog) {
        self.watchdog = Some(wdog);
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 16> {
        &self.trace
    }

    pub fn keystore(&self) -> &Keystore<'a> {
        self.keystore
    }

    fn check_header(&mut self, hdr: &BpakHeader) -> Result<(), BootError> {
        hdr.valid_header().map_err(|e| {
            ringbuf_entry!(self.trace, Trace::BadHeader(e));
            BootError::BadHeader
        })
    }

    /// Authenticates the header signature.
    ///
    /// The header is handed back unchanged whatever the outcome.
    pub fn auth_header(
        &mut self,
        hdr: &mut BpakHeader,
    ) -> Result<(), BootError> {
        self.check_header(hdr)?;

        let found = hdr.keystore_id.get();
        if found != self.keystore.id {
            ringbuf_entry!(
                self.trace,
                Trace::KeystoreMismatch {
                    expected: self.keystore.id,
                    found
                }
            );
            return Err(BootError::BadKeystore);
        }

        let key_id = hdr.key_id.get();
        let Some(key) = self.keystore.get(key_id) else {
            ringbuf_entry!(self.trace, Trace::KeyNotFound(key_id));
            return Err(BootError::KeyNotFound);
        };

        if !self.trust.key_active(key_id)? {
            ringbuf_entry!(self.trace, Trace::KeyRevoked(key_id));
            return Err(BootError::KeyRevoked);
        }

        let Some(hash_kind) = hdr.hash_kind() else {
            ringbuf_entry!(self.trace, Trace::UnknownHash(hdr.hash_kind));
            return Err(BootError::UnknownHash);
        };

        match key.kind {
            KeyKind::Prime256v1 | KeyKind::Secp384r1 | KeyKind::Secp521r1 => (),
            KeyKind::Rsa4096 => return Err(BootError::NotSupported),
        }

        self.crypto.hash_init(hash_kind)?;

        let saved = (hdr.signature, hdr.signature_sz);
        let mut sig = [0u8; SIGNATURE_MAX];
        let sig_len =
            hdr.copyz_signature(&mut sig).map_err(|_| BootError::Mem)?;
        let digest = self
            .crypto
            .hash_update(hdr.as_bytes())
            .and_then(|()| self.crypto.hash_final());
        (hdr.signature, hdr.signature_sz) = saved;
        let digest = digest?;

        if self
            .crypto
            .verify(key.kind, key.data, &digest, &sig[..sig_len])?
        {
            ringbuf_entry!(self.trace, Trace::Authenticated { key_id });
            Ok(())
        } else {
            ringbuf_entry!(self.trace, Trace::SignatureRejected { key_id });
            Err(BootError::AuthenticationFailed)
        }
    }

    /// Checks that every part has a load address and that none would be
    /// loaded over the bootloader's own memory.
    pub fn verify_parts(&mut self, hdr: &BpakHeader) -> Result<(), BootError> {
        for p in hdr.parts() {
            let part = p.id.get();
            let Ok(addr) = hdr.load_addr(part) else {
                ringbuf_entry!(self.trace, Trace::MissingLoadAddr { part });
                return Err(BootError::BadMeta);
            };
            let end = addr.checked_add(p.part_size()).ok_or(BootError::Mem)?;
            if self
                .reserved
                .iter()
                .any(|r| addr < r.end && r.start < end)
            {
                ringbuf_entry!(self.trace, Trace::Overlap { part, addr });
                return Err(BootError::Mem);
            }
        }
        Ok(())
    }

    /// Loads every part to its load address and hashes it, returning the
    /// payload digest.
    ///
    /// With a `reader` the bytes are read into place `chunk` bytes at a
    /// time, which must be a whole number of [`READ_BLOCK`]s; without one
    /// the parts are taken to be in memory already and are only hashed.
    pub fn load_and_hash(
        &mut self,
        hdr: &BpakHeader,
        chunk: usize,
        mem: &mut dyn LoadMemory,
        mut reader: Option<&mut (dyn PayloadReader + '_)>,
    ) -> Result<Digest, BootError> {
        self.check_header(hdr)?;
        let Some(hash_kind) = hdr.hash_kind() else {
            ringbuf_entry!(self.trace, Trace::UnknownHash(hdr.hash_kind));
            return Err(BootError::UnknownHash);
        };
        if chunk == 0 || chunk as u64 % READ_BLOCK != 0 {
            return Err(BootError::Param);
        }

        self.crypto.hash_init(hash_kind)?;

        for p in hdr.parts() {
            let part = p.id.get();
            let Ok(addr) = hdr.load_addr(part) else {
                ringbuf_entry!(self.trace, Trace::MissingLoadAddr { part });
                return Err(BootError::BadMeta);
            };
            let stream = hdr.part_offset(p) - HEADER_SIZE as u64;
            let bytes = p.part_size();

            let mut r = self.load_part(
                addr,
                stream,
                bytes,
                chunk,
                mem,
                reader.as_deref_mut(),
            );
            if let Some(rd) = reader.as_deref_mut() {
                r = rd.result(r);
            }
            match r {
                Ok(()) => {
                    ringbuf_entry!(
                        self.trace,
                        Trace::PartLoaded { part, bytes }
                    )
                }
                Err(err) => {
                    ringbuf_entry!(self.trace, Trace::PartFailed { part, err });
                    return Err(err);
                }
            }
        }

        self.crypto.hash_final()
    }

    fn load_part(
        &mut self,
        addr: u64,
        stream: u64,
        bytes: u64,
        chunk: usize,
        mem: &mut dyn LoadMemory,
        mut reader: Option<&mut (dyn PayloadReader + '_)>,
    ) -> Result<(), BootError> {
        let mut done = 0;
        while done < bytes {
            let n = u64::min(bytes - done, chunk as u64);
            let dst = addr.checked_add(done).ok_or(BootError::Mem)?;
            let buf = mem.region(dst, n as usize)?;
            if let Some(rd) = reader.as_deref_mut() {
                rd.read((stream + done) / READ_BLOCK, buf)?;
            }
            self.crypto.hash_update(buf)?;
            if let Some(w) = self.watchdog.as_deref_mut() {
                w.kick();
            }
            done += n;
        }
        Ok(())
    }

    /// Compares a digest from [`Authenticator::load_and_hash`] with the
    /// payload hash in an authenticated header.
    pub fn verify_payload(
        &mut self,
        hdr: &BpakHeader,
        digest: &Digest,
    ) -> Result<(), BootError> {
        self.check_header(hdr)?;
        let Some(hash_kind) = hdr.hash_kind() else {
            ringbuf_entry!(self.trace, Trace::UnknownHash(hdr.hash_kind));
            return Err(BootError::UnknownHash);
        };
        let expected = &hdr.payload_hash[..hash_kind.digest_len()];
        if digest.as_bytes() == expected {
            ringbuf_entry!(self.trace, Trace::PayloadVerified);
            Ok(())
        } else {
            ringbuf_entry!(self.trace, Trace::PayloadMismatch);
            Err(BootError::BadPayload)
        }
    }
}
