// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The 4 KiB BPAK header.
//!
//! A package is this header followed by the data of each part, back to back
//! in header order. Small per-package and per-part values (load addresses,
//! versions, transport parameters) live in the metadata blob, indexed by the
//! meta table.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian as le;
use zerocopy::FromZeros;

use crate::crypto::HashKind;
use crate::id;
use crate::BpakError;

pub const MAGIC: u32 = 0x4250_4132;
pub const HEADER_SIZE: usize = 4096;
pub const MAX_PARTS: usize = 32;
pub const MAX_META: usize = 32;
pub const METADATA_BYTES: usize = 1920;
pub const PART_ALIGN: u64 = 512;
pub const META_ALIGN: usize = 8;
pub const SIGNATURE_MAX: usize = 512;
pub const PAYLOAD_HASH_MAX: usize = 64;

/// Part data is not included in the payload hash.
pub const FLAG_EXCLUDE_FROM_HASH: u8 = 1 << 0;
/// Part data was re-encoded for transport; `transport_size` is its length.
pub const FLAG_TRANSPORT: u8 = 1 << 1;

pub const SIGN_RSA4096: u8 = 1;
pub const SIGN_PRIME256V1: u8 = 2;
pub const SIGN_SECP384R1: u8 = 3;
pub const SIGN_SECP521R1: u8 = 4;

#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct MetaHeader {
    pub id: le::U32,
    pub size: le::U16,
    /// Offset into [`BpakHeader::metadata`].
    pub offset: le::U16,
    /// Part this entry describes, or zero.
    pub part_id_ref: le::U32,
    _pad: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<MetaHeader>(), 16);

#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct PartHeader {
    pub id: le::U32,
    pub size: le::U64,
    /// Offset of the part data in the package stream.
    pub offset: le::U64,
    pub transport_size: le::U64,
    pub pad_bytes: le::U16,
    pub flags: u8,
    _pad: u8,
}

const_assert_eq!(core::mem::size_of::<PartHeader>(), 32);

impl PartHeader {
    /// Bytes this part occupies in the stream: data plus padding, or the
    /// transport size for a part prepared for transport.
    pub fn part_size(&self) -> u64 {
        if self.flags & FLAG_TRANSPORT != 0 {
            self.transport_size.get()
        } else {
            self.size.get() + u64::from(self.pad_bytes.get())
        }
    }
}

#[derive(
    Clone,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct BpakHeader {
    pub magic: le::U32,
    _pad0: [u8; 4],
    pub meta: [MetaHeader; MAX_META],
    pub parts: [PartHeader; MAX_PARTS],
    pub metadata: [u8; METADATA_BYTES],
    pub hash_kind: u8,
    pub signature_kind: u8,
    pub alignment: le::U16,
    pub payload_hash: [u8; PAYLOAD_HASH_MAX],
    pub key_id: le::U32,
    pub keystore_id: le::U32,
    _pad1: [u8; 42],
    pub signature: [u8; SIGNATURE_MAX],
    pub signature_sz: le::U16,
}

const_assert_eq!(core::mem::size_of::<BpakHeader>(), HEADER_SIZE);

impl BpakHeader {
    /// An empty header for a SHA-256 / P-256 package.
    pub fn new() -> Self {
        let mut h = Self::new_zeroed();
        h.magic.set(MAGIC);
        h.hash_kind = HashKind::Sha256 as u8;
        h.signature_kind = SIGN_PRIME256V1;
        h.alignment.set(PART_ALIGN as u16);
        h
    }

    pub fn hash_kind(&self) -> Option<HashKind> {
        HashKind::from_header(self.hash_kind)
    }

    /// Checks the structural invariants every other operation relies on.
    pub fn valid_header(&self) -> Result<(), BpakError> {
        if self.magic.get() != MAGIC {
            return Err(BpakError::BadMagic);
        }

        for p in self.parts() {
            let stored = p.size.get().checked_add(u64::from(p.pad_bytes.get()));
            match stored {
                Some(n) if n % PART_ALIGN == 0 => (),
                _ => return Err(BpakError::BadAlignment),
            }
        }

        for m in self.metas() {
            let end = usize::from(m.offset.get()) + usize::from(m.size.get());
            if end > METADATA_BYTES {
                return Err(BpakError::SizeError);
            }
        }

        if self.hash_kind == 0 {
            return Err(BpakError::NotSupported);
        }
        Ok(())
    }

    /// Used part slots, in stream order.
    pub fn parts(&self) -> impl Iterator<Item = &PartHeader> + '_ {
        self.parts.iter().take_while(|p| p.id.get() != 0)
    }

    /// Used meta slots.
    pub fn metas(&self) -> impl Iterator<Item = &MetaHeader> + '_ {
        self.meta.iter().take_while(|m| m.id.get() != 0)
    }

    pub fn get_part(&self, id: u32) -> Result<&PartHeader, BpakError> {
        self.parts()
            .find(|p| p.id.get() == id)
            .ok_or(BpakError::NotFound)
    }

    /// Stream offset of the data of `part`.
    pub fn part_offset(&self, part: &PartHeader) -> u64 {
        HEADER_SIZE as u64
            + self
                .parts()
                .take_while(|p| p.id.get() != part.id.get())
                .map(PartHeader::part_size)
                .sum::<u64>()
    }

    /// Returns the metadata bytes for `id`. With `part_ref` set only an
    /// entry describing that part matches.
    pub fn get_meta(
        &self,
        id: u32,
        part_ref: Option<u32>,
    ) -> Result<&[u8], BpakError> {
        let m = self
            .metas()
            .find(|m| {
                m.id.get() == id
                    && part_ref.map_or(true, |r| m.part_id_ref.get() == r)
            })
            .ok_or(BpakError::NotFound)?;
        let start = usize::from(m.offset.get());
        self.metadata
            .get(start..start + usize::from(m.size.get()))
            .ok_or(BpakError::SizeError)
    }

    /// Every entry carrying `id`, in table order, with the part it refers
    /// to. Walks ids that repeat once per part, like load addresses.
    pub fn meta_entries(
        &self,
        id: u32,
    ) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.metas()
            .filter(move |m| m.id.get() == id)
            .filter_map(move |m| {
                let start = usize::from(m.offset.get());
                self.metadata
                    .get(start..start + usize::from(m.size.get()))
                    .map(|data| (m.part_id_ref.get(), data))
            })
    }

    /// The `pb-load-addr` of a part.
    pub fn load_addr(&self, part_id: u32) -> Result<u64, BpakError> {
        let bytes = match self.get_meta(id::PB_LOAD_ADDR, Some(part_id)) {
            Ok(b) => b,
            Err(BpakError::NotFound) => return Err(BpakError::MissingMeta),
            Err(e) => return Err(e),
        };
        let raw = bytes.get(..8).ok_or(BpakError::SizeError)?;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(raw);
        Ok(u64::from_le_bytes(addr))
    }

    pub fn add_meta(
        &mut self,
        id: u32,
        part_ref: u32,
        data: &[u8],
    ) -> Result<(), BpakError> {
        let size = u16::try_from(data.len()).map_err(|_| BpakError::NoSpace)?;
        let mut offset = 0;
        for m in self.meta.iter_mut() {
            if m.id.get() == 0 {
                let end = offset + data.len();
                if end > METADATA_BYTES {
                    return Err(BpakError::NoSpace);
                }
                m.id.set(id);
                m.size.set(size);
                m.offset.set(offset as u16);
                m.part_id_ref.set(part_ref);
                self.metadata[offset..end].copy_from_slice(data);
                return Ok(());
            }
            if m.id.get() == id && m.part_id_ref.get() == part_ref {
                return Err(BpakError::Exists);
            }
            offset = (offset + usize::from(m.size.get()))
                .next_multiple_of(META_ALIGN);
        }
        Err(BpakError::NoSpace)
    }

    /// Appends a part of `size` bytes, padded up to the part alignment.
    pub fn add_part(&mut self, id: u32, size: u64) -> Result<(), BpakError> {
        if self.parts().any(|p| p.id.get() == id) {
            return Err(BpakError::Exists);
        }
        let offset = HEADER_SIZE as u64
            + self.parts().map(PartHeader::part_size).sum::<u64>();
        let slot = self
            .parts
            .iter_mut()
            .find(|p| p.id.get() == 0)
            .ok_or(BpakError::NoSpace)?;
        slot.id.set(id);
        slot.size.set(size);
        slot.offset.set(offset);
        slot.pad_bytes
            .set(((PART_ALIGN - size % PART_ALIGN) % PART_ALIGN) as u16);
        Ok(())
    }

    pub fn set_key(&mut self, keystore_id: u32, key_id: u32) {
        self.keystore_id.set(keystore_id);
        self.key_id.set(key_id);
    }

    pub fn set_payload_hash(&mut self, digest: &[u8]) -> Result<(), BpakError> {
        let dst = self
            .payload_hash
            .get_mut(..digest.len())
            .ok_or(BpakError::SizeError)?;
        dst.copy_from_slice(digest);
        Ok(())
    }

    pub fn set_signature(&mut self, sig: &[u8]) -> Result<(), BpakError> {
        let dst = self
            .signature
            .get_mut(..sig.len())
            .ok_or(BpakError::SizeError)?;
        dst.copy_from_slice(sig);
        self.signature_sz.set(sig.len() as u16);
        Ok(())
    }

    /// Copies the signature into `out` and zeroes it in the header, leaving
    /// the header as it was when it was signed. Returns the signature length.
    pub fn copyz_signature(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, BpakError> {
        let sz = usize::from(self.signature_sz.get());
        if sz == 0 || sz > SIGNATURE_MAX {
            return Err(BpakError::SizeError);
        }
        let dst = out.get_mut(..sz).ok_or(BpakError::BufferTooSmall)?;
        dst.copy_from_slice(&self.signature[..sz]);
        self.signature.fill(0);
        self.signature_sz.set(0);
        Ok(sz)
    }
}

impl Default for BpakHeader {
    fn default() -> Self {
        Self::new()
    }
}
