// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CRC32 flavors used by the persistent formats.
//!
//! Both use the reflected Ethernet polynomial. [`efi_crc32`] is the usual
//! all-ones seeded, complemented variant found in GPT. [`raw_crc32`] starts
//! from zero and is not complemented; the A/B state record and BPAK name ids
//! are defined in terms of it.

use ::crc::{Algorithm, Crc, CRC_32_ISO_HDLC};

/// Reflected CRC32 with zero seed and no output complement.
pub const CRC_32_RAW: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x2dfd_2d88,
    residue: 0,
};

pub static EFI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
pub static RAW: Crc<u32> = Crc::<u32>::new(&CRC_32_RAW);

pub fn efi_crc32(bytes: &[u8]) -> u32 {
    EFI.checksum(bytes)
}

pub fn raw_crc32(bytes: &[u8]) -> u32 {
    RAW.checksum(bytes)
}

/// Computes a CRC over `bytes` as if the four bytes at `field` were zero.
///
/// Self-describing records store their own checksum inline and define it
/// over the record with that field cleared.
pub fn crc32_skipping(
    crc: &'static Crc<u32>,
    bytes: &[u8],
    field: usize,
) -> u32 {
    let mut digest = crc.digest();
    let end = usize::min(field + 4, bytes.len());
    let field = usize::min(field, bytes.len());
    digest.update(&bytes[..field]);
    digest.update(&[0u8; 4][..end - field]);
    digest.update(&bytes[end..]);
    digest.finalize()
}
