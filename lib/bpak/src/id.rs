// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata and part identifiers.
//!
//! An id is the raw CRC32 of the ASCII name, so tools can name things with
//! strings while the header only ever stores the 32-bit value.

use boot_api::crc::raw_crc32;

pub fn id(name: &str) -> u32 {
    raw_crc32(name.as_bytes())
}

/// `pb-load-addr`: a little-endian `u64` load address, one per part.
pub const PB_LOAD_ADDR: u32 = 0xd1e6_4a4b;
/// `bpak-transport`: encoder/decoder ids for a part prepared for transport.
pub const BPAK_TRANSPORT: u32 = 0x2d44_bbfb;
pub const KEYSTORE_PROVIDER_ID: u32 = 0xfb36_7d9a;
pub const BPAK_VERSION: u32 = 0x9a5b_ab69;
pub const BPAK_PACKAGE: u32 = 0xfb2f_1f3f;
pub const MERKLE_SALT: u32 = 0x7c9b_2f93;
pub const MERKLE_ROOT_HASH: u32 = 0xe68f_c9be;

/// Returns the name of a well-known id.
pub fn known_id(id: u32) -> Option<&'static str> {
    Some(match id {
        PB_LOAD_ADDR => "pb-load-addr",
        BPAK_TRANSPORT => "bpak-transport",
        KEYSTORE_PROVIDER_ID => "keystore-provider-id",
        BPAK_VERSION => "bpak-version",
        BPAK_PACKAGE => "bpak-package",
        MERKLE_SALT => "merkle-salt",
        MERKLE_ROOT_HASH => "merkle-root-hash",
        _ => return None,
    })
}
