// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BPAK signed image packages.
//!
//! [`header`] has the package format, [`auth`] the verification pipeline
//! run on it before anything is booted.

#![cfg_attr(not(test), no_std)]

pub mod auth;
pub mod crypto;
pub mod header;
pub mod id;
pub mod keystore;

pub use auth::{Authenticator, LoadMemory, PayloadReader, RamWindow};
pub use crypto::{Crypto, Digest, HashKind, SoftCrypto};
pub use header::{BpakHeader, MetaHeader, PartHeader};
pub use id::id;
pub use keystore::{Key, KeyKind, KeyStatus, Keystore, NoRevocation, TrustState};

/// Format-level problems with a header, before any cryptography.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BpakError {
    BadMagic = 1,
    /// A part's data and padding are not a whole number of alignment units.
    BadAlignment,
    /// Metadata or a signature does not fit its field.
    SizeError,
    /// No hash algorithm is named.
    NotSupported,
    MissingMeta,
    BufferTooSmall,
    NotFound,
    /// An entry with the same id is already present.
    Exists,
    /// The part, meta or metadata table is full.
    NoSpace,
}
