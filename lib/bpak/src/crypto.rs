// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hash and signature primitives.
//!
//! The authenticator only talks to the [`Crypto`] trait; a board with a hash
//! engine implements it over the hardware. [`SoftCrypto`] is the portable
//! fallback.

use core::fmt;

use boot_api::BootError;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::Digest as _;
use sha2::{Sha256, Sha384, Sha512};

use crate::keystore::KeyKind;

pub const MAX_DIGEST: usize = 64;

/// Hash algorithm named by a header's `hash_kind` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HashKind {
    Sha256 = 1,
    Sha384 = 2,
    Sha512 = 3,
}

impl HashKind {
    pub fn from_header(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Sha256),
            2 => Some(Self::Sha384),
            3 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// A finished hash, sized for the largest supported algorithm.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Digest {
    buf: [u8; MAX_DIGEST],
    len: usize,
}

impl Digest {
    pub fn new(bytes: &[u8]) -> Option<Self> {
        let mut buf = [0; MAX_DIGEST];
        buf.get_mut(..bytes.len())?.copy_from_slice(bytes);
        Some(Self {
            buf,
            len: bytes.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

pub trait Crypto {
    /// Starts a new hash, discarding any in progress.
    fn hash_init(&mut self, kind: HashKind) -> Result<(), BootError>;

    fn hash_update(&mut self, bytes: &[u8]) -> Result<(), BootError>;

    fn hash_final(&mut self) -> Result<Digest, BootError>;

    /// Checks `signature` over `digest` with a public key of `kind`.
    ///
    /// A malformed or mismatching signature is `Ok(false)`; `Err` is kept
    /// for keys and algorithms the provider cannot handle.
    fn verify(
        &mut self,
        kind: KeyKind,
        key: &[u8],
        digest: &Digest,
        signature: &[u8],
    ) -> Result<bool, BootError>;
}

#[derive(Clone, Default)]
enum HashState {
    #[default]
    Idle,
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Software SHA-2 and ECDSA P-256.
///
/// Keys are SEC1 encoded points and signatures are the fixed-width `r || s`
/// form.
#[derive(Clone, Default)]
pub struct SoftCrypto {
    state: HashState,
}

impl SoftCrypto {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Crypto for SoftCrypto {
    fn hash_init(&mut self, kind: HashKind) -> Result<(), BootError> {
        self.state = match kind {
            HashKind::Sha256 => HashState::Sha256(Sha256::new()),
            HashKind::Sha384 => HashState::Sha384(Sha384::new()),
            HashKind::Sha512 => HashState::Sha512(Sha512::new()),
        };
        Ok(())
    }

    fn hash_update(&mut self, bytes: &[u8]) -> Result<(), BootError> {
        match &mut self.state {
            HashState::Idle => return Err(BootError::Param),
            HashState::Sha256(h) => h.update(bytes),
            HashState::Sha384(h) => h.update(bytes),
            HashState::Sha512(h) => h.update(bytes),
        }
        Ok(())
    }

    fn hash_final(&mut self) -> Result<Digest, BootError> {
        let d = match core::mem::take(&mut self.state) {
            HashState::Idle => return Err(BootError::Param),
            HashState::Sha256(h) => Digest::new(&h.finalize()),
            HashState::Sha384(h) => Digest::new(&h.finalize()),
            HashState::Sha512(h) => Digest::new(&h.finalize()),
        };
        d.ok_or(BootError::Mem)
    }

    fn verify(
        &mut self,
        kind: KeyKind,
        key: &[u8],
        digest: &Digest,
        signature: &[u8],
    ) -> Result<bool, BootError> {
        if kind != KeyKind::Prime256v1 {
            return Err(BootError::NotSupported);
        }
        let key = VerifyingKey::from_sec1_bytes(key)
            .map_err(|_| BootError::BadKeystore)?;
        let Ok(sig) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(key.verify_prehash(digest.as_bytes(), &sig).is_ok())
    }
}
