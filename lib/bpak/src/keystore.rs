// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use boot_api::BootError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Rsa4096,
    Prime256v1,
    Secp384r1,
    Secp521r1,
}

/// A public key built into the bootloader.
#[derive(Copy, Clone, Debug)]
pub struct Key<'k> {
    pub id: u32,
    pub kind: KeyKind,
    pub data: &'k [u8],
}

/// The set of keys images may be signed with. A header names both the
/// keystore and a key in it.
#[derive(Copy, Clone, Debug)]
pub struct Keystore<'k> {
    pub id: u32,
    pub keys: &'k [Key<'k>],
}

impl<'k> Keystore<'k> {
    pub fn get(&self, key_id: u32) -> Option<&'k Key<'k>> {
        self.keys.iter().find(|k| k.id == key_id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Revoked,
}

/// Platform key revocation state, typically backed by fuses.
pub trait TrustState {
    fn key_active(&mut self, key_id: u32) -> Result<bool, BootError>;

    fn key_status(&mut self, key_id: u32) -> Result<KeyStatus, BootError> {
        Ok(if self.key_active(key_id)? {
            KeyStatus::Active
        } else {
            KeyStatus::Revoked
        })
    }

    /// Reports the status of every key in `keystore` through `f`.
    fn for_each_key_status(
        &mut self,
        keystore: &Keystore<'_>,
        f: &mut dyn FnMut(u32, KeyStatus),
    ) -> Result<(), BootError> {
        for k in keystore.keys {
            f(k.id, self.key_status(k.id)?);
        }
        Ok(())
    }
}

/// Trust state for platforms without key revocation.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoRevocation;

impl TrustState for NoRevocation {
    fn key_active(&mut self, _key_id: u32) -> Result<bool, BootError> {
        Ok(true)
    }
}
