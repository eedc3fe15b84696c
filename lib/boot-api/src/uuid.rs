// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;
use serde::de::{self, Deserialize, Deserializer, Unexpected, Visitor};

/// A 16-byte identifier in RFC 4122 (big-endian) byte order.
///
/// GPT stores identifiers in the mixed-endian "GUID" order instead; convert
/// with [`Uuid::to_guid`] and [`Uuid::from_guid`] at that boundary only.
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Hash,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(transparent)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub const NIL: Self = Self([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Parses the 36-character hyphenated form.
    pub const fn parse(s: &str) -> Option<Self> {
        let s = s.as_bytes();
        if s.len() != 36 {
            return None;
        }
        let mut out = [0u8; 16];
        let mut i = 0;
        let mut o = 0;
        while i < 36 {
            if i == 8 || i == 13 || i == 18 || i == 23 {
                if s[i] != b'-' {
                    return None;
                }
                i += 1;
                continue;
            }
            let hi = match hex_val(s[i]) {
                Some(v) => v,
                None => return None,
            };
            let lo = match hex_val(s[i + 1]) {
                Some(v) => v,
                None => return None,
            };
            out[o] = (hi << 4) | lo;
            o += 1;
            i += 2;
        }
        Some(Self(out))
    }

    /// Parses a UUID literal for use in `const` board configuration; a
    /// malformed literal fails the build.
    pub const fn must_parse(s: &str) -> Self {
        match Self::parse(s) {
            Some(u) => u,
            None => panic!("malformed UUID literal"),
        }
    }

    /// Converts to GPT's mixed-endian on-disk order. The first three fields
    /// are byte-swapped, the remaining eight bytes are kept.
    pub const fn to_guid(self) -> Self {
        let b = self.0;
        Self([
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10],
            b[11], b[12], b[13], b[14], b[15],
        ])
    }

    /// Inverse of [`Uuid::to_guid`] (the swap is its own inverse).
    pub const fn from_guid(guid: Self) -> Self {
        guid.to_guid()
    }
}

const fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct UuidVisitor;

        impl Visitor<'_> for UuidVisitor {
            type Value = Uuid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hyphenated UUID string")
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Uuid, E> {
                Uuid::parse(s)
                    .ok_or_else(|| E::invalid_value(Unexpected::Str(s), &self))
            }
        }

        d.deserialize_str(UuidVisitor)
    }
}
