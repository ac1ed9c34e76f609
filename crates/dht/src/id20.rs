use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use sha1w::sha1_concat;

/// A 160-bit identifier. Nodes and records share the same space.
///
/// Ordering is the unsigned big-endian integer order, so comparing two
/// [`Id20::distance`] results tells which id is closer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Id20(pub [u8; 20]);

pub const ID_BITS: usize = 160;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid name {0:?}")]
pub struct InvalidName(pub String);

impl Id20 {
    pub const MAX: Id20 = Id20([0xff; 20]);

    pub fn new(from: [u8; 20]) -> Id20 {
        Id20(from)
    }

    pub fn from_bytes(b: &[u8]) -> Option<Id20> {
        Some(Id20(b.try_into().ok()?))
    }

    pub fn random() -> Id20 {
        Id20(rand::random())
    }

    /// Digest of `parts` concatenated.
    pub fn digest<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Id20 {
        Id20(sha1_concat(parts))
    }

    /// The record identifier for a host name within an optional realm.
    pub fn from_name(realm: Option<&str>, name: &str) -> Result<Id20, InvalidName> {
        if !is_valid_name(name) {
            return Err(InvalidName(name.to_owned()));
        }
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let realm = realm.unwrap_or_default();
        Ok(Id20::digest([realm.as_bytes(), name.as_bytes()]))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn distance(&self, other: &Id20) -> Id20 {
        let mut xor = [0u8; 20];
        for (x, (s, o)) in xor.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *x = s ^ o;
        }
        Id20(xor)
    }

    pub fn get_bit(&self, bit: usize) -> bool {
        let n = self.0[bit / 8];
        let mask = 1 << (7 - bit % 8);
        n & mask > 0
    }

    pub fn set_bit(&mut self, bit: usize, value: bool) {
        let n = &mut self.0[bit / 8];
        if value {
            *n |= 1 << (7 - bit % 8)
        } else {
            let mask = !(1 << (7 - bit % 8));
            *n &= mask;
        }
    }

    pub fn set_bits_range(&mut self, r: std::ops::Range<usize>, value: bool) {
        for bit in r {
            self.set_bit(bit, value)
        }
    }

    /// Number of leading bits shared with `other`, 160 if equal.
    pub fn common_prefix_len(&self, other: &Id20) -> usize {
        for (idx, (s, o)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = s ^ o;
            if x != 0 {
                return idx * 8 + x.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// A random id sharing the first `bits` bits with `self`.
    pub fn random_with_prefix(&self, bits: usize) -> Id20 {
        let mut out = Id20::random();
        for bit in 0..bits.min(ID_BITS) {
            out.set_bit(bit, self.get_bit(bit));
        }
        out
    }
}

/// Host name rules: 1..=253 bytes, dot separated labels of 1..=63 bytes made
/// of ASCII letters, digits and '-', not starting or ending with '-'. A single
/// trailing dot is allowed.
pub fn is_valid_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}

impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl serde::de::Visitor<'_> for IdVisitor {
            type Value = Id20;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("20 bytes or a 40 character hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 40 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                Id20::from_str(v).map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id20::from_bytes(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_any(IdVisitor {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_properties() {
        for _ in 0..100 {
            let a = Id20::random();
            let b = Id20::random();
            assert_eq!(a.distance(&a), Id20::default());
            assert_eq!(a.distance(&b), b.distance(&a));
            if a != b {
                assert!(a.distance(&b) > Id20::default());
            }
        }
    }

    #[test]
    fn test_distance_ordering_is_big_endian() {
        let target = Id20::default();
        let mut near = Id20::default();
        near.0[19] = 0xff;
        let mut far = Id20::default();
        far.0[0] = 0x01;
        assert!(near.distance(&target) < far.distance(&target));
    }

    #[test]
    fn test_set_bit_range() {
        let mut id = Id20::default();
        id.set_bits_range(9..17, true);
        assert_eq!(
            id,
            Id20::new([0, 127, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
        )
    }

    #[test]
    fn test_common_prefix_len() {
        let a = Id20::default();
        assert_eq!(a.common_prefix_len(&a), ID_BITS);
        let mut b = a;
        b.set_bit(0, true);
        assert_eq!(a.common_prefix_len(&b), 0);
        let mut c = a;
        c.set_bit(13, true);
        assert_eq!(a.common_prefix_len(&c), 13);
        let mut d = a;
        d.set_bit(159, true);
        assert_eq!(a.common_prefix_len(&d), 159);
    }

    #[test]
    fn test_random_with_prefix() {
        let base = Id20::random();
        for bits in [0, 1, 7, 8, 63, 159, 160] {
            let r = base.random_with_prefix(bits);
            assert!(base.common_prefix_len(&r) >= bits);
        }
    }

    #[test]
    fn test_from_name() {
        let a = Id20::from_name(None, "Example.p2p").unwrap();
        let b = Id20::from_name(None, "example.p2p.").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Id20::digest([&b"example.p2p"[..]]));

        let in_realm = Id20::from_name(Some("open.p2p"), "example.p2p").unwrap();
        assert_ne!(a, in_realm);

        assert!(Id20::from_name(None, "").is_err());
        assert!(Id20::from_name(None, "-bad.p2p").is_err());
        assert!(Id20::from_name(None, "bad..p2p").is_err());
        assert!(Id20::from_name(None, "sp ace.p2p").is_err());
        assert!(Id20::from_name(None, &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = Id20::random();
        assert_eq!(Id20::from_str(&id.as_string()).unwrap(), id);
        assert!(Id20::from_str("abc").is_err());
    }
}
