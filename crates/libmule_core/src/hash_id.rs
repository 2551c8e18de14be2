use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Id<N> {
    pub const fn new(from: [u8; N]) -> Id<N> {
        Id(from)
    }

    pub fn from_bytes(b: &[u8]) -> Option<Id<N>> {
        let arr: [u8; N] = b.try_into().ok()?;
        Some(Id(arr))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl<const N: usize> Default for Id<N> {
    fn default() -> Self {
        Id([0; N])
    }
}

impl<const N: usize> std::fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x?}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> std::fmt::Display for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != N * 2 {
            return Err(Error::BadHashLength {
                expected: N * 2,
                actual: s.len(),
            });
        }
        let mut out = [0u8; N];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id(out))
    }
}

// Resume data is JSON, so hashes are written as hex strings.
impl<const N: usize> Serialize for Id<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de, const N: usize> Deserialize<'de> for Id<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor<const N: usize>;

        impl<'de, const N: usize> serde::de::Visitor<'de> for IdVisitor<N> {
            type Value = Id<N>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a hex string or a byte array of length {}", N)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id::from_str(v).map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id::from_bytes(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_any(IdVisitor {})
    }
}

/// A 16-byte MD4 hash: file hashes, piece hashes and user ids.
pub type Id16 = Id<16>;

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_id16_from_str() {
        let s = "31d6cfe0d16ae931b73c59d7e0c089c0";
        let id = Id16::from_str(s).unwrap();
        assert_eq!(id.0[0], 0x31);
        assert_eq!(id.as_string(), s);
    }

    #[test]
    fn test_id16_bad_length() {
        assert!(matches!(
            Id16::from_str("abcd"),
            Err(Error::BadHashLength {
                expected: 32,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_id16_serde_json() {
        let id = Id16::new([7; 16]);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"07070707070707070707070707070707\"");
        let back: Id16 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
