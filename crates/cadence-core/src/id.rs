//! Identity types for Cadence
//!
//! On-chain identifiers are fixed-size byte strings. They print and
//! serialize as `0x`-prefixed lowercase hex so persisted state stays
//! readable and matches what block explorers show.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::CadenceError;

macro_rules! hex_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const ZERO: $name = $name([0u8; $len]);
            pub const LEN: usize = $len;

            #[inline]
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::ZERO
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = CadenceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(digits, &mut bytes).map_err(|e| {
                    CadenceError::Serialization(format!(
                        "invalid {} `{}`: {}",
                        stringify!($name),
                        s,
                        e
                    ))
                })?;
                Ok($name(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

hex_bytes!(
    /// Account or contract address (20 bytes)
    Address,
    20
);

hex_bytes!(
    /// Game entity identity (avatar or empire), a 256-bit token id
    EntityId,
    32
);

hex_bytes!(
    /// Transaction hash returned by the transaction layer
    TxRef,
    32
);

hex_bytes!(
    /// Commit secret, revealed together with the actions it hides
    Secret,
    32
);

hex_bytes!(
    /// Chain genesis block hash
    GenesisHash,
    32
);

impl EntityId {
    /// Entity id from a plain integer (big-endian in the low 16 bytes)
    pub fn from_u128(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[16..].copy_from_slice(&value.to_be_bytes());
        EntityId(bytes)
    }

    /// Entity id minted for an owner: `(owner << 96) + sub_id`
    /// Only the low 96 bits of `sub_id` are kept.
    pub fn from_owner(owner: &Address, sub_id: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..20].copy_from_slice(&owner.0);
        let sub = sub_id.to_be_bytes();
        bytes[20..].copy_from_slice(&sub[4..]);
        EntityId(bytes)
    }

    /// Address encoded in the top 160 bits
    pub fn owner(&self) -> Address {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.0[..20]);
        Address(bytes)
    }
}

/// Chain identifier (EIP-155)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain({})", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Game round number
///
/// Epochs 0 and 1 are reserved by the game contract; the first playable
/// epoch is 2.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const FIRST: Epoch = Epoch(2);

    #[inline]
    pub fn new(epoch: u64) -> Self {
        Epoch(epoch)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        Epoch(self.0.saturating_add(1))
    }

    #[inline]
    pub fn previous(self) -> Self {
        Epoch(self.0.saturating_sub(1))
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let address: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        assert_eq!(address.0[19], 0xaa);
        assert_eq!(
            address.to_string(),
            "0x00000000000000000000000000000000000000aa"
        );
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("not hex".parse::<TxRef>().is_err());
    }

    #[test]
    fn test_entity_id_from_owner() {
        let owner = Address([0x11; 20]);
        let id = EntityId::from_owner(&owner, 7);
        assert_eq!(id.owner(), owner);
        assert_eq!(id.0[31], 7);
        assert_eq!(&id.0[20..31], &[0u8; 11]);
    }

    #[test]
    fn test_entity_id_serde_as_hex_string() {
        let id = EntityId::from_u128(1);
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_epoch_ordering() {
        assert!(Epoch::FIRST.next() > Epoch::FIRST);
        assert_eq!(Epoch(0).previous(), Epoch(0));
    }
}
