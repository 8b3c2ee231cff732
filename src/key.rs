use const_hex::{FromHex, ToHexExt};
use serde::{Deserialize, Serialize};
use sha1_smol::Sha1;
use std::{
    fmt::{Debug, Display, Error, Formatter},
    str::FromStr,
};

use crate::{KEY_LEN, N_BUCKETS};

/// 160-bit identifier shared by nodes and stored values.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Deserialize, Serialize)]
pub struct DHTKey([u8; KEY_LEN]);

impl DHTKey {
    /// Returns a uniformly distributed random key.
    pub fn random() -> DHTKey {
        DHTKey(rand::random())
    }

    /// Returns the SHA-1 digest of data as a key.
    pub fn hash(data: &[u8]) -> DHTKey {
        let mut hasher = Sha1::new();
        hasher.update(data);
        DHTKey(hasher.digest().bytes())
    }

    pub const fn zero() -> DHTKey {
        DHTKey([0; KEY_LEN])
    }

    /// XORs two keys.
    pub fn distance(&self, y: &DHTKey) -> Distance {
        let mut result = [0; KEY_LEN];
        for (out, (a, b)) in result.iter_mut().zip(self.0.iter().zip(y.0.iter())) {
            *out = a ^ b;
        }

        Distance(result)
    }

    /// Number of leading bits both keys have in common, in `0..=N_BUCKETS`.
    #[inline]
    pub fn shared_prefix_len(&self, y: &DHTKey) -> usize {
        self.distance(y).zeroes_in_prefix()
    }
}

impl From<[u8; KEY_LEN]> for DHTKey {
    fn from(value: [u8; KEY_LEN]) -> Self {
        DHTKey(value)
    }
}

impl Display for DHTKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode_hex_upper())
    }
}

impl Debug for DHTKey {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        write!(f, "{}", self.encode_hex_with_prefix())
    }
}

impl FromStr for DHTKey {
    type Err = const_hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DHTKey::from_hex(s)
    }
}

impl AsRef<[u8]> for DHTKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromHex for DHTKey {
    type Error = const_hex::FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        let mut key = [0u8; KEY_LEN];
        const_hex::decode_to_slice(hex, &mut key)?;
        Ok(DHTKey(key))
    }
}

/// XOR distance between two keys.
///
/// Bytes are stored big-endian, so the derived ordering is the numeric
/// ordering of the distance as an unsigned 160-bit integer.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    pub const MAX: Distance = Distance([u8::MAX; KEY_LEN]);

    pub fn zeroes_in_prefix(&self) -> usize {
        let mut zeroes_count = 0;

        for n in self.0 {
            if n == 0 {
                zeroes_count += 8;
                continue;
            }

            zeroes_count += n.leading_zeros() as usize;

            break;
        }

        debug_assert!(zeroes_count <= N_BUCKETS);
        zeroes_count
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        for x in self.0.iter() {
            write!(f, "{0:02x}", x)?;
        }
        Ok(())
    }
}
