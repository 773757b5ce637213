use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const WORD_BITS: usize = 64;

/// Fixed-length bit string produced by the difference hash.
///
/// Bits are packed little-end first into `u64` words; bit `i` lives in word
/// `i / 64` at position `i % 64`. Unused tail bits are always zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint {
    words: Vec<u64>,
    len: usize,
}

impl Fingerprint {
    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut words = Vec::new();
        let mut len = 0;
        for bit in bits {
            if len % WORD_BITS == 0 {
                words.push(0u64);
            }
            if bit {
                if let Some(word) = words.last_mut() {
                    *word |= 1u64 << (len % WORD_BITS);
                }
            }
            len += 1;
        }
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, index: usize) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        Some((self.words[index / WORD_BITS] >> (index % WORD_BITS)) & 1 == 1)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s: String = (0..self.len)
            .map(|i| if self.bit(i) == Some(true) { '1' } else { '0' })
            .collect();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFingerprintError(pub char);

impl Display for ParseFingerprintError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected character '{}' in fingerprint", self.0)
    }
}

impl std::error::Error for ParseFingerprintError {}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = s
            .trim()
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(ParseFingerprintError(other)),
            })
            .collect::<Result<Vec<bool>, _>>()?;
        Ok(Fingerprint::from_bits(bits))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Fingerprint>().map_err(de::Error::custom)
    }
}

#[derive(
    strum_macros::Display,
    strum_macros::EnumIter,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Normal,
    Mirrored,
    Rotated,
    MirroredRotated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocess {
    /// Input already had card proportions and was resized as-is.
    Direct,
    /// Input was center-cropped to card proportions first. The crop may miss
    /// the card when upstream rectification failed silently.
    CenterCropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintSet {
    pub normal: Fingerprint,
    pub mirrored: Fingerprint,
    pub rotated: Fingerprint,
    pub mirrored_rotated: Fingerprint,
    pub preprocess: Preprocess,
}

impl FingerprintSet {
    pub fn get(&self, orientation: Orientation) -> &Fingerprint {
        match orientation {
            Orientation::Normal => &self.normal,
            Orientation::Mirrored => &self.mirrored,
            Orientation::Rotated => &self.rotated,
            Orientation::MirroredRotated => &self.mirrored_rotated,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Orientation, &Fingerprint)> {
        [
            (Orientation::Normal, &self.normal),
            (Orientation::Mirrored, &self.mirrored),
            (Orientation::Rotated, &self.rotated),
            (Orientation::MirroredRotated, &self.mirrored_rotated),
        ]
        .into_iter()
    }
}
