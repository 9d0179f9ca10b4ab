use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Number of LAN registration slots. LAN ids run from 1 to this value.
pub const LAN_SLOTS: u8 = 5;

/// Source index of a property update: 0 local, 1 cloud, `lan_id + 1` for LAN clients.
pub type Source = u8;

pub const SOURCE_LOCAL: Source = 0;
pub const SOURCE_ADS: Source = 1;

/// Destination bit mask: bit 0 is the cloud, bit `n` is LAN client `n`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestMask(u8);

impl DestMask {
    pub const NONE: Self = Self(0);
    pub const ADS: Self = Self(0x01);
    pub const LAN_APPS: Self = Self(0xfe);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Mask of a single LAN client. Ids outside `1..=LAN_SLOTS` yield an empty mask.
    pub fn lan(id: u8) -> Self {
        if (1..=LAN_SLOTS).contains(&id) {
            Self(1 << id)
        } else {
            Self::NONE
        }
    }

    pub fn from_source(source: Source) -> Self {
        match source {
            0 => Self::NONE,
            s if s <= 8 => Self(1 << (s - 1)),
            _ => Self::NONE,
        }
    }

    pub fn lan_source(id: u8) -> Source {
        id + 1
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn has_ads(self) -> bool {
        self.intersects(Self::ADS)
    }

    /// LAN ids present in the mask, ascending.
    pub fn lan_ids(self) -> impl Iterator<Item = u8> {
        (1..=LAN_SLOTS).filter(move |id| self.intersects(Self::lan(*id)))
    }
}

impl BitOr for DestMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DestMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DestMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for DestMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for DestMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for DestMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestMask({:#04x})", self.0)
    }
}

impl fmt::Display for DestMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
