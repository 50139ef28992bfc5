use crate::constants::*;
use crate::error::AtcaError;
use modular_bitfield::prelude::*;
use num_enum::IntoPrimitive;
use strum_macros::Display;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Memory zones addressed by Read, Write, GenDig and Lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[repr(u8)]
pub enum Zone {
    Config = 0x00,
    Otp = 0x01,
    Data = 0x02,
}

impl Zone {
    /// Word address of `(slot, block, offset)` within this zone.
    ///
    /// Config and OTP are addressed by block and word offset only; `slot`
    /// is ignored there. The offset is a word index within a 32-byte block.
    pub fn address(&self, slot: u16, block: u8, offset: u8) -> Result<u16, AtcaError> {
        let offset = (offset & 0x07) as u16;
        match self {
            Zone::Config | Zone::Otp => Ok(((block as u16) << 3) | offset),
            Zone::Data => {
                if slot >= SLOT_COUNT {
                    return Err(AtcaError::BadParameter(format!("slot {} out of range", slot)));
                }
                Ok((slot << 3) | offset | ((block as u16) << 8))
            }
        }
    }
}

impl TryFrom<u8> for Zone {
    type Error = AtcaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Zone::Config),
            0x01 => Ok(Zone::Otp),
            0x02 => Ok(Zone::Data),
            _ => Err(AtcaError::BadParameter(format!("invalid zone {:#04x}", value))),
        }
    }
}

/// Param1 of Read and Write: zone in the low bits, encryption flag, access size.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneParam {
    pub zone: B2,
    #[skip]
    unused: B4,
    pub encrypted: bool,
    pub block_access: bool,
}

impl ZoneParam {
    pub fn for_access(zone: Zone, block_access: bool, encrypted: bool) -> Self {
        ZoneParam::new()
            .with_zone(u8::from(zone))
            .with_block_access(block_access)
            .with_encrypted(encrypted)
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }
}

/// Zones that carry a lock byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LockZone {
    Config,
    Data,
}

impl LockZone {
    /// Position of this zone's lock byte inside the lock word.
    pub const fn byte_index(&self) -> usize {
        match self {
            LockZone::Data => 2,
            LockZone::Config => 3,
        }
    }

    /// Mode bit of the Lock command selecting this zone.
    pub const fn lock_mode(&self) -> u8 {
        match self {
            LockZone::Config => 0x00,
            LockZone::Data => 0x01,
        }
    }
}

/// Config zone word at [`LOCK_WORD_ADDRESS`] (bytes 84..=87).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LockWord {
    pub user_extra: u8,
    pub selector: u8,
    pub lock_value: u8,
    pub lock_config: u8,
}

impl LockWord {
    pub fn from_word(word: [u8; WORD_SIZE]) -> Self {
        LockWord {
            user_extra: word[0],
            selector: word[1],
            lock_value: word[2],
            lock_config: word[3],
        }
    }

    pub fn is_locked(&self, zone: LockZone) -> bool {
        self.as_bytes()[zone.byte_index()] == LOCK_BYTE_LOCKED
    }
}

/// Lock state a command needs before it makes sense to run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequirement {
    pub zone: LockZone,
    pub locked: bool,
}

impl LockRequirement {
    pub const fn locked(zone: LockZone) -> Self {
        Self { zone, locked: true }
    }

    pub const fn unlocked(zone: LockZone) -> Self {
        Self { zone, locked: false }
    }
}

/// Whether lock-dependent work applies to the device as it is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Met,
    Unmet(LockRequirement),
}

impl Precondition {
    pub fn is_met(&self) -> bool {
        *self == Precondition::Met
    }
}
