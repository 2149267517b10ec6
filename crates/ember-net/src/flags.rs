//! Delivery flags carried by every packet.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::ProtocolError;

/// Bitwise-combinable delivery flags.
///
/// `UNRELIABLE` is the empty set. `NO_DELAY` asks the transport to drop the
/// packet rather than queue it, which makes no sense for reliable delivery,
/// so `RELIABLE | NO_DELAY` is rejected by [`validate`](Self::validate).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// May be dropped, never retransmitted.
    pub const UNRELIABLE: PacketFlags = PacketFlags(0);
    /// Delivered once per connection lifetime, or the connection fails.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Transmit now instead of batching.
    pub const NO_NAGLE: PacketFlags = PacketFlags(1 << 1);
    /// Drop instead of queueing if the connection cannot send right away.
    pub const NO_DELAY: PacketFlags = PacketFlags(1 << 2);
    /// Alias for [`NO_NAGLE`](Self::NO_NAGLE).
    pub const SEND_IMMEDIATELY: PacketFlags = PacketFlags::NO_NAGLE;

    const ALL_BITS: u8 = 0b111;

    /// Raw bit pattern, as written to the wire.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from the wire, rejecting unknown bits and invalid combinations.
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(ProtocolError::InvalidFlags { bits });
        }
        let flags = PacketFlags(bits);
        flags.validate()?;
        Ok(flags)
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the reliable bit is set.
    #[inline]
    pub fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }

    /// Reject `RELIABLE | NO_DELAY`.
    pub fn validate(self) -> Result<(), ProtocolError> {
        if self.contains(Self::RELIABLE) && self.contains(Self::NO_DELAY) {
            return Err(ProtocolError::InvalidFlags { bits: self.0 });
        }
        Ok(())
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: PacketFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_reliable() {
            parts.push("RELIABLE");
        } else {
            parts.push("UNRELIABLE");
        }
        if self.contains(Self::NO_NAGLE) {
            parts.push("NO_NAGLE");
        }
        if self.contains(Self::NO_DELAY) {
            parts.push("NO_DELAY");
        }
        write!(f, "PacketFlags({})", parts.join(" | "))
    }
}
