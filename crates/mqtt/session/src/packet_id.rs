//! Packet identifiers and the generator that hands them out.
//!
//! MQTT reserves identifier `0` to mean "no identifier", so [`PacketId`] wraps a
//! [`NonZeroU16`] and the absent case is spelled `Option<PacketId>` everywhere in
//! this crate.

use std::{fmt, num::NonZeroU16};

/// A non-zero MQTT packet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    /// Wraps a raw identifier, returning `None` for the reserved value `0`.
    pub const fn new(value: u16) -> Option<Self> {
        match NonZeroU16::new(value) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Returns the raw on-wire value.
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl From<PacketId> for u16 {
    fn from(id: PacketId) -> Self {
        id.get()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-scoped source of packet identifiers.
///
/// Identifiers increase monotonically and wrap from `65535` back to `1`. The
/// generator itself does not know which identifiers are still in flight; the
/// publish tracker skips live ones when it reserves a slot.
#[derive(Debug, Clone, Default)]
pub struct PacketIdGenerator {
    last: u16,
}

impl PacketIdGenerator {
    /// Creates a generator whose first identifier is `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a generator whose next identifier follows `last`.
    ///
    /// Useful when an identifier space has to continue where a previous
    /// process left off.
    pub fn starting_after(last: u16) -> Self {
        Self { last }
    }

    /// Returns the next identifier, wrapping past `65535` to `1`.
    pub fn next_id(&mut self) -> PacketId {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        PacketId(NonZeroU16::new(self.last).unwrap_or(NonZeroU16::MIN))
    }

    /// Rewinds the generator so the next identifier is `1`.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_rejects_zero() {
        assert!(PacketId::new(0).is_none());
        assert_eq!(PacketId::new(7).map(PacketId::get), Some(7));
    }

    #[test]
    fn test_generator_starts_at_one() {
        let mut ids = PacketIdGenerator::new();
        assert_eq!(ids.next_id().get(), 1);
        assert_eq!(ids.next_id().get(), 2);
    }

    #[test]
    fn test_generator_wraps_without_zero() {
        let mut ids = PacketIdGenerator::starting_after(u16::MAX - 1);
        assert_eq!(ids.next_id().get(), u16::MAX);
        assert_eq!(ids.next_id().get(), 1);
    }

    #[test]
    fn test_generator_reset() {
        let mut ids = PacketIdGenerator::starting_after(41);
        assert_eq!(ids.next_id().get(), 42);
        ids.reset();
        assert_eq!(ids.next_id().get(), 1);
    }
}
