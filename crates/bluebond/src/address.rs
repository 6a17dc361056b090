//! Device address types
//!
//! Addresses are stored little-endian as they appear on the wire; the
//! `Display` implementation prints them most-significant byte first.

use std::fmt;

/// Bluetooth device address type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// Public device address
    Public,
    /// Random device address (static or private)
    Random,
    /// Public identity address, resolved from a private address
    PublicIdentity,
    /// Random static identity address, resolved from a private address
    RandomIdentity,
}

impl AddressType {
    /// Whether this address type refers to the public address space
    pub fn is_public(&self) -> bool {
        matches!(self, AddressType::Public | AddressType::PublicIdentity)
    }
}

/// Classification of a random address by its two most significant bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomAddressKind {
    /// Static random address, stable for the lifetime of the device
    Static,
    /// Resolvable private address, rotates and resolves via an IRK
    ResolvablePrivate,
    /// Non-resolvable private address
    NonResolvablePrivate,
}

/// Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this is the all-zero address
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; 6]
    }

    /// Classify a random address by the top two bits of its most
    /// significant byte (Core Spec Vol 6, Part B, 1.3.2)
    pub fn random_kind(&self) -> RandomAddressKind {
        match self.bytes[5] >> 6 {
            0b11 => RandomAddressKind::Static,
            0b01 => RandomAddressKind::ResolvablePrivate,
            _ => RandomAddressKind::NonResolvablePrivate,
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Capacity-bounded list of bonded device addresses, filled from the bond
/// table and handed to the controller as a filter accept list.
#[derive(Debug, Clone)]
pub struct Whitelist {
    capacity: usize,
    addresses: Vec<(AddressType, BdAddr)>,
}

impl Whitelist {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            addresses: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.addresses.len() >= self.capacity
    }

    /// Append an address; returns false if the whitelist is full
    pub fn push(&mut self, address_type: AddressType, address: BdAddr) -> bool {
        if self.is_full() {
            return false;
        }
        self.addresses.push((address_type, address));
        true
    }

    pub fn entries(&self) -> &[(AddressType, BdAddr)] {
        &self.addresses
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
    }

    #[test]
    fn test_random_address_kind() {
        // top two bits select the kind
        assert_eq!(
            BdAddr::new([0, 0, 0, 0, 0, 0xC0]).random_kind(),
            RandomAddressKind::Static
        );
        assert_eq!(
            BdAddr::new([0, 0, 0, 0, 0, 0x40]).random_kind(),
            RandomAddressKind::ResolvablePrivate
        );
        assert_eq!(
            BdAddr::new([0, 0, 0, 0, 0, 0x00]).random_kind(),
            RandomAddressKind::NonResolvablePrivate
        );
    }

    #[test]
    fn test_whitelist_capacity() {
        let mut whitelist = Whitelist::with_capacity(2);
        assert!(whitelist.push(AddressType::Public, BdAddr::new([1, 0, 0, 0, 0, 0])));
        assert!(whitelist.push(AddressType::Random, BdAddr::new([2, 0, 0, 0, 0, 0xC0])));
        assert!(!whitelist.push(AddressType::Public, BdAddr::new([3, 0, 0, 0, 0, 0])));
        assert_eq!(whitelist.len(), 2);
    }
}
