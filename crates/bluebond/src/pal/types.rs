//! Type definitions for the platform abstraction layer boundary

use super::constants::*;
use bitflags::bitflags;
use std::fmt;

/// Handle identifying an active link, supplied by the stack on connection
/// and invalid after disconnection
pub type ConnectionHandle = u16;

bitflags! {
    /// Authentication requirements negotiated during pairing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AuthReq: u8 {
        const BONDING = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SECURE_CONNECTIONS = SMP_AUTH_REQ_SC;
        const KEYPRESS = SMP_AUTH_REQ_KEYPRESS;
        const CT2 = SMP_AUTH_REQ_CT2;
    }
}

bitflags! {
    /// Key types each side will distribute during pairing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyDistribution: u8 {
        const ENCRYPTION = SMP_KEY_DIST_ENC_KEY;
        const IDENTITY = SMP_KEY_DIST_ID_KEY;
        const SIGNING = SMP_KEY_DIST_SIGN_KEY;
        const LINK = SMP_KEY_DIST_LINK_KEY;
    }
}

/// IO capability advertised for pairing method selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to the value carried on the wire
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from the value carried on the wire
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Keypress notification sent during passkey entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypress {
    EntryStarted,
    DigitEntered,
    DigitErased,
    Cleared,
    EntryCompleted,
}

impl Keypress {
    /// Convert to the value carried on the wire
    pub fn to_u8(&self) -> u8 {
        match self {
            Keypress::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            Keypress::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            Keypress::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            Keypress::Cleared => SMP_KEYPRESS_CLEARED,
            Keypress::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    /// Convert from the value carried on the wire
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(Keypress::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(Keypress::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(Keypress::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(Keypress::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(Keypress::EntryCompleted),
            _ => None,
        }
    }
}

/// Encryption state of a link, ordered by strength
///
/// The ordering backs the escalation-only rule of
/// [`SecurityManager::set_link_encryption`](crate::sm::SecurityManager::set_link_encryption):
/// requesting a level at or below the current one is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkEncryption {
    NotEncrypted,
    /// An encryption or pairing exchange is in flight
    InProgress,
    Encrypted,
    EncryptedWithMitm,
    EncryptedWithScMitm,
}

impl LinkEncryption {
    pub fn is_encrypted(&self) -> bool {
        *self >= LinkEncryption::Encrypted
    }

    pub fn is_authenticated(&self) -> bool {
        *self >= LinkEncryption::EncryptedWithMitm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_req_wire_bits() {
        let auth = AuthReq::BONDING | AuthReq::MITM;
        assert_eq!(auth.bits(), 0x05);
        assert_eq!(AuthReq::from_bits_truncate(0x0D), auth | AuthReq::SECURE_CONNECTIONS);
    }

    #[test]
    fn test_key_distribution_bits() {
        assert_eq!(KeyDistribution::all().bits(), 0x0F);
        let dist = KeyDistribution::ENCRYPTION | KeyDistribution::IDENTITY;
        assert_eq!(dist.bits(), 0x03);
    }

    #[test]
    fn test_io_capability_round_trip() {
        for value in 0..=4 {
            let cap = IoCapability::from_u8(value).unwrap();
            assert_eq!(cap.to_u8(), value);
        }
        assert_eq!(IoCapability::from_u8(5), None);
    }

    #[test]
    fn test_link_encryption_ordering() {
        assert!(LinkEncryption::NotEncrypted < LinkEncryption::Encrypted);
        assert!(LinkEncryption::Encrypted < LinkEncryption::EncryptedWithMitm);
        assert!(LinkEncryption::EncryptedWithMitm < LinkEncryption::EncryptedWithScMitm);
        assert!(LinkEncryption::EncryptedWithMitm.is_encrypted());
        assert!(!LinkEncryption::Encrypted.is_authenticated());
    }
}
