//! Error types for the bluebond library
//!
//! Two distinct error surfaces exist: `SmError` for results reported
//! synchronously to callers, and `PairingFailure` for protocol-level
//! failures delivered asynchronously through event callbacks.

use thiserror::Error;

/// Errors reported synchronously by security manager and database operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmError {
    #[error("Operation not valid in the current state")]
    InvalidState,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("No resources available")]
    NoResources,

    #[error("Operation not implemented by this backend")]
    NotImplemented,

    #[error("No matching entry found")]
    NotFound,
}

/// Result type for security manager operations
pub type SmResult<T> = Result<T, SmError>;

/// Reasons a pairing exchange can fail, mirroring the SMP reason codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    #[error("Passkey entry failed")]
    PasskeyEntryFailed,

    #[error("OOB data not available")]
    OobNotAvailable,

    #[error("Authentication requirements not met")]
    AuthenticationRequirements,

    #[error("Confirm value failed")]
    ConfirmValueFailed,

    #[error("Pairing not supported")]
    PairingNotSupported,

    #[error("Encryption key size not acceptable")]
    EncryptionKeySize,

    #[error("Command not supported")]
    CommandNotSupported,

    #[error("Unspecified reason")]
    UnspecifiedReason,

    #[error("Too many pairing attempts")]
    RepeatedAttempts,

    #[error("Invalid parameters")]
    InvalidParameters,

    #[error("DHKey check failed")]
    DhKeyCheckFailed,

    #[error("Numeric comparison failed")]
    NumericComparisonFailed,

    #[error("BR/EDR pairing in progress")]
    BrEdrPairingInProgress,

    #[error("Cross-transport key derivation not allowed")]
    CrossTransportKeyNotAllowed,
}

impl PairingFailure {
    /// Convert to the SMP reason code carried on the wire
    pub fn to_u8(&self) -> u8 {
        use crate::pal::constants::*;

        match self {
            PairingFailure::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            PairingFailure::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            PairingFailure::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            PairingFailure::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            PairingFailure::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            PairingFailure::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            PairingFailure::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            PairingFailure::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            PairingFailure::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            PairingFailure::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            PairingFailure::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            PairingFailure::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            PairingFailure::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            PairingFailure::CrossTransportKeyNotAllowed => {
                SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED
            }
        }
    }

    /// Convert from an SMP reason code; unknown codes map to `None`
    pub fn from_u8(value: u8) -> Option<Self> {
        use crate::pal::constants::*;

        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => Some(PairingFailure::PasskeyEntryFailed),
            SMP_REASON_OOB_NOT_AVAILABLE => Some(PairingFailure::OobNotAvailable),
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => {
                Some(PairingFailure::AuthenticationRequirements)
            }
            SMP_REASON_CONFIRM_VALUE_FAILED => Some(PairingFailure::ConfirmValueFailed),
            SMP_REASON_PAIRING_NOT_SUPPORTED => Some(PairingFailure::PairingNotSupported),
            SMP_REASON_ENCRYPTION_KEY_SIZE => Some(PairingFailure::EncryptionKeySize),
            SMP_REASON_COMMAND_NOT_SUPPORTED => Some(PairingFailure::CommandNotSupported),
            SMP_REASON_UNSPECIFIED_REASON => Some(PairingFailure::UnspecifiedReason),
            SMP_REASON_REPEATED_ATTEMPTS => Some(PairingFailure::RepeatedAttempts),
            SMP_REASON_INVALID_PARAMETERS => Some(PairingFailure::InvalidParameters),
            SMP_REASON_DHKEY_CHECK_FAILED => Some(PairingFailure::DhKeyCheckFailed),
            SMP_REASON_NUMERIC_COMPARISON_FAILED => Some(PairingFailure::NumericComparisonFailed),
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => Some(PairingFailure::BrEdrPairingInProgress),
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => {
                Some(PairingFailure::CrossTransportKeyNotAllowed)
            }
            _ => None,
        }
    }
}
