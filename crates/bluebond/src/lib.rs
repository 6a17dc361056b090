//! BlueBond - BLE Security Manager pairing and bonding engine
//!
//! This library implements the host side of Bluetooth Low Energy link
//! security on top of an abstract link-layer stack: the pairing state
//! machine, the bonded-device key database and the control-block table
//! tracking each active connection. The vendor stack is consumed through a
//! platform abstraction layer that accepts commands and raises
//! asynchronous events; SMP framing, cryptography and radio timing stay
//! below that boundary.

pub mod address;
pub mod db;
pub mod error;
pub mod keys;
pub mod pal;
pub mod sm;

// Re-export common types for convenience
pub use address::{AddressType, BdAddr, RandomAddressKind, Whitelist};
pub use db::{DistributionFlags, EntryHandle, FileSecurityDb, MemorySecurityDb, SecurityDb};
pub use error::{PairingFailure, SmError, SmResult};
pub use keys::{
    Csrk, Irk, Ltk, OobConfirm, OobRandom, OobTk, Passkey, Rand, SecurityEntryIdentity,
    SecurityEntryKeys, SecurityEntrySigning,
};
pub use pal::{
    AuthReq, ConnectionHandle, IoCapability, KeyDistribution, Keypress, LinkEncryption,
    SecurityEvent, SecurityPal,
};
pub use sm::{EventHandler, SecurityConfig, SecurityManager};
