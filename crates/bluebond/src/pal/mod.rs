//! Platform abstraction layer boundary
//!
//! The security manager does not speak SMP framing itself; the vendor
//! link-layer stack does. This module defines the two halves of that
//! boundary: [`SecurityPal`], the command surface the engine drives, and
//! [`SecurityEvent`], the normalized event vocabulary the stack feeds back.
//! Commands are fire-and-forget; their outcome arrives later as an event on
//! the same single-threaded event-processing context.

pub mod constants;
mod types;

pub use self::types::*;

use crate::address::{AddressType, BdAddr};
use crate::error::{PairingFailure, SmError, SmResult};
use crate::keys::{Csrk, Irk, Ltk, OobConfirm, OobRandom, OobTk, Passkey, Rand};

/// Commands issued to the vendor stack.
///
/// Every method returns as soon as the request is handed to the stack;
/// completion is reported asynchronously through [`SecurityEvent`]s. A
/// backend may answer [`SmError::NotImplemented`] for the privacy group
/// (resolving list, private address timeout).
pub trait SecurityPal {
    /// One-time stack bring-up; also (re)generates the local key pair used
    /// for secure connections
    fn initialize(&mut self) -> SmResult<()>;

    /// Reset the stack state
    fn reset(&mut self) -> SmResult<()>;

    fn send_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthReq,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()>;

    fn send_pairing_response(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthReq,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()>;

    /// Request cancellation of an ongoing exchange; termination is
    /// confirmed asynchronously
    fn cancel_pairing(
        &mut self,
        connection: ConnectionHandle,
        reason: PairingFailure,
    ) -> SmResult<()>;

    /// Start encryption with a legacy LTK identified by its EDIV/RAND pair
    fn enable_encryption(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        rand: &Rand,
        ediv: u16,
        mitm: bool,
    ) -> SmResult<()>;

    /// Start encryption with a secure connections LTK
    fn enable_encryption_sc(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
    ) -> SmResult<()>;

    /// Answer an LTK request with the stored key
    fn set_ltk(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
        secure_connections: bool,
    ) -> SmResult<()>;

    /// Answer an LTK request reporting that no matching key exists
    fn set_ltk_not_found(&mut self, connection: ConnectionHandle) -> SmResult<()>;

    /// Install the local identity resolving key
    fn set_irk(&mut self, irk: &Irk) -> SmResult<()>;

    /// Install the local signing key
    fn set_csrk(&mut self, csrk: &Csrk) -> SmResult<()>;

    /// Install the peer signing key and its last known sign counter
    fn set_peer_csrk(
        &mut self,
        connection: ConnectionHandle,
        csrk: &Csrk,
        authenticated: bool,
        sign_counter: u32,
    ) -> SmResult<()>;

    fn passkey_request_reply(
        &mut self,
        connection: ConnectionHandle,
        passkey: Passkey,
    ) -> SmResult<()>;

    fn legacy_pairing_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        tk: &OobTk,
    ) -> SmResult<()>;

    fn confirmation_entered(
        &mut self,
        connection: ConnectionHandle,
        confirmed: bool,
    ) -> SmResult<()>;

    fn send_keypress_notification(
        &mut self,
        connection: ConnectionHandle,
        keypress: Keypress,
    ) -> SmResult<()>;

    /// Start generation of local secure connections OOB data; the values
    /// arrive via [`SecurityEvent::SecureConnectionsOobGenerated`]
    fn generate_secure_connections_oob(&mut self) -> SmResult<()>;

    fn secure_connections_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        local_random: &OobRandom,
        peer_random: &OobRandom,
        peer_confirm: &OobConfirm,
    ) -> SmResult<()>;

    /// Send a slave security request asking the master to raise security
    fn slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthReq,
    ) -> SmResult<()>;

    /// Set the authentication payload timeout, in 10 ms units
    fn set_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
        timeout_in_10ms: u16,
    ) -> SmResult<()>;

    /// Read the authentication payload timeout, in 10 ms units
    fn get_authentication_timeout(&mut self, connection: ConnectionHandle) -> SmResult<u16>;

    /// Configure a fixed display passkey, or clear it to use random ones
    fn set_display_passkey(&mut self, passkey: Option<Passkey>) -> SmResult<()>;

    fn set_io_capability(&mut self, io_capability: IoCapability) -> SmResult<()>;

    /// Bounds are validated by the caller: 7 <= min <= max <= 16
    fn set_encryption_key_requirements(&mut self, min_size: u8, max_size: u8) -> SmResult<()>;

    fn get_secure_connections_support(&mut self) -> SmResult<bool>;

    /// Fill the buffer with random data from the link controller
    fn get_random_data(&mut self, buffer: &mut [u8]) -> SmResult<()>;

    fn set_private_address_timeout(&mut self, _timeout_in_seconds: u16) -> SmResult<()> {
        Err(SmError::NotImplemented)
    }

    fn add_device_to_resolving_list(
        &mut self,
        _peer_identity_address_is_public: bool,
        _peer_identity_address: &BdAddr,
        _peer_irk: &Irk,
    ) -> SmResult<()> {
        Err(SmError::NotImplemented)
    }

    fn remove_device_from_resolving_list(
        &mut self,
        _peer_identity_address_is_public: bool,
        _peer_identity_address: &BdAddr,
    ) -> SmResult<()> {
        Err(SmError::NotImplemented)
    }

    fn clear_resolving_list(&mut self) -> SmResult<()> {
        Err(SmError::NotImplemented)
    }
}

/// Events raised asynchronously by the vendor stack, normalized into one
/// tagged union consumed by
/// [`SecurityManager::process_event`](crate::sm::SecurityManager::process_event).
///
/// Events for a given connection are delivered in protocol order; no
/// ordering exists across connections. The two LTK request shapes are
/// distinct variants on purpose: a request carrying EDIV/RAND targets a
/// legacy key and demands an exact match against the stored pair, while a
/// bare request targets a secure connections key. Conflating them would
/// defeat the point of EDIV/RAND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A link came up; the engine acquires per-connection state
    Connected {
        connection: ConnectionHandle,
        is_master: bool,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        local_address: BdAddr,
    },
    /// A link went down; per-connection state is flushed and released
    Disconnected { connection: ConnectionHandle },

    /// Peer sent a pairing request (responder role)
    PairingRequest {
        connection: ConnectionHandle,
        use_oob: bool,
        authentication: AuthReq,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    },
    /// Pairing terminated with an SMP failure
    PairingError {
        connection: ConnectionHandle,
        failure: PairingFailure,
    },
    /// The stack's pairing timer expired
    PairingTimedOut { connection: ConnectionHandle },
    /// Pairing finished successfully
    PairingCompleted { connection: ConnectionHandle },
    /// Slave requested security escalation (master role)
    SlaveSecurityRequest {
        connection: ConnectionHandle,
        authentication: AuthReq,
    },

    LinkEncryptionResult {
        connection: ConnectionHandle,
        result: LinkEncryption,
    },
    LinkEncryptionRequestTimedOut { connection: ConnectionHandle },

    PasskeyDisplay {
        connection: ConnectionHandle,
        passkey: Passkey,
    },
    PasskeyRequest { connection: ConnectionHandle },
    ConfirmationRequest { connection: ConnectionHandle },
    KeypressNotification {
        connection: ConnectionHandle,
        keypress: Keypress,
    },
    LegacyPairingOobRequest { connection: ConnectionHandle },
    SecureConnectionsOobRequest { connection: ConnectionHandle },
    SecureConnectionsOobGenerated {
        random: OobRandom,
        confirm: OobConfirm,
    },

    /// Peer asks for the secure connections LTK
    LtkRequest { connection: ConnectionHandle },
    /// Peer asks for a legacy LTK identified by EDIV/RAND
    LegacyLtkRequest {
        connection: ConnectionHandle,
        ediv: u16,
        rand: Rand,
    },

    KeysDistributedLtk {
        connection: ConnectionHandle,
        ltk: Ltk,
    },
    KeysDistributedLocalLtk {
        connection: ConnectionHandle,
        ltk: Ltk,
    },
    KeysDistributedEdivRand {
        connection: ConnectionHandle,
        ediv: u16,
        rand: Rand,
    },
    KeysDistributedLocalEdivRand {
        connection: ConnectionHandle,
        ediv: u16,
        rand: Rand,
    },
    KeysDistributedIrk {
        connection: ConnectionHandle,
        irk: Irk,
    },
    KeysDistributedBdaddr {
        connection: ConnectionHandle,
        peer_identity_address_is_public: bool,
        peer_identity_address: BdAddr,
    },
    KeysDistributedCsrk {
        connection: ConnectionHandle,
        csrk: Csrk,
    },
    /// Secure connections pairing derived a shared LTK
    SecureConnectionsLtkGenerated {
        connection: ConnectionHandle,
        ltk: Ltk,
    },

    /// A locally signed write was sent; the local sign counter advances
    SignedWriteDone,
    /// A peer signed write was received and verified by the stack
    SignedWriteReceived {
        connection: ConnectionHandle,
        sign_counter: u32,
    },
    /// A peer signed write failed verification
    SignedWriteVerificationFailure { connection: ConnectionHandle },
}
