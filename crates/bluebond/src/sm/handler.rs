//! Application-facing security event handler
//!
//! The security manager delivers its callbacks through a single registered
//! handler object. Every method has a no-op default so applications only
//! implement the events they care about; a default handler is installed at
//! construction so delivery never needs a null check.

use crate::error::PairingFailure;
use crate::keys::{Csrk, Irk, Ltk, OobConfirm, OobRandom, Passkey, Rand};
use crate::address::BdAddr;
use crate::pal::{AuthReq, ConnectionHandle, Keypress, LinkEncryption};

/// Events delivered to the application, mirroring the PAL events but
/// carrying resolved application types
#[allow(unused_variables)]
pub trait EventHandler {
    /// A peer requested pairing and authorisation is required; answer with
    /// `accept_pairing_request` or `cancel_pairing_request`
    fn on_pairing_request(&mut self, connection: ConnectionHandle) {}

    fn on_pairing_completed(&mut self, connection: ConnectionHandle) {}

    fn on_pairing_error(&mut self, connection: ConnectionHandle, failure: PairingFailure) {}

    fn on_pairing_timed_out(&mut self, connection: ConnectionHandle) {}

    fn on_link_encryption_result(&mut self, connection: ConnectionHandle, level: LinkEncryption) {}

    fn on_link_encryption_request_timed_out(&mut self, connection: ConnectionHandle) {}

    /// Show this passkey to the user; the peer will enter it
    fn on_passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey) {}

    /// Ask the user for the passkey shown on the peer; answer with
    /// `passkey_entered`
    fn on_passkey_request(&mut self, connection: ConnectionHandle) {}

    /// Ask the user to confirm matching values; answer with
    /// `confirmation_entered`
    fn on_confirmation_request(&mut self, connection: ConnectionHandle) {}

    fn on_keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress) {}

    /// Legacy OOB data is needed; answer with `legacy_pairing_oob_received`
    fn on_legacy_pairing_oob_request(&mut self, connection: ConnectionHandle) {}

    /// Secure connections OOB data is needed; answer with `oob_received`
    fn on_oob_request(&mut self, connection: ConnectionHandle) {}

    /// Local OOB data is ready to be transported to the peer out-of-band
    fn on_oob_generated(&mut self, random: &OobRandom, confirm: &OobConfirm) {}

    fn on_keys_distributed_ltk(&mut self, connection: ConnectionHandle, ltk: &Ltk) {}

    fn on_keys_distributed_local_ltk(&mut self, connection: ConnectionHandle, ltk: &Ltk) {}

    fn on_keys_distributed_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: u16,
        rand: &Rand,
    ) {
    }

    fn on_keys_distributed_local_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: u16,
        rand: &Rand,
    ) {
    }

    fn on_keys_distributed_irk(&mut self, connection: ConnectionHandle, irk: &Irk) {}

    fn on_keys_distributed_bdaddr(
        &mut self,
        connection: ConnectionHandle,
        peer_identity_address_is_public: bool,
        peer_identity_address: &BdAddr,
    ) {
    }

    fn on_keys_distributed_csrk(&mut self, connection: ConnectionHandle, csrk: &Csrk) {}

    fn on_slave_security_request(&mut self, connection: ConnectionHandle, authentication: AuthReq) {
    }

    /// A peer signed write failed verification; repeated failures are an
    /// application policy concern (e.g. disconnect)
    fn on_signed_write_verification_failure(&mut self, connection: ConnectionHandle) {}
}

/// Handler installed at construction; ignores every event
pub(crate) struct DefaultEventHandler;

impl EventHandler for DefaultEventHandler {}
