//! Security manager pairing engine
//!
//! `SecurityManager` orchestrates the SMP exchange over an abstract
//! platform layer: it validates application requests, derives a per
//! connection control block, drives the PAL with commands and digests the
//! stack's asynchronous events back into database updates and application
//! callbacks. Everything runs on the single event-processing context of
//! the BLE stack; asynchrony is expressed as deferred callbacks, never as
//! parallel execution, so the engine holds no locks.

mod control_block;
mod handler;

pub use self::control_block::{MAX_CONTROL_BLOCKS, MAX_CSRK_FAILURES};
pub use self::handler::EventHandler;

use self::control_block::{ControlBlock, ControlBlockPool};
use self::handler::DefaultEventHandler;
use crate::address::{AddressType, BdAddr, Whitelist};
use crate::db::{
    DistributionFlags, EntryHandle, FileSecurityDb, MemorySecurityDb, SecurityDb, MAX_ENTRIES,
};
use crate::error::{PairingFailure, SmError, SmResult};
use crate::keys::{
    Csrk, Irk, Ltk, OobConfirm, OobRandom, OobTk, Passkey, Rand, SecurityEntryIdentity,
};
use crate::pal::constants::{
    AUTH_TIMEOUT_UNIT_MS, SMP_MAX_ENCRYPTION_KEY_SIZE, SMP_MIN_ENCRYPTION_KEY_SIZE,
};
use crate::pal::{
    AuthReq, ConnectionHandle, IoCapability, KeyDistribution, Keypress, LinkEncryption,
    SecurityEvent, SecurityPal,
};
use log::{debug, info, warn};
use std::path::PathBuf;

/// Configuration applied by [`SecurityManager::init`]
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Store and reuse bonding information
    pub bondable: bool,
    /// Require MITM protection by default
    pub mitm: bool,
    pub io_capability: IoCapability,
    /// Fixed passkey to display instead of a random one
    pub display_passkey: Option<Passkey>,
    /// Generate a local CSRK and support signed writes
    pub signing: bool,
    /// Back the bond database with this file; in-memory when absent
    pub db_path: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bondable: true,
            mitm: true,
            io_capability: IoCapability::NoInputNoOutput,
            display_passkey: None,
            signing: true,
            db_path: None,
        }
    }
}

/// The pairing and key-distribution engine.
///
/// Collaborators are injected at construction: the PAL is owned by the
/// engine, the database is created by [`init`](Self::init), and exactly one
/// application [`EventHandler`] is active at a time (a no-op handler is
/// installed until [`set_event_handler`](Self::set_event_handler) is
/// called).
pub struct SecurityManager<P: SecurityPal> {
    pal: P,
    db: Box<dyn SecurityDb>,
    handler: Box<dyn EventHandler>,
    blocks: ControlBlockPool,

    default_authentication: AuthReq,
    default_key_distribution: KeyDistribution,

    pairing_authorisation_required: bool,
    legacy_pairing_allowed: bool,
    master_sends_keys: bool,
    restore_enabled: bool,
    initialized: bool,

    // At most one outstanding OOB exchange, process-wide
    oob_local_address: BdAddr,
    oob_local_random: OobRandom,
    oob_peer_address: BdAddr,
    oob_peer_random: OobRandom,
    oob_peer_confirm: OobConfirm,
    /// Temporary key for legacy pairing, with the address of the device
    /// that generated it
    oob_temporary_key: OobTk,
    oob_temporary_key_creator_address: BdAddr,
}

impl<P: SecurityPal> SecurityManager<P> {
    pub fn new(pal: P) -> Self {
        Self {
            pal,
            db: Box::new(MemorySecurityDb::new()),
            handler: Box::new(DefaultEventHandler),
            blocks: ControlBlockPool::new(),
            default_authentication: AuthReq::default(),
            default_key_distribution: KeyDistribution::all(),
            pairing_authorisation_required: false,
            legacy_pairing_allowed: true,
            master_sends_keys: false,
            restore_enabled: true,
            initialized: false,
            oob_local_address: BdAddr::default(),
            oob_local_random: OobRandom::default(),
            oob_peer_address: BdAddr::default(),
            oob_peer_random: OobRandom::default(),
            oob_peer_confirm: OobConfirm::default(),
            oob_temporary_key: OobTk::default(),
            oob_temporary_key_creator_address: BdAddr::default(),
        }
    }

    /// Register the application event handler, replacing the previous one
    pub fn set_event_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = handler;
    }

    // Lifecycle management

    /// Configure the engine. Must be called before any pairing operation;
    /// calling it again while connections are active returns
    /// [`SmError::InvalidState`].
    pub fn init(&mut self, config: SecurityConfig) -> SmResult<()> {
        if self.blocks.iter().any(|cb| cb.connected) {
            return Err(SmError::InvalidState);
        }

        self.db = match &config.db_path {
            Some(path) => Box::new(FileSecurityDb::new(path)),
            None => Box::new(MemorySecurityDb::new()),
        };
        self.db.set_restore(self.restore_enabled);
        self.db.restore();

        self.pal.initialize()?;

        let mut authentication = AuthReq::empty();
        if config.bondable {
            authentication |= AuthReq::BONDING;
        }
        if config.mitm {
            authentication |= AuthReq::MITM;
        }
        if self.pal.get_secure_connections_support().unwrap_or(false) {
            authentication |= AuthReq::SECURE_CONNECTIONS;
        }
        self.default_authentication = authentication;

        let mut distribution =
            KeyDistribution::ENCRYPTION | KeyDistribution::IDENTITY | KeyDistribution::SIGNING;
        if !config.signing {
            distribution -= KeyDistribution::SIGNING;
        }
        self.default_key_distribution = distribution;

        self.pal.set_io_capability(config.io_capability)?;
        self.pal.set_display_passkey(config.display_passkey)?;

        if config.signing {
            self.init_signing()?;
        }
        self.init_identity()?;
        self.init_resolving_list();

        self.initialized = true;
        info!(
            "security manager initialized (bondable={}, mitm={}, signing={})",
            config.bondable, config.mitm, config.signing
        );
        Ok(())
    }

    /// Flush the database and drop all transient state
    pub fn reset(&mut self) -> SmResult<()> {
        self.db.sync();
        self.pal.reset()?;
        self.blocks.clear();
        self.initialized = false;
        Ok(())
    }

    /// Keep (or discard) the bond database across [`reset`](Self::reset)
    pub fn preserve_bonding_state_on_reset(&mut self, enable: bool) -> SmResult<()> {
        self.restore_enabled = enable;
        self.db.set_restore(enable);
        Ok(())
    }

    // List management

    /// Delete every bond and the local key material
    pub fn purge_all_bonding_state(&mut self) -> SmResult<()> {
        self.db.clear_entries();
        self.db.sync();
        Ok(())
    }

    /// Fill the whitelist with bonded public/static addresses, bounded by
    /// its capacity
    pub fn generate_whitelist_from_bond_table(
        &mut self,
        whitelist: &mut Whitelist,
    ) -> SmResult<()> {
        self.db
            .generate_whitelist_from_bond_table(&mut |_| {}, whitelist);
        Ok(())
    }

    // Pairing

    /// Start pairing on a connection where the local device is master
    pub fn request_pairing(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        if !self.initialized {
            return Err(SmError::InvalidState);
        }
        self.update_oob_presence(connection);

        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        if !cb.is_master {
            return Err(SmError::InvalidState);
        }

        let authentication = self.connection_authentication(&cb);
        let responder_dist = self.connection_key_distribution(&cb);
        // the master only distributes its own keys when a role reversal is
        // anticipated
        let initiator_dist = if self.master_sends_keys {
            responder_dist
        } else {
            KeyDistribution::empty()
        };
        self.pal.send_pairing_request(
            connection,
            cb.oob_present,
            authentication,
            initiator_dist,
            responder_dist,
        )?;

        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.initiator_key_distribution = initiator_dist;
            cb.responder_key_distribution = responder_dist;
        }
        debug!("pairing requested on connection {}", connection);
        Ok(())
    }

    /// Answer a pairing request previously surfaced through
    /// [`EventHandler::on_pairing_request`]
    pub fn accept_pairing_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        if !self.initialized {
            return Err(SmError::InvalidState);
        }
        self.update_oob_presence(connection);

        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let authentication = self.connection_authentication(&cb);
        let local = self.connection_key_distribution(&cb);
        // respond with the intersection of the peer proposal and our policy
        let initiator_dist = cb.initiator_key_distribution & local;
        let responder_dist = cb.responder_key_distribution & local;

        self.pal.send_pairing_response(
            connection,
            cb.oob_present,
            authentication,
            initiator_dist,
            responder_dist,
        )?;

        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.initiator_key_distribution = initiator_dist;
            cb.responder_key_distribution = responder_dist;
        }
        Ok(())
    }

    /// Ask the stack to abort an ongoing exchange; termination is
    /// confirmed asynchronously and may race the peer's completion
    pub fn cancel_pairing_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        self.pal
            .cancel_pairing(connection, PairingFailure::UnspecifiedReason)
    }

    /// Gate incoming pairing requests on application approval
    pub fn set_pairing_request_authorisation(&mut self, required: bool) -> SmResult<()> {
        self.pairing_authorisation_required = required;
        Ok(())
    }

    // Feature support

    /// Allow or reject peers that only support legacy pairing
    pub fn allow_legacy_pairing(&mut self, allow: bool) -> SmResult<()> {
        self.legacy_pairing_allowed = allow;
        Ok(())
    }

    pub fn get_secure_connections_support(&mut self) -> SmResult<bool> {
        self.pal.get_secure_connections_support()
    }

    // Security settings

    pub fn set_io_capability(&mut self, io_capability: IoCapability) -> SmResult<()> {
        self.pal.set_io_capability(io_capability)
    }

    pub fn set_display_passkey(&mut self, passkey: Option<Passkey>) -> SmResult<()> {
        self.pal.set_display_passkey(passkey)
    }

    pub fn set_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
        timeout_in_ms: u32,
    ) -> SmResult<()> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        self.pal
            .set_authentication_timeout(connection, (timeout_in_ms / AUTH_TIMEOUT_UNIT_MS) as u16)
    }

    pub fn get_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
    ) -> SmResult<u32> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let timeout_in_10ms = self.pal.get_authentication_timeout(connection)?;
        Ok(u32::from(timeout_in_10ms) * AUTH_TIMEOUT_UNIT_MS)
    }

    /// Request keypress notifications during passkey entry
    pub fn set_keypress_notification(&mut self, enabled: bool) -> SmResult<()> {
        if enabled {
            self.default_authentication |= AuthReq::KEYPRESS;
        } else {
            self.default_authentication -= AuthReq::KEYPRESS;
        }
        Ok(())
    }

    /// Hint that the local device may act as master later, so the master
    /// also distributes its keys during pairing
    pub fn set_hint_future_role_reversal(&mut self, enable: bool) -> SmResult<()> {
        self.master_sends_keys = enable;
        Ok(())
    }

    /// Acceptable encryption key sizes, bounded to 7..=16 bytes
    pub fn set_encryption_key_requirements(&mut self, min_size: u8, max_size: u8) -> SmResult<()> {
        if min_size < SMP_MIN_ENCRYPTION_KEY_SIZE
            || max_size > SMP_MAX_ENCRYPTION_KEY_SIZE
            || min_size > max_size
        {
            return Err(SmError::InvalidParam);
        }
        self.pal.set_encryption_key_requirements(min_size, max_size)
    }

    // Encryption

    pub fn get_link_encryption(&self, connection: ConnectionHandle) -> SmResult<LinkEncryption> {
        let cb = self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        Ok(self.current_encryption(cb))
    }

    /// Escalate link security. Requesting a level at or below the current
    /// one reports the current level through the handler and does nothing
    /// else; this operation never downgrades.
    pub fn set_link_encryption(
        &mut self,
        connection: ConnectionHandle,
        encryption: LinkEncryption,
    ) -> SmResult<()> {
        if !self.initialized {
            return Err(SmError::InvalidState);
        }
        if encryption == LinkEncryption::InProgress {
            return Err(SmError::InvalidParam);
        }

        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let current = self.current_encryption(&cb);
        if encryption <= current {
            self.handler.on_link_encryption_result(connection, current);
            return Ok(());
        }

        if encryption == LinkEncryption::Encrypted {
            return self.enable_encryption(connection);
        }

        // an authenticated level is wanted
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.mitm_requested = true;
        }
        let flags = self.entry_flags(cb.db_entry);
        let key_is_sufficient = flags
            .map(|f| {
                f.ltk_stored
                    && f.mitm_performed
                    && (encryption != LinkEncryption::EncryptedWithScMitm
                        || f.secure_connections_paired)
            })
            .unwrap_or(false);

        if key_is_sufficient {
            self.enable_encryption(connection)
        } else if cb.is_master {
            self.request_pairing(connection)
        } else {
            self.slave_security_request(connection)
        }
    }

    pub fn get_encryption_key_size(&self, connection: ConnectionHandle) -> SmResult<u8> {
        let cb = self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let flags = self.entry_flags(cb.db_entry).ok_or(SmError::NotFound)?;
        Ok(flags.encryption_key_size)
    }

    // Signing

    /// Enable or disable signed writes on this connection, overriding the
    /// configured default
    pub fn enable_signing(&mut self, connection: ConnectionHandle, enabled: bool) -> SmResult<()> {
        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.signing_override_default = true;
            cb.signing_requested = enabled;
        }
        if !enabled {
            return Ok(());
        }

        // arm the stack with an already-bonded signing key
        if let Some(entry) = cb.db_entry {
            let flags = self.db.distribution_flags(entry);
            if flags.map(|f| f.csrk_stored).unwrap_or(false) {
                let mut signing = None;
                self.db
                    .get_entry_peer_csrk(entry, &mut |_, s| signing = s.copied());
                if let Some(s) = signing {
                    let authenticated = flags.map(|f| f.mitm_performed).unwrap_or(false);
                    self.pal
                        .set_peer_csrk(connection, &s.csrk, authenticated, s.counter)?;
                }
            }
        }
        Ok(())
    }

    /// Hand the peer signing key to the stack, pairing first when an
    /// authenticated key is required but not bonded
    pub fn get_signing_key(
        &mut self,
        connection: ConnectionHandle,
        authenticated: bool,
    ) -> SmResult<()> {
        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let entry = cb.db_entry.ok_or(SmError::InvalidState)?;
        let flags = self.db.distribution_flags(entry).ok_or(SmError::NotFound)?;

        if flags.csrk_stored && (!authenticated || flags.mitm_performed) {
            let mut signing = None;
            self.db
                .get_entry_peer_csrk(entry, &mut |_, s| signing = s.copied());
            if let Some(s) = signing {
                self.pal
                    .set_peer_csrk(connection, &s.csrk, flags.mitm_performed, s.counter)?;
            }
            Ok(())
        } else if authenticated {
            if let Some(cb) = self.blocks.get_mut(connection) {
                cb.mitm_requested = true;
                cb.signing_override_default = true;
                cb.signing_requested = true;
            }
            if cb.is_master {
                self.request_pairing(connection)
            } else {
                self.slave_security_request(connection)
            }
        } else {
            Err(SmError::NotFound)
        }
    }

    // MITM and out-of-band

    /// Generate local secure connections OOB data for transport to the
    /// device at `address`; at most one exchange is tracked process-wide
    pub fn generate_oob(&mut self, address: &BdAddr) -> SmResult<()> {
        self.pal.generate_secure_connections_oob()?;
        self.oob_local_address = *address;
        Ok(())
    }

    pub fn set_oob_data_usage(
        &mut self,
        connection: ConnectionHandle,
        use_oob: bool,
        oob_provides_mitm: bool,
    ) -> SmResult<()> {
        {
            let cb = self.blocks.get_mut(connection).ok_or(SmError::InvalidState)?;
            cb.attempt_oob = use_oob;
            cb.oob_mitm_protection = oob_provides_mitm;
        }
        self.update_oob_presence(connection);
        Ok(())
    }

    /// Answer [`EventHandler::on_confirmation_request`]
    pub fn confirmation_entered(
        &mut self,
        connection: ConnectionHandle,
        confirmed: bool,
    ) -> SmResult<()> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        if confirmed {
            self.set_mitm_performed(connection);
        }
        self.pal.confirmation_entered(connection, confirmed)
    }

    /// Answer [`EventHandler::on_passkey_request`]
    pub fn passkey_entered(
        &mut self,
        connection: ConnectionHandle,
        passkey: Passkey,
    ) -> SmResult<()> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        self.set_mitm_performed(connection);
        self.pal.passkey_request_reply(connection, passkey)
    }

    pub fn send_keypress_notification(
        &mut self,
        connection: ConnectionHandle,
        keypress: Keypress,
    ) -> SmResult<()> {
        self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        self.pal.send_keypress_notification(connection, keypress)
    }

    /// Supply the legacy temporary key received out-of-band from `address`
    pub fn legacy_pairing_oob_received(
        &mut self,
        address: &BdAddr,
        tk: &OobTk,
    ) -> SmResult<()> {
        self.oob_temporary_key = *tk;
        self.oob_temporary_key_creator_address = *address;

        // serve a request that was waiting for exactly this device's key
        let pending = self
            .blocks
            .iter()
            .find(|cb| {
                cb.legacy_pairing_oob_request_pending
                    && self.peer_address_of(cb) == Some(*address)
            })
            .map(|cb| cb.connection);

        if let Some(connection) = pending {
            let tk = self.oob_temporary_key;
            if let Some(cb) = self.blocks.get_mut(connection) {
                cb.legacy_pairing_oob_request_pending = false;
                if cb.oob_mitm_protection {
                    cb.mitm_performed = true;
                }
            }
            self.pal.legacy_pairing_oob_request_reply(connection, &tk)?;
        }

        self.refresh_oob_presence();
        Ok(())
    }

    /// Supply the peer's secure connections OOB values received
    /// out-of-band from `address`
    pub fn oob_received(
        &mut self,
        address: &BdAddr,
        random: &OobRandom,
        confirm: &OobConfirm,
    ) -> SmResult<()> {
        self.oob_peer_address = *address;
        self.oob_peer_random = *random;
        self.oob_peer_confirm = *confirm;
        self.refresh_oob_presence();
        Ok(())
    }

    // Privacy

    pub fn set_private_address_timeout(&mut self, timeout_in_seconds: u16) -> SmResult<()> {
        self.pal.set_private_address_timeout(timeout_in_seconds)
    }

    // Event processing

    /// Digest one stack event. Events for a connection must be delivered
    /// in protocol order; this is the only entry point besides the public
    /// operations, and both run on the same context.
    pub fn process_event(&mut self, event: SecurityEvent) {
        match event {
            SecurityEvent::Connected {
                connection,
                is_master,
                peer_address_type,
                peer_address,
                local_address,
            } => self.on_connected(
                connection,
                is_master,
                peer_address_type,
                peer_address,
                local_address,
            ),
            SecurityEvent::Disconnected { connection } => self.on_disconnected(connection),
            SecurityEvent::PairingRequest {
                connection,
                use_oob,
                authentication,
                initiator_dist,
                responder_dist,
            } => self.on_pairing_request(
                connection,
                use_oob,
                authentication,
                initiator_dist,
                responder_dist,
            ),
            SecurityEvent::PairingError {
                connection,
                failure,
            } => self.on_pairing_error(connection, failure),
            SecurityEvent::PairingTimedOut { connection } => self.on_pairing_timed_out(connection),
            SecurityEvent::PairingCompleted { connection } => {
                self.on_pairing_completed(connection)
            }
            SecurityEvent::SlaveSecurityRequest {
                connection,
                authentication,
            } => self.on_slave_security_request(connection, authentication),
            SecurityEvent::LinkEncryptionResult { connection, result } => {
                self.on_link_encryption_result(connection, result)
            }
            SecurityEvent::LinkEncryptionRequestTimedOut { connection } => {
                self.on_link_encryption_request_timed_out(connection)
            }
            SecurityEvent::PasskeyDisplay {
                connection,
                passkey,
            } => self.on_passkey_display(connection, passkey),
            SecurityEvent::PasskeyRequest { connection } => self.on_passkey_request(connection),
            SecurityEvent::ConfirmationRequest { connection } => {
                self.on_confirmation_request(connection)
            }
            SecurityEvent::KeypressNotification {
                connection,
                keypress,
            } => self.on_keypress_notification(connection, keypress),
            SecurityEvent::LegacyPairingOobRequest { connection } => {
                self.on_legacy_pairing_oob_request(connection)
            }
            SecurityEvent::SecureConnectionsOobRequest { connection } => {
                self.on_secure_connections_oob_request(connection)
            }
            SecurityEvent::SecureConnectionsOobGenerated { random, confirm } => {
                self.on_secure_connections_oob_generated(random, confirm)
            }
            SecurityEvent::LtkRequest { connection } => self.on_ltk_request(connection),
            SecurityEvent::LegacyLtkRequest {
                connection,
                ediv,
                rand,
            } => self.on_legacy_ltk_request(connection, ediv, rand),
            SecurityEvent::KeysDistributedLtk { connection, ltk } => {
                self.on_keys_distributed_ltk(connection, ltk)
            }
            SecurityEvent::KeysDistributedLocalLtk { connection, ltk } => {
                self.on_keys_distributed_local_ltk(connection, ltk)
            }
            SecurityEvent::KeysDistributedEdivRand {
                connection,
                ediv,
                rand,
            } => self.on_keys_distributed_ediv_rand(connection, ediv, rand),
            SecurityEvent::KeysDistributedLocalEdivRand {
                connection,
                ediv,
                rand,
            } => self.on_keys_distributed_local_ediv_rand(connection, ediv, rand),
            SecurityEvent::KeysDistributedIrk { connection, irk } => {
                self.on_keys_distributed_irk(connection, irk)
            }
            SecurityEvent::KeysDistributedBdaddr {
                connection,
                peer_identity_address_is_public,
                peer_identity_address,
            } => self.on_keys_distributed_bdaddr(
                connection,
                peer_identity_address_is_public,
                peer_identity_address,
            ),
            SecurityEvent::KeysDistributedCsrk { connection, csrk } => {
                self.on_keys_distributed_csrk(connection, csrk)
            }
            SecurityEvent::SecureConnectionsLtkGenerated { connection, ltk } => {
                self.on_secure_connections_ltk_generated(connection, ltk)
            }
            SecurityEvent::SignedWriteDone => self.on_signed_write_done(),
            SecurityEvent::SignedWriteReceived {
                connection,
                sign_counter,
            } => self.on_signed_write_received(connection, sign_counter),
            SecurityEvent::SignedWriteVerificationFailure { connection } => {
                self.on_signed_write_verification_failure(connection)
            }
        }
    }

    // Connection lifecycle

    fn on_connected(
        &mut self,
        connection: ConnectionHandle,
        is_master: bool,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        local_address: BdAddr,
    ) {
        let bondable = self.default_authentication.contains(AuthReq::BONDING);
        let entry = if bondable {
            let entry = self.db.open_entry(peer_address_type, &peer_address);
            if entry.is_none() {
                warn!(
                    "bond table full, connection {} to {} cannot be bonded",
                    connection, peer_address
                );
            }
            entry
        } else {
            None
        };

        let mut acquired = false;
        if let Some(cb) = self.blocks.acquire(connection) {
            cb.connected = true;
            cb.is_master = is_master;
            cb.local_address = local_address;
            cb.db_entry = entry;
            acquired = true;
        }

        if acquired {
            debug!("connection {} to {} acquired a control block", connection, peer_address);
        } else {
            // capacity limit: the link stays up but cannot be secured
            warn!(
                "control block pool exhausted, connection {} cannot be secured",
                connection
            );
            if let Some(entry) = entry {
                self.db.close_entry(entry);
            }
        }
    }

    fn on_disconnected(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.blocks.release(connection) {
            if let Some(entry) = cb.db_entry {
                // reserved entries go back to the pool; written ones persist
                self.db.close_entry(entry);
            }
            self.db.sync();
            debug!("connection {} released its control block", connection);
        }
    }

    // Pairing events

    fn on_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        _use_oob: bool,
        authentication: AuthReq,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) {
        if self.blocks.get(connection).is_none() {
            warn!("pairing request on unknown connection {}", connection);
            return;
        }

        if !self.legacy_pairing_allowed
            && !authentication.contains(AuthReq::SECURE_CONNECTIONS)
        {
            let _ = self
                .pal
                .cancel_pairing(connection, PairingFailure::AuthenticationRequirements);
            return;
        }

        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.initiator_key_distribution = initiator_dist;
            cb.responder_key_distribution = responder_dist;
            if authentication.contains(AuthReq::MITM) {
                cb.mitm_requested = true;
            }
        }

        if self.pairing_authorisation_required {
            self.handler.on_pairing_request(connection);
        } else if let Err(e) = self.accept_pairing_request(connection) {
            warn!(
                "failed to accept pairing request on connection {}: {}",
                connection, e
            );
        }
    }

    fn on_pairing_error(&mut self, connection: ConnectionHandle, failure: PairingFailure) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.clear_pairing_state();
        }
        debug!("pairing failed on connection {}: {}", connection, failure);
        self.handler.on_pairing_error(connection, failure);
    }

    fn on_pairing_timed_out(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            // in-progress state only; bonded data from earlier pairings stays
            cb.clear_pairing_state();
        }
        debug!("pairing timed out on connection {}", connection);
        self.handler.on_pairing_timed_out(connection);
    }

    fn on_pairing_completed(&mut self, connection: ConnectionHandle) {
        let cb = match self.blocks.get(connection) {
            Some(cb) => *cb,
            None => {
                warn!("pairing completed on unknown connection {}", connection);
                return;
            }
        };

        if cb.initiator_key_distribution != KeyDistribution::empty()
            || cb.responder_key_distribution != KeyDistribution::empty()
        {
            debug!(
                "pairing completed on connection {} with undistributed keys ({:?}/{:?})",
                connection, cb.initiator_key_distribution, cb.responder_key_distribution
            );
        }

        if let Some(entry) = cb.db_entry {
            if let Some(mut flags) = self.db.distribution_flags(entry) {
                flags.mitm_performed = cb.mitm_performed;
                flags.oob_used = cb.oob_present;
                if flags.encryption_key_size == 0 {
                    flags.encryption_key_size = SMP_MAX_ENCRYPTION_KEY_SIZE;
                }
                self.db.set_distribution_flags(entry, flags);
            }
            self.db.sync();
        }

        info!("pairing completed on connection {}", connection);
        self.handler.on_pairing_completed(connection);
    }

    fn on_slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthReq,
    ) {
        let cb = match self.blocks.get(connection) {
            Some(cb) => *cb,
            None => {
                warn!("slave security request on unknown connection {}", connection);
                return;
            }
        };

        let mitm = authentication.contains(AuthReq::MITM);
        if mitm {
            if let Some(cb) = self.blocks.get_mut(connection) {
                cb.mitm_requested = true;
            }
        }
        self.handler.on_slave_security_request(connection, authentication);

        let flags = self.entry_flags(cb.db_entry);
        let key_is_sufficient = flags
            .map(|f| f.ltk_stored && (!mitm || f.mitm_performed))
            .unwrap_or(false);

        let result = if key_is_sufficient {
            self.enable_encryption(connection)
        } else {
            self.request_pairing(connection)
        };
        if let Err(e) = result {
            warn!(
                "could not act on slave security request for connection {}: {}",
                connection, e
            );
        }
    }

    // Encryption events

    fn on_link_encryption_result(
        &mut self,
        connection: ConnectionHandle,
        result: LinkEncryption,
    ) {
        match self.blocks.get_mut(connection) {
            Some(cb) => match result {
                LinkEncryption::NotEncrypted => {
                    cb.encryption_requested = false;
                    cb.encryption_failed = true;
                    cb.encrypted = false;
                }
                LinkEncryption::InProgress => {
                    cb.encryption_requested = true;
                }
                _ => {
                    cb.encrypted = true;
                    cb.encryption_requested = false;
                    cb.encryption_failed = false;
                }
            },
            None => {
                warn!("encryption result on unknown connection {}", connection);
                return;
            }
        }

        let mut level = result;
        if result.is_encrypted() {
            // refine the raw result with what we know of the keys in use
            if let Some(cb) = self.blocks.get(connection) {
                let cb = *cb;
                level = self.current_encryption(&cb);
            }
            if level.is_authenticated() {
                if let Some(cb) = self.blocks.get_mut(connection) {
                    cb.authenticated = true;
                }
            }
        }

        debug!("connection {} encryption level now {:?}", connection, level);
        self.handler.on_link_encryption_result(connection, level);
    }

    fn on_link_encryption_request_timed_out(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.encryption_requested = false;
        }
        self.handler.on_link_encryption_request_timed_out(connection);
    }

    // MITM events

    fn on_passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey) {
        self.set_mitm_performed(connection);
        self.handler.on_passkey_display(connection, passkey);
    }

    fn on_passkey_request(&mut self, connection: ConnectionHandle) {
        self.handler.on_passkey_request(connection);
    }

    fn on_confirmation_request(&mut self, connection: ConnectionHandle) {
        self.handler.on_confirmation_request(connection);
    }

    fn on_keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress) {
        self.handler.on_keypress_notification(connection, keypress);
    }

    fn on_legacy_pairing_oob_request(&mut self, connection: ConnectionHandle) {
        let cb = match self.blocks.get(connection) {
            Some(cb) => *cb,
            None => return,
        };

        let have_tk = !self.oob_temporary_key_creator_address.is_zero()
            && self.peer_address_of(&cb) == Some(self.oob_temporary_key_creator_address);

        if have_tk {
            let tk = self.oob_temporary_key;
            if cb.oob_mitm_protection {
                self.set_mitm_performed(connection);
            }
            if let Err(e) = self.pal.legacy_pairing_oob_request_reply(connection, &tk) {
                warn!("legacy OOB reply failed on connection {}: {}", connection, e);
            }
        } else {
            if let Some(cb) = self.blocks.get_mut(connection) {
                cb.legacy_pairing_oob_request_pending = true;
            }
            self.handler.on_legacy_pairing_oob_request(connection);
        }
    }

    fn on_secure_connections_oob_request(&mut self, connection: ConnectionHandle) {
        let cb = match self.blocks.get(connection) {
            Some(cb) => *cb,
            None => return,
        };

        let have_peer_oob = !self.oob_peer_address.is_zero()
            && self.peer_address_of(&cb) == Some(self.oob_peer_address);
        // local OOB data must have been generated for the address this
        // connection uses
        let have_local_oob =
            !self.oob_local_address.is_zero() && cb.local_address == self.oob_local_address;

        if have_peer_oob && have_local_oob {
            let (local_random, peer_random, peer_confirm) = (
                self.oob_local_random,
                self.oob_peer_random,
                self.oob_peer_confirm,
            );
            if cb.oob_mitm_protection {
                self.set_mitm_performed(connection);
            }
            if let Err(e) = self.pal.secure_connections_oob_request_reply(
                connection,
                &local_random,
                &peer_random,
                &peer_confirm,
            ) {
                warn!("OOB reply failed on connection {}: {}", connection, e);
            }
        } else {
            self.handler.on_oob_request(connection);
            let _ = self
                .pal
                .cancel_pairing(connection, PairingFailure::OobNotAvailable);
        }
    }

    fn on_secure_connections_oob_generated(&mut self, random: OobRandom, confirm: OobConfirm) {
        self.oob_local_random = random;
        self.handler.on_oob_generated(&random, &confirm);
    }

    // Key events

    fn on_ltk_request(&mut self, connection: ConnectionHandle) {
        let entry = self.connected_entry(connection);
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let _ = self.pal.set_ltk_not_found(connection);
                return;
            }
        };

        let flags = self.db.distribution_flags(entry);
        let mut keys = None;
        self.db
            .get_entry_local_keys_sc(entry, &mut |_, k| keys = k.copied());

        match keys {
            Some(keys) => {
                let mitm = flags.map(|f| f.mitm_performed).unwrap_or(false);
                if let Err(e) = self.pal.set_ltk(connection, &keys.ltk, mitm, true) {
                    warn!("LTK response failed on connection {}: {}", connection, e);
                }
            }
            None => {
                let _ = self.pal.set_ltk_not_found(connection);
            }
        }
    }

    fn on_legacy_ltk_request(&mut self, connection: ConnectionHandle, ediv: u16, rand: Rand) {
        let entry = self.connected_entry(connection);
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let _ = self.pal.set_ltk_not_found(connection);
                return;
            }
        };

        let flags = self.db.distribution_flags(entry);
        let mut keys = None;
        self.db
            .get_entry_local_keys(entry, ediv, &rand, &mut |_, k| keys = k.copied());

        match keys {
            Some(keys) => {
                let mitm = flags.map(|f| f.mitm_performed).unwrap_or(false);
                if let Err(e) = self.pal.set_ltk(connection, &keys.ltk, mitm, false) {
                    warn!("LTK response failed on connection {}: {}", connection, e);
                }
            }
            None => {
                // the peer asked for a key we did not issue
                debug!(
                    "no local LTK for ediv {:#06x} on connection {}",
                    ediv, connection
                );
                let _ = self.pal.set_ltk_not_found(connection);
            }
        }
    }

    fn on_keys_distributed_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_peer_ltk(entry, &ltk);
        }
        self.clear_distributed_bit(connection, false, KeyDistribution::ENCRYPTION);
        self.handler.on_keys_distributed_ltk(connection, &ltk);
    }

    fn on_keys_distributed_local_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_local_ltk(entry, &ltk);
        }
        self.clear_distributed_bit(connection, true, KeyDistribution::ENCRYPTION);
        self.handler.on_keys_distributed_local_ltk(connection, &ltk);
    }

    fn on_keys_distributed_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: u16,
        rand: Rand,
    ) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_peer_ediv_rand(entry, ediv, &rand);
        }
        self.handler
            .on_keys_distributed_ediv_rand(connection, ediv, &rand);
    }

    fn on_keys_distributed_local_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: u16,
        rand: Rand,
    ) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_local_ediv_rand(entry, ediv, &rand);
        }
        self.handler
            .on_keys_distributed_local_ediv_rand(connection, ediv, &rand);
    }

    fn on_keys_distributed_irk(&mut self, connection: ConnectionHandle, irk: Irk) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_peer_irk(entry, &irk);
        }
        self.clear_distributed_bit(connection, false, KeyDistribution::IDENTITY);
        self.handler.on_keys_distributed_irk(connection, &irk);
    }

    fn on_keys_distributed_bdaddr(
        &mut self,
        connection: ConnectionHandle,
        peer_identity_address_is_public: bool,
        peer_identity_address: BdAddr,
    ) {
        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_peer_bdaddr(
                entry,
                peer_identity_address_is_public,
                &peer_identity_address,
            );
        }
        self.handler.on_keys_distributed_bdaddr(
            connection,
            peer_identity_address_is_public,
            &peer_identity_address,
        );
    }

    fn on_keys_distributed_csrk(&mut self, connection: ConnectionHandle, csrk: Csrk) {
        let mitm = self
            .blocks
            .get(connection)
            .map(|cb| cb.mitm_performed)
            .unwrap_or(false);

        if let Some(entry) = self.connected_entry(connection) {
            self.db.set_entry_peer_csrk(entry, &csrk);
        }
        // arm the stack for signed write verification right away
        if let Err(e) = self.pal.set_peer_csrk(connection, &csrk, mitm, 0) {
            warn!("failed to install peer CSRK on connection {}: {}", connection, e);
        }
        self.clear_distributed_bit(connection, false, KeyDistribution::SIGNING);
        self.handler.on_keys_distributed_csrk(connection, &csrk);
    }

    fn on_secure_connections_ltk_generated(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        if let Some(entry) = self.connected_entry(connection) {
            // the secure connections LTK is symmetric
            self.db.set_entry_local_ltk(entry, &ltk);
            self.db.set_entry_peer_ltk(entry, &ltk);
            if let Some(mut flags) = self.db.distribution_flags(entry) {
                flags.secure_connections_paired = true;
                self.db.set_distribution_flags(entry, flags);
            }
        }
    }

    // Signing events

    fn on_signed_write_done(&mut self) {
        let counter = self.db.local_sign_counter().wrapping_add(1);
        self.db.set_local_sign_counter(counter);
    }

    fn on_signed_write_received(&mut self, connection: ConnectionHandle, sign_counter: u32) {
        let entry = match self.connected_entry(connection) {
            Some(entry) => entry,
            None => return,
        };

        let mut stored = None;
        self.db
            .get_entry_peer_csrk(entry, &mut |_, s| stored = s.copied());
        let current = stored.map(|s| s.counter).unwrap_or(0);

        if sign_counter > current {
            self.db.set_entry_peer_sign_counter(entry, sign_counter);
        } else {
            warn!(
                "stale sign counter {} (stored {}) on connection {}",
                sign_counter, current, connection
            );
            if let Some(cb) = self.blocks.get_mut(connection) {
                cb.add_csrk_failure();
            }
            self.handler.on_signed_write_verification_failure(connection);
        }
    }

    fn on_signed_write_verification_failure(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.add_csrk_failure();
        }
        self.handler.on_signed_write_verification_failure(connection);
    }

    // Helper functions

    fn init_signing(&mut self) -> SmResult<()> {
        let csrk = match self.db.local_csrk() {
            Some(csrk) => *csrk,
            None => {
                let csrk = Csrk::random();
                self.db.set_local_csrk(csrk);
                csrk
            }
        };
        self.pal.set_csrk(&csrk)
    }

    fn init_identity(&mut self) -> SmResult<()> {
        let identity = match self.db.local_identity() {
            Some(identity) => *identity,
            None => {
                let identity = SecurityEntryIdentity {
                    identity_address: BdAddr::default(),
                    identity_address_is_public: true,
                    irk: Irk::random(),
                };
                self.db.set_local_identity(identity);
                identity
            }
        };
        self.pal.set_irk(&identity.irk)
    }

    /// Seed the controller resolving list from the bond table; a PAL
    /// without privacy support is tolerated
    fn init_resolving_list(&mut self) {
        let mut out = [SecurityEntryIdentity::default(); MAX_ENTRIES];
        let mut identities: Vec<SecurityEntryIdentity> = Vec::new();
        self.db
            .get_identity_list(&mut |list| identities.extend_from_slice(list), &mut out);

        match self.pal.clear_resolving_list() {
            Err(SmError::NotImplemented) => {
                debug!("resolving list not supported by this PAL");
                return;
            }
            Err(e) => {
                warn!("failed to clear resolving list: {}", e);
                return;
            }
            Ok(()) => {}
        }

        for identity in identities {
            if let Err(e) = self.pal.add_device_to_resolving_list(
                identity.identity_address_is_public,
                &identity.identity_address,
                &identity.irk,
            ) {
                warn!("failed to populate resolving list: {}", e);
                break;
            }
        }
    }

    fn connection_authentication(&self, cb: &ControlBlock) -> AuthReq {
        let mut authentication = self.default_authentication;
        if cb.mitm_requested || (cb.oob_present && cb.oob_mitm_protection) {
            authentication |= AuthReq::MITM;
        }
        authentication
    }

    fn connection_key_distribution(&self, cb: &ControlBlock) -> KeyDistribution {
        let mut distribution = self.default_key_distribution;
        if cb.signing_override_default {
            if cb.signing_requested {
                distribution |= KeyDistribution::SIGNING;
            } else {
                distribution -= KeyDistribution::SIGNING;
            }
        }
        distribution
    }

    fn current_encryption(&self, cb: &ControlBlock) -> LinkEncryption {
        if cb.encrypted {
            let flags = self.entry_flags(cb.db_entry);
            let secure_connections = flags
                .map(|f| f.secure_connections_paired)
                .unwrap_or(false);
            let mitm = cb.authenticated
                || cb.mitm_performed
                || flags.map(|f| f.mitm_performed).unwrap_or(false);
            if mitm && secure_connections {
                LinkEncryption::EncryptedWithScMitm
            } else if mitm {
                LinkEncryption::EncryptedWithMitm
            } else {
                LinkEncryption::Encrypted
            }
        } else if cb.encryption_requested {
            LinkEncryption::InProgress
        } else {
            LinkEncryption::NotEncrypted
        }
    }

    /// Start encryption with stored keys, falling back to pairing when no
    /// usable key exists
    fn enable_encryption(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;

        if !cb.is_master {
            return self.slave_security_request(connection);
        }

        // a key the controller already rejected is not offered again
        let flags = if cb.encryption_failed {
            None
        } else {
            self.entry_flags(cb.db_entry)
        };

        if let (Some(entry), Some(flags)) = (cb.db_entry, flags) {
            if flags.ltk_stored {
                let mut keys = None;
                self.db
                    .get_entry_peer_keys(entry, &mut |_, k| keys = k.copied());
                if let Some(keys) = keys {
                    if flags.secure_connections_paired {
                        self.pal.enable_encryption_sc(
                            connection,
                            &keys.ltk,
                            flags.mitm_performed,
                        )?;
                    } else {
                        self.pal.enable_encryption(
                            connection,
                            &keys.ltk,
                            &keys.rand,
                            keys.ediv,
                            flags.mitm_performed,
                        )?;
                    }
                    if let Some(cb) = self.blocks.get_mut(connection) {
                        cb.encryption_requested = true;
                    }
                    return Ok(());
                }
            }
        }

        // no key on file: pair instead
        self.request_pairing(connection)
    }

    fn slave_security_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = *self.blocks.get(connection).ok_or(SmError::InvalidState)?;
        let authentication = self.connection_authentication(&cb);
        self.pal.slave_security_request(connection, authentication)?;
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.encryption_requested = true;
        }
        Ok(())
    }

    fn set_mitm_performed(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.mitm_performed = true;
        }
    }

    fn entry_flags(&self, entry: Option<EntryHandle>) -> Option<DistributionFlags> {
        entry.and_then(|entry| self.db.distribution_flags(entry))
    }

    /// Database entry of a connection, if it has one
    fn connected_entry(&self, connection: ConnectionHandle) -> Option<EntryHandle> {
        self.blocks.get(connection).and_then(|cb| cb.db_entry)
    }

    /// Address the peer used when its bond entry was created; private
    /// addresses are not stored and yield `None`
    fn peer_address_of(&self, cb: &ControlBlock) -> Option<BdAddr> {
        let flags = self.entry_flags(cb.db_entry)?;
        if flags.peer_address.is_zero() {
            None
        } else {
            Some(flags.peer_address)
        }
    }

    /// Drop the to-distribute bit once a key of that type arrived, keeping
    /// the completeness bookkeeping reported at pairing completion
    fn clear_distributed_bit(
        &mut self,
        connection: ConnectionHandle,
        local: bool,
        bit: KeyDistribution,
    ) {
        if let Some(cb) = self.blocks.get_mut(connection) {
            let initiator_side = cb.is_master == local;
            if initiator_side {
                cb.initiator_key_distribution -= bit;
            } else {
                cb.responder_key_distribution -= bit;
            }
        }
    }

    fn update_oob_presence(&mut self, connection: ConnectionHandle) {
        let cb = match self.blocks.get(connection) {
            Some(cb) => *cb,
            None => return,
        };

        let peer = self.peer_address_of(&cb);
        let present = cb.attempt_oob
            && peer
                .map(|address| {
                    address == self.oob_peer_address
                        || address == self.oob_temporary_key_creator_address
                })
                .unwrap_or(false);

        if let Some(cb) = self.blocks.get_mut(connection) {
            cb.oob_present = present;
        }
    }

    fn refresh_oob_presence(&mut self) {
        let connections: Vec<ConnectionHandle> =
            self.blocks.iter().map(|cb| cb.connection).collect();
        for connection in connections {
            self.update_oob_presence(connection);
        }
    }
}
