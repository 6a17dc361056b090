//! Bonded-device security database
//!
//! The database stores one entry per bonded peer: distribution flags, the
//! local and peer encryption keys, the peer identity and its signing
//! material. Entries are addressed by an opaque [`EntryHandle`] and looked
//! up by identity address first, then by the address used at connection
//! time. Key retrieval is callback-based because a persistent backing store
//! may need I/O; the in-process backends complete the callback before
//! returning, but callers must not rely on that.

mod file;
mod memory;
#[cfg(test)]
mod tests;

pub use self::file::FileSecurityDb;
pub use self::memory::MemorySecurityDb;

use crate::address::{AddressType, BdAddr, Whitelist};
use crate::keys::{Csrk, Irk, Ltk, Rand, SecurityEntryIdentity, SecurityEntryKeys, SecurityEntrySigning};

/// Number of bonded devices a database holds
pub const MAX_ENTRIES: usize = 5;

/// Opaque handle to a database entry, valid until the entry is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(pub(crate) usize);

/// Per-entry persisted state describing what was distributed during bonding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DistributionFlags {
    /// Address the peer used when the bond was created; zeroed for private
    /// addresses, which are not comparable across rotations
    pub peer_address: BdAddr,
    pub peer_address_is_public: bool,
    /// Negotiated encryption key size in bytes, 0 until pairing completes
    pub encryption_key_size: u8,
    /// A peer LTK is stored
    pub ltk_stored: bool,
    /// The keys were exchanged with MITM protection
    pub mitm_performed: bool,
    /// A peer CSRK is stored
    pub csrk_stored: bool,
    /// A peer IRK and identity address are stored
    pub irk_stored: bool,
    /// The bond was created with secure connections pairing
    pub secure_connections_paired: bool,
    /// Out-of-band data was used during pairing
    pub oob_used: bool,
}

/// Callback receiving entry keys; `None` means validation failed or no key
/// is stored, and the caller should fall back (typically to re-pairing)
pub type EntryKeysCb<'a> = &'a mut dyn FnMut(EntryHandle, Option<&SecurityEntryKeys>);

/// Callback receiving the peer identity of an entry
pub type EntryIdentityCb<'a> = &'a mut dyn FnMut(EntryHandle, Option<&SecurityEntryIdentity>);

/// Callback receiving the peer signing material of an entry
pub type EntrySigningCb<'a> = &'a mut dyn FnMut(EntryHandle, Option<&SecurityEntrySigning>);

/// Store of per-bonded-device security material.
///
/// All lookups return `None`/empty rather than failing: a miss means
/// "proceed without this key", never a fatal condition.
pub trait SecurityDb {
    /// Return the entry matching the peer address, or reserve a free one.
    ///
    /// Lookup tries the identity address first, then the connection-time
    /// address. Private (resolvable or non-resolvable) addresses are never
    /// persisted as the lookup key. Returns `None` when nothing matches and
    /// the pool is exhausted.
    fn open_entry(
        &mut self,
        peer_address_type: AddressType,
        peer_address: &BdAddr,
    ) -> Option<EntryHandle>;

    /// Return a reserved-but-unwritten entry to the free pool; entries that
    /// already hold key material are retained
    fn close_entry(&mut self, entry: EntryHandle);

    /// Remove the entry bonded to the given identity address
    fn remove_entry(&mut self, peer_identity_address: &BdAddr);

    /// Remove all entries and local material
    fn clear_entries(&mut self);

    fn distribution_flags(&self, entry: EntryHandle) -> Option<DistributionFlags>;

    fn set_distribution_flags(&mut self, entry: EntryHandle, flags: DistributionFlags);

    /// Retrieve local keys for legacy re-encryption; the callback receives
    /// `None` unless the supplied EDIV/RAND exactly match the stored pair
    fn get_entry_local_keys(
        &mut self,
        entry: EntryHandle,
        ediv: u16,
        rand: &Rand,
        cb: EntryKeysCb<'_>,
    );

    /// Retrieve local keys for secure connections re-encryption; the
    /// callback receives `None` unless the entry was paired with secure
    /// connections
    fn get_entry_local_keys_sc(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>);

    fn get_entry_peer_keys(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>);

    /// Retrieve the peer identity; the callback receives `None` unless an
    /// IRK was distributed
    fn get_entry_identity(&mut self, entry: EntryHandle, cb: EntryIdentityCb<'_>);

    fn get_entry_peer_csrk(&mut self, entry: EntryHandle, cb: EntrySigningCb<'_>);

    fn set_entry_local_ltk(&mut self, entry: EntryHandle, ltk: &Ltk);

    fn set_entry_local_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand);

    fn set_entry_peer_ltk(&mut self, entry: EntryHandle, ltk: &Ltk);

    fn set_entry_peer_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand);

    fn set_entry_peer_irk(&mut self, entry: EntryHandle, irk: &Irk);

    fn set_entry_peer_bdaddr(
        &mut self,
        entry: EntryHandle,
        address_is_public: bool,
        peer_address: &BdAddr,
    );

    fn set_entry_peer_csrk(&mut self, entry: EntryHandle, csrk: &Csrk);

    fn set_entry_peer_sign_counter(&mut self, entry: EntryHandle, sign_counter: u32);

    // Local device material

    fn local_csrk(&self) -> Option<&Csrk>;

    fn set_local_csrk(&mut self, csrk: Csrk);

    fn local_sign_counter(&self) -> u32;

    fn set_local_sign_counter(&mut self, sign_counter: u32);

    fn local_identity(&self) -> Option<&SecurityEntryIdentity>;

    fn set_local_identity(&mut self, identity: SecurityEntryIdentity);

    // List projections

    /// Fill `out` with as many stored peer identities as fit and invoke the
    /// callback with the slice actually written; used to seed the
    /// controller resolving list
    fn get_identity_list(
        &mut self,
        cb: &mut dyn FnMut(&[SecurityEntryIdentity]),
        out: &mut [SecurityEntryIdentity],
    );

    /// Project bonded public/static addresses into the whitelist, bounded
    /// by its capacity, and invoke the callback with the result
    fn generate_whitelist_from_bond_table(
        &mut self,
        cb: &mut dyn FnMut(&Whitelist),
        whitelist: &mut Whitelist,
    );

    // Persistence lifecycle

    /// Load entries from the backing store, if any and if enabled
    fn restore(&mut self);

    /// Write entries to the backing store, if any
    fn sync(&mut self);

    /// Control whether `restore` reloads persisted state
    fn set_restore(&mut self, reload: bool);
}
