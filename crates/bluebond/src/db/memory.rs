//! In-memory security database
//!
//! Fixed pool of entries with first-free-slot allocation and no eviction:
//! once every slot holds a written bond, `open_entry` reports exhaustion
//! for unknown peers instead of silently dropping a bond the peer still
//! holds.

use super::{
    DistributionFlags, EntryHandle, EntryIdentityCb, EntryKeysCb, EntrySigningCb, SecurityDb,
    MAX_ENTRIES,
};
use crate::address::{AddressType, BdAddr, RandomAddressKind, Whitelist};
use crate::keys::{
    Csrk, Irk, Ltk, Rand, SecurityEntryIdentity, SecurityEntryKeys, SecurityEntrySigning,
};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EntryState {
    #[default]
    Free,
    Reserved,
    Written,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Entry {
    pub(crate) state: EntryState,
    pub(crate) flags: DistributionFlags,
    pub(crate) local_keys: SecurityEntryKeys,
    pub(crate) peer_keys: SecurityEntryKeys,
    pub(crate) peer_identity: SecurityEntryIdentity,
    pub(crate) signing: SecurityEntrySigning,
}

/// Snapshot of a written entry, used by the file backend to serialize and
/// rebuild the pool
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryRecord {
    pub(crate) flags: DistributionFlags,
    pub(crate) local_keys: SecurityEntryKeys,
    pub(crate) peer_keys: SecurityEntryKeys,
    pub(crate) peer_identity: SecurityEntryIdentity,
    pub(crate) signing: SecurityEntrySigning,
}

/// Memory-backed [`SecurityDb`]; the persistence hooks are no-ops
#[derive(Debug, Default)]
pub struct MemorySecurityDb {
    entries: [Entry; MAX_ENTRIES],
    local_identity: Option<SecurityEntryIdentity>,
    local_csrk: Option<Csrk>,
    local_sign_counter: u32,
}

impl MemorySecurityDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, handle: EntryHandle) -> Option<&Entry> {
        self.entries
            .get(handle.0)
            .filter(|e| e.state != EntryState::Free)
    }

    fn entry_mut(&mut self, handle: EntryHandle) -> Option<&mut Entry> {
        self.entries
            .get_mut(handle.0)
            .filter(|e| e.state != EntryState::Free)
    }

    /// Mark an entry written; setters call this so that any stored key
    /// material makes the entry survive disconnection
    fn write_entry(&mut self, handle: EntryHandle) -> Option<&mut Entry> {
        let entry = self.entry_mut(handle)?;
        entry.state = EntryState::Written;
        Some(entry)
    }

    /// Free any other written entry bonded to the same identity, so that a
    /// re-bond through a fresh private address converges to a single entry
    fn drop_duplicate_identity(&mut self, keep: EntryHandle, identity_address: &BdAddr) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if i == keep.0 || entry.state != EntryState::Written || !entry.flags.irk_stored {
                continue;
            }
            if entry.peer_identity.identity_address == *identity_address {
                debug!(
                    "dropping stale bond for identity {} in favor of new entry",
                    identity_address
                );
                *entry = Entry::default();
            }
        }
    }

    pub(crate) fn written_records(&self) -> Vec<EntryRecord> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Written)
            .map(|e| EntryRecord {
                flags: e.flags,
                local_keys: e.local_keys,
                peer_keys: e.peer_keys,
                peer_identity: e.peer_identity,
                signing: e.signing,
            })
            .collect()
    }

    /// Install a record into the first free slot; returns false when full
    pub(crate) fn insert_record(&mut self, record: EntryRecord) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Free {
                *entry = Entry {
                    state: EntryState::Written,
                    flags: record.flags,
                    local_keys: record.local_keys,
                    peer_keys: record.peer_keys,
                    peer_identity: record.peer_identity,
                    signing: record.signing,
                };
                return true;
            }
        }
        false
    }
}

impl SecurityDb for MemorySecurityDb {
    fn open_entry(
        &mut self,
        peer_address_type: AddressType,
        peer_address: &BdAddr,
    ) -> Option<EntryHandle> {
        let peer_address_public = peer_address_type.is_public();

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state == EntryState::Free {
                continue;
            }

            if peer_address_type == AddressType::PublicIdentity && !entry.flags.irk_stored {
                continue;
            }

            // identity address first, then the address used at bonding
            if entry.flags.irk_stored
                && entry.peer_identity.identity_address == *peer_address
                && entry.peer_identity.identity_address_is_public == peer_address_public
            {
                return Some(EntryHandle(i));
            }
            if entry.flags.peer_address == *peer_address
                && entry.flags.peer_address_is_public == peer_address_public
            {
                return Some(EntryHandle(i));
            }
        }

        let is_private_address = peer_address_type == AddressType::Random
            && peer_address.random_kind() != RandomAddressKind::Static;

        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.state == EntryState::Free {
                *entry = Entry::default();
                // private addresses rotate and cannot serve as a lookup key
                if !is_private_address {
                    entry.flags.peer_address = *peer_address;
                    entry.flags.peer_address_is_public = peer_address_public;
                }
                entry.state = EntryState::Reserved;
                return Some(EntryHandle(i));
            }
        }

        None
    }

    fn close_entry(&mut self, entry: EntryHandle) {
        if let Some(e) = self.entries.get_mut(entry.0) {
            if e.state == EntryState::Reserved {
                *e = Entry::default();
            }
        }
    }

    fn remove_entry(&mut self, peer_identity_address: &BdAddr) {
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Free {
                continue;
            }
            if entry.peer_identity.identity_address == *peer_identity_address {
                *entry = Entry::default();
                return;
            }
        }
    }

    fn clear_entries(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = Entry::default();
        }
        self.local_identity = None;
        self.local_csrk = None;
        self.local_sign_counter = 0;
    }

    fn distribution_flags(&self, entry: EntryHandle) -> Option<DistributionFlags> {
        self.entry(entry).map(|e| e.flags)
    }

    fn set_distribution_flags(&mut self, entry: EntryHandle, flags: DistributionFlags) {
        if let Some(e) = self.write_entry(entry) {
            e.flags = flags;
        }
    }

    fn get_entry_local_keys(
        &mut self,
        entry: EntryHandle,
        ediv: u16,
        rand: &Rand,
        cb: EntryKeysCb<'_>,
    ) {
        match self.entry(entry) {
            // validate we issued this key
            Some(e) if e.local_keys.ediv == ediv && e.local_keys.rand == *rand => {
                cb(entry, Some(&e.local_keys));
            }
            _ => cb(entry, None),
        }
    }

    fn get_entry_local_keys_sc(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>) {
        match self.entry(entry) {
            Some(e) if e.flags.secure_connections_paired => cb(entry, Some(&e.local_keys)),
            _ => cb(entry, None),
        }
    }

    fn get_entry_peer_keys(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>) {
        match self.entry(entry) {
            Some(e) => cb(entry, Some(&e.peer_keys)),
            None => cb(entry, None),
        }
    }

    fn get_entry_identity(&mut self, entry: EntryHandle, cb: EntryIdentityCb<'_>) {
        match self.entry(entry) {
            Some(e) if e.flags.irk_stored => cb(entry, Some(&e.peer_identity)),
            _ => cb(entry, None),
        }
    }

    fn get_entry_peer_csrk(&mut self, entry: EntryHandle, cb: EntrySigningCb<'_>) {
        match self.entry(entry) {
            Some(e) if e.flags.csrk_stored => cb(entry, Some(&e.signing)),
            _ => cb(entry, None),
        }
    }

    fn set_entry_local_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        if let Some(e) = self.write_entry(entry) {
            e.local_keys.ltk = *ltk;
        }
    }

    fn set_entry_local_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand) {
        if let Some(e) = self.write_entry(entry) {
            e.local_keys.ediv = ediv;
            e.local_keys.rand = *rand;
        }
    }

    fn set_entry_peer_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        if let Some(e) = self.write_entry(entry) {
            e.peer_keys.ltk = *ltk;
            e.flags.ltk_stored = true;
        }
    }

    fn set_entry_peer_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand) {
        if let Some(e) = self.write_entry(entry) {
            e.peer_keys.ediv = ediv;
            e.peer_keys.rand = *rand;
        }
    }

    fn set_entry_peer_irk(&mut self, entry: EntryHandle, irk: &Irk) {
        if let Some(e) = self.write_entry(entry) {
            e.peer_identity.irk = *irk;
            e.flags.irk_stored = true;
        }
    }

    fn set_entry_peer_bdaddr(
        &mut self,
        entry: EntryHandle,
        address_is_public: bool,
        peer_address: &BdAddr,
    ) {
        if let Some(e) = self.write_entry(entry) {
            e.peer_identity.identity_address = *peer_address;
            e.peer_identity.identity_address_is_public = address_is_public;
        }
        self.drop_duplicate_identity(entry, peer_address);
    }

    fn set_entry_peer_csrk(&mut self, entry: EntryHandle, csrk: &Csrk) {
        if let Some(e) = self.write_entry(entry) {
            e.signing.csrk = *csrk;
            e.signing.counter = 0;
            e.flags.csrk_stored = true;
        }
    }

    fn set_entry_peer_sign_counter(&mut self, entry: EntryHandle, sign_counter: u32) {
        if let Some(e) = self.write_entry(entry) {
            e.signing.counter = sign_counter;
        }
    }

    fn local_csrk(&self) -> Option<&Csrk> {
        self.local_csrk.as_ref()
    }

    fn set_local_csrk(&mut self, csrk: Csrk) {
        self.local_csrk = Some(csrk);
    }

    fn local_sign_counter(&self) -> u32 {
        self.local_sign_counter
    }

    fn set_local_sign_counter(&mut self, sign_counter: u32) {
        self.local_sign_counter = sign_counter;
    }

    fn local_identity(&self) -> Option<&SecurityEntryIdentity> {
        self.local_identity.as_ref()
    }

    fn set_local_identity(&mut self, identity: SecurityEntryIdentity) {
        self.local_identity = Some(identity);
    }

    fn get_identity_list(
        &mut self,
        cb: &mut dyn FnMut(&[SecurityEntryIdentity]),
        out: &mut [SecurityEntryIdentity],
    ) {
        let mut count = 0;
        for entry in self.entries.iter() {
            if count >= out.len() {
                break;
            }
            if entry.state == EntryState::Written && entry.flags.irk_stored {
                out[count] = entry.peer_identity;
                count += 1;
            }
        }
        cb(&out[..count]);
    }

    fn generate_whitelist_from_bond_table(
        &mut self,
        cb: &mut dyn FnMut(&Whitelist),
        whitelist: &mut Whitelist,
    ) {
        for entry in self.entries.iter() {
            if whitelist.is_full() {
                break;
            }
            if entry.state != EntryState::Written {
                continue;
            }

            // prefer the identity address; fall back to the bonding address
            let (address, is_public) = if entry.flags.irk_stored {
                (
                    entry.peer_identity.identity_address,
                    entry.peer_identity.identity_address_is_public,
                )
            } else if !entry.flags.peer_address.is_zero() {
                (entry.flags.peer_address, entry.flags.peer_address_is_public)
            } else {
                continue;
            };

            let address_type = if is_public {
                AddressType::Public
            } else {
                AddressType::Random
            };
            whitelist.push(address_type, address);
        }

        cb(whitelist);
    }

    fn restore(&mut self) {}

    fn sync(&mut self) {}

    fn set_restore(&mut self, _reload: bool) {}
}
