//! File-backed security database
//!
//! Entries live in memory and are flushed to a single flat file on
//! `sync()`. Records are fixed-size little-endian. A missing, truncated or
//! otherwise unreadable file loads as an empty database: damaged key
//! material is never returned, the peers simply re-pair.

use super::memory::{EntryRecord, MemorySecurityDb};
use super::{
    DistributionFlags, EntryHandle, EntryIdentityCb, EntryKeysCb, EntrySigningCb, SecurityDb,
    MAX_ENTRIES,
};
use crate::address::{AddressType, BdAddr, Whitelist};
use crate::keys::{
    Csrk, Irk, Ltk, Rand, SecurityEntryIdentity, SecurityEntryKeys, SecurityEntrySigning,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

const DB_MAGIC: u32 = 0x4244_4253; // "SBDB"
const DB_VERSION: u16 = 1;

const FLAG_LTK_STORED: u8 = 0x01;
const FLAG_MITM_PERFORMED: u8 = 0x02;
const FLAG_CSRK_STORED: u8 = 0x04;
const FLAG_IRK_STORED: u8 = 0x08;
const FLAG_SECURE_CONNECTIONS: u8 = 0x10;
const FLAG_OOB_USED: u8 = 0x20;

/// [`SecurityDb`] persisted to a file so that bonds survive a restart
#[derive(Debug)]
pub struct FileSecurityDb {
    db: MemorySecurityDb,
    path: PathBuf,
    reload: bool,
}

impl FileSecurityDb {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            db: MemorySecurityDb::new(),
            path: path.as_ref().to_path_buf(),
            reload: true,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let records = self.db.written_records();
        let mut out = Vec::new();

        // infallible writes into a Vec
        let _ = out.write_u32::<LittleEndian>(DB_MAGIC);
        let _ = out.write_u16::<LittleEndian>(DB_VERSION);

        let _ = out.write_u8(self.db.local_csrk().is_some() as u8);
        let csrk = self.db.local_csrk().copied().unwrap_or_default();
        let _ = out.write_all(csrk.as_slice());
        let _ = out.write_u32::<LittleEndian>(self.db.local_sign_counter());

        let _ = out.write_u8(self.db.local_identity().is_some() as u8);
        let identity = self.db.local_identity().copied().unwrap_or_default();
        write_identity(&mut out, &identity);

        let _ = out.write_u8(records.len() as u8);
        for record in &records {
            write_record(&mut out, record);
        }

        out
    }

    fn deserialize(data: &[u8]) -> io::Result<LoadedState> {
        let mut cursor = Cursor::new(data);

        if cursor.read_u32::<LittleEndian>()? != DB_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        if cursor.read_u16::<LittleEndian>()? != DB_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
        }

        let has_csrk = cursor.read_u8()? != 0;
        let mut csrk = [0u8; 16];
        cursor.read_exact(&mut csrk)?;
        let sign_counter = cursor.read_u32::<LittleEndian>()?;

        let has_identity = cursor.read_u8()? != 0;
        let identity = read_identity(&mut cursor)?;

        let count = cursor.read_u8()? as usize;
        if count > MAX_ENTRIES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad entry count"));
        }

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(read_record(&mut cursor)?);
        }

        Ok(LoadedState {
            local_csrk: has_csrk.then_some(Csrk::new(csrk)),
            local_sign_counter: sign_counter,
            local_identity: has_identity.then_some(identity),
            records,
        })
    }
}

struct LoadedState {
    local_csrk: Option<Csrk>,
    local_sign_counter: u32,
    local_identity: Option<SecurityEntryIdentity>,
    records: Vec<EntryRecord>,
}

fn write_identity(out: &mut Vec<u8>, identity: &SecurityEntryIdentity) {
    let _ = out.write_all(identity.identity_address.as_slice());
    let _ = out.write_u8(identity.identity_address_is_public as u8);
    let _ = out.write_all(identity.irk.as_slice());
}

fn read_identity(cursor: &mut Cursor<&[u8]>) -> io::Result<SecurityEntryIdentity> {
    let mut address = [0u8; 6];
    cursor.read_exact(&mut address)?;
    let is_public = cursor.read_u8()? != 0;
    let mut irk = [0u8; 16];
    cursor.read_exact(&mut irk)?;
    Ok(SecurityEntryIdentity {
        identity_address: BdAddr::new(address),
        identity_address_is_public: is_public,
        irk: Irk::new(irk),
    })
}

fn write_keys(out: &mut Vec<u8>, keys: &SecurityEntryKeys) {
    let _ = out.write_all(keys.ltk.as_slice());
    let _ = out.write_u16::<LittleEndian>(keys.ediv);
    let _ = out.write_all(keys.rand.as_slice());
}

fn read_keys(cursor: &mut Cursor<&[u8]>) -> io::Result<SecurityEntryKeys> {
    let mut ltk = [0u8; 16];
    cursor.read_exact(&mut ltk)?;
    let ediv = cursor.read_u16::<LittleEndian>()?;
    let mut rand = [0u8; 8];
    cursor.read_exact(&mut rand)?;
    Ok(SecurityEntryKeys {
        ltk: Ltk::new(ltk),
        ediv,
        rand: Rand::new(rand),
    })
}

fn write_record(out: &mut Vec<u8>, record: &EntryRecord) {
    let flags = &record.flags;
    let _ = out.write_all(flags.peer_address.as_slice());
    let _ = out.write_u8(flags.peer_address_is_public as u8);
    let _ = out.write_u8(flags.encryption_key_size);

    let mut bits = 0u8;
    if flags.ltk_stored {
        bits |= FLAG_LTK_STORED;
    }
    if flags.mitm_performed {
        bits |= FLAG_MITM_PERFORMED;
    }
    if flags.csrk_stored {
        bits |= FLAG_CSRK_STORED;
    }
    if flags.irk_stored {
        bits |= FLAG_IRK_STORED;
    }
    if flags.secure_connections_paired {
        bits |= FLAG_SECURE_CONNECTIONS;
    }
    if flags.oob_used {
        bits |= FLAG_OOB_USED;
    }
    let _ = out.write_u8(bits);

    write_keys(out, &record.local_keys);
    write_keys(out, &record.peer_keys);
    write_identity(out, &record.peer_identity);
    let _ = out.write_all(record.signing.csrk.as_slice());
    let _ = out.write_u32::<LittleEndian>(record.signing.counter);
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> io::Result<EntryRecord> {
    let mut peer_address = [0u8; 6];
    cursor.read_exact(&mut peer_address)?;
    let peer_address_is_public = cursor.read_u8()? != 0;
    let encryption_key_size = cursor.read_u8()?;
    let bits = cursor.read_u8()?;

    let flags = DistributionFlags {
        peer_address: BdAddr::new(peer_address),
        peer_address_is_public,
        encryption_key_size,
        ltk_stored: bits & FLAG_LTK_STORED != 0,
        mitm_performed: bits & FLAG_MITM_PERFORMED != 0,
        csrk_stored: bits & FLAG_CSRK_STORED != 0,
        irk_stored: bits & FLAG_IRK_STORED != 0,
        secure_connections_paired: bits & FLAG_SECURE_CONNECTIONS != 0,
        oob_used: bits & FLAG_OOB_USED != 0,
    };

    let local_keys = read_keys(cursor)?;
    let peer_keys = read_keys(cursor)?;
    let peer_identity = read_identity(cursor)?;

    let mut csrk = [0u8; 16];
    cursor.read_exact(&mut csrk)?;
    let counter = cursor.read_u32::<LittleEndian>()?;

    Ok(EntryRecord {
        flags,
        local_keys,
        peer_keys,
        peer_identity,
        signing: SecurityEntrySigning {
            csrk: Csrk::new(csrk),
            counter,
        },
    })
}

impl SecurityDb for FileSecurityDb {
    fn open_entry(
        &mut self,
        peer_address_type: AddressType,
        peer_address: &BdAddr,
    ) -> Option<EntryHandle> {
        self.db.open_entry(peer_address_type, peer_address)
    }

    fn close_entry(&mut self, entry: EntryHandle) {
        self.db.close_entry(entry);
    }

    fn remove_entry(&mut self, peer_identity_address: &BdAddr) {
        self.db.remove_entry(peer_identity_address);
    }

    fn clear_entries(&mut self) {
        self.db.clear_entries();
    }

    fn distribution_flags(&self, entry: EntryHandle) -> Option<DistributionFlags> {
        self.db.distribution_flags(entry)
    }

    fn set_distribution_flags(&mut self, entry: EntryHandle, flags: DistributionFlags) {
        self.db.set_distribution_flags(entry, flags);
    }

    fn get_entry_local_keys(
        &mut self,
        entry: EntryHandle,
        ediv: u16,
        rand: &Rand,
        cb: EntryKeysCb<'_>,
    ) {
        self.db.get_entry_local_keys(entry, ediv, rand, cb);
    }

    fn get_entry_local_keys_sc(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>) {
        self.db.get_entry_local_keys_sc(entry, cb);
    }

    fn get_entry_peer_keys(&mut self, entry: EntryHandle, cb: EntryKeysCb<'_>) {
        self.db.get_entry_peer_keys(entry, cb);
    }

    fn get_entry_identity(&mut self, entry: EntryHandle, cb: EntryIdentityCb<'_>) {
        self.db.get_entry_identity(entry, cb);
    }

    fn get_entry_peer_csrk(&mut self, entry: EntryHandle, cb: EntrySigningCb<'_>) {
        self.db.get_entry_peer_csrk(entry, cb);
    }

    fn set_entry_local_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        self.db.set_entry_local_ltk(entry, ltk);
    }

    fn set_entry_local_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand) {
        self.db.set_entry_local_ediv_rand(entry, ediv, rand);
    }

    fn set_entry_peer_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        self.db.set_entry_peer_ltk(entry, ltk);
    }

    fn set_entry_peer_ediv_rand(&mut self, entry: EntryHandle, ediv: u16, rand: &Rand) {
        self.db.set_entry_peer_ediv_rand(entry, ediv, rand);
    }

    fn set_entry_peer_irk(&mut self, entry: EntryHandle, irk: &Irk) {
        self.db.set_entry_peer_irk(entry, irk);
    }

    fn set_entry_peer_bdaddr(
        &mut self,
        entry: EntryHandle,
        address_is_public: bool,
        peer_address: &BdAddr,
    ) {
        self.db.set_entry_peer_bdaddr(entry, address_is_public, peer_address);
    }

    fn set_entry_peer_csrk(&mut self, entry: EntryHandle, csrk: &Csrk) {
        self.db.set_entry_peer_csrk(entry, csrk);
    }

    fn set_entry_peer_sign_counter(&mut self, entry: EntryHandle, sign_counter: u32) {
        self.db.set_entry_peer_sign_counter(entry, sign_counter);
    }

    fn local_csrk(&self) -> Option<&Csrk> {
        self.db.local_csrk()
    }

    fn set_local_csrk(&mut self, csrk: Csrk) {
        self.db.set_local_csrk(csrk);
    }

    fn local_sign_counter(&self) -> u32 {
        self.db.local_sign_counter()
    }

    fn set_local_sign_counter(&mut self, sign_counter: u32) {
        self.db.set_local_sign_counter(sign_counter);
    }

    fn local_identity(&self) -> Option<&SecurityEntryIdentity> {
        self.db.local_identity()
    }

    fn set_local_identity(&mut self, identity: SecurityEntryIdentity) {
        self.db.set_local_identity(identity);
    }

    fn get_identity_list(
        &mut self,
        cb: &mut dyn FnMut(&[SecurityEntryIdentity]),
        out: &mut [SecurityEntryIdentity],
    ) {
        self.db.get_identity_list(cb, out);
    }

    fn generate_whitelist_from_bond_table(
        &mut self,
        cb: &mut dyn FnMut(&Whitelist),
        whitelist: &mut Whitelist,
    ) {
        self.db.generate_whitelist_from_bond_table(cb, whitelist);
    }

    fn restore(&mut self) {
        if !self.reload {
            return;
        }

        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("failed to read bond database {}: {}", self.path.display(), e);
                return;
            }
        };

        match Self::deserialize(&data) {
            Ok(state) => {
                self.db.clear_entries();
                if let Some(csrk) = state.local_csrk {
                    self.db.set_local_csrk(csrk);
                }
                self.db.set_local_sign_counter(state.local_sign_counter);
                if let Some(identity) = state.local_identity {
                    self.db.set_local_identity(identity);
                }
                let count = state.records.len();
                for record in state.records {
                    self.db.insert_record(record);
                }
                debug!("restored {} bond entries from {}", count, self.path.display());
            }
            Err(e) => {
                // a damaged file must never yield key material
                warn!(
                    "bond database {} is corrupt ({}), starting empty",
                    self.path.display(),
                    e
                );
            }
        }
    }

    fn sync(&mut self) {
        let data = self.serialize();
        if let Err(e) = std::fs::write(&self.path, data) {
            warn!("failed to write bond database {}: {}", self.path.display(), e);
        }
    }

    fn set_restore(&mut self, reload: bool) {
        self.reload = reload;
    }
}
