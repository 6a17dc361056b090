//! Tests for the security database backends

use super::*;
use crate::address::{AddressType, BdAddr, Whitelist};
use crate::keys::{Csrk, Irk, Ltk, Rand, SecurityEntryIdentity};

fn public_addr(last: u8) -> BdAddr {
    BdAddr::new([last, 0x22, 0x33, 0x44, 0x55, 0x66])
}

fn resolvable_private_addr(last: u8) -> BdAddr {
    // top two bits 0b01 mark a resolvable private address
    BdAddr::new([last, 0x22, 0x33, 0x44, 0x55, 0x40])
}

fn peer_keys(handle: EntryHandle, db: &mut dyn SecurityDb) -> Option<SecurityEntryKeys> {
    let mut found = None;
    db.get_entry_peer_keys(handle, &mut |_, keys| found = keys.copied());
    found
}

#[test]
fn test_open_entry_dedups_public_address() {
    let mut db = MemorySecurityDb::new();
    let addr = public_addr(0x11);

    let first = db.open_entry(AddressType::Public, &addr).unwrap();
    // a second open for the same public address returns the same entry
    let second = db.open_entry(AddressType::Public, &addr).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_open_entry_does_not_collide_across_address_spaces() {
    let mut db = MemorySecurityDb::new();
    let bytes = [0x11, 0x22, 0x33, 0x44, 0x55, 0xC6];

    let public = db.open_entry(AddressType::Public, &BdAddr::new(bytes)).unwrap();
    let random = db.open_entry(AddressType::Random, &BdAddr::new(bytes)).unwrap();
    assert_ne!(public, random);
}

#[test]
fn test_open_entry_never_keys_on_private_address() {
    let mut db = MemorySecurityDb::new();
    let addr = resolvable_private_addr(0x11);

    let handle = db.open_entry(AddressType::Random, &addr).unwrap();
    let flags = db.distribution_flags(handle).unwrap();
    assert!(flags.peer_address.is_zero());

    // the rotated address must not find the old reserved slot
    db.set_entry_peer_ltk(handle, &Ltk::new([1; 16]));
    let other = db
        .open_entry(AddressType::Random, &resolvable_private_addr(0x12))
        .unwrap();
    assert_ne!(handle, other);
}

#[test]
fn test_identity_distribution_converges_to_one_entry() {
    let mut db = MemorySecurityDb::new();
    let identity = public_addr(0xAA);

    // first bond through a private address
    let first = db
        .open_entry(AddressType::Random, &resolvable_private_addr(0x01))
        .unwrap();
    db.set_entry_peer_ltk(first, &Ltk::new([1; 16]));
    db.set_entry_peer_irk(first, &Irk::new([2; 16]));
    db.set_entry_peer_bdaddr(first, true, &identity);

    // re-bond through a fresh private address, same identity
    let second = db
        .open_entry(AddressType::Random, &resolvable_private_addr(0x02))
        .unwrap();
    assert_ne!(first, second);
    db.set_entry_peer_ltk(second, &Ltk::new([3; 16]));
    db.set_entry_peer_irk(second, &Irk::new([2; 16]));
    db.set_entry_peer_bdaddr(second, true, &identity);

    // the stale entry is gone; a lookup by identity finds the new bond
    let resolved = db.open_entry(AddressType::PublicIdentity, &identity).unwrap();
    assert_eq!(resolved, second);
    assert_eq!(peer_keys(resolved, &mut db).unwrap().ltk, Ltk::new([3; 16]));
}

#[test]
fn test_close_entry_frees_reserved_but_keeps_written() {
    let mut db = MemorySecurityDb::new();
    let reserved_addr = public_addr(0x01);
    let written_addr = public_addr(0x02);

    let reserved = db.open_entry(AddressType::Public, &reserved_addr).unwrap();
    let written = db.open_entry(AddressType::Public, &written_addr).unwrap();
    db.set_entry_peer_ltk(written, &Ltk::new([7; 16]));

    db.close_entry(reserved);
    db.close_entry(written);

    assert!(db.distribution_flags(reserved).is_none());
    assert!(db.distribution_flags(written).is_some());
}

#[test]
fn test_pool_exhaustion_returns_none() {
    let mut db = MemorySecurityDb::new();
    for i in 0..MAX_ENTRIES {
        let handle = db.open_entry(AddressType::Public, &public_addr(i as u8)).unwrap();
        db.set_entry_peer_ltk(handle, &Ltk::new([i as u8; 16]));
    }

    assert!(db.open_entry(AddressType::Public, &public_addr(0xFF)).is_none());

    // existing entries are untouched
    let existing = db.open_entry(AddressType::Public, &public_addr(0)).unwrap();
    assert_eq!(peer_keys(existing, &mut db).unwrap().ltk, Ltk::new([0; 16]));
}

#[test]
fn test_local_keys_require_exact_ediv_rand_match() {
    let mut db = MemorySecurityDb::new();
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_local_ltk(handle, &Ltk::new([9; 16]));
    db.set_entry_local_ediv_rand(handle, 0x5678, &Rand::new([1, 2, 3, 4, 5, 6, 7, 8]));

    let mut found = None;
    db.get_entry_local_keys(handle, 0x1234, &Rand::new([1, 2, 3, 4, 5, 6, 7, 8]), &mut |_, k| {
        found = k.copied()
    });
    assert!(found.is_none());

    db.get_entry_local_keys(handle, 0x5678, &Rand::new([8, 7, 6, 5, 4, 3, 2, 1]), &mut |_, k| {
        found = k.copied()
    });
    assert!(found.is_none());

    db.get_entry_local_keys(handle, 0x5678, &Rand::new([1, 2, 3, 4, 5, 6, 7, 8]), &mut |_, k| {
        found = k.copied()
    });
    assert_eq!(found.unwrap().ltk, Ltk::new([9; 16]));
}

#[test]
fn test_sc_local_keys_gated_on_secure_connections_flag() {
    let mut db = MemorySecurityDb::new();
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_local_ltk(handle, &Ltk::new([9; 16]));

    let mut found = None;
    db.get_entry_local_keys_sc(handle, &mut |_, k| found = k.copied());
    assert!(found.is_none());

    let mut flags = db.distribution_flags(handle).unwrap();
    flags.secure_connections_paired = true;
    db.set_distribution_flags(handle, flags);

    db.get_entry_local_keys_sc(handle, &mut |_, k| found = k.copied());
    assert_eq!(found.unwrap().ltk, Ltk::new([9; 16]));
}

#[test]
fn test_identity_gated_on_irk_stored() {
    let mut db = MemorySecurityDb::new();
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_peer_ltk(handle, &Ltk::new([1; 16]));

    let mut seen = None;
    db.get_entry_identity(handle, &mut |_, id| seen = id.copied());
    assert!(seen.is_none());

    db.set_entry_peer_irk(handle, &Irk::new([5; 16]));
    db.get_entry_identity(handle, &mut |_, id| seen = id.copied());
    assert_eq!(seen.unwrap().irk, Irk::new([5; 16]));
}

#[test]
fn test_identity_list_bounded_by_destination() {
    let mut db = MemorySecurityDb::new();
    for i in 0..3 {
        let handle = db.open_entry(AddressType::Public, &public_addr(i)).unwrap();
        db.set_entry_peer_irk(handle, &Irk::new([i; 16]));
        db.set_entry_peer_bdaddr(handle, true, &public_addr(i));
    }

    let mut out = [SecurityEntryIdentity::default(); 2];
    let mut written = 0;
    db.get_identity_list(&mut |list| written = list.len(), &mut out);
    assert_eq!(written, 2);
}

#[test]
fn test_whitelist_projection() {
    let mut db = MemorySecurityDb::new();

    // bonded with identity
    let bonded = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_peer_irk(bonded, &Irk::new([1; 16]));
    db.set_entry_peer_bdaddr(bonded, true, &public_addr(1));

    // reserved only, never written: excluded
    let _ = db.open_entry(AddressType::Public, &public_addr(2)).unwrap();

    let mut whitelist = Whitelist::with_capacity(4);
    let mut done = false;
    db.generate_whitelist_from_bond_table(&mut |_| done = true, &mut whitelist);

    assert!(done);
    assert_eq!(whitelist.len(), 1);
    assert_eq!(whitelist.entries()[0], (AddressType::Public, public_addr(1)));
}

#[test]
fn test_remove_and_clear_entries() {
    let mut db = MemorySecurityDb::new();
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_peer_ltk(handle, &Ltk::new([1; 16]));
    db.set_entry_peer_bdaddr(handle, true, &public_addr(1));
    db.set_local_csrk(Csrk::new([3; 16]));

    db.remove_entry(&public_addr(1));
    assert!(db.distribution_flags(handle).is_none());

    db.set_local_sign_counter(7);
    db.clear_entries();
    assert!(db.local_csrk().is_none());
    assert_eq!(db.local_sign_counter(), 0);
}

#[test]
fn test_peer_sign_counter_update() {
    let mut db = MemorySecurityDb::new();
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_peer_csrk(handle, &Csrk::new([4; 16]));
    db.set_entry_peer_sign_counter(handle, 41);

    let mut counter = 0;
    db.get_entry_peer_csrk(handle, &mut |_, signing| {
        counter = signing.map(|s| s.counter).unwrap_or(0)
    });
    assert_eq!(counter, 41);
}

#[test]
fn test_file_db_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    let mut db = FileSecurityDb::new(&path);
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_local_ltk(handle, &Ltk::new([1; 16]));
    db.set_entry_local_ediv_rand(handle, 0x1234, &Rand::new([9; 8]));
    db.set_entry_peer_ltk(handle, &Ltk::new([2; 16]));
    db.set_entry_peer_irk(handle, &Irk::new([3; 16]));
    db.set_entry_peer_bdaddr(handle, true, &public_addr(1));
    db.set_entry_peer_csrk(handle, &Csrk::new([4; 16]));
    db.set_entry_peer_sign_counter(handle, 99);
    db.set_local_csrk(Csrk::new([5; 16]));
    db.set_local_sign_counter(12);
    db.sync();

    let mut reloaded = FileSecurityDb::new(&path);
    reloaded.restore();

    let found = reloaded.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    let flags = reloaded.distribution_flags(found).unwrap();
    assert!(flags.ltk_stored);
    assert!(flags.irk_stored);
    assert!(flags.csrk_stored);
    assert_eq!(peer_keys(found, &mut reloaded).unwrap().ltk, Ltk::new([2; 16]));

    let mut local = None;
    reloaded.get_entry_local_keys(found, 0x1234, &Rand::new([9; 8]), &mut |_, k| {
        local = k.copied()
    });
    assert_eq!(local.unwrap().ltk, Ltk::new([1; 16]));
    assert_eq!(reloaded.local_csrk(), Some(&Csrk::new([5; 16])));
    assert_eq!(reloaded.local_sign_counter(), 12);
}

#[test]
fn test_file_db_corrupt_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    // valid database, then truncate it mid-record
    let mut db = FileSecurityDb::new(&path);
    let handle = db.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    db.set_entry_peer_ltk(handle, &Ltk::new([2; 16]));
    db.sync();

    let data = std::fs::read(&path).unwrap();
    std::fs::write(&path, &data[..data.len() / 2]).unwrap();

    let mut reloaded = FileSecurityDb::new(&path);
    reloaded.restore();
    let fresh = reloaded.open_entry(AddressType::Public, &public_addr(1)).unwrap();
    // nothing survived: the entry is a fresh reservation with no keys
    assert!(!reloaded.distribution_flags(fresh).unwrap().ltk_stored);
}

#[test]
fn test_file_db_garbage_magic_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");
    std::fs::write(&path, b"not a bond database").unwrap();

    let mut db = FileSecurityDb::new(&path);
    db.restore();
    assert!(db.local_csrk().is_none());
}

#[test]
fn test_file_db_set_restore_false_skips_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    let mut db = FileSecurityDb::new(&path);
    db.set_local_csrk(Csrk::new([5; 16]));
    db.sync();

    let mut reloaded = FileSecurityDb::new(&path);
    reloaded.set_restore(false);
    reloaded.restore();
    assert!(reloaded.local_csrk().is_none());
}
