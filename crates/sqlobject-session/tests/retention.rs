mod fixtures;

use fixtures::{SharedDb, transaction, transaction_with};
use sqlobject_core::Value;
use sqlobject_session::{RetentionMode, TransactionConfig};

const SEED: &str = r#"
INSERT INTO "Person" (id, name) VALUES (1, 'P1'), (2, 'P2'), (3, 'P3'), (4, 'P4'), (5, 'P5');
"#;

#[test]
fn strong_retention_keeps_everything() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    for key in 1..=5i64 {
        txn.load("Person", key).unwrap();
    }
    assert_eq!(txn.resident_count(), 5);
}

#[test]
fn evictable_retention_bounds_clean_objects() {
    let db = SharedDb::open();
    db.seed(SEED);
    let config = TransactionConfig::new().retention(RetentionMode::Evictable { max_resident: 2 });
    let mut txn = transaction_with(&db, config);

    let mut ids = Vec::new();
    for key in 1..=5i64 {
        ids.push(txn.load("Person", key).unwrap());
        assert!(txn.resident_count() <= 2);
    }
    // evicted handles stay valid and reload by key
    assert_eq!(txn.value(ids[0], "name").unwrap(), Value::from("P1"));
    assert_eq!(txn.get("Person", 1i64).unwrap(), ids[0]);
}

#[test]
fn objects_with_pending_changes_are_never_evicted() {
    let db = SharedDb::open();
    db.seed(SEED);
    let config = TransactionConfig::new().retention(RetentionMode::Evictable { max_resident: 1 });
    let mut txn = transaction_with(&db, config);

    let first = txn.load("Person", 1i64).unwrap();
    txn.set_value(first, "name", "changed").unwrap();
    let draft = txn.create_with_key("Person", 10i64).unwrap();
    for key in 2..=5i64 {
        txn.load("Person", key).unwrap();
    }
    assert!(txn.resident_count() >= 2);
    assert!(txn.is_dirty(first).unwrap());
    assert_eq!(txn.value(first, "name").unwrap(), Value::from("changed"));
    assert!(txn.object(draft).unwrap().is_insert_mode());

    txn.commit().unwrap();
    assert_eq!(
        db.column(r#"SELECT name FROM "Person" WHERE id = 1"#),
        vec![Value::from("changed")]
    );
    assert_eq!(db.count("Person"), 6);
    // committed objects are clean again and may go
    assert!(txn.resident_count() <= 1);
}
