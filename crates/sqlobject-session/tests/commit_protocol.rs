mod fixtures;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fixtures::{EventLog, SharedDb, transaction, transaction_with};
use sqlobject_core::{ErrorKind, Result, Value};
use sqlobject_session::{ObjectId, ObjectTriggers, Transaction, TransactionConfig};

#[test]
fn commit_inserts_then_updates() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    let ada = txn.create("Person").unwrap();
    txn.set_value(ada, "name", "Ada").unwrap();
    txn.commit().unwrap();

    assert_eq!(db.column(r#"SELECT name FROM "Person""#), vec![Value::from("Ada")]);
    assert!(!txn.is_dirty(ada).unwrap());
    assert!(!txn.object(ada).unwrap().is_insert_mode());

    txn.set_value(ada, "name", "Ada Lovelace").unwrap();
    assert_eq!(txn.dirty_objects(), vec![ada]);
    txn.commit().unwrap();
    assert_eq!(
        db.column(r#"SELECT name FROM "Person" WHERE id = 1"#),
        vec![Value::from("Ada Lovelace")]
    );
    assert!(txn.dirty_objects().is_empty());
}

#[test]
fn loaded_objects_read_and_write_through() {
    let db = SharedDb::open();
    db.seed(r#"INSERT INTO "Person" (id, name) VALUES (10, 'Grace'), (11, 'Alan')"#);

    let mut txn = transaction(&db);
    let grace = txn.load("Person", 10i64).unwrap();
    assert_eq!(txn.value(grace, "name").unwrap(), Value::from("Grace"));
    assert_eq!(txn.get("Person", 10i64).unwrap(), grace);

    let err = txn.load("Person", 99i64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotFound);

    let alan = txn.get("Person", 11i64).unwrap();
    txn.set_reference(alan, "manager", Some(grace)).unwrap();
    txn.commit().unwrap();
    assert_eq!(
        db.column(r#"SELECT manager_id FROM "Person" WHERE id = 11"#),
        vec![Value::BigInt(10)]
    );
    // untouched fields are not rewritten
    assert_eq!(
        db.column(r#"SELECT name FROM "Person" WHERE id = 11"#),
        vec![Value::from("Alan")]
    );
}

#[test]
fn referenced_rows_are_inserted_first() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    // the referencing object is created before its target; foreign keys
    // are enforced, so a wrong order fails the insert
    let worker = txn.create("Person").unwrap();
    let boss = txn.create("Person").unwrap();
    txn.set_value(worker, "name", "worker").unwrap();
    txn.set_value(boss, "name", "boss").unwrap();
    txn.set_reference(worker, "manager", Some(boss)).unwrap();
    txn.commit().unwrap();

    assert_eq!(
        db.column(r#"SELECT manager_id FROM "Person" WHERE name = 'worker'"#),
        vec![Value::BigInt(2)]
    );
}

#[test]
fn nullable_cycle_is_broken_and_patched() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    let a = txn.create("Person").unwrap();
    let b = txn.create("Person").unwrap();
    txn.set_reference(a, "manager", Some(b)).unwrap();
    txn.set_reference(b, "manager", Some(a)).unwrap();
    txn.commit().unwrap();

    assert_eq!(
        db.column(r#"SELECT manager_id FROM "Person" ORDER BY id"#),
        vec![Value::BigInt(2), Value::BigInt(1)]
    );
}

#[test]
fn non_nullable_cycle_is_rejected() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    let a = txn.create("Node").unwrap();
    let b = txn.create("Node").unwrap();
    txn.set_reference(a, "next", Some(b)).unwrap();
    txn.set_reference(b, "next", Some(a)).unwrap();

    let err = txn.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicReference);
    assert_eq!(db.count("Node"), 0);
    // nothing was flushed, so both objects still hold their changes
    assert!(txn.is_dirty(a).unwrap());
    assert!(txn.is_dirty(b).unwrap());
}

#[test]
fn self_reference_is_not_a_cycle() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    let node = txn.create("Node").unwrap();
    txn.set_reference(node, "next", Some(node)).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.column(r#"SELECT next_id FROM "Node""#), vec![Value::BigInt(1)]);
}

#[test]
fn missing_required_value_fails_validation() {
    let db = SharedDb::open();
    let mut txn = transaction(&db);
    txn.create("Node").unwrap();
    let err = txn.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NullConstraint);
    assert_eq!(db.count("Node"), 0);
}

/// Renames every new person once and counts how often it was asked to.
#[derive(Debug, Default)]
struct Stamp {
    calls: AtomicUsize,
}

impl ObjectTriggers for Stamp {
    fn before_insert(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = txn.value(id, "name")?;
        let stamped = format!("{}!", name.as_str().unwrap_or_default());
        txn.set_value(id, "name", stamped)
    }
}

#[test]
fn before_insert_runs_once_even_when_it_dirties_the_object() {
    let db = SharedDb::open();
    let stamp = Arc::new(Stamp::default());
    let mut txn = transaction(&db);
    txn.register_triggers("Person", stamp.clone()).unwrap();

    let p = txn.create("Person").unwrap();
    txn.set_value(p, "name", "Ada").unwrap();
    txn.commit().unwrap();

    assert_eq!(stamp.calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.column(r#"SELECT name FROM "Person""#), vec![Value::from("Ada!")]);
}

#[test]
fn lifecycle_events_follow_the_commit() {
    let db = SharedDb::open();
    db.seed(r#"INSERT INTO "Person" (id, name) VALUES (10, 'Grace')"#);
    let log = Arc::new(EventLog::default());
    let mut txn = transaction(&db);
    txn.register_triggers("Person", log.clone()).unwrap();

    let grace = txn.get("Person", 10i64).unwrap();
    txn.set_value(grace, "name", "Grace H.").unwrap();
    let ada = txn.create_with_key("Person", 20i64).unwrap();
    txn.set_value(ada, "name", "Ada").unwrap();
    txn.commit().unwrap();

    let events = log.events();
    assert_eq!(events.len(), 4);
    assert!(events[..2].contains(&"before_update:(10)".to_string()));
    assert!(events[..2].contains(&"before_insert:(20)".to_string()));
    assert!(events[2..].contains(&"after_update:(10)".to_string()));
    assert!(events[2..].contains(&"after_insert:(20)".to_string()));

    // a clean object only sees after-commit hooks when forced
    txn.force_post_commit(grace).unwrap();
    txn.commit().unwrap();
    assert_eq!(log.events().last().unwrap(), "after_update:(10)");
    assert_eq!(log.events().len(), 5);
}

#[test]
fn changes_after_a_precommit_run_before_hooks_again() {
    let db = SharedDb::open();
    db.seed(r#"INSERT INTO "Person" (id, name) VALUES (10, 'Grace')"#);
    let log = Arc::new(EventLog::default());
    let config = TransactionConfig::new().precommit_before_query(false);
    let mut txn = transaction_with(&db, config);
    txn.register_triggers("Person", log.clone()).unwrap();

    let grace = txn.get("Person", 10i64).unwrap();
    txn.set_value(grace, "name", "Grace H.").unwrap();
    txn.precommit(&["Person"]).unwrap();
    assert_eq!(log.events(), vec!["before_update:(10)"]);

    txn.set_value(grace, "name", "Grace Hopper").unwrap();
    txn.commit().unwrap();
    assert_eq!(
        log.events(),
        vec!["before_update:(10)", "before_update:(10)", "after_update:(10)"]
    );
    assert_eq!(
        db.column(r#"SELECT name FROM "Person" WHERE id = 10"#),
        vec![Value::from("Grace Hopper")]
    );
}

#[test]
fn triggers_can_be_suppressed() {
    let db = SharedDb::open();
    let log = Arc::new(EventLog::default());
    let mut txn = transaction(&db);
    txn.register_triggers("Person", log.clone()).unwrap();
    txn.with_triggers_suppressed(|txn| {
        let p = txn.create("Person")?;
        txn.set_value(p, "name", "quiet")?;
        txn.commit()
    })
    .unwrap();
    assert!(log.events().is_empty());
    assert_eq!(db.count("Person"), 1);
}

#[test]
fn precommit_writes_without_committing() {
    let db = SharedDb::open();
    let config = TransactionConfig::new().precommit_before_query(false);
    let mut txn = transaction_with(&db, config);
    let p = txn.create("Person").unwrap();
    txn.set_value(p, "name", "draft").unwrap();
    let task = txn.create("Task").unwrap();
    txn.set_value(task, "title", "write").unwrap();

    txn.precommit(&["Person"]).unwrap();
    assert_eq!(db.count("Person"), 1);
    assert_eq!(db.count("Task"), 0);
    // a second precommit of a clean hierarchy writes nothing
    txn.precommit(&["Person"]).unwrap();

    txn.rollback().unwrap();
    assert_eq!(db.count("Person"), 0);
    assert!(txn.value(p, "name").is_err());
    assert!(txn.dirty_objects().is_empty());
}

#[test]
fn rollback_reloads_changed_objects() {
    let db = SharedDb::open();
    db.seed(r#"INSERT INTO "Person" (id, name) VALUES (10, 'Grace')"#);
    let mut txn = transaction(&db);
    let grace = txn.load("Person", 10i64).unwrap();
    txn.set_value(grace, "name", "changed").unwrap();
    txn.rollback().unwrap();

    assert!(!txn.is_dirty(grace).unwrap());
    assert_eq!(txn.value(grace, "name").unwrap(), Value::from("Grace"));
    txn.commit().unwrap();
    assert_eq!(db.column(r#"SELECT name FROM "Person""#), vec![Value::from("Grace")]);
}
