mod fixtures;

use std::sync::Arc;

use fixtures::{SharedDb, transaction};
use sqlobject_core::{ErrorKind, MemoryCache, Tuple, Value};
use sqlobject_query::{Expr, OrderBy, Query};

const SEED: &str = r#"
INSERT INTO "Person" (id, name, manager_id) VALUES (100, 'Grace', NULL);
INSERT INTO "Person" (id, name, manager_id) VALUES (101, 'Ada', 100);
INSERT INTO "Person" (id, name, manager_id) VALUES (102, 'Alan', 100);
INSERT INTO "Person" (id, name, manager_id) VALUES (103, 'Edsger', NULL);
"#;

fn reports_of() -> Query {
    Query::from("Person", "p")
        .filter(Expr::path("p.manager.name").eq(Expr::param(0)))
        .order_by(OrderBy::asc(Expr::path("p.name")))
}

#[test]
fn object_queries_see_pending_changes() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    let found = txn.query_objects(&reports_of(), &[Value::from("Grace")]).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(txn.value(found[0], "name").unwrap(), Value::from("Ada"));

    let grace = txn.get("Person", 100i64).unwrap();
    let hire = txn.create_with_key("Person", 200i64).unwrap();
    txn.set_value(hire, "name", "Zed").unwrap();
    txn.set_reference(hire, "manager", Some(grace)).unwrap();

    let found = txn.query_objects(&reports_of(), &[Value::from("Grace")]).unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found[2], hire);
    // the same handles come back for the same rows
    assert_eq!(
        txn.query_objects(&reports_of(), &[Value::from("Grace")]).unwrap(),
        found
    );
}

#[test]
fn key_and_row_queries() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    let roots = Query::from("Person", "p")
        .filter(Expr::path("p.manager").is_null())
        .order_by(OrderBy::desc(Expr::path("p.id")));
    assert_eq!(
        txn.query_keys(&roots, &[]).unwrap(),
        vec![Tuple::from(103i64), Tuple::from(100i64)]
    );

    let counts = Query::from("Person", "p")
        .select_as(Expr::path("p.name"), "name")
        .select_as(Expr::count("p.reports"), "reports")
        .filter(Expr::count("p.reports").gt(0i64));
    let rows = txn.execute_query(&counts, &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_by_name("name"), Some(&Value::from("Grace")));
    assert_eq!(rows[0].get_by_name("reports").and_then(Value::as_i64), Some(2));

    let projected = txn
        .query_objects(&Query::from("Person", "p").select(Expr::path("p.name")), &[])
        .unwrap_err();
    assert_eq!(projected.kind(), ErrorKind::UnsupportedQueryFeature);
}

#[test]
fn object_queries_without_an_alias() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    let ada = Query::from("Person", "").filter(Expr::path("name").eq("Ada"));
    assert_eq!(txn.query_keys(&ada, &[]).unwrap(), vec![Tuple::from(101i64)]);

    let found = txn.query_objects(&ada, &[]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(txn.key_of(found[0]).unwrap(), Some(Tuple::from(101i64)));
    assert_eq!(txn.value(found[0], "name").unwrap(), Value::from("Ada"));

    let managed = Query::from("Person", "")
        .filter(Expr::path("manager.name").eq("Grace"))
        .order_by(OrderBy::asc(Expr::path("name")));
    let found = txn.query_objects(&managed, &[]).unwrap();
    let names: Vec<Value> = found.iter().map(|&id| txn.value(id, "name").unwrap()).collect();
    assert_eq!(names, vec![Value::from("Ada"), Value::from("Alan")]);
}

#[test]
fn raw_statements_run_after_a_flush() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    let p = txn.create("Person").unwrap();
    txn.set_value(p, "name", "raw").unwrap();
    let rows = txn
        .execute_raw(r#"SELECT COUNT(*) FROM "Person" WHERE name = ?1"#, &[Value::from("raw")])
        .unwrap();
    assert_eq!(rows[0].get(0).and_then(Value::as_i64), Some(1));
}

#[test]
fn named_key_lists_are_cached_until_invalidated() {
    let db = SharedDb::open();
    db.seed(SEED);
    let cache = Arc::new(MemoryCache::new());
    let mut txn = transaction(&db).with_cache(cache.clone());
    let query = Query::from("Person", "p")
        .filter(Expr::path("p.name").like(Expr::param(0)))
        .order_by(OrderBy::asc(Expr::path("p.id")));
    let params = [Value::from("A%")];

    let first = txn.load_keys_cached("by_name", &query, &params).unwrap();
    assert_eq!(first, vec![Tuple::from(101i64), Tuple::from(102i64)]);

    // a row written behind the transaction's back stays invisible
    db.seed(r#"INSERT INTO "Person" (id, name) VALUES (104, 'Anita')"#);
    assert_eq!(txn.load_keys_cached("by_name", &query, &params).unwrap(), first);
    // other parameter values are stored separately
    assert_eq!(
        txn.load_keys_cached("by_name", &query, &[Value::from("E%")]).unwrap(),
        vec![Tuple::from(103i64)]
    );

    // pending changes of a dependent class bypass the cache
    let grace = txn.get("Person", 100i64).unwrap();
    txn.set_value(grace, "name", "Grace H.").unwrap();
    assert_eq!(txn.load_keys_cached("by_name", &query, &params).unwrap().len(), 3);

    // committing the change drops the stored list
    txn.commit().unwrap();
    assert_eq!(txn.load_keys_cached("by_name", &query, &params).unwrap().len(), 3);
}

#[test]
fn evaluate_against_loaded_objects() {
    let db = SharedDb::open();
    db.seed(SEED);
    let mut txn = transaction(&db);
    let ada = txn.get("Person", 101i64).unwrap();
    let grace = txn.get("Person", 100i64).unwrap();
    let edsger = txn.get("Person", 103i64).unwrap();

    let managed_by_grace = Expr::path("p.manager.name").eq("Grace");
    assert_eq!(txn.evaluate(ada, &managed_by_grace, &[]).unwrap(), Value::Bool(true));
    // no manager: unknown, not false
    assert_eq!(txn.evaluate(edsger, &managed_by_grace, &[]).unwrap(), Value::Null);
    assert_eq!(
        txn.evaluate(edsger, &Expr::path("manager").is_null(), &[]).unwrap(),
        Value::Bool(true)
    );

    assert_eq!(
        txn.evaluate(grace, &Expr::count("reports"), &[]).unwrap(),
        Value::BigInt(2)
    );
    assert_eq!(
        txn.evaluate(grace, &Expr::contains("reports", Expr::param(0)), &[Value::BigInt(101)])
            .unwrap(),
        Value::Bool(true)
    );
    // membership compares numerically across integer widths
    assert_eq!(
        txn.evaluate(grace, &Expr::contains("reports", Expr::param(0)), &[Value::Int(102)])
            .unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        txn.evaluate(grace, &Expr::contains("reports", Expr::param(0)), &[Value::Int(103)])
            .unwrap(),
        Value::Bool(false)
    );
    assert_eq!(
        txn.evaluate(ada, &Expr::func("upper", vec![Expr::path("name")]), &[])
            .unwrap(),
        Value::from("ADA")
    );
    assert_eq!(
        txn.evaluate(ada, &Expr::path("id").add(1i64), &[]).unwrap(),
        Value::BigInt(102)
    );
    assert_eq!(
        txn.evaluate(ada, &Expr::class_of("manager"), &[]).unwrap(),
        Value::from("Person")
    );
    assert_eq!(
        txn.evaluate(ada, &Expr::path("name").like("A%").and(Expr::path("p").eq(101i64)), &[])
            .unwrap(),
        Value::Bool(true)
    );

    // in-memory evaluation follows unflushed changes
    txn.set_value(ada, "name", "Augusta").unwrap();
    assert_eq!(
        txn.evaluate(ada, &Expr::path("name").like("A%a"), &[]).unwrap(),
        Value::Bool(true)
    );

    let sub = Expr::exists(Query::from("Person", "x"));
    let err = txn.evaluate(ada, &sub, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedQueryFeature);
}
