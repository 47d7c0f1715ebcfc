//! Paging against SQLite. Nested `ROWNUM` paging needs a database that
//! numbers rows that way, so its bounds are checked on the compiled SQL in
//! the query compiler's unit tests instead.

mod fixtures;

use fixtures::{SharedDb, schema};
use sqlobject::prelude::*;

const ITEMS: &str = r#"
INSERT INTO "Item" (id, label, rank) VALUES
    (1, 'g', 70), (2, 'c', 30), (3, 'a', 10), (4, 'f', 60),
    (5, 'b', 20), (6, 'e', 50), (7, 'd', 40);
"#;

fn by_rank() -> Query {
    Query::from("Item", "i").order_by(OrderBy::asc(Expr::path("i.rank")))
}

fn session(paging: PagingStrategy) -> Session {
    let config = TransactionConfig::new().compile_options(CompileOptions::default().paging(paging));
    Session::builder(schema()).config(config).build()
}

fn page(db: &SharedDb, paging: PagingStrategy, start: usize, count: usize) -> Vec<Tuple> {
    let mut txn = session(paging).begin(db.clone()).unwrap();
    let keys = txn.query_keys(&by_rank().page(start, count), &[]).unwrap();
    txn.rollback().unwrap();
    keys
}

#[test]
fn window_and_limit_paging_agree() {
    let db = SharedDb::open();
    db.seed(ITEMS);
    let all = page(&db, PagingStrategy::LimitOffset, 0, 100);
    let expected: Vec<Tuple> = [3i64, 5, 2, 7, 6, 4, 1].into_iter().map(Tuple::from).collect();
    assert_eq!(all, expected);

    let n = all.len();
    for start in [0, 2, n - 1, n] {
        for count in [0, 1, n - 1, n, n + 1] {
            let limit = page(&db, PagingStrategy::LimitOffset, start, count);
            let window = page(&db, PagingStrategy::WindowRowNumber, start, count);
            let end = (start + count).min(n);
            assert_eq!(limit, all[start..end], "limit/offset start={start} count={count}");
            assert_eq!(window, limit, "row-number start={start} count={count}");
        }
    }
}

#[test]
fn paged_rows_keep_selected_columns() {
    let db = SharedDb::open();
    db.seed(ITEMS);
    let query = by_rank()
        .select_as(Expr::path("i.label"), "label")
        .select_as(Expr::path("i.rank"), "rank")
        .page(1, 2);
    for paging in [PagingStrategy::LimitOffset, PagingStrategy::WindowRowNumber] {
        let mut txn = session(paging).begin(db.clone()).unwrap();
        let rows = txn.execute_query(&query, &[]).unwrap();
        let labels: Vec<&Value> = rows.iter().filter_map(|r| r.get_by_name("label")).collect();
        assert_eq!(labels, vec![&Value::from("b"), &Value::from("c")], "{paging:?}");
        assert_eq!(rows[1].get_by_name("rank"), Some(&Value::BigInt(30)));
        txn.rollback().unwrap();
    }
}

#[test]
fn pages_include_unflushed_objects() {
    let db = SharedDb::open();
    db.seed(ITEMS);
    let session = session(PagingStrategy::WindowRowNumber);
    let mut txn = session.begin(db.clone()).unwrap();
    let first = txn.create_with_key("Item", 100i64).unwrap();
    txn.set_value(first, "label", "zero").unwrap();
    txn.set_value(first, "rank", 0i64).unwrap();

    let keys = txn.query_keys(&by_rank().page(0, 2), &[]).unwrap();
    assert_eq!(keys, vec![Tuple::from(100i64), Tuple::from(3i64)]);
    txn.rollback().unwrap();
    assert!(db.column(r#"SELECT id FROM "Item" WHERE id = 100"#).is_empty());
}
