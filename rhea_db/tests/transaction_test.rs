mod common;

use common::*;
use rhea_db::errors::Error;
use rhea_db::types::{CompOp, Condition, Rhs, SetClause, Value};

#[test]
fn test_uncommitted_insert_blocks_reader_until_commit() {
    let (_dir, db) = setup_db("nowait");
    create_table_t(&db);

    let t1 = db.begin();
    insert_row(&db, &t1, "t", vec![Value::Int(10), Value::Str("aa".into())]).unwrap();

    // T2 hits T1's exclusive row lock and is refused outright.
    let t2 = db.begin();
    let err = select_where(
        &db,
        &t2,
        "t",
        vec![Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(10)))],
    )
    .unwrap_err();
    assert!(matches!(err, Error::DeadlockPrevention(id) if id == t2.id()));
    db.abort(&t2).unwrap();

    db.commit(&t1).unwrap();

    let t3 = db.begin();
    let rows = select_where(
        &db,
        &t3,
        "t",
        vec![Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(10)))],
    )
    .unwrap();
    db.commit(&t3).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(row_str(&rows[0], 4, 4), b"aa\0\0");
}

#[test]
fn test_aborted_update_restores_row_and_index() {
    let (_dir, db) = setup_db("abort_update");
    create_table_t(&db);
    db.catalog_mut().create_index("t", &["a"], None).unwrap();

    let setup = db.begin();
    insert_row(&db, &setup, "t", vec![Value::Int(1), Value::Str("a   ".into())]).unwrap();
    db.commit(&setup).unwrap();

    let t1 = db.begin();
    let updated = update_where(
        &db,
        &t1,
        "t",
        vec![
            SetClause::new("a", Value::Int(2)),
            SetClause::new("b", Value::Str("b   ".into())),
        ],
        vec![Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(1)))],
    )
    .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(index_int_keys(&db, "t"), vec![2]);
    db.abort(&t1).unwrap();

    let t2 = db.begin();
    let rows = select_where(&db, &t2, "t", vec![]).unwrap();
    db.commit(&t2).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(row_int(&rows[0], 0), 1);
    assert_eq!(row_str(&rows[0], 4, 4), b"a   ");
    assert_eq!(index_int_keys(&db, "t"), vec![1]);
}

#[test]
fn test_rollback_restores_pre_begin_state_byte_for_byte() {
    let (_dir, db) = setup_db("rollback");
    create_table_t(&db);
    db.catalog_mut().create_index("t", &["a"], None).unwrap();

    let setup = db.begin();
    for k in 0..10 {
        insert_row(&db, &setup, "t", vec![Value::Int(k), Value::Str("base".into())]).unwrap();
    }
    db.commit(&setup).unwrap();

    let before_rows = snapshot_table(&db, "t");
    let before_keys = index_int_keys(&db, "t");

    let txn = db.begin();
    for k in 100..105 {
        insert_row(&db, &txn, "t", vec![Value::Int(k), Value::Str("newb".into())]).unwrap();
    }
    update_where(
        &db,
        &txn,
        "t",
        vec![SetClause::new("a", Value::Int(55))],
        vec![Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(5)))],
    )
    .unwrap();
    delete_where(
        &db,
        &txn,
        "t",
        vec![Condition::new("a", CompOp::Le, Rhs::Value(Value::Int(2)))],
    )
    .unwrap();
    db.abort(&txn).unwrap();

    assert_eq!(snapshot_table(&db, "t"), before_rows);
    assert_eq!(index_int_keys(&db, "t"), before_keys);
}

#[test]
fn test_aborted_insert_disappears() {
    let (_dir, db) = setup_db("abort_insert");
    create_table_t(&db);
    db.catalog_mut().create_index("t", &["a"], None).unwrap();

    let txn = db.begin();
    insert_row(&db, &txn, "t", vec![Value::Int(42), Value::Str("gone".into())]).unwrap();
    db.abort(&txn).unwrap();

    let t2 = db.begin();
    assert!(select_where(&db, &t2, "t", vec![]).unwrap().is_empty());
    db.commit(&t2).unwrap();
    assert!(index_int_keys(&db, "t").is_empty());
}

#[test]
fn test_aborted_delete_comes_back_at_same_rid() {
    let (_dir, db) = setup_db("abort_delete");
    create_table_t(&db);
    db.catalog_mut().create_index("t", &["a"], None).unwrap();

    let setup = db.begin();
    insert_row(&db, &setup, "t", vec![Value::Int(8), Value::Str("keep".into())]).unwrap();
    db.commit(&setup).unwrap();
    let before = snapshot_table(&db, "t");

    let txn = db.begin();
    delete_where(
        &db,
        &txn,
        "t",
        vec![Condition::new("a", CompOp::Eq, Rhs::Value(Value::Int(8)))],
    )
    .unwrap();
    assert!(index_int_keys(&db, "t").is_empty());
    db.abort(&txn).unwrap();

    assert_eq!(snapshot_table(&db, "t"), before);
    assert_eq!(index_int_keys(&db, "t"), vec![8]);
}

#[test]
fn test_commit_makes_writes_visible_to_later_transactions() {
    let (_dir, db) = setup_db("visibility");
    create_table_t(&db);

    let t1 = db.begin();
    insert_row(&db, &t1, "t", vec![Value::Int(1), Value::Str("one".into())]).unwrap();
    db.commit(&t1).unwrap();

    let t2 = db.begin();
    let rows = select_where(&db, &t2, "t", vec![]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(row_int(&rows[0], 0), 1);
    db.commit(&t2).unwrap();
}

#[test]
fn test_two_writers_conflict_and_loser_retries_after_commit() {
    let (_dir, db) = setup_db("writers");
    create_table_t(&db);

    let setup = db.begin();
    insert_row(&db, &setup, "t", vec![Value::Int(1), Value::Str("v0".into())]).unwrap();
    db.commit(&setup).unwrap();

    let t1 = db.begin();
    update_where(
        &db,
        &t1,
        "t",
        vec![SetClause::new("b", Value::Str("v1".into()))],
        vec![],
    )
    .unwrap();

    let t2 = db.begin();
    let err = update_where(
        &db,
        &t2,
        "t",
        vec![SetClause::new("b", Value::Str("v2".into()))],
        vec![],
    )
    .unwrap_err();
    assert!(err.is_lock_violation());
    db.abort(&t2).unwrap();

    db.commit(&t1).unwrap();

    let t3 = db.begin();
    update_where(
        &db,
        &t3,
        "t",
        vec![SetClause::new("b", Value::Str("v3".into()))],
        vec![],
    )
    .unwrap();
    db.commit(&t3).unwrap();

    let t4 = db.begin();
    let rows = select_where(&db, &t4, "t", vec![]).unwrap();
    db.commit(&t4).unwrap();
    assert_eq!(row_str(&rows[0], 4, 4), b"v3\0\0");
}
