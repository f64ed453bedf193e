mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::test_db;
use index::{BTreeIndex, Index, IndexInfo};
use sql::{Constant, ConstantRange, ConstantType};
use storage::{BlockId, Page, PageFormatter, Rid, TransactionManager};

fn rid_for(value: u64) -> Rid {
    Rid::new(BlockId::new("emp.tbl", value), value as u32)
}

fn index_info() -> IndexInfo {
    IndexInfo::new("emp_eid_idx", "emp", "eid")
}

fn insert_range(txn_mgr: &Arc<TransactionManager>, values: std::ops::Range<i64>) {
    let tx = txn_mgr.begin().unwrap();
    let mut idx = BTreeIndex::new(index_info(), ConstantType::Integer, &tx).unwrap();
    for value in values {
        idx.insert(Constant::Integer(value as i32), rid_for(value as u64), true)
            .unwrap();
        // Releasing the index locks after each operation is what lets the
        // two writers interleave.
        idx.close();
    }
    tx.commit().unwrap();
}

#[test]
fn concurrent_writers_serialize_through_crabbing() {
    let db = test_db(64);

    // Seed the index files up front so the writers only contend on blocks.
    let setup = db.txn_mgr.begin().unwrap();
    BTreeIndex::new(index_info(), ConstantType::Integer, &setup).unwrap();
    setup.commit().unwrap();

    let writers: Vec<_> = [0..1000_i64, 1000..2000_i64]
        .into_iter()
        .map(|values| {
            let txn_mgr = Arc::clone(&db.txn_mgr);
            thread::spawn(move || insert_range(&txn_mgr, values))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // A reader that starts after both commits observes all 2000 keys in
    // key order.
    let tx = db.txn_mgr.begin_readonly().unwrap();
    let mut idx = BTreeIndex::new(index_info(), ConstantType::Integer, &tx).unwrap();
    idx.before_first(&ConstantRange::unbounded()).unwrap();
    let mut seen = Vec::new();
    while idx.next().unwrap() {
        seen.push(idx.get_data_rid().unwrap().blk.number());
    }
    idx.close();
    tx.commit().unwrap();

    let expected: Vec<u64> = (0..2000).collect();
    assert_eq!(seen, expected);
}

struct Zeroes;

impl PageFormatter for Zeroes {
    fn format(&self, _page: &mut Page) {}
}

#[test]
fn pinned_out_pool_releases_waiters_on_commit() {
    let db = test_db(4);

    let holder = db.txn_mgr.begin().unwrap();
    for _ in 0..4 {
        holder.buffer_mgr().pin_new("emp.tbl", &Zeroes).unwrap();
    }
    assert_eq!(db.txn_mgr.pool().available(), 0);

    let txn_mgr = Arc::clone(&db.txn_mgr);
    let waiter = thread::spawn(move || {
        let tx = txn_mgr.begin().unwrap();
        let start = Instant::now();
        tx.buffer_mgr().pin_new("emp.tbl", &Zeroes).unwrap();
        let waited = start.elapsed();
        tx.commit().unwrap();
        waited
    });

    thread::sleep(Duration::from_millis(100));
    holder.commit().unwrap();

    // The waiter finishes within one wait window of the commit.
    let waited = waiter.join().unwrap();
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(500));
}
