//! Concurrent claimants of one dedupe key must all observe the same
//! transaction id, and exactly one of them creates the canonical record.

use std::sync::Arc;
use std::thread;

use rvl_testkit::{sample_stripe_tx, MemLedger};

#[test]
fn concurrent_ingest_converges_to_one_record() {
    let ledger = Arc::new(MemLedger::new());
    let tx = sample_stripe_tx("invoice:in_race");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let tx = tx.clone();
            thread::spawn(move || ledger.ingest(&tx).unwrap())
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first_id = results[0].tx_id;
    assert!(results.iter().all(|r| r.tx_id == first_id));
    assert_eq!(results.iter().filter(|r| r.created).count(), 1);
}

#[test]
fn blank_dedupe_key_is_rejected() {
    let ledger = MemLedger::new();
    let mut tx = sample_stripe_tx("invoice:in_1");
    tx.dedupe_key = "  ".into();
    assert!(ledger.ingest(&tx).is_err());
}
