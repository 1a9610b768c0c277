//! Concurrent writers against one parcel

mod helpers;

use helpers::*;
use parcelrec_common::{FieldValue, ParcelField};
use parcelrec_ingest::db::{audit, parcels};
use parcelrec_ingest::models::{AuditOperation, SessionStatus, UpdateStatus};
use parcelrec_ingest::storage::SessionRepository;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn same_parcel_variants(count: usize) -> Vec<parcelrec_ingest::models::SourceRecord> {
    // Distinct source keys that all normalize to 42 BIRCH RD
    (1..=count)
        .map(|i| {
            let address = format!("42 Birch Road{}", ".".repeat(i));
            source(
                &address,
                "62720",
                &[(ParcelField::PropertyValue, FieldValue::Number(i as f64 * 1000.0))],
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_parcel_updates_are_serialized() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(42, "42 BIRCH RD", "62720")]).await;

    let ctx = context(&db, &test_config(8));
    let outcome = ctx
        .pipeline
        .start("birch.json", same_parcel_variants(8), CancellationToken::new())
        .await
        .unwrap();

    let session = outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.processed_records, 8);
    assert_eq!(session.successful_updates, 8);
    assert!(session.counters_consistent());

    let entries = audit::entries_for_parcel(&db.pool, 42).await.unwrap();
    let updates: Vec<_> = entries
        .iter()
        .filter(|e| e.operation == AuditOperation::Update)
        .collect();
    assert_eq!(updates.len(), 8);

    // Each write saw the value left by the one before it
    assert!(updates[0].old_values["property_value"].is_null());
    for pair in updates.windows(2) {
        let previous_new = match pair[0].new_values.get(&ParcelField::PropertyValue) {
            Some(FieldValue::Number(n)) => *n,
            other => panic!("unexpected new value {:?}", other),
        };
        assert_eq!(pair[1].old_values["property_value"].as_f64(), Some(previous_new));
    }

    let last_new = updates[7].new_values.get(&ParcelField::PropertyValue).cloned();
    let stored = parcels::load_parcel(&db.pool, 42).await.unwrap();
    assert_eq!(stored.property_value.map(FieldValue::Number), last_new);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_parcels_in_parallel() {
    let db = create_test_db().await;
    let seeded: Vec<_> = (1..=40)
        .map(|n| parcel(n, &format!("{} SPRUCE ST", n), "62721"))
        .collect();
    seed(&db.pool, &seeded).await;

    let records: Vec<_> = (1..=40)
        .map(|n| {
            source(
                &format!("{} Spruce Street", n),
                "62721",
                &[(ParcelField::LotSize, FieldValue::Number(n as f64 / 10.0))],
            )
        })
        .collect();

    let ctx = context(&db, &test_config(8));
    let outcome = ctx
        .pipeline
        .start("spruce.json", records, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.session.successful_updates, 40);
    assert!(outcome.errors.is_empty());

    for n in [1, 17, 40] {
        let stored = parcels::load_parcel(&db.pool, n).await.unwrap();
        assert_eq!(stored.lot_size, Some(n as f64 / 10.0));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_parcel_lock_fails_after_retries() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(5, "5 MAPLE AVE", "62722")]).await;

    let mut config = test_config(1);
    config.workers.lock_timeout_ms = 20;
    config.retry.max_retries = 3;
    let ctx = context(&db, &config);

    // Another writer owns the parcel for the whole run
    let guard = ctx.locks.acquire(5, Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    let outcome = ctx
        .pipeline
        .start(
            "maple.json",
            vec![source("5 Maple Avenue", "62722", &[(ParcelField::OwnerName, text("E"))])],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();
    drop(guard);

    let session = outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.failed_updates, 1);

    let update = db
        .store()
        .find_update(session.id, "5 Maple Avenue")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, UpdateStatus::Failed);
    assert_eq!(
        update.error_message.as_deref(),
        Some("Write conflict on parcel 5 after 4 attempt(s)")
    );
    // One lock wait per attempt
    assert!(elapsed >= Duration::from_millis(80), "finished after {:?}", elapsed);

    assert!(audit::entries_for_parcel(&db.pool, 5).await.unwrap().is_empty());
    assert_eq!(parcels::load_parcel(&db.pool, 5).await.unwrap().owner_name, None);
}
