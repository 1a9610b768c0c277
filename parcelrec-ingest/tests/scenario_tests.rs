//! End-to-end import scenarios against a temporary SQLite database

mod helpers;

use helpers::*;
use parcelrec_common::events::IngestEvent;
use parcelrec_common::{FieldValue, ParcelField};
use parcelrec_ingest::db::{audit, parcels, SqliteStore};
use parcelrec_ingest::models::{AuditOperation, FoiaUpdate, MatchType, SessionStatus, UpdateStatus};
use parcelrec_ingest::storage::SessionRepository;
use parcelrec_ingest::IngestContext;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_high_confidence_match_is_applied_and_audited() {
    let db = create_test_db().await;
    let mut existing = parcel(1, "123 MAIN STREET", "62701");
    existing.fire_sprinklers = Some(false);
    existing.owner_name = Some("ACME HOLDINGS".to_string());
    seed(&db.pool, &[existing]).await;

    let ctx = context(&db, &test_config(2));
    let mut events = ctx.event_bus.subscribe();

    let records = vec![source(
        "123 Main St",
        "62701",
        &[(ParcelField::FireSprinklers, text("Yes"))],
    )];
    let outcome = ctx
        .pipeline
        .start("foia.json", records, CancellationToken::new())
        .await
        .unwrap();

    assert!(!outcome.cancelled);
    assert!(outcome.errors.is_empty());
    let session = outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_records, 1);
    assert_eq!(session.successful_updates, 1);
    assert_eq!(session.failed_updates, 0);

    let updates = db.store().updates_for_session(session.id).await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].match_type, MatchType::HighConfidence);
    assert_eq!(updates[0].match_confidence, 0.95);
    assert_eq!(updates[0].parcel_id, Some(1));
    assert_eq!(updates[0].status, UpdateStatus::Applied);
    assert!(updates[0].applied_at.is_some());

    let entries = audit::entries_for_session(&db.pool, session.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.operation, AuditOperation::Update);
    assert_eq!(entry.record_id, 1);
    assert_eq!(entry.changed_fields, vec![ParcelField::FireSprinklers]);
    assert_eq!(entry.old_values["fire_sprinklers"], false);
    assert_eq!(entry.old_values["owner_name"], "ACME HOLDINGS");
    assert_eq!(entry.update_id, Some(updates[0].id));

    let stored = parcels::load_parcel(&db.pool, 1).await.unwrap();
    assert_eq!(stored.fire_sprinklers, Some(true));
    assert_eq!(stored.owner_name.as_deref(), Some("ACME HOLDINGS"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(IngestEvent::SessionStarted { total_records: 1, .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        IngestEvent::RecordProcessed { processed_records: 1, status, .. } if status == "applied"
    )));
    assert!(matches!(seen.last(), Some(IngestEvent::SessionCompleted { successful_updates: 1, .. })));
}

#[tokio::test]
async fn test_identifier_match_wins_over_address() {
    let db = create_test_db().await;
    let mut target = parcel(2, "9 OAK AVE", "62702");
    target.parcel_number = Some("14-22-301-005".to_string());
    seed(&db.pool, &[target, parcel(3, "11 OAK AVE", "62702")]).await;

    let ctx = context(&db, &test_config(1));
    let mut record = source(
        "Rear lot behind the feed store",
        "62702",
        &[(ParcelField::OwnerName, text("Jane Q Public"))],
    );
    record.parcel_number = Some(" 14-22-301-005 ".to_string());

    let outcome = ctx
        .pipeline
        .start("foia.json", vec![record], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.session.successful_updates, 1);

    let updates = db.store().updates_for_session(outcome.session.id).await.unwrap();
    assert_eq!(updates[0].match_type, MatchType::ExactMatch);
    assert_eq!(updates[0].match_confidence, 1.0);
    assert_eq!(updates[0].parcel_id, Some(2));

    let stored = parcels::load_parcel(&db.pool, 2).await.unwrap();
    assert_eq!(stored.owner_name.as_deref(), Some("Jane Q Public"));
}

#[tokio::test]
async fn test_tie_in_same_zip_resolves_to_lowest_id() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(5, "100 ELM ST", "62703"), parcel(3, "100 Elm Street", "62703")]).await;

    let ctx = context(&db, &test_config(1));
    let records = vec![source(
        "100 Elm St Apt 2",
        "62703",
        &[(ParcelField::OccupancyClass, text("R-2"))],
    )];
    let outcome = ctx
        .pipeline
        .start("foia.json", records, CancellationToken::new())
        .await
        .unwrap();

    let updates = db.store().updates_for_session(outcome.session.id).await.unwrap();
    assert_eq!(updates[0].match_type, MatchType::MediumConfidence);
    assert_eq!(updates[0].parcel_id, Some(3));
    assert!((updates[0].match_confidence - 11.0 / 17.0).abs() < 1e-9);
    assert_eq!(updates[0].status, UpdateStatus::Applied);

    let untouched = parcels::load_parcel(&db.pool, 5).await.unwrap();
    assert!(untouched.occupancy_class.is_none());
}

#[tokio::test]
async fn test_cancel_then_resume_counts_every_record_once() {
    let db = create_test_db().await;
    let seeded: Vec<_> = (1..=10)
        .map(|n| parcel(n, &format!("{} MAPLE AVE", n), "62704"))
        .collect();
    seed(&db.pool, &seeded).await;

    let records: Vec<_> = (1..=10)
        .map(|n| {
            source(
                &format!("{} Maple Avenue", n),
                "62704",
                &[(ParcelField::OwnerName, text(&format!("OWNER {}", n)))],
            )
        })
        .collect();

    // Cancel fires when the fourth outcome is counted
    let token = CancellationToken::new();
    let store = SqliteStore::new(db.pool.clone());
    let repo = Arc::new(CancelAfterTallies::new(store.clone(), token.clone(), 4));
    let config = test_config(1);
    let cancelling = IngestContext::new(
        Arc::new(store),
        repo,
        &config,
        parcelrec_common::events::EventBus::new(100),
    );

    let first = cancelling
        .pipeline
        .start("maple.json", records.clone(), token)
        .await
        .unwrap();
    assert!(first.cancelled);
    assert_eq!(first.dispatched, 4);
    assert_eq!(first.session.status, SessionStatus::Processing);
    assert_eq!(first.session.processed_records, 4);
    assert!(first.session.counters_consistent());

    let ctx = context(&db, &config);
    let second = ctx
        .pipeline
        .resume(first.session.id, records, CancellationToken::new())
        .await
        .unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.dispatched, 6);

    let session = second.session;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.processed_records, 10);
    assert_eq!(session.successful_updates, 10);
    assert_eq!(session.failed_updates, 0);

    let entries = audit::entries_for_session(&db.pool, session.id).await.unwrap();
    assert_eq!(entries.len(), 10, "each parcel written exactly once");
}

#[tokio::test]
async fn test_resume_rejects_different_input() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(1, "1 ELM ST", "62705")]).await;
    let ctx = context(&db, &test_config(1));

    let session = ctx.sessions.create_session("elm.json", 2).await.unwrap();
    ctx.sessions.begin_processing(session.id).await.unwrap();

    let result = ctx
        .pipeline
        .resume(session.id, vec![source("1 Elm St", "62705", &[])], CancellationToken::new())
        .await;
    assert!(matches!(result, Err(parcelrec_common::Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_record_outcome_is_idempotent() {
    let db = create_test_db().await;
    let ctx = context(&db, &test_config(1));

    let session = ctx.sessions.create_session("one.json", 1).await.unwrap();
    ctx.sessions.begin_processing(session.id).await.unwrap();

    let update = FoiaUpdate::rejected(session.id, "row:0", "Invalid address: ''".to_string());
    assert_eq!(
        ctx.sessions.record_outcome(&update).await.unwrap(),
        Some(UpdateStatus::Skipped)
    );
    assert_eq!(ctx.sessions.record_outcome(&update).await.unwrap(), None);

    let reloaded = ctx.sessions.load(session.id).await.unwrap();
    assert_eq!(reloaded.processed_records, 1);
    assert_eq!(reloaded.failed_updates, 1);
    assert!(reloaded.counters_consistent());

    ctx.sessions.finalize(session.id).await.unwrap();
}

#[tokio::test]
async fn test_finalize_requires_all_records() {
    let db = create_test_db().await;
    let ctx = context(&db, &test_config(1));

    let session = ctx.sessions.create_session("two.json", 2).await.unwrap();
    ctx.sessions.begin_processing(session.id).await.unwrap();

    assert!(ctx.sessions.finalize(session.id).await.is_err());
    assert_eq!(
        ctx.sessions.load(session.id).await.unwrap().status,
        SessionStatus::Processing
    );
}

#[tokio::test]
async fn test_fail_only_before_processing() {
    let db = create_test_db().await;
    let ctx = context(&db, &test_config(1));

    let session = ctx.sessions.create_session("bad.json", 3).await.unwrap();
    let failed = ctx.sessions.fail(session.id, "unreadable input").await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("unreadable input"));
    let stored = ctx.sessions.load(session.id).await.unwrap();
    assert_eq!(stored.total_records, 0);
    assert!(stored.counters_consistent());

    let session = ctx.sessions.create_session("ok.json", 1).await.unwrap();
    ctx.sessions.begin_processing(session.id).await.unwrap();
    let update = FoiaUpdate::rejected(session.id, "row:0", "Invalid address: '#'".to_string());
    ctx.sessions.record_outcome(&update).await.unwrap();
    assert!(ctx.sessions.fail(session.id, "too late").await.is_err());
}

#[tokio::test]
async fn test_skipped_outcomes_keep_counters_consistent() {
    let db = create_test_db().await;
    let mut owned = parcel(1, "123 MAIN ST", "62706");
    owned.owner_name = Some("ACME".to_string());
    seed(&db.pool, &[owned]).await;

    let ctx = context(&db, &test_config(3));
    let records = vec![
        // Same value already stored
        source("123 Main Street", "62706", &[(ParcelField::OwnerName, text("ACME"))]),
        // Similar enough for review, not for auto-apply
        source(
            "123 Main St Apt 456 Bldg 9",
            "62706",
            &[(ParcelField::OwnerName, text("SOMEONE ELSE"))],
        ),
        // Unparseable, no identifier
        source("###", "62706", &[(ParcelField::LotSize, FieldValue::Number(1.0))]),
        // Nothing in scope
        source("5 Nowhere Rd", "99999", &[(ParcelField::LotSize, FieldValue::Number(2.0))]),
    ];

    let outcome = ctx
        .pipeline
        .start("mixed.json", records, CancellationToken::new())
        .await
        .unwrap();
    let session = outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_records, 4);
    assert_eq!(session.processed_records, 4);
    assert_eq!(session.successful_updates, 0);
    assert_eq!(session.failed_updates, 4);
    assert!(session.counters_consistent());

    let summary = ctx.sessions.summary(session.id).await.unwrap();
    assert_eq!(summary.count_status(UpdateStatus::Skipped), 4);
    assert_eq!(summary.count_match_type(MatchType::NoMatch), 2);
    assert_eq!(summary.needs_review.len(), 1);
    assert_eq!(summary.needs_review[0].source_address, "123 Main St Apt 456 Bldg 9");
    assert!(summary.failures.is_empty());

    let stored = parcels::load_parcel(&db.pool, 1).await.unwrap();
    assert_eq!(stored.owner_name.as_deref(), Some("ACME"));
    assert!(audit::entries_for_session(&db.pool, session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_source_keys_last_wins() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(1, "8 BIRCH RD", "62707")]).await;
    let ctx = context(&db, &test_config(2));

    let records = vec![
        source("8 Birch Rd", "62707", &[(ParcelField::PropertyValue, text("$100,000"))]),
        source("8 Birch Rd", "62707", &[(ParcelField::PropertyValue, text("$250,000"))]),
    ];
    let outcome = ctx
        .pipeline
        .start("birch.json", records, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.session.total_records, 1);
    assert_eq!(outcome.session.successful_updates, 1);

    let stored = parcels::load_parcel(&db.pool, 1).await.unwrap();
    assert_eq!(stored.property_value, Some(250_000.0));
}

#[tokio::test]
async fn test_unparseable_upload_fails_session() {
    let db = create_test_db().await;
    let ctx = context(&db, &test_config(1));
    let mut events = ctx.event_bus.subscribe();

    let session = ctx.pipeline.open("broken.jsonl").await.unwrap();
    assert_eq!(session.status, SessionStatus::Uploading);

    let contents = "{\"address\": \"1 Elm St\", \"zip\": \"62701\"}\n{\"address\": ";
    let outcome = ctx
        .pipeline
        .ingest(session.id, contents, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.dispatched, 0);
    let failed = outcome.session;
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.processed_records, 0);
    assert_eq!(failed.total_records, 0);
    assert!(failed.failure_reason.as_deref().unwrap_or_default().contains("line 2"));
    assert!(failed.counters_consistent());

    assert!(db.store().updates_for_session(session.id).await.unwrap().is_empty());
    assert!(matches!(events.try_recv(), Ok(IngestEvent::SessionFailed { .. })));
    assert!(ctx.sessions.begin_processing(session.id).await.is_err());
}

#[tokio::test]
async fn test_parsed_upload_is_processed() {
    let db = create_test_db().await;
    seed(&db.pool, &[parcel(1, "1 ELM ST", "62701")]).await;
    let ctx = context(&db, &test_config(1));

    let session = ctx.pipeline.open("elm.json").await.unwrap();
    let contents = r#"[{"address": "1 Elm Street", "zip": "62701", "owner_name": "D"}]"#;
    let outcome = ctx
        .pipeline
        .ingest(session.id, contents, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.session.total_records, 1);
    assert_eq!(outcome.session.successful_updates, 1);
    assert_eq!(
        parcels::load_parcel(&db.pool, 1).await.unwrap().owner_name.as_deref(),
        Some("D")
    );
}
