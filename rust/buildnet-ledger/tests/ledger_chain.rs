//! Integration tests for the hash-chained double-entry ledger

use buildnet_ledger::{
    Actor, ChangeDelta, EntryFilter, EntryType, IntegrityErrorKind, Ledger, LedgerConfig,
};
use buildnet_state::MemoryBackend;
use serde_json::json;
use std::sync::Arc;

async fn open_ledger() -> Ledger {
    let backend = Arc::new(MemoryBackend::new());
    Ledger::open(backend, LedgerConfig::default()).await.unwrap()
}

#[tokio::test]
async fn create_records_single_credit_at_sequence_one() {
    let ledger = open_ledger().await;
    let tx = ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({"name": "w1", "cpu": 8})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();

    assert_eq!(tx.entries.len(), 1);
    let entry = &tx.entries[0];
    assert_eq!(entry.entry_type, EntryType::Credit);
    assert_eq!(entry.sequence_number, 1);
    assert_eq!(entry.delta, ChangeDelta::Create);

    let state = ledger.get_entity_state("resource", "w1").await.unwrap();
    assert_eq!(state, Some(json!({"name": "w1", "cpu": 8})));

    let report = ledger.verify_integrity(None).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.entries_checked, 1);
}

#[tokio::test]
async fn update_records_debit_credit_pair_with_field_delta() {
    let ledger = open_ledger().await;
    ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({"name": "w1", "cpu": 8})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    let tx = ledger
        .record_change(
            "resource",
            "w1",
            Some(json!({"name": "w1", "cpu": 8})),
            Some(json!({"name": "w1", "cpu": 16})),
            &Actor::system(),
            "upgrade",
            None,
        )
        .await
        .unwrap();

    assert_eq!(tx.entries.len(), 2);
    let debit = &tx.entries[0];
    let credit = &tx.entries[1];
    assert_eq!(debit.entry_type, EntryType::Debit);
    assert_eq!(debit.sequence_number, 2);
    assert_eq!(credit.entry_type, EntryType::Credit);
    assert_eq!(credit.sequence_number, 3);
    assert_eq!(debit.transaction_id, credit.transaction_id);
    assert_eq!(debit.timestamp, credit.timestamp);
    assert_eq!(debit.reason, credit.reason);
    assert_eq!(debit.actor, credit.actor);

    let ChangeDelta::Update { changes } = &credit.delta else {
        panic!("expected update delta");
    };
    assert_eq!(changes.len(), 1);
    assert_eq!(changes["cpu"].old, json!(8));
    assert_eq!(changes["cpu"].new, json!(16));

    let state = ledger.get_entity_state("resource", "w1").await.unwrap();
    assert_eq!(state, Some(json!({"name": "w1", "cpu": 16})));
}

#[tokio::test]
async fn chain_is_dense_and_linked() {
    let ledger = open_ledger().await;
    for i in 0..5u32 {
        ledger
            .record_change(
                "resource",
                &format!("w{}", i),
                None,
                Some(json!({"idx": i})),
                &Actor::system(),
                "add",
                None,
            )
            .await
            .unwrap();
    }
    let entries = ledger
        .query_entries(&EntryFilter::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(entries.len(), 5);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence_number, i as u64 + 1);
        if i > 0 {
            assert_eq!(entry.previous_checksum, entries[i - 1].checksum);
        }
    }
    let report = ledger.verify_integrity(None).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.entries_checked, 5);
}

#[tokio::test]
async fn tampered_previous_checksum_reports_one_chain_break() {
    let ledger = open_ledger().await;
    ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({"name": "w1", "cpu": 8})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    let tx = ledger
        .record_change(
            "resource",
            "w1",
            Some(json!({"name": "w1", "cpu": 8})),
            Some(json!({"name": "w1", "cpu": 16})),
            &Actor::system(),
            "upgrade",
            None,
        )
        .await
        .unwrap();

    let mut tampered = tx.entries[0].clone();
    tampered.previous_checksum = "feedfacefeedfacefeedface".to_string();
    ledger.overwrite_entry_unchecked(&tampered).await.unwrap();

    let report = ledger.verify_integrity(None).await.unwrap();
    assert!(!report.verified);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, IntegrityErrorKind::ChainBreak);
    assert_eq!(report.errors[0].sequence, 2);
}

#[tokio::test]
async fn tampered_state_reports_checksum_mismatch() {
    let ledger = open_ledger().await;
    let tx = ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({"cpu": 8})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();

    let mut tampered = tx.entries[0].clone();
    tampered.new_state = Some(json!({"cpu": 64}));
    ledger.overwrite_entry_unchecked(&tampered).await.unwrap();

    let report = ledger.verify_integrity(None).await.unwrap();
    assert!(!report.verified);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, IntegrityErrorKind::ChecksumMismatch);
    assert_eq!(report.errors[0].sequence, 1);
}

#[tokio::test]
async fn delete_leaves_entity_absent() {
    let ledger = open_ledger().await;
    ledger
        .record_change(
            "session",
            "s1",
            None,
            Some(json!({"actor": "alice"})),
            &Actor::system(),
            "create",
            None,
        )
        .await
        .unwrap();
    let tx = ledger
        .record_change(
            "session",
            "s1",
            Some(json!({"actor": "alice"})),
            None,
            &Actor::system(),
            "end",
            None,
        )
        .await
        .unwrap();

    assert_eq!(tx.entries.len(), 1);
    assert_eq!(tx.entries[0].entry_type, EntryType::Debit);
    assert_eq!(
        ledger.get_entity_state("session", "s1").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn point_in_time_query_matches_history() {
    let ledger = open_ledger().await;
    ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({"cpu": 8})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    let after_create = chrono::Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    ledger
        .record_change(
            "resource",
            "w1",
            Some(json!({"cpu": 8})),
            Some(json!({"cpu": 16})),
            &Actor::system(),
            "upgrade",
            None,
        )
        .await
        .unwrap();

    let then = ledger
        .get_entity_state_at("resource", "w1", after_create)
        .await
        .unwrap();
    assert_eq!(then, Some(json!({"cpu": 8})));

    let now = ledger
        .get_entity_state_at("resource", "w1", chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(now, ledger.get_entity_state("resource", "w1").await.unwrap());
}

#[tokio::test]
async fn query_filters_by_entity_and_actor() {
    let ledger = open_ledger().await;
    let alice = Actor::new("alice", "Alice", buildnet_ledger::ActorKind::User);
    ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    ledger
        .record_change("session", "s1", None, Some(json!({})), &alice, "create", None)
        .await
        .unwrap();

    let filter = EntryFilter {
        actor_id: Some("alice".to_string()),
        ..Default::default()
    };
    let entries = ledger.query_entries(&filter, 10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entity_type, "session");

    let filter = EntryFilter {
        entity_type: Some("resource".to_string()),
        entity_id: Some("w1".to_string()),
        ..Default::default()
    };
    let entries = ledger.query_entries(&filter, 10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entity_id, "w1");
}

#[tokio::test]
async fn correlation_scope_attaches_to_subsequent_changes() {
    let ledger = open_ledger().await;
    let correlation = ledger.start_correlation();
    let tx = ledger
        .record_change(
            "build",
            "b1",
            None,
            Some(json!({"status": "running"})),
            &Actor::system(),
            "build started",
            None,
        )
        .await
        .unwrap();
    assert_eq!(tx.entries[0].correlation_id, Some(correlation));

    ledger.end_correlation();
    let tx = ledger
        .record_change(
            "build",
            "b2",
            None,
            Some(json!({"status": "running"})),
            &Actor::system(),
            "build started",
            None,
        )
        .await
        .unwrap();
    assert_eq!(tx.entries[0].correlation_id, None);
}

#[tokio::test]
async fn no_op_change_records_nothing() {
    let ledger = open_ledger().await;
    let tx = ledger
        .record_change("resource", "w1", None, None, &Actor::system(), "noop", None)
        .await
        .unwrap();
    assert!(tx.entries.is_empty());
    let report = ledger.verify_integrity(None).await.unwrap();
    assert_eq!(report.entries_checked, 0);
    assert!(report.verified);
}

#[tokio::test]
async fn stats_count_accounts_and_entity_types() {
    let ledger = open_ledger().await;
    ledger
        .record_change(
            "resource",
            "w1",
            None,
            Some(json!({})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    ledger
        .record_change(
            "session",
            "s1",
            None,
            Some(json!({})),
            &Actor::system(),
            "create",
            None,
        )
        .await
        .unwrap();

    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.total_transactions, 2);
    assert_eq!(stats.first_sequence, Some(1));
    assert_eq!(stats.last_sequence, Some(2));
    assert_eq!(stats.entries_by_account["WORKER_POOL"], 1);
    assert_eq!(stats.entries_by_account["USER_SESSIONS"], 1);
    assert_eq!(stats.entries_by_entity_type["resource"], 1);
}

#[tokio::test]
async fn sequence_recovers_across_reopen() {
    let backend = Arc::new(MemoryBackend::new());
    {
        let ledger = Ledger::open(backend.clone(), LedgerConfig::default())
            .await
            .unwrap();
        ledger
            .record_change(
                "resource",
                "w1",
                None,
                Some(json!({})),
                &Actor::system(),
                "add",
                None,
            )
            .await
            .unwrap();
    }
    let ledger = Ledger::open(backend, LedgerConfig::default()).await.unwrap();
    let tx = ledger
        .record_change(
            "resource",
            "w2",
            None,
            Some(json!({})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    assert_eq!(tx.entries[0].sequence_number, 2);
    assert!(ledger.verify_integrity(None).await.unwrap().verified);
}

#[tokio::test]
async fn mirror_replay_restores_a_wiped_backend() {
    let dir = tempfile::TempDir::new().unwrap();
    let mirror_path = dir.path().join("ledger.jsonl");
    let config = LedgerConfig {
        mirror_path: Some(mirror_path.clone()),
        ..Default::default()
    };

    {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = Ledger::open(backend, config.clone()).await.unwrap();
        ledger
            .record_change(
                "resource",
                "w1",
                None,
                Some(json!({"cpu": 8})),
                &Actor::system(),
                "add",
                None,
            )
            .await
            .unwrap();
        ledger
            .record_change(
                "resource",
                "w1",
                Some(json!({"cpu": 8})),
                Some(json!({"cpu": 16})),
                &Actor::system(),
                "upgrade",
                None,
            )
            .await
            .unwrap();
    }

    // Fresh backend: the wipe
    let backend = Arc::new(MemoryBackend::new());
    let ledger = Ledger::open(backend, config).await.unwrap();
    let replayed = ledger.replay_mirror().await.unwrap();
    assert_eq!(replayed, 3);

    assert_eq!(
        ledger.get_entity_state("resource", "w1").await.unwrap(),
        Some(json!({"cpu": 16}))
    );
    assert!(ledger.verify_integrity(None).await.unwrap().verified);

    // Writes continue after the restored sequence
    let tx = ledger
        .record_change(
            "resource",
            "w2",
            None,
            Some(json!({})),
            &Actor::system(),
            "add",
            None,
        )
        .await
        .unwrap();
    assert_eq!(tx.entries[0].sequence_number, 4);
}
