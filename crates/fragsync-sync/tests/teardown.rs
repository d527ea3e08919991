//! Withdrawing the last fragment deletes the remote object, then the record

use fragsync_model::ErrorClass;
use fragsync_store::{InMemoryRecordStore, RecordStore};
use fragsync_sync::{Aggregator, CycleOutcome, RemoteError};
use fragsync_test_utils::{
    fast_config, ingress_payload, source, tunnel_key, RemoteOp, SpyRemote,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Fixture {
    store: Arc<InMemoryRecordStore>,
    spy: Arc<SpyRemote>,
    aggregator: Aggregator,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryRecordStore::new());
    let spy = Arc::new(SpyRemote::new());
    let aggregator = Aggregator::new(store.clone(), spy.clone(), fast_config("replica-a")).unwrap();
    Fixture {
        store,
        spy,
        aggregator,
    }
}

#[tokio::test]
async fn last_withdrawal_deletes_remote_object() {
    let fx = fixture();
    let key = tunnel_key("tun-1");
    let a = fx.aggregator.producer(source("Tunnel", "a"));
    let b = fx.aggregator.producer(source("Tunnel", "b"));
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a"), 10)
        .await
        .unwrap();
    b.contribute_fragment(&key, ingress_payload("b.example.com", "http://b"), 10)
        .await
        .unwrap();
    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::Synced);

    // one contributor left: plain update, object survives
    assert!(a.withdraw_fragment(&key).await.unwrap());
    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::Synced);
    assert_eq!(fx.spy.object_count(), 1);

    assert!(b.withdraw_fragment(&key).await.unwrap());
    let record = fx.store.get(&key).await.unwrap().unwrap().value;
    assert!(record.teardown_requested);

    fx.spy.reset_calls();
    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::TornDown);
    assert_eq!(fx.spy.count(RemoteOp::Delete), 1);
    assert_eq!(fx.spy.object_count(), 0);
    assert!(fx.store.get(&key).await.unwrap().is_none());
    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::Missing);
}

#[tokio::test]
async fn failed_delete_keeps_record_for_retry() {
    let fx = fixture();
    let key = tunnel_key("tun-1");
    let a = fx.aggregator.producer(source("Tunnel", "a"));
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a"), 10)
        .await
        .unwrap();
    fx.aggregator.sync_once(&key).await.unwrap();
    a.withdraw_fragment(&key).await.unwrap();

    for _ in 0..3 {
        fx.spy
            .fail_next(RemoteOp::Delete, RemoteError::unavailable("503 service unavailable"));
    }
    let outcome = fx.aggregator.sync_once(&key).await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Failed {
            class: ErrorClass::Transient,
            ..
        }
    ));
    let record = fx.store.get(&key).await.unwrap().unwrap().value;
    assert!(record.teardown_requested);
    assert!(record.status.remote_id().is_some());
    assert_eq!(fx.spy.object_count(), 1);

    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::TornDown);
    assert_eq!(fx.spy.object_count(), 0);
    assert!(fx.store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn object_already_gone_counts_as_deleted() {
    let fx = fixture();
    let key = tunnel_key("tun-1");
    let a = fx.aggregator.producer(source("Tunnel", "a"));
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a"), 10)
        .await
        .unwrap();
    fx.aggregator.sync_once(&key).await.unwrap();
    a.withdraw_fragment(&key).await.unwrap();
    fx.spy.delete_out_of_band(&key);

    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::TornDown);
    assert!(fx.store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn never_synced_record_is_dropped_without_delete() {
    let fx = fixture();
    let key = tunnel_key("tun-1");
    let a = fx.aggregator.producer(source("Tunnel", "a"));
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a"), 10)
        .await
        .unwrap();
    a.withdraw_fragment(&key).await.unwrap();

    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::TornDown);
    assert_eq!(fx.spy.count(RemoteOp::Exists), 1);
    assert_eq!(fx.spy.count(RemoteOp::Delete), 0);
    assert!(fx.store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn recontribution_before_teardown_cancels_it() {
    let fx = fixture();
    let key = tunnel_key("tun-1");
    let a = fx.aggregator.producer(source("Tunnel", "a"));
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a"), 10)
        .await
        .unwrap();
    fx.aggregator.sync_once(&key).await.unwrap();

    a.withdraw_fragment(&key).await.unwrap();
    a.contribute_fragment(&key, ingress_payload("a.example.com", "http://a2"), 10)
        .await
        .unwrap();
    let record = fx.store.get(&key).await.unwrap().unwrap().value;
    assert!(!record.teardown_requested);

    fx.spy.reset_calls();
    assert_eq!(fx.aggregator.sync_once(&key).await.unwrap(), CycleOutcome::Synced);
    assert_eq!(fx.spy.count(RemoteOp::Delete), 0);
    assert_eq!(fx.spy.count(RemoteOp::Create), 0);
    assert_eq!(fx.spy.object_count(), 1);
}
