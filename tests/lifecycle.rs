// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of DynaLease.
//
// DynaLease is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// DynaLease is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with DynaLease. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end lock lifecycle tests over the in-memory store.
//!
//! Expiry and heartbeat scenarios use short real leases; each test works on
//! its own store so they can run in parallel.

use aws_sdk_dynamodb::types::AttributeValue;
use dynalease::{
    AcquireOptions, ClientOptions, CreateTableOptions, HeartbeatOptions, InMemoryLockStore, Item,
    LockClient, LockError, LockStore, ReleaseOptions, TableSchema,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

async fn new_store() -> Arc<InMemoryLockStore> {
    let store = Arc::new(InMemoryLockStore::new());
    store
        .create_table(
            "locks",
            &TableSchema {
                partition_key_name: "key".to_string(),
                sort_key_name: None,
            },
            &CreateTableOptions::default(),
        )
        .await
        .expect("create table");
    store
}

fn client(
    store: &Arc<InMemoryLockStore>,
    owner: &str,
    lease: Duration,
    heartbeat: Duration,
) -> LockClient {
    LockClient::new(
        store.clone(),
        "locks",
        "key",
        ClientOptions::new()
            .with_owner_name(owner)
            .with_lease_duration(lease)
            .with_heartbeat_period(heartbeat),
    )
    .expect("client")
}

fn key_item(key: &str) -> Item {
    let mut item = Item::new();
    item.insert("key".to_string(), AttributeValue::S(key.to_string()));
    item
}

fn s(v: &str) -> AttributeValue {
    AttributeValue::S(v.to_string())
}

#[tokio::test]
async fn fresh_acquisition_writes_the_full_row() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::from_secs(5));

    let lock = a
        .acquire_lock("k", AcquireOptions::new().with_data(vec![0x01]))
        .await
        .expect("acquire");

    assert_eq!(lock.owner_name(), "A");
    assert_eq!(lock.partition_key(), "k");
    assert_eq!(lock.data(), Some(vec![0x01]));
    assert_eq!(lock.lease_duration(), Duration::from_secs(20));
    assert_eq!(lock.record_version_number().len(), 32);
    assert!(!lock.is_expired());

    let row = store.raw_row("locks", &key_item("k")).await.expect("row");
    assert_eq!(row.get("ownerName"), Some(&s("A")));
    assert_eq!(row.get("leaseDuration"), Some(&s("20s")));
    assert_eq!(
        row.get("recordVersionNumber"),
        Some(&s(&lock.record_version_number()))
    );
    assert!(row.get("data").is_some());
    assert!(!row.contains_key("isReleased"));

    a.close().await.expect("close");
}

#[tokio::test]
async fn released_locks_can_be_taken_over() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);

    let lock = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();
    let first_rvn = lock.record_version_number();
    a.release_lock(&lock).await.unwrap();
    assert!(lock.is_released());

    let row = store.raw_row("locks", &key_item("k")).await.expect("row");
    assert_eq!(row.get("isReleased"), Some(&s("1")));

    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);
    let taken = b.acquire_lock("k", AcquireOptions::new()).await.unwrap();
    assert_eq!(taken.owner_name(), "B");
    assert_ne!(taken.record_version_number(), first_rvn);

    let row = store.raw_row("locks", &key_item("k")).await.expect("row");
    assert!(!row.contains_key("isReleased"));
    assert_eq!(row.get("ownerName"), Some(&s("B")));
}

#[tokio::test]
async fn expired_locks_are_taken_over_after_a_full_lease_of_silence() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(1), Duration::ZERO);
    let stale = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();

    // A goes quiet past its own lease.
    sleep(Duration::from_millis(1200)).await;

    let b = client(&store, "B", Duration::from_secs(1), Duration::ZERO);
    let taken = b
        .acquire_lock(
            "k",
            AcquireOptions::new()
                .with_refresh_period(Duration::from_millis(200))
                .with_additional_time_to_wait_for_lock(Duration::from_secs(2)),
        )
        .await
        .expect("takeover");

    assert_eq!(taken.owner_name(), "B");
    assert!(!taken.is_expired());
    assert!(stale.is_expired());

    // A's release loses the ownership CAS but still releases locally.
    let err = a.release_lock(&stale).await.unwrap_err();
    assert!(err.is_condition_failed());
    assert!(stale.is_released());
}

#[tokio::test]
async fn fail_if_locked_returns_within_one_round_trip() {
    let store = new_store().await;
    let a = client(
        &store,
        "A",
        Duration::from_secs(2),
        Duration::from_millis(500),
    );
    let _held = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();

    let b = client(&store, "B", Duration::from_secs(2), Duration::ZERO);
    let started = Instant::now();
    let err = b
        .acquire_lock("k", AcquireOptions::new().with_fail_if_locked())
        .await
        .unwrap_err();

    assert!(err.is_not_granted());
    // No sleep happened: well under the 1s default refresh period.
    assert!(started.elapsed() < Duration::from_millis(500));

    a.close().await.unwrap();
}

#[tokio::test]
async fn session_monitor_fires_exactly_once_in_the_danger_zone() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(2), Duration::ZERO);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_by_callback = fired.clone();
    let lock = a
        .acquire_lock(
            "k",
            AcquireOptions::new().with_session_monitor(Duration::from_millis(1200), move || {
                fired_by_callback.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    // Danger zone opens at lease - safe_time = 800ms.
    assert!(!lock.is_almost_expired().unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    sleep(Duration::from_millis(1100)).await;
    assert!(lock.is_almost_expired().unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Never a second invocation, no matter how long we wait.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_cancels_the_session_monitor() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(2), Duration::ZERO);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_by_callback = fired.clone();
    let lock = a
        .acquire_lock(
            "k",
            AcquireOptions::new().with_session_monitor(Duration::from_millis(1500), move || {
                fired_by_callback.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    a.release_lock(&lock).await.unwrap();
    sleep(Duration::from_millis(1200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn monitor_without_callback_still_allows_polling() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(2), Duration::ZERO);
    let lock = a
        .acquire_lock(
            "k",
            AcquireOptions::new().with_session_monitor_without_callback(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    assert!(!lock.is_almost_expired().unwrap());
    assert!(lock.time_until_danger_zone().unwrap() > Duration::from_millis(1000));
}

#[tokio::test]
async fn heartbeats_keep_contenders_out() {
    let store = new_store().await;
    let a = client(
        &store,
        "A",
        Duration::from_secs(2),
        Duration::from_millis(500),
    );
    let held = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();
    let initial_rvn = held.record_version_number();

    let b = client(&store, "B", Duration::from_secs(2), Duration::ZERO);
    let err = b
        .acquire_lock(
            "k",
            AcquireOptions::new().with_refresh_period(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    // Budget was one default buffer plus one observed lease; the live holder
    // kept changing its RVN the whole time.
    match err {
        LockError::LockNotGranted { cause, .. } => {
            let timeout = cause.expect("timeout cause");
            assert!(timeout.age >= Duration::from_secs(3));
        }
        other => panic!("expected LockNotGranted with timeout, got {other:?}"),
    }

    assert!(!held.is_expired());
    assert_ne!(held.record_version_number(), initial_rvn);

    a.close().await.unwrap();
}

#[tokio::test]
async fn closed_clients_refuse_every_operation() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let lock = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();

    a.close().await.expect("first close");
    assert!(a.is_closed().await);

    assert!(matches!(a.close().await, Err(LockError::ClientClosed)));
    assert!(matches!(
        a.acquire_lock("k2", AcquireOptions::new()).await,
        Err(LockError::ClientClosed)
    ));
    assert!(matches!(a.get_lock("k").await, Err(LockError::ClientClosed)));
    assert!(matches!(
        a.release_lock(&lock).await,
        Err(LockError::ClientClosed)
    ));
    assert!(matches!(
        a.send_heartbeat(&lock).await,
        Err(LockError::ClientClosed)
    ));
    assert!(matches!(
        a.create_table().await,
        Err(LockError::ClientClosed)
    ));
}

#[tokio::test]
async fn close_releases_every_held_lock() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    a.acquire_lock("k1", AcquireOptions::new()).await.unwrap();
    a.acquire_lock("k2", AcquireOptions::new()).await.unwrap();

    a.close().await.unwrap();

    for key in ["k1", "k2"] {
        let row = store.raw_row("locks", &key_item(key)).await.expect("row");
        assert_eq!(row.get("isReleased"), Some(&s("1")), "{key} not released");
    }

    // A successor can claim them immediately.
    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);
    let lock = b.acquire_lock("k1", AcquireOptions::new()).await.unwrap();
    assert_eq!(lock.owner_name(), "B");
}

#[tokio::test]
async fn releasing_someone_elses_lock_is_refused() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);
    a.acquire_lock("k", AcquireOptions::new()).await.unwrap();

    let view = b.get_lock("k").await.unwrap();
    assert_eq!(view.owner_name(), "A");
    assert!(matches!(
        b.release_lock(&view).await,
        Err(LockError::OwnerMismatched)
    ));

    let empty = b.get_lock("missing").await.unwrap();
    assert!(empty.is_empty());
    assert!(matches!(
        b.release_lock(&empty).await,
        Err(LockError::CannotReleaseNullLock)
    ));
}

#[tokio::test]
async fn get_lock_returns_held_handles_and_expired_views() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);

    let held = a
        .acquire_lock("k", AcquireOptions::new().with_data(vec![7]))
        .await
        .unwrap();

    // The holder gets its live handle back.
    let mine = a.get_lock("k").await.unwrap();
    assert_eq!(mine.record_version_number(), held.record_version_number());
    assert!(!mine.is_expired());

    // An observer gets a read-only view that can never pass for a lease.
    let view = b.get_lock("k").await.unwrap();
    assert_eq!(view.owner_name(), "A");
    assert_eq!(view.data(), Some(vec![7]));
    assert_eq!(view.record_version_number(), "");
    assert!(view.is_expired());

    // Absent rows come back as empty handles, not errors.
    let missing = b.get_lock("missing").await.unwrap();
    assert!(missing.is_empty());
    assert!(missing.is_expired());
}

#[tokio::test]
async fn payload_is_preserved_unless_replaced() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let first = a
        .acquire_lock("k", AcquireOptions::new().with_data(b"X".to_vec()))
        .await
        .unwrap();
    a.release_lock(&first).await.unwrap();

    // Without replace_data the row's payload wins over the caller's.
    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);
    let second = b
        .acquire_lock("k", AcquireOptions::new().with_data(b"Y".to_vec()))
        .await
        .unwrap();
    assert_eq!(second.data(), Some(b"X".to_vec()));
    b.release_lock(&second).await.unwrap();

    // replace_data forces the caller's bytes.
    let c = client(&store, "C", Duration::from_secs(20), Duration::ZERO);
    let third = c
        .acquire_lock(
            "k",
            AcquireOptions::new()
                .with_data(b"Z".to_vec())
                .with_replace_data(),
        )
        .await
        .unwrap();
    assert_eq!(third.data(), Some(b"Z".to_vec()));
}

#[tokio::test]
async fn release_can_delete_the_row_or_store_final_data() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);

    let lock = a
        .acquire_lock("k", AcquireOptions::new().with_delete_lock_on_release())
        .await
        .unwrap();
    a.release_lock(&lock).await.unwrap();
    assert!(store.raw_row("locks", &key_item("k")).await.is_none());

    let lock = a.acquire_lock("k", AcquireOptions::new()).await.unwrap();
    a.release_lock_with_options(
        &lock,
        ReleaseOptions::new().with_data(b"handoff".to_vec()),
    )
    .await
    .unwrap();
    let row = store.raw_row("locks", &key_item("k")).await.expect("row");
    assert_eq!(row.get("isReleased"), Some(&s("1")));
    assert!(row.contains_key("data"));
}

#[tokio::test]
async fn reserved_attribute_names_are_rejected() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);

    for reserved in ["key", "ownerName", "leaseDuration", "recordVersionNumber", "data"] {
        let err = a
            .acquire_lock(
                "k",
                AcquireOptions::new().with_additional_attribute(reserved, s("boom")),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, LockError::ReservedAttribute(ref name) if name.as_str() == reserved),
            "{reserved} should be rejected"
        );
    }
}

#[tokio::test]
async fn additional_attributes_merge_with_caller_overlay_winning() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let lock = a
        .acquire_lock(
            "k",
            AcquireOptions::new()
                .with_additional_attribute("purpose", s("leader"))
                .with_additional_attribute("region", s("us-east-1")),
        )
        .await
        .unwrap();
    assert_eq!(lock.additional_attributes().get("purpose"), Some(&s("leader")));
    a.release_lock(&lock).await.unwrap();

    // Existing row attributes survive; the caller's overlay wins collisions.
    let b = client(&store, "B", Duration::from_secs(20), Duration::ZERO);
    let lock = b
        .acquire_lock(
            "k",
            AcquireOptions::new().with_additional_attribute("purpose", s("backup")),
        )
        .await
        .unwrap();
    let attrs = lock.additional_attributes();
    assert_eq!(attrs.get("purpose"), Some(&s("backup")));
    assert_eq!(attrs.get("region"), Some(&s("us-east-1")));
}

#[tokio::test]
async fn manual_heartbeats_rotate_the_version_and_manage_data() {
    let store = new_store().await;
    let a = client(&store, "A", Duration::from_secs(20), Duration::ZERO);
    let lock = a
        .acquire_lock("k", AcquireOptions::new().with_data(b"X".to_vec()))
        .await
        .unwrap();
    let first_rvn = lock.record_version_number();

    a.send_heartbeat(&lock).await.unwrap();
    assert_ne!(lock.record_version_number(), first_rvn);
    assert_eq!(lock.data(), Some(b"X".to_vec()));

    a.send_heartbeat_with_options(&lock, HeartbeatOptions::new().with_data(b"Y".to_vec()))
        .await
        .unwrap();
    assert_eq!(lock.data(), Some(b"Y".to_vec()));

    a.send_heartbeat_with_options(&lock, HeartbeatOptions::new().with_delete_data())
        .await
        .unwrap();
    assert_eq!(lock.data(), None);
    let row = store.raw_row("locks", &key_item("k")).await.expect("row");
    assert!(!row.contains_key("data"));

    let err = a
        .send_heartbeat_with_options(
            &lock,
            HeartbeatOptions::new().with_data(b"Z".to_vec()).with_delete_data(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Config(_)));

    a.release_lock(&lock).await.unwrap();
    let err = a.send_heartbeat(&lock).await.unwrap_err();
    assert!(err.is_not_granted());
}

#[tokio::test]
async fn sort_key_tables_keep_rows_independent() {
    let store = Arc::new(InMemoryLockStore::new());
    let options = ClientOptions::new()
        .with_owner_name("A")
        .with_lease_duration(Duration::from_secs(20))
        .with_heartbeat_period(Duration::ZERO);
    let a = LockClient::new_with_sort_key(store.clone(), "locks", "key", "rangeKey", options)
        .expect("client");
    a.create_table().await.expect("create table");

    let first = a
        .acquire_lock(("host", "replica-1"), AcquireOptions::new())
        .await
        .unwrap();
    let second = a
        .acquire_lock(("host", "replica-2"), AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(first.sort_key(), Some("replica-1"));
    assert_eq!(second.sort_key(), Some("replica-2"));
    assert_eq!(store.row_count("locks").await, 2);

    // A partition-only key cannot address a composite table.
    let err = a.acquire_lock("host", AcquireOptions::new()).await.unwrap_err();
    assert!(matches!(err, LockError::InvalidKey(_)));

    let view = a.get_lock(("host", "replica-1")).await.unwrap();
    assert_eq!(view.record_version_number(), first.record_version_number());
}

#[tokio::test]
async fn concurrent_contenders_elect_exactly_one_winner() {
    let store = new_store().await;
    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let contender = client(
                &store,
                &format!("node-{i}"),
                Duration::from_secs(20),
                Duration::ZERO,
            );
            contender
                .acquire_lock("k", AcquireOptions::new().with_fail_if_locked())
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join").is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
