use std::collections::HashMap;
use std::time::Duration;

use docfeed_db::{DbRuntimeSettings, NotifySettings, SqliteStore, StoreSettings};
use docfeed_stream::{Cursor, CursorState, Feed, Filter, Predicate, Row, RowId, StreamError, StreamSettings, TableName};
use docfeed_types::Notification;
use futures_util::StreamExt;
use serde_json::json;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn open_store(dir: &TempDir, settings: StoreSettings) -> SqliteStore {
    let path = dir.path().join("docfeed.db");
    let store = SqliteStore::open(path.to_str().unwrap(), settings).expect("failed to open store");
    store.provision_table(&events(), &["v".to_string()]).expect("failed to provision table");
    store
}

fn setup(settings: StreamSettings) -> (TempDir, Feed) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = open_store(&dir, StoreSettings::default());
    (dir, Feed::with_settings(store, settings))
}

fn events() -> TableName {
    TableName::new("events").unwrap()
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|row| row.id.get()).collect()
}

async fn next_row(cursor: &mut Cursor) -> Option<Row> {
    tokio::time::timeout(WAIT, cursor.recv()).await.expect("timed out waiting for cursor")
}

async fn drain(cursor: &mut Cursor) -> Vec<Row> {
    let mut rows = Vec::new();
    while let Some(row) = next_row(cursor).await {
        rows.push(row);
    }
    rows
}

async fn take(cursor: &mut Cursor, n: usize) -> Vec<Row> {
    let mut rows = Vec::with_capacity(n);
    while rows.len() < n {
        match next_row(cursor).await {
            Some(row) => rows.push(row),
            None => panic!("cursor closed after {} of {n} rows: {:?}", rows.len(), cursor.err()),
        }
    }
    rows
}

fn subscribers(feed: &Feed) -> usize {
    let channel = feed.store().channel(&events()).unwrap();
    feed.store().hub().subscriber_count(channel.as_str())
}

async fn wait_for_subscribers(feed: &Feed, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while subscribers(feed) != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn one_shot_replays_matching_history_in_order() {
    let (_dir, feed) = setup(StreamSettings::default());
    for v in 1..=3 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let mut cursor = feed.get(&events(), Filter::new(Predicate::gte("v", 2)));
    let rows = drain(&mut cursor).await;

    assert_eq!(ids(&rows), vec![2, 3]);
    assert_eq!(rows[0].data, json!({ "v": 2 }));
    assert!(cursor.err().is_none());
    assert_eq!(cursor.state(), CursorState::Closed);
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn one_shot_on_empty_table_closes_immediately() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default());
    assert!(next_row(&mut cursor).await.is_none());
    assert!(cursor.err().is_none());
}

#[tokio::test]
async fn offset_applies_once_across_pages() {
    let (_dir, feed) = setup(StreamSettings {
        page_size: 2,
        ..StreamSettings::default()
    });
    for v in 1..=7 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let mut cursor = feed.get(&events(), Filter::default().with_offset(3));
    let rows = drain(&mut cursor).await;

    assert_eq!(ids(&rows), vec![4, 5, 6, 7]);
    assert!(cursor.err().is_none());
}

#[tokio::test]
async fn offset_past_the_end_yields_nothing() {
    let (_dir, feed) = setup(StreamSettings::default());
    feed.add(&events(), &json!({ "v": 1 })).await.unwrap();

    let mut cursor = feed.get(&events(), Filter::default().with_offset(5));
    assert!(drain(&mut cursor).await.is_empty());
    assert!(cursor.err().is_none());
}

#[tokio::test]
async fn cursor_is_a_stream() {
    let (_dir, feed) = setup(StreamSettings::default());
    for v in 1..=4 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let cursor = feed.get(&events(), Filter::new(Predicate::lt("v", 3)));
    let rows: Vec<Row> = tokio::time::timeout(WAIT, cursor.collect()).await.unwrap();
    assert_eq!(ids(&rows), vec![1, 2]);
}

#[tokio::test]
async fn live_tail_delivers_history_then_new_rows() {
    let (_dir, feed) = setup(StreamSettings::default());
    feed.add(&events(), &json!({ "v": 1 })).await.unwrap();

    let mut cursor = feed.get(&events(), Filter::default().live());
    let first = take(&mut cursor, 1).await;
    assert_eq!(ids(&first), vec![1]);

    feed.add(&events(), &json!({ "v": 2 })).await.unwrap();
    feed.add(&events(), &json!({ "v": 3 })).await.unwrap();

    let live = take(&mut cursor, 2).await;
    assert_eq!(ids(&live), vec![2, 3]);
    assert_eq!(live[1].data, json!({ "v": 3 }));
    assert_eq!(cursor.state(), CursorState::Draining);

    cursor.close();
    assert!(next_row(&mut cursor).await.is_none());
    assert!(cursor.err().is_none());
}

#[tokio::test]
async fn live_tail_rechecks_the_filter() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::new(Predicate::gt("v", 10)).live());
    wait_for_subscribers(&feed, 1).await;

    feed.add(&events(), &json!({ "v": 5 })).await.unwrap();
    feed.add(&events(), &json!({ "v": 20 })).await.unwrap();
    feed.add(&events(), &json!({ "w": 99 })).await.unwrap();
    feed.add(&events(), &json!({ "v": 11 })).await.unwrap();

    let rows = take(&mut cursor, 2).await;
    assert_eq!(ids(&rows), vec![2, 4]);
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn every_insert_is_delivered_exactly_once() {
    let (_dir, feed) = setup(StreamSettings {
        page_size: 7,
        ..StreamSettings::default()
    });
    for v in 0..40 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let mut cursor = feed.get(&events(), Filter::default().live());

    let writer = {
        let feed = feed.clone();
        tokio::spawn(async move {
            for v in 40..100 {
                feed.add(&events(), &json!({ "v": v })).await.unwrap();
            }
        })
    };

    let rows = take(&mut cursor, 100).await;
    writer.await.unwrap();

    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(ids(&rows), expected, "rows must be complete, unique, and ordered");
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_do_not_lose_rows() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let feed = feed.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    feed.add(&events(), &json!({ "writer": w, "i": i })).await.unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let rows = take(&mut cursor, 100).await;
    let seen = ids(&rows);
    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(seen, expected, "live rows arrive in commit order");
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sustained_writer_is_streamed_while_the_consumer_reads() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    let writer = {
        let feed = feed.clone();
        tokio::spawn(async move {
            for v in 0..3000 {
                feed.add(&events(), &json!({ "v": v })).await.unwrap();
            }
        })
    };

    let rows = take(&mut cursor, 3000).await;
    writer.await.unwrap();

    let expected: Vec<i64> = (1..=3000).collect();
    assert_eq!(ids(&rows), expected);
    assert!(cursor.err().is_none());
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn recheck_is_not_blocked_by_an_unrelated_write_transaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(
        &dir,
        StoreSettings {
            db: DbRuntimeSettings {
                busy_timeout_ms: 300,
                ..DbRuntimeSettings::default()
            },
            ..StoreSettings::default()
        },
    );
    let feed = Feed::new(store);
    let id = feed.add(&events(), &json!({ "v": 1 })).await.unwrap();

    // The offset hides the row from the backfill, so only the re-check can
    // deliver it.
    let mut cursor = feed.get(&events(), Filter::default().with_offset(1).live());
    wait_for_subscribers(&feed, 1).await;

    let writer = feed.store().pool().get().unwrap();
    writer.execute_batch("BEGIN IMMEDIATE").unwrap();

    let channel = feed.store().channel(&events()).unwrap();
    feed.store().hub().publish(Notification {
        channel: channel.as_str().to_string(),
        payload: id.to_string(),
    });

    let row = tokio::time::timeout(Duration::from_secs(1), cursor.recv())
        .await
        .expect("re-check waited on the open writer")
        .expect("row should be delivered");
    assert_eq!(row.id, id);
    assert!(cursor.err().is_none());

    writer.execute_batch("ROLLBACK").unwrap();
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn close_is_idempotent_and_safe_from_many_tasks() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let closer = cursor.closer();
            tokio::spawn(async move { closer.close() })
        })
        .collect();
    cursor.close();
    for closer in closers {
        closer.await.unwrap();
    }
    cursor.close();

    assert!(next_row(&mut cursor).await.is_none());
    assert!(cursor.err().is_none());
    cursor.shutdown().await.expect("closing is not an error");
    assert_eq!(subscribers(&feed), 0);
}

#[tokio::test]
async fn close_unblocks_a_full_output_queue() {
    let (_dir, feed) = setup(StreamSettings {
        output_capacity: 1,
        backlog_capacity: 1,
        page_size: 2,
        ..StreamSettings::default()
    });
    for v in 0..10 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;
    for v in 10..15 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    tokio::time::timeout(WAIT, cursor.shutdown())
        .await
        .expect("shutdown must not wait on the consumer")
        .expect("clean shutdown");
    assert_eq!(subscribers(&feed), 0);
}

#[tokio::test]
async fn dropping_the_cursor_releases_the_subscription() {
    let (_dir, feed) = setup(StreamSettings::default());
    let cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    drop(cursor);
    wait_for_subscribers(&feed, 0).await;
}

#[tokio::test]
async fn missing_table_ends_the_stream_with_a_store_error() {
    let (_dir, feed) = setup(StreamSettings::default());
    let ghost = TableName::new("ghost").unwrap();

    let mut cursor = feed.get(&ghost, Filter::default());
    assert!(next_row(&mut cursor).await.is_none());
    assert!(matches!(cursor.err(), Some(StreamError::Store(_))));
}

#[tokio::test]
async fn history_failure_cancels_the_listener() {
    let (_dir, feed) = setup(StreamSettings::default());
    let ghost = TableName::new("ghost").unwrap();

    let mut cursor = feed.get(&ghost, Filter::default().live());
    assert!(next_row(&mut cursor).await.is_none());

    let err = tokio::time::timeout(WAIT, cursor.shutdown())
        .await
        .expect("listener must stop after the history task fails")
        .expect_err("store error should be reported");
    assert!(matches!(err, StreamError::Store(_)));

    let channel = feed.store().channel(&ghost).unwrap();
    assert_eq!(feed.store().hub().subscriber_count(channel.as_str()), 0);
}

#[tokio::test]
async fn malformed_notification_is_terminal() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    let channel = feed.store().channel(&events()).unwrap();
    feed.store().hub().publish(Notification {
        channel: channel.as_str().to_string(),
        payload: "not-a-row".to_string(),
    });

    assert!(next_row(&mut cursor).await.is_none());
    match cursor.err() {
        Some(StreamError::MalformedNotification { payload, .. }) => assert_eq!(payload, "not-a-row"),
        other => panic!("expected malformed notification error, got {other:?}"),
    }
    assert_eq!(cursor.state(), CursorState::Closed);
}

#[tokio::test]
async fn notification_for_an_unknown_row_is_ignored() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    let channel = feed.store().channel(&events()).unwrap();
    feed.store().hub().publish(Notification {
        channel: channel.as_str().to_string(),
        payload: "4242".to_string(),
    });
    feed.add(&events(), &json!({ "v": 1 })).await.unwrap();

    let rows = take(&mut cursor, 1).await;
    assert_eq!(rows[0].id, RowId(1));
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn lagging_subscription_recovers_missed_rows() {
    let dir = TempDir::new().unwrap();
    let store = open_store(
        &dir,
        StoreSettings {
            notify: NotifySettings { channel_capacity: 4 },
            ..StoreSettings::default()
        },
    );
    let feed = Feed::with_settings(
        store,
        StreamSettings {
            page_size: 3,
            ..StreamSettings::default()
        },
    );
    let mut cursor = feed.get(&events(), Filter::new(Predicate::gte("v", 5)).live());
    wait_for_subscribers(&feed, 1).await;

    // The current-thread runtime cannot run the listener until this loop
    // yields, so the channel overflows.
    for v in 0..20 {
        feed.store().insert(&events(), &json!({ "v": v })).unwrap();
    }

    let rows = take(&mut cursor, 15).await;
    let expected: Vec<i64> = (6..=20).collect();
    assert_eq!(ids(&rows), expected);
    assert!(cursor.err().is_none());

    let next = feed.add(&events(), &json!({ "v": 99 })).await.unwrap();
    assert_eq!(next_row(&mut cursor).await.map(|row| row.id), Some(next));
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_consumer_recovers_after_thousands_of_inserts() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    // Nobody reads while these commit, so the output, the backlog, and the
    // notification channel all fill up.
    for v in 0..4000 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }

    let rows = take(&mut cursor, 4000).await;
    let expected: Vec<i64> = (1..=4000).collect();
    assert_eq!(ids(&rows), expected);
    assert!(cursor.err().is_none());
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn idle_live_cursor_survives_keepalive_pings() {
    let (_dir, feed) = setup(StreamSettings {
        keepalive: Duration::from_millis(10),
        ..StreamSettings::default()
    });
    let mut cursor = feed.get(&events(), Filter::default().live());
    wait_for_subscribers(&feed, 1).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    feed.add(&events(), &json!({ "v": 1 })).await.unwrap();

    let rows = take(&mut cursor, 1).await;
    assert_eq!(ids(&rows), vec![1]);
    assert!(cursor.err().is_none());
    cursor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn add_rejects_documents_that_are_not_json() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut doc = HashMap::new();
    doc.insert((1, 2), "tuple keys cannot be JSON object keys");

    let err = feed.add(&events(), &doc).await.expect_err("serialization should fail");
    assert!(matches!(err, StreamError::Serialization(_)));
}

#[tokio::test]
async fn add_to_missing_table_is_a_store_error() {
    let (_dir, feed) = setup(StreamSettings::default());
    let err = feed
        .add(&TableName::new("ghost").unwrap(), &json!({ "v": 1 }))
        .await
        .expect_err("insert should fail");
    assert!(matches!(err, StreamError::Store(_)));
}

#[tokio::test]
async fn repeated_one_shot_reads_are_stable_and_see_new_rows() {
    let (_dir, feed) = setup(StreamSettings::default());
    for v in 1..=5 {
        feed.add(&events(), &json!({ "v": v })).await.unwrap();
    }
    let filter = Filter::new(Predicate::gte("v", 2));

    let first = drain(&mut feed.get(&events(), filter.clone())).await;
    let second = drain(&mut feed.get(&events(), filter.clone())).await;
    assert_eq!(ids(&first), vec![2, 3, 4, 5]);
    assert_eq!(first, second);

    feed.add(&events(), &json!({ "v": 6 })).await.unwrap();
    let third = drain(&mut feed.get(&events(), filter)).await;
    assert_eq!(ids(&third), vec![2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn live_tail_on_empty_table_delivers_only_matches() {
    let (_dir, feed) = setup(StreamSettings::default());
    let mut cursor = feed.get(&events(), Filter::new(Predicate::gt("v", 3)).live());
    wait_for_subscribers(&feed, 1).await;

    let idle = tokio::time::timeout(Duration::from_millis(50), cursor.recv()).await;
    assert!(idle.is_err(), "no rows expected before any insert");

    feed.add(&events(), &json!({ "v": 1 })).await.unwrap();
    let ten = feed.add(&events(), &json!({ "v": 10 })).await.unwrap();

    let row = next_row(&mut cursor).await.expect("row with v=10");
    assert_eq!(row.id, ten);
    assert_eq!(row.data, json!({ "v": 10 }));

    cursor.close();
    assert!(next_row(&mut cursor).await.is_none());
    assert!(cursor.err().is_none());
}
