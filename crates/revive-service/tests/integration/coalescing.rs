use std::sync::Arc;
use std::time::Duration;

use revive_service::cell::ValueSource;
use revive_test::{self as test, CountingRecovery, RecordingSave};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_blocking_gets_recover_once() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(42u32).with_delay(Duration::from_millis(50));
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());

    let gets: Vec<_> = (0..8)
        .map(|_| {
            let cell = cell.clone();
            tokio::task::spawn_blocking(move || cell.get(&CancellationToken::new()))
        })
        .collect();

    let mut values = Vec::new();
    for get in gets {
        values.push(get.await.unwrap().unwrap());
    }

    assert_eq!(recovery.calls(), 1);
    assert!(values.iter().all(|value| **value == 42));
    assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));

    assert!(cell.wait_saved().await);
    assert_eq!(save.saved(), vec![42]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_and_async_callers_share_one_recovery() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(String::from("shared")).with_delay(Duration::from_millis(50));
    let cell = services.cell(recovery.clone());

    let mut blocking = Vec::new();
    let mut suspended = Vec::new();
    for _ in 0..4 {
        let blocking_cell = cell.clone();
        blocking.push(tokio::task::spawn_blocking(move || {
            blocking_cell.get(&CancellationToken::new())
        }));
        let async_cell = cell.clone();
        suspended.push(tokio::spawn(async move {
            async_cell.get_async(&CancellationToken::new()).await
        }));
    }

    let mut values = Vec::new();
    for get in blocking {
        values.push(get.await.unwrap().unwrap());
    }
    for get in suspended {
        values.push(get.await.unwrap().unwrap());
    }

    assert_eq!(recovery.calls(), 1);
    assert_eq!(values.len(), 8);
    assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
}

#[tokio::test]
async fn test_live_value_is_never_recovered() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(7u64);
    let cell = services.cell(recovery.clone());
    let cancel = CancellationToken::new();

    let value = cell.get_async(&cancel).await.unwrap();
    for _ in 0..100 {
        assert!(Arc::ptr_eq(&cell.try_get().unwrap(), &value));
        assert!(Arc::ptr_eq(&cell.get(&cancel).unwrap(), &value));
        assert!(Arc::ptr_eq(&cell.get_async(&cancel).await.unwrap(), &value));
    }

    assert_eq!(recovery.calls(), 1);
}

#[tokio::test]
async fn test_try_get_never_recovers() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(1u8);
    let cell = services.cell(recovery.clone());

    assert_eq!(cell.try_get(), None);
    assert_eq!(cell.try_get(), None);
    assert_eq!(recovery.calls(), 0);
}
