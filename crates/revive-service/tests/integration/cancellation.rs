use std::sync::Arc;
use std::time::Duration;

use revive_service::cell::{SaveState, ValueError, ValueSource};
use revive_service::config::{CellConfig, Config, RetentionConfig};
use revive_test::{self as test, CountingRecovery, RecordingSave};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_waiter_does_not_block_others() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(3u32).with_delay(Duration::from_millis(200));
    let cell = services.cell(recovery.clone());

    let leader = {
        let cell = cell.clone();
        tokio::spawn(async move { cell.get_async(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel_a = CancellationToken::new();
    let waiter_a = {
        let cell = cell.clone();
        let cancel_a = cancel_a.clone();
        tokio::spawn(async move { cell.get_async(&cancel_a).await })
    };
    let waiter_b = {
        let cell = cell.clone();
        tokio::spawn(async move { cell.get_async(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancel_a.cancel();
    assert_eq!(waiter_a.await.unwrap(), Err(ValueError::Cancelled));

    let leader = leader.await.unwrap().unwrap();
    let waiter_b = waiter_b.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&leader, &waiter_b));
    assert_eq!(recovery.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_recovery_leaves_cell_usable() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(11u64).with_delay(Duration::from_millis(100));
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());

    let cancel = CancellationToken::new();
    let cancelled = {
        let cell = cell.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cell.get_async(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    assert_eq!(cancelled.await.unwrap(), Err(ValueError::Cancelled));
    assert_eq!(cell.save_state(), SaveState::Unsaved);
    assert_eq!(cell.try_get(), None);

    let value = cell.get_async(&CancellationToken::new()).await.unwrap();
    assert_eq!(*value, 11);
    assert_eq!(recovery.calls(), 2);

    assert!(cell.wait_saved().await);
    assert_eq!(save.saves(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_get_times_out() {
    test::setup();
    let services = test::services_with(Config {
        retention: RetentionConfig {
            capacity: 0,
            ..RetentionConfig::default()
        },
        cells: CellConfig {
            lock_timeout: Some(Duration::from_millis(20)),
        },
        ..Config::default()
    });

    let recovery = CountingRecovery::new(0u8).with_delay(Duration::from_millis(300));
    let cell = services.cell(recovery.clone());

    let leader = {
        let cell = cell.clone();
        tokio::spawn(async move { cell.get_async(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let blocked = {
        let cell = cell.clone();
        tokio::task::spawn_blocking(move || cell.get(&CancellationToken::new()))
    };
    assert_eq!(
        blocked.await.unwrap(),
        Err(ValueError::TimedOut(Duration::from_millis(20)))
    );

    assert!(leader.await.unwrap().is_ok());
    assert_eq!(recovery.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_waiter_cancelled_from_another_thread() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(5u16).with_delay(Duration::from_millis(200));
    let cell = services.cell(recovery.clone());

    let leader = {
        let cell = cell.clone();
        tokio::spawn(async move { cell.get_async(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    let blocked = {
        let cell = cell.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || cell.get(&cancel))
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    assert_eq!(blocked.await.unwrap(), Err(ValueError::Cancelled));
    assert_eq!(*leader.await.unwrap().unwrap(), 5);
}
