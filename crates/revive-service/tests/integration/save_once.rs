use std::sync::{Arc, Mutex};
use std::time::Duration;

use revive_service::cell::{SaveState, ValueSource, save_fn};
use revive_test::{self as test, CountingRecovery, RecordingSave};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_saves_at_most_once_per_lineage() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(42u32);
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    assert_eq!(*cell.get_async(&cancel).await.unwrap(), 42);
    assert_eq!(cell.save_state(), SaveState::Saving);
    assert!(cell.wait_saved().await);

    // nothing retains the value, every access recovers from the saved copy
    for round in 1..=3 {
        assert_eq!(*cell.get_async(&cancel).await.unwrap(), 42);
        assert!(cell.wait_saved().await);
        assert_eq!(save.saved_recoveries(), round);
    }

    assert_eq!(recovery.calls(), 1);
    assert_eq!(save.saves(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_saves_complete_in_submission_order() {
    test::setup();
    let services = test::services();
    let log = Arc::new(Mutex::new(Vec::new()));

    let recording_save = |label: &'static str, delay: Duration| {
        let log = Arc::clone(&log);
        save_fn(move |value: Arc<u32>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{label}:start"));
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push(format!("{label}:end"));
                Ok(CountingRecovery::new(*value))
            }
        })
    };

    let slow = services.saving_cell(
        CountingRecovery::new(1u32),
        recording_save("slow", Duration::from_millis(100)),
    );
    let fast = services.saving_cell(
        CountingRecovery::new(2u32),
        recording_save("fast", Duration::ZERO),
    );
    let cancel = CancellationToken::new();

    slow.get_async(&cancel).await.unwrap();
    fast.get_async(&cancel).await.unwrap();

    assert!(fast.wait_saved().await);
    assert!(slow.wait_saved().await);

    assert_eq!(
        *log.lock().unwrap(),
        vec!["slow:start", "slow:end", "fast:start", "fast:end"]
    );
}

#[tokio::test]
async fn test_failed_save_is_retried() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(8u8);
    let save = RecordingSave::new().failing(1);
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    cell.get_async(&cancel).await.unwrap();
    assert!(!cell.wait_saved().await);
    assert_eq!(cell.save_state(), SaveState::Unsaved);
    assert!(cell.derive().is_none());

    // the value is gone, so the next access recovers it and saves again
    cell.get_async(&cancel).await.unwrap();
    assert!(cell.wait_saved().await);

    assert_eq!(recovery.calls(), 2);
    assert_eq!(save.saves(), 1);
}

#[tokio::test]
async fn test_failed_recovery_keeps_lineage_unsaved() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(3u8).failing(2);
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    assert!(cell.get_async(&cancel).await.is_err());
    assert!(cell.get(&cancel).is_err());
    assert_eq!(cell.save_state(), SaveState::Unsaved);

    assert_eq!(*cell.get_async(&cancel).await.unwrap(), 3);
    assert!(cell.wait_saved().await);
    assert_eq!(recovery.calls(), 3);
    assert_eq!(save.saved(), vec![3]);
}

#[tokio::test]
async fn test_initial_value_is_saved_then_released() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(0u64);
    let save = RecordingSave::new();
    let cell = services
        .builder(recovery.clone())
        .save(save.clone())
        .initial_value(Arc::new(77))
        .build();

    assert!(cell.wait_saved().await);
    assert_eq!(save.saved(), vec![77]);
    assert_eq!(cell.try_get(), None);

    assert_eq!(*cell.get_async(&CancellationToken::new()).await.unwrap(), 77);
    assert_eq!(recovery.calls(), 0);
    assert_eq!(save.saved_recoveries(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_saved_instance_lives_until_save_completes() {
    test::setup();
    let services = test::services();

    let recovery = CountingRecovery::new(21u32);
    let save = RecordingSave::new().with_delay(Duration::from_millis(100));
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    drop(cell.get_async(&cancel).await.unwrap());

    // nothing retains the value, only the pending save keeps it alive
    assert_eq!(cell.save_state(), SaveState::Saving);
    assert_eq!(cell.try_get().as_deref(), Some(&21));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cell.save_state(), SaveState::Saving);
    assert!(cell.try_get().is_some());

    assert!(cell.wait_saved().await);
    assert_eq!(cell.try_get(), None);
    assert_eq!(save.saved(), vec![21]);
    assert_eq!(recovery.calls(), 1);
}
