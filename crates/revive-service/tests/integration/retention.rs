use std::time::Duration;

use revive_service::cell::ValueSource;
use revive_service::config::{Config, RetentionConfig};
use revive_test::{self as test, CountingRecovery, RecordingSave};
use tokio_util::sync::CancellationToken;

fn retaining_services(time_to_idle: Option<Duration>) -> revive_service::services::CellServices {
    test::services_with(Config {
        retention: RetentionConfig {
            capacity: 1024 * 1024,
            time_to_idle,
            time_to_live: None,
        },
        ..Config::default()
    })
}

#[tokio::test]
async fn test_retained_value_survives_its_callers() {
    test::setup();
    let services = retaining_services(None);

    let recovery = CountingRecovery::new(vec![1u8, 2, 3]);
    let cell = services.cell(recovery.clone());
    let cancel = CancellationToken::new();

    drop(cell.get_async(&cancel).await.unwrap());
    assert_eq!(cell.try_get().as_deref(), Some(&vec![1, 2, 3]));
    assert_eq!(recovery.calls(), 1);

    services.retainer.evict(cell.id());
    assert_eq!(cell.try_get(), None);

    cell.get_async(&cancel).await.unwrap();
    assert_eq!(recovery.calls(), 2);
}

#[tokio::test]
async fn test_recovery_is_idempotent_across_collections() {
    test::setup();
    let services = retaining_services(None);

    let recovery = CountingRecovery::new(String::from("stable"));
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    let first = cell.get_async(&cancel).await.unwrap();
    assert!(cell.wait_saved().await);
    drop(first);

    for collection in 1..=3 {
        services.retainer.evict_all();
        assert_eq!(cell.try_get(), None);

        let value = if collection % 2 == 0 {
            cell.get(&cancel).unwrap()
        } else {
            cell.get_async(&cancel).await.unwrap()
        };
        assert_eq!(*value, "stable");
        assert_eq!(save.saved_recoveries(), collection);
    }

    assert_eq!(recovery.calls(), 1);
    assert_eq!(save.saves(), 1);
}

#[tokio::test]
async fn test_idle_values_are_reclaimed() {
    test::setup();
    let services = retaining_services(Some(Duration::from_millis(50)));

    let recovery = CountingRecovery::new(9u64);
    let cell = services.cell(recovery.clone());

    drop(cell.get_async(&CancellationToken::new()).await.unwrap());
    assert!(cell.try_get().is_some());

    // idle expiration runs on the retainer's own clock
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(services.retainer.retained_count(), 0);
    assert_eq!(cell.try_get(), None);
}

#[tokio::test]
async fn test_derived_cell_recovers_from_saved_lineage() {
    test::setup();
    let services = retaining_services(None);

    let recovery = CountingRecovery::new(100i32);
    let save = RecordingSave::new();
    let cell = services.saving_cell(recovery.clone(), save.clone());
    let cancel = CancellationToken::new();

    assert!(cell.derive().is_none());

    cell.get_async(&cancel).await.unwrap();
    assert!(cell.wait_saved().await);

    let derived = cell.derive().unwrap();
    assert!(derived.is_saved());
    assert_eq!(derived.try_get().as_deref(), Some(&100));

    services.retainer.evict_all();
    assert_eq!(*derived.get_async(&cancel).await.unwrap(), 100);

    assert_eq!(recovery.calls(), 1);
    assert_eq!(save.saved_recoveries(), 1);
    // derived cells never save on their own
    assert!(derived.wait_saved().await);
    assert_eq!(save.saves(), 1);
}

#[tokio::test]
async fn test_dropping_a_cell_releases_its_value() {
    test::setup();
    let services = retaining_services(None);

    let cell = services.cell(CountingRecovery::new(1u32));
    let value = cell.get_async(&CancellationToken::new()).await.unwrap();
    let weak = std::sync::Arc::downgrade(&value);
    drop(value);
    assert_eq!(services.retainer.retained_count(), 1);

    drop(cell);
    assert_eq!(services.retainer.retained_count(), 0);
    assert!(weak.upgrade().is_none());
}
