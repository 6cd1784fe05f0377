mod common;

use clearing_house_connector::{
    accounts::{
        AccountDecoder, AccountSubscriber, BulkAccountLoader, BulkAccountLoaderHandle,
        ListenerId, PollingAccountSubscriber, SubscriberEvent,
    },
    error::{ConnectorError, DecodeError},
};
use common::{manual_config, MockAccountReader};
use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio_stream::StreamExt;

fn counter_decoder() -> Arc<dyn AccountDecoder<u64>> {
    Arc::new(|data: &[u8]| -> Result<u64, DecodeError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| DecodeError::TooShort {
            expected: 8,
            actual: data.len(),
        })?;
        Ok(u64::from_le_bytes(bytes))
    })
}

fn setup() -> (Arc<MockAccountReader>, BulkAccountLoaderHandle) {
    let reader = MockAccountReader::new();
    let loader = BulkAccountLoader::spawn(Arc::new(manual_config()), reader.clone());
    (reader, loader)
}

fn subscriber(
    reader: &Arc<MockAccountReader>,
    loader: &BulkAccountLoaderHandle,
) -> PollingAccountSubscriber<u64> {
    PollingAccountSubscriber::new(&manual_config(), loader.clone(), reader.clone())
}

fn latest_value(subscriber: &PollingAccountSubscriber<u64>) -> Option<u64> {
    subscriber.get_latest().unwrap().map(|value| *value.data)
}

fn count_events(subscriber: &PollingAccountSubscriber<u64>) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = count.clone();
    subscriber.on_change(Box::new(move |_: &SubscriberEvent<u64>| {
        sink.fetch_add(1, Ordering::SeqCst);
    }));
    count
}

#[tokio::test]
async fn test_subscribe_populates_cache_before_first_tick() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 7u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();

    assert_eq!(latest_value(&subscriber), Some(7));
    assert_eq!(reader.read_many_calls(), 0);
    assert_eq!(loader.ref_count(address).await.unwrap(), 1);
}

#[tokio::test]
async fn test_decode_error_keeps_last_value_then_recovers() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 7u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    let mut errors = subscriber.errors();
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();

    reader.set_data(address, vec![1, 2, 3]);
    loader.load().await.unwrap();
    assert_eq!(latest_value(&subscriber), Some(7));
    let error = errors.try_recv().unwrap();
    assert!(matches!(
        error.as_ref(),
        ConnectorError::Decode {
            source: DecodeError::TooShort { actual: 3, .. },
            ..
        }
    ));

    reader.set_data(address, 9u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    assert_eq!(latest_value(&subscriber), Some(9));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent_and_clears_state() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    assert!(subscriber.is_subscribed());

    subscriber.unsubscribe().await.unwrap();
    subscriber.unsubscribe().await.unwrap();

    assert!(!subscriber.is_subscribed());
    assert!(matches!(
        subscriber.get_latest(),
        Err(ConnectorError::NotSubscribed)
    ));
    assert_eq!(loader.ref_count(address).await.unwrap(), 0);

    // A released subscriber can subscribe again.
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    assert_eq!(latest_value(&subscriber), Some(1));
}

#[tokio::test]
async fn test_subscribing_twice_fails() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    let subscriber = subscriber(&reader, &loader);
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();

    let result = subscriber.subscribe(&[address], counter_decoder()).await;
    assert!(matches!(result, Err(ConnectorError::AlreadySubscribed)));
    assert_eq!(loader.ref_count(address).await.unwrap(), 1);
}

#[tokio::test]
async fn test_other_subscriber_survives_unsubscribe() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let first = subscriber(&reader, &loader);
    let second = subscriber(&reader, &loader);
    first.subscribe(&[address], counter_decoder()).await.unwrap();
    second.subscribe(&[address], counter_decoder()).await.unwrap();
    assert_eq!(loader.ref_count(address).await.unwrap(), 2);

    first.unsubscribe().await.unwrap();
    first.unsubscribe().await.unwrap();
    assert_eq!(loader.ref_count(address).await.unwrap(), 1);

    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    assert_eq!(latest_value(&second), Some(2));
}

#[tokio::test]
async fn test_listeners_and_update_stream_see_every_event() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    let events: Arc<Mutex<Vec<SubscriberEvent<u64>>>> = Arc::default();
    let sink = events.clone();
    let listener = subscriber.on_change(Box::new(move |event: &SubscriberEvent<u64>| {
        sink.lock().push(event.clone())
    }));
    let mut updates = subscriber.updates(8);

    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    reader.set_data(address, vec![0xff]);
    loader.load().await.unwrap();
    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();

    match updates.next().await.unwrap() {
        SubscriberEvent::Updated { value, .. } => assert_eq!(*value.unwrap().data, 1),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        updates.next().await.unwrap(),
        SubscriberEvent::DecodeFailed { .. }
    ));
    match updates.next().await.unwrap() {
        SubscriberEvent::Updated { value, .. } => assert_eq!(*value.unwrap().data, 2),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(events.lock().len(), 3);

    assert!(subscriber.remove_listener(listener));
    assert!(!subscriber.remove_listener(listener));
    reader.set_data(address, 3u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    assert_eq!(events.lock().len(), 3);
}

#[tokio::test]
async fn test_deleted_account_is_removed_from_cache() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 4u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    let events: Arc<Mutex<Vec<SubscriberEvent<u64>>>> = Arc::default();
    let sink = events.clone();
    subscriber.on_change(Box::new(move |event: &SubscriberEvent<u64>| {
        sink.lock().push(event.clone())
    }));
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    // The first tick sees the same bytes as the initial read.
    loader.load().await.unwrap();

    reader.remove(&address);
    loader.load().await.unwrap();

    assert_eq!(latest_value(&subscriber), None);
    let events = events.lock();
    assert!(matches!(
        events.last(),
        Some(SubscriberEvent::Updated { value: None, .. })
    ));
}

#[tokio::test]
async fn test_multi_address_subscription() {
    let (reader, loader) = setup();
    let primary = Pubkey::new_unique();
    let secondary = Pubkey::new_unique();
    let missing = Pubkey::new_unique();
    reader.set_data(primary, 10u64.to_le_bytes().to_vec());
    reader.set_data(secondary, 20u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    subscriber
        .subscribe(&[primary, secondary, missing], counter_decoder())
        .await
        .unwrap();

    assert_eq!(latest_value(&subscriber), Some(10));
    let value = subscriber.get_latest_for(&secondary).unwrap().unwrap();
    assert_eq!(*value.data, 20);
    assert!(subscriber.get_latest_for(&missing).unwrap().is_none());
    assert!(matches!(
        subscriber.get_latest_for(&Pubkey::new_unique()),
        Err(ConnectorError::UnknownAddress(_))
    ));
}

#[tokio::test]
async fn test_cached_value_never_moves_back_in_slot() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());
    reader.set_slot(50);

    let subscriber = subscriber(&reader, &loader);
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    assert_eq!(subscriber.get_latest().unwrap().unwrap().slot, 50);

    reader.set_slot(60);
    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    let latest = subscriber.get_latest().unwrap().unwrap();
    assert_eq!((*latest.data, latest.slot), (2, 60));
}

#[tokio::test]
async fn test_failed_initial_read_falls_back_to_loader_snapshot() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 7u64.to_le_bytes().to_vec());

    let first = subscriber(&reader, &loader);
    first.subscribe(&[address], counter_decoder()).await.unwrap();
    loader.load().await.unwrap();

    reader.fail_reads(true);
    let second = subscriber(&reader, &loader);
    second.subscribe(&[address], counter_decoder()).await.unwrap();
    reader.fail_reads(false);
    assert_eq!(latest_value(&second), Some(7));

    // Unchanged data is never dispatched again, so the cache must already hold it.
    loader.load().await.unwrap();
    loader.load().await.unwrap();
    assert_eq!(latest_value(&second), Some(7));
}

#[tokio::test]
async fn test_failed_initial_read_of_new_address_fills_on_first_tick() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 3u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    reader.fail_reads(true);
    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    reader.fail_reads(false);
    assert_eq!(latest_value(&subscriber), None);

    loader.load().await.unwrap();
    assert_eq!(latest_value(&subscriber), Some(3));
}

#[tokio::test]
async fn test_panicking_listener_does_not_starve_others() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    subscriber.on_change(Box::new(|_: &SubscriberEvent<u64>| panic!("listener failure")));
    let count = count_events(&subscriber);

    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(latest_value(&subscriber), Some(2));
}

#[tokio::test]
async fn test_listener_can_replace_itself_during_dispatch() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = Arc::new(subscriber(&reader, &loader));
    let handle = Arc::downgrade(&subscriber);
    let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::default();
    let replacement_calls = Arc::new(AtomicUsize::new(0));
    let first_calls = Arc::new(AtomicUsize::new(0));

    let id = subscriber.on_change(Box::new({
        let own_id = own_id.clone();
        let replacement_calls = replacement_calls.clone();
        let first_calls = first_calls.clone();
        move |_: &SubscriberEvent<u64>| {
            first_calls.fetch_add(1, Ordering::SeqCst);
            let (Some(subscriber), Some(id)) = (handle.upgrade(), *own_id.lock()) else {
                return;
            };
            subscriber.remove_listener(id);
            let replacement_calls = replacement_calls.clone();
            subscriber.on_change(Box::new(move |_: &SubscriberEvent<u64>| {
                replacement_calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
    }));
    *own_id.lock() = Some(id);

    subscriber.subscribe(&[address], counter_decoder()).await.unwrap();
    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(replacement_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsubscribe_waits_for_initial_reads() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = Arc::new(subscriber(&reader, &loader));
    let count = count_events(&subscriber);

    let gate = reader.block_reads().await;
    let subscribing = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.subscribe(&[address], counter_decoder()).await }
    });
    while reader.read_one_calls() == 0 {
        tokio::task::yield_now().await;
    }

    let unsubscribing = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.unsubscribe().await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!unsubscribing.is_finished());
    assert!(subscriber.is_subscribed());

    drop(gate);
    subscribing.await.unwrap().unwrap();
    unsubscribing.await.unwrap().unwrap();

    assert!(!subscriber.is_subscribed());
    assert!(matches!(
        subscriber.get_latest(),
        Err(ConnectorError::NotSubscribed)
    ));
    assert_eq!(loader.ref_count(address).await.unwrap(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplicate_addresses_are_tracked_once() {
    let (reader, loader) = setup();
    let address = Pubkey::new_unique();
    reader.set_data(address, 1u64.to_le_bytes().to_vec());

    let subscriber = subscriber(&reader, &loader);
    let count = count_events(&subscriber);
    subscriber
        .subscribe(&[address, address], counter_decoder())
        .await
        .unwrap();

    assert_eq!(loader.ref_count(address).await.unwrap(), 1);
    assert_eq!(reader.read_one_calls(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    reader.set_data(address, 2u64.to_le_bytes().to_vec());
    loader.load().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(latest_value(&subscriber), Some(2));
}
