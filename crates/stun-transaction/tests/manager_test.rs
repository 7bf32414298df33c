mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};

use rvoip_stun_transaction::prelude::*;

use common::{drain_events, local, remote, MockTransport};

#[tokio::test(start_paused = true)]
async fn stray_response_is_dropped_silently() {
    let transport = Arc::new(MockTransport::new());
    let (manager, mut events) = TransactionManager::new(transport.clone(), None);

    let stray = Message::success_response_to(&Message::binding_request(), Bytes::new());
    manager.handle_message(stray, local(), remote()).await.unwrap();

    assert!(drain_events(&mut events).is_empty());
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(manager.active_transactions(), (vec![], vec![]));
}

#[tokio::test(start_paused = true)]
async fn indication_is_passed_through() {
    let transport = Arc::new(MockTransport::new());
    let (manager, mut events) = TransactionManager::new(transport.clone(), None);
    let indication = Message::new(MessageClass::Indication, BINDING_METHOD, TransactionId::generate(), Bytes::new());

    manager.handle_message(indication.clone(), local(), remote()).await.unwrap();
    manager.handle_message(indication.clone(), local(), remote()).await.unwrap();

    let events = drain_events(&mut events);
    assert_eq!(events.len(), 2);
    for event in events {
        assert!(event.transaction_id().is_none());
        match event {
            TransactionEvent::IndicationReceived { message, local_addr, source } => {
                assert_eq!(message, indication);
                assert_eq!(local_addr, local());
                assert_eq!(source, remote());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(manager.active_transactions(), (vec![], vec![]));
}

#[tokio::test(start_paused = true)]
async fn client_and_server_registries_are_independent() {
    let transport = Arc::new(MockTransport::new());
    let (manager, mut events) = TransactionManager::new(transport.clone(), None);
    let request = Message::binding_request();
    let id = request.transaction_id();

    // Our own request and an inbound request share the ID
    let client = manager.send_request(request.clone(), local(), remote()).await.unwrap();
    manager.handle_message(request.clone(), local(), remote()).await.unwrap();
    assert_eq!(manager.active_transactions(), (vec![id], vec![id]));

    let response = Message::success_response_to(&request, Bytes::new());
    manager.send_response(&id, response.clone(), local(), remote()).await.unwrap();
    assert_eq!(client.state().await, ClientTransactionState::Retransmitting);

    manager.handle_message(response.clone(), local(), remote()).await.unwrap();
    assert_eq!(client.outcome(), Some(ClientOutcome::Answered(response)));
    assert!(manager.client_transaction(&id).is_none());
    assert!(manager.server_transaction(&id).unwrap().is_retransmitting().await);

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, TransactionEvent::TransactionTerminated { is_server: false, .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransactionEvent::TransactionTerminated { is_server: true, .. })));
}

#[tokio::test(start_paused = true)]
async fn request_must_be_a_request() {
    let transport = Arc::new(MockTransport::new());
    let (manager, _events) = TransactionManager::new(transport.clone(), None);
    let response = Message::success_response_to(&Message::binding_request(), Bytes::new());

    let result = manager.send_request(response, local(), remote()).await;
    assert!(matches!(result, Err(Error::InvalidMessage(_))));
    assert_eq!(transport.sent_count(), 0);
    assert!(manager.active_transactions().0.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unencodable_request_is_rejected_and_unregistered() {
    let transport = Arc::new(UdpTransport::new());
    let (manager, mut events) = TransactionManager::new(transport, None);
    // Methods are 12 bits wide
    let request = Message::request(0x1FFF, Bytes::new());

    let result = manager.send_request(request.clone(), local(), remote()).await;
    assert!(matches!(result, Err(Error::Encode(_))));
    assert!(manager.client_transaction(&request.transaction_id()).is_none());

    let events = drain_events(&mut events);
    assert!(matches!(
        events.as_slice(),
        [TransactionEvent::TransactionTerminated { is_server: false, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_terminates_everything() {
    let transport = Arc::new(MockTransport::new());
    let (manager, mut events) = TransactionManager::new(transport.clone(), None);

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(
            manager
                .send_request(Message::binding_request(), local(), remote())
                .await
                .unwrap(),
        );
    }
    for _ in 0..2 {
        manager
            .handle_message(Message::binding_request(), local(), remote())
            .await
            .unwrap();
    }
    let (active_clients, active_servers) = manager.active_transactions();
    assert_eq!((active_clients.len(), active_servers.len()), (3, 2));

    manager.shutdown().await;
    sleep(Duration::from_millis(1)).await;

    assert_eq!(manager.active_transactions(), (vec![], vec![]));
    for client in &clients {
        assert_eq!(client.outcome(), Some(ClientOutcome::Canceled));
    }
    let terminated = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, TransactionEvent::TransactionTerminated { .. }))
        .count();
    assert_eq!(terminated, 5);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(transport.sent_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn undrained_event_channel_never_blocks_routing() {
    let transport = Arc::new(MockTransport::new());
    let (manager, mut events) = TransactionManager::with_capacity(transport.clone(), None, 1);
    let bound = Duration::from_secs(1);

    // Fills the channel
    let request = Message::binding_request();
    let id = request.transaction_id();
    manager.handle_message(request.clone(), local(), remote()).await.unwrap();
    let response = Message::success_response_to(&request, Bytes::new());
    manager.send_response(&id, response, local(), remote()).await.unwrap();

    for _ in 0..10 {
        timeout(bound, manager.handle_message(request.clone(), local(), remote()))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(transport.sent_count(), 11);

    for _ in 0..10 {
        let outbound = Message::binding_request();
        let tx = timeout(bound, manager.send_request(outbound.clone(), local(), remote()))
            .await
            .unwrap()
            .unwrap();
        let answer = Message::success_response_to(&outbound, Bytes::new());
        timeout(bound, manager.handle_message(answer.clone(), local(), remote()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.outcome(), Some(ClientOutcome::Answered(answer)));
    }

    // No room to announce it, so it must not linger as a known transaction
    let unheard = Message::binding_request();
    timeout(bound, manager.handle_message(unheard.clone(), local(), remote()))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(1)).await;
    assert!(manager.server_transaction(&unheard.transaction_id()).is_none());

    let queued = drain_events(&mut events);
    assert!(matches!(
        queued.as_slice(),
        [TransactionEvent::RequestReceived { transaction_id, .. }] if *transaction_id == id
    ));

    // Its retransmission reaches the application once there is room
    manager.handle_message(unheard.clone(), local(), remote()).await.unwrap();
    let queued = drain_events(&mut events);
    assert!(matches!(
        queued.as_slice(),
        [TransactionEvent::RequestReceived { transaction_id, .. }] if *transaction_id == unheard.transaction_id()
    ));
}
