mod common;

use std::time::Duration;

use common::*;
use testfarm_client::message::{
    RegistryOperationCode, TestOperationCode, TextMessage,
};
use testfarm_client::{
    Address, ClientConfig, FarmClient, Message, Operation, Test, TestStatus, TransportError,
};

fn update(id: &str, status: TestStatus) -> Message {
    let mut test = Test::new(id).unwrap();
    test.status = status;
    Message::test(
        Address::new("unset", 1),
        Address::new("unset", 1),
        TestOperationCode::Update,
        test,
    )
}

fn text(id: &str, body: &str) -> Message {
    Message::new(
        Address::new("unset", 1),
        Address::new("unset", 1),
        Operation::Text(TextMessage {
            test_id: Some(id.to_string()),
            text: body.to_string(),
        }),
    )
}

async fn start_client(config: ClientConfig) -> FarmClient {
    FarmClient::start(config).await.unwrap()
}

/// Waits until the service has seen the REGISTER and the START for `id`.
async fn expect_registration(service: &mut FakePeer, id: &str) {
    let register = service.next().await;
    match &register.message.operation {
        Operation::Registry(op) => assert_eq!(op.code, RegistryOperationCode::Register),
        other => panic!("expected REGISTER, got {other:?}"),
    }
    let start = service.next().await;
    match &start.message.operation {
        Operation::Test(op) => {
            assert_eq!(op.code, TestOperationCode::Start);
            assert_eq!(op.test.id(), id);
            assert_eq!(op.test.status, TestStatus::Pending);
        }
        other => panic!("expected START, got {other:?}"),
    }
}

#[tokio::test]
async fn submit_registers_then_starts() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, _events) = RecordingListener::new();

    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();

    expect_registration(&mut service, "T1").await;
    assert_eq!(client.registered_tests().await, vec!["T1"]);
    assert_eq!(client.services().await, vec![service.address()]);
    client.shutdown().await;
}

#[tokio::test]
async fn second_submit_reuses_service_channel() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, _events) = RecordingListener::new();

    client
        .submit(Test::new("T1").unwrap(), listener.clone(), service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    client
        .submit(Test::new("T2").unwrap(), listener, service.address())
        .await
        .unwrap();
    let start = service.next().await;
    assert_eq!(start.message.test_id(), Some("T2"));
    assert!(matches!(start.message.operation, Operation::Test(_)));
    client.shutdown().await;
}

#[tokio::test]
async fn started_fires_once() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener.clone(), service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    let me = client.local_address().clone();
    service.send(update("T1", TestStatus::Started), &me).await;
    service.send(update("T1", TestStatus::Started), &me).await;
    service.send(text("T1", "barrier"), &me).await;

    assert_eq!(next_event(&mut events).await, Event::Started("T1".to_string()));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("T1".to_string(), "barrier".to_string())
    );
    assert_eq!(
        listener.events().await,
        vec![
            Event::Started("T1".to_string()),
            Event::Message("T1".to_string(), "barrier".to_string()),
        ]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn finished_test_shuts_client_down() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    let me = client.local_address().clone();
    service.send(update("T1", TestStatus::Finished), &me).await;

    assert_eq!(next_event(&mut events).await, Event::Finished("T1".to_string()));
    tokio::time::timeout(WAIT, client.closed()).await.unwrap();
    assert!(client.registered_tests().await.is_empty());

    let deregister = service.next().await;
    match deregister.message.operation {
        Operation::Registry(op) => assert_eq!(op.code, RegistryOperationCode::Deregister),
        other => panic!("expected DEREGISTER, got {other:?}"),
    }
}

#[tokio::test]
async fn update_after_removal_is_ignored() {
    let mut service = FakePeer::start().await;
    let config = ClientConfig {
        shutdown_when_idle: false,
        ..fast_config()
    };
    let client = start_client(config).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener.clone(), service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;
    client
        .submit(Test::new("T2").unwrap(), listener.clone(), service.address())
        .await
        .unwrap();
    service.next().await;

    let me = client.local_address().clone();
    let mut failed = update("T1", TestStatus::Failed);
    if let Operation::Test(op) = &mut failed.operation {
        op.test.reason = Some("no products".to_string());
    }
    service.send(failed, &me).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Failed("T1".to_string(), "no products".to_string())
    );

    service.send(update("T1", TestStatus::Started), &me).await;
    service.send(text("T2", "barrier"), &me).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("T2".to_string(), "barrier".to_string())
    );
    assert_eq!(client.registered_tests().await, vec!["T2"]);
    assert!(!client.is_closed());
    client.shutdown().await;
}

#[tokio::test]
async fn invalid_test_fails_without_network() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    let test: Test = serde_json::from_str(r#"{"id": "bad/id"}"#).unwrap();

    let err = client
        .submit(test, listener, service.address())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidTest { .. }));
    assert!(matches!(next_event(&mut events).await, Event::Failed(id, _) if id == "bad/id"));
    service.expect_silence(Duration::from_millis(200)).await;
    assert!(client.registered_tests().await.is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_submit_rejected() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener.clone(), service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    let err = client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::DuplicateTest(_)));
    assert!(matches!(next_event(&mut events).await, Event::Failed(..)));
    assert_eq!(client.registered_tests().await, vec!["T1"]);
    client.shutdown().await;
}

#[tokio::test]
async fn unreachable_service_fails_submit() {
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    let service = refused_address().await;

    let err = client
        .submit(Test::new("T1").unwrap(), listener, service)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    assert!(matches!(next_event(&mut events).await, Event::Failed(id, _) if id == "T1"));
    assert!(client.registered_tests().await.is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn lost_service_fails_its_tests() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    service.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.cancel("T1").await.unwrap();

    let expected = format!("remote service {} disconnected", service.address());
    assert_eq!(
        next_event(&mut events).await,
        Event::Failed("T1".to_string(), expected)
    );
    assert!(client.services().await.is_empty());
    tokio::time::timeout(WAIT, client.closed()).await.unwrap();
}

#[tokio::test]
async fn idle_channel_checks_live_test_once_per_period() {
    let mut service = FakePeer::start().await;
    let config = ClientConfig {
        idle_check_ms: 400,
        ..fast_config()
    };
    let client = start_client(config).await;
    let (listener, _events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    for _ in 0..2 {
        let check = service.next().await;
        match check.message.operation {
            Operation::Test(op) => {
                assert_eq!(op.code, TestOperationCode::Check);
                assert_eq!(op.test.id(), "T1");
            }
            other => panic!("expected CHECK, got {other:?}"),
        }
        service.expect_silence(Duration::from_millis(200)).await;
    }
    client.shutdown().await;
}

#[tokio::test]
async fn idle_channel_without_tests_is_dropped() {
    let mut service = FakePeer::start().await;
    let config = ClientConfig {
        idle_check_ms: 200,
        shutdown_when_idle: false,
        ..fast_config()
    };
    let client = start_client(config).await;
    let (listener, mut events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;
    let me = client.local_address().clone();

    service.send(update("T1", TestStatus::Finished), &me).await;
    assert_eq!(next_event(&mut events).await, Event::Finished("T1".to_string()));
    assert!(client.registered_tests().await.is_empty());

    for _ in 0..200 {
        if client.services().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.services().await.is_empty());
    assert!(!client.is_closed());
    client.shutdown().await;
}

#[tokio::test]
async fn cancel_sends_stop() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, _events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    client.cancel("T1").await.unwrap();
    let stop = service.next().await;
    match stop.message.operation {
        Operation::Test(op) => assert_eq!(op.code, TestOperationCode::Stop),
        other => panic!("expected STOP, got {other:?}"),
    }
    assert!(matches!(
        client.cancel("T9").await,
        Err(TransportError::UnknownTest(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn send_text_reaches_service() {
    let mut service = FakePeer::start().await;
    let client = start_client(fast_config()).await;
    let (listener, _events) = RecordingListener::new();
    client
        .submit(Test::new("T1").unwrap(), listener, service.address())
        .await
        .unwrap();
    expect_registration(&mut service, "T1").await;

    client.send_text("T1", "line one\nline two").await.unwrap();
    let received = service.next().await;
    match received.message.operation {
        Operation::Text(text) => {
            assert_eq!(text.test_id.as_deref(), Some("T1"));
            assert_eq!(text.text, "line one\nline two");
        }
        other => panic!("expected text, got {other:?}"),
    }
    client.shutdown().await;
}
