//! Call lifecycle: invocation, duplicate eviction, error precedence,
//! deferred listener faults, and read timeouts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use wirecall::{
    CallError, CallListeners, Channel, Client, CodecRegistry, Message, MethodDescriptor, Packet,
    PacketType, ServiceDescriptor, Status,
};

type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

fn method(name: &str, client_streaming: bool, server_streaming: bool) -> MethodDescriptor {
    MethodDescriptor {
        name: name.to_string(),
        client_streaming,
        server_streaming,
        request_type: "test.Text".to_string(),
        response_type: "test.Text".to_string(),
    }
}

fn text_client() -> (Arc<Client>, Sent) {
    let mut codecs = CodecRegistry::new();
    codecs.register_postcard::<String>("test.Text");
    let descriptor = ServiceDescriptor {
        name: "Echo".to_string(),
        methods: vec![
            method("Say", false, false),
            method("Watch", false, true),
            method("Upload", true, false),
            method("Chat", true, true),
        ],
    };

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();
    let channel = Channel::new(1, move |bytes: &[u8]| {
        sink.lock().push(bytes.to_vec());
        Ok(())
    });

    let client = Client::from_descriptors([channel], [("test", &descriptor)], &codecs).unwrap();
    (Arc::new(client), sent)
}

fn text(value: &str) -> Message {
    Message::new(value.to_string())
}

fn text_payload(value: &str) -> Vec<u8> {
    postcard::to_allocvec(&value.to_string()).unwrap()
}

fn get_text(message: &Message) -> String {
    message.downcast_ref::<String>().unwrap().clone()
}

fn sent_packets(sent: &Sent) -> Vec<Packet> {
    sent.lock()
        .iter()
        .map(|bytes| Packet::decode(bytes).unwrap())
        .collect()
}

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn unary_call_sends_request_and_delivers_response() {
    trace_init();
    let (client, sent) = text_client();
    let received = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(None));

    let listeners = CallListeners::new()
        .on_next({
            let received = received.clone();
            move |message: &Message| received.lock().push(get_text(message))
        })
        .on_completed({
            let completed = completed.clone();
            move |status: Status| *completed.lock() = Some(status)
        });

    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let call = stub.invoke_unary(&text("ping"), listeners).unwrap();

    let packets = sent_packets(&sent);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::Request);
    assert_eq!(packets[0].ids(), stub.rpc().ids());
    assert_eq!(packets[0].payload.as_ref(), text_payload("ping"));

    let status = client.process_packet(
        &Packet::response(
            stub.rpc().ids(),
            Status::Aborted,
            Some(&text_payload("pong")),
        )
        .encode(),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(*received.lock(), vec!["pong".to_string()]);
    assert_eq!(*completed.lock(), Some(Status::Aborted));

    let (final_status, response) = call.complete(None).await.unwrap();
    assert_eq!(final_status, Status::Aborted);
    assert_eq!(get_text(&response), "pong");
}

#[tokio::test]
async fn duplicate_invocation_cancels_the_previous_call() {
    let (client, _sent) = text_client();
    let errored = Arc::new(Mutex::new(None));
    let listeners = CallListeners::new().on_error({
        let errored = errored.clone();
        move |status: Status| *errored.lock() = Some(status)
    });

    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Upload")
        .unwrap();
    let first = stub.invoke_client_streaming(listeners).unwrap();
    let second = stub.invoke_client_streaming(CallListeners::new()).unwrap();

    assert_eq!(first.error(), Some(Status::Cancelled));
    assert_eq!(*errored.lock(), Some(Status::Cancelled));
    assert!(first.completed());
    assert!(!second.completed());
    assert_eq!(client.registry().len(), 1);
}

#[tokio::test]
async fn recorded_error_takes_priority_over_buffered_responses() {
    let (client, _sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Watch")
        .unwrap();
    let call = stub
        .invoke_server_streaming(&text("start"), CallListeners::new())
        .unwrap();
    let ids = stub.rpc().ids();

    client.process_packet(&Packet::server_stream(ids, &text_payload("one")).encode());
    let server_error = Packet {
        packet_type: PacketType::ServerError,
        channel_id: ids[0],
        service_id: ids[1],
        method_id: ids[2],
        status: Some(Status::Unavailable),
        payload: Bytes::new(),
    };
    client.process_packet(&server_error.encode());

    assert_eq!(call.error(), Some(Status::Unavailable));
    assert_eq!(call.responses().len(), 1);

    let mut reader = call.response_reader(None, None);
    match reader.next().await {
        Err(CallError::Status(Status::Unavailable)) => {}
        other => panic!("expected the recorded error, got {other:?}"),
    }
}

#[tokio::test]
async fn listener_panic_is_deferred_and_reraised_on_read() {
    let (client, _sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Watch")
        .unwrap();
    let listeners = CallListeners::new().on_next(|_: &Message| panic!("listener exploded"));
    let call = stub
        .invoke_server_streaming(&text("start"), listeners)
        .unwrap();

    // The panic never escapes packet processing.
    let status = client
        .process_packet(&Packet::server_stream(stub.rpc().ids(), &text_payload("one")).encode());
    assert_eq!(status, Status::Ok);

    let mut reader = call.response_reader(None, None);
    match reader.next().await {
        Err(CallError::Callback(message)) => assert!(message.contains("listener exploded")),
        other => panic!("expected a deferred callback failure, got {other:?}"),
    }
}

#[tokio::test]
async fn read_timeout_raises_and_requeues_the_late_response() {
    let (client, _sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Watch")
        .unwrap();
    let call = stub
        .invoke_server_streaming(&text("start"), CallListeners::new())
        .unwrap();

    let mut reader = call.response_reader(Some(1), Some(Duration::from_millis(10)));
    match reader.next().await {
        Err(CallError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 10),
        other => panic!("expected a timeout, got {other:?}"),
    }

    // A response arriving after the deadline is requeued to the front
    // rather than lost.
    client.process_packet(&Packet::server_stream(stub.rpc().ids(), &text_payload("late")).encode());
    let message = reader.next().await.unwrap().unwrap();
    assert_eq!(get_text(&message), "late");
}

#[tokio::test]
async fn readers_after_completion_observe_the_terminal_sentinel() {
    let (client, _sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let call = stub.invoke_unary(&text("ping"), CallListeners::new()).unwrap();
    client.process_packet(
        &Packet::response(stub.rpc().ids(), Status::Ok, Some(&text_payload("pong"))).encode(),
    );

    let (status, response) = call.complete(None).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(get_text(&response), "pong");

    // A fresh reader yields nothing further.
    let mut reader = call.response_reader(None, None);
    assert!(reader.next().await.unwrap().is_none());
}
