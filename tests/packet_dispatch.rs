//! Inbound packet dispatch: validation order, error replies, and the
//! pending-call lookup rules.

use std::sync::Arc;

use parking_lot::Mutex;
use wirecall::{
    CallListeners, Channel, Client, CodecRegistry, Message, MethodDescriptor, Packet, PacketType,
    ServiceDescriptor, Status,
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
        methods: vec![method("Say", false, false), method("Watch", false, true)],
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

#[tokio::test]
async fn malformed_packets_are_data_loss() {
    let (client, sent) = text_client();
    assert_eq!(client.process_packet(&[]), Status::DataLoss);
    assert_eq!(client.process_packet(&[0xFF, 0x00, 0x01]), Status::DataLoss);
    assert!(sent.lock().is_empty());
}

#[tokio::test]
async fn server_directed_packets_are_invalid_argument() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let status = client.process_packet(&Packet::request(stub.rpc().ids(), b"x").encode());
    assert_eq!(status, Status::InvalidArgument);
    assert!(sent.lock().is_empty());
}

#[tokio::test]
async fn unknown_channel_is_not_found() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let mut ids = stub.rpc().ids();
    ids[0] = 99;
    let status = client
        .process_packet(&Packet::response(ids, Status::Ok, Some(&text_payload("x"))).encode());
    assert_eq!(status, Status::NotFound);
    assert!(sent.lock().is_empty());
}

#[tokio::test]
async fn unknown_method_reports_not_found_to_the_peer() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let mut ids = stub.rpc().ids();
    ids[2] = 0;
    let status = client
        .process_packet(&Packet::response(ids, Status::Ok, Some(&text_payload("x"))).encode());
    assert_eq!(status, Status::Ok);

    let packets = sent_packets(&sent);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ClientError);
    assert_eq!(packets[0].status, Some(Status::NotFound));
    assert_eq!(packets[0].ids(), ids);
}

#[tokio::test]
async fn unknown_service_reports_not_found_to_the_peer() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let mut ids = stub.rpc().ids();
    ids[1] = 0;
    let status = client
        .process_packet(&Packet::response(ids, Status::Ok, Some(&text_payload("x"))).encode());
    assert_eq!(status, Status::Ok);

    let packets = sent_packets(&sent);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ClientError);
    assert_eq!(packets[0].status, Some(Status::NotFound));
    assert_eq!(packets[0].ids(), ids);
}

#[tokio::test]
async fn response_for_an_inactive_call_reports_failed_precondition() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    // Never invoked: the response is discarded and reported.
    let status = client.process_packet(
        &Packet::response(stub.rpc().ids(), Status::Ok, Some(&text_payload("x"))).encode(),
    );
    assert_eq!(status, Status::Ok);

    let packets = sent_packets(&sent);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ClientError);
    assert_eq!(packets[0].status, Some(Status::FailedPrecondition));
}

#[tokio::test]
async fn undecodable_payload_becomes_a_data_loss_error() {
    let (client, sent) = text_client();
    let stub = client
        .channel(1)
        .unwrap()
        .method_stub("test.Echo.Say")
        .unwrap();
    let call = stub.invoke_unary(&text("ping"), CallListeners::new()).unwrap();

    let status = client.process_packet(
        &Packet::response(stub.rpc().ids(), Status::Ok, Some([0xFF].as_slice())).encode(),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(call.error(), Some(Status::DataLoss));

    let packets = sent_packets(&sent);
    assert_eq!(packets.len(), 2); // the request, then the DATA_LOSS report
    assert_eq!(packets[1].packet_type, PacketType::ClientError);
    assert_eq!(packets[1].status, Some(Status::DataLoss));

    // The identity's slot is free again.
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn stream_chunks_leave_the_call_pending_until_terminal() {
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
    client.process_packet(&Packet::server_stream(ids, &text_payload("two")).encode());
    assert_eq!(client.registry().len(), 1);

    client.process_packet(&Packet::response(ids, Status::Ok, None).encode());
    assert!(client.registry().is_empty());

    let (status, responses) = call.complete(None).await.unwrap();
    assert_eq!(status, Status::Ok);
    let texts: Vec<String> = responses.iter().map(get_text).collect();
    assert_eq!(texts, ["one", "two"]);
}
