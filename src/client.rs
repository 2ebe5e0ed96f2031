//! Client: packet ingestion, routing, and the stub lookup layers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::call::{
    BidirectionalStreamingCall, Call, CallListeners, ClientStreamingCall, ServerStreamingCall,
    UnaryCall,
};
use crate::codec::{CodecRegistry, Message};
use crate::descriptor::{Channel, Method, MethodKind, Rpc, Service, ServiceDescriptor};
use crate::error::{CallError, DescriptorError, Status};
use crate::packet::{Packet, PacketType};
use crate::registry::PendingCalls;

/// Client-side endpoint.
///
/// Owns the channel and service tables and the pending-call registry,
/// and is the single entry point for inbound packets. Tables are
/// constructor-injected and immutable afterwards, so several independent
/// clients can coexist in one process.
pub struct Client {
    registry: Arc<PendingCalls>,
    channels: HashMap<u32, Channel>,
    services: HashMap<u32, Arc<Service>>,
    services_by_name: HashMap<String, Arc<Service>>,
}

impl Client {
    /// Build a client from channels and fully-constructed services.
    pub fn new(
        channels: impl IntoIterator<Item = Channel>,
        services: impl IntoIterator<Item = Service>,
    ) -> Result<Self, DescriptorError> {
        let mut channel_table = HashMap::new();
        for channel in channels {
            let id = channel.id();
            if channel_table.insert(id, channel).is_some() {
                return Err(DescriptorError::DuplicateChannel { channel_id: id });
            }
        }

        let mut service_table = HashMap::new();
        let mut services_by_name = HashMap::new();
        for service in services {
            let service = Arc::new(service);
            let replaced_id = service_table.insert(service.id(), service.clone()).is_some();
            let replaced_name = services_by_name
                .insert(service.name().to_string(), service.clone())
                .is_some();
            if replaced_id || replaced_name {
                return Err(DescriptorError::DuplicateService {
                    service: service.name().to_string(),
                });
            }
        }

        Ok(Self {
            registry: Arc::new(PendingCalls::new()),
            channels: channel_table,
            services: service_table,
            services_by_name,
        })
    }

    /// Build a client straight from descriptor-source input, resolving
    /// payload type paths through the codec registry.
    pub fn from_descriptors<'a>(
        channels: impl IntoIterator<Item = Channel>,
        descriptors: impl IntoIterator<Item = (&'a str, &'a ServiceDescriptor)>,
        codecs: &CodecRegistry,
    ) -> Result<Self, DescriptorError> {
        let mut services = Vec::new();
        for (package, descriptor) in descriptors {
            services.push(Service::from_descriptor(package, descriptor, codecs)?);
        }
        Self::new(channels, services)
    }

    /// The pending-call registry shared by every stub of this client.
    pub fn registry(&self) -> &Arc<PendingCalls> {
        &self.registry
    }

    /// Look up a channel-scoped client.
    pub fn channel(&self, id: u32) -> Option<ChannelClient<'_>> {
        self.channels.get(&id).map(|channel| ChannelClient {
            client: self,
            channel: channel.clone(),
        })
    }

    /// The channel-scoped client with the lowest channel id.
    pub fn default_channel(&self) -> Option<ChannelClient<'_>> {
        let id = self.channels.keys().min().copied()?;
        self.channel(id)
    }

    /// Look up a service by fully-qualified name.
    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services_by_name.get(name)
    }

    fn resolve(&self, service_id: u32, method_id: u32) -> Option<(Arc<Service>, Arc<Method>)> {
        let service = self.services.get(&service_id)?;
        let method = service.method_by_id(method_id)?;
        Some((service.clone(), method.clone()))
    }

    /// Feed one inbound packet through validation, decoding, and
    /// dispatch into the pending call it addresses.
    ///
    /// Returns `OK` once the packet has been accepted for processing,
    /// including when processing consists of reporting an error back to
    /// the peer. The other statuses mark packets this client could not
    /// route at all: `DATA_LOSS` for malformed bytes, `INVALID_ARGUMENT`
    /// for server-directed packets, `NOT_FOUND` for unknown channels.
    pub fn process_packet(&self, data: &[u8]) -> Status {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::warn!(%error, "failed to decode inbound packet");
                return Status::DataLoss;
            }
        };

        if packet.for_server() {
            tracing::warn!(
                packet_type = ?packet.packet_type,
                "dropping server-directed packet"
            );
            return Status::InvalidArgument;
        }

        let Some(channel) = self.channels.get(&packet.channel_id) else {
            tracing::warn!(channel_id = packet.channel_id, "packet for unknown channel");
            return Status::NotFound;
        };

        // An unrecognized RPC is a handled, reported condition.
        let Some((service, method)) = self.resolve(packet.service_id, packet.method_id) else {
            tracing::warn!(
                service_id = packet.service_id,
                method_id = packet.method_id,
                "packet for unknown rpc"
            );
            self.send_error_reply(channel, &packet, Status::NotFound);
            return Status::Ok;
        };
        let rpc = Rpc {
            channel: channel.clone(),
            service,
            method: method.clone(),
        };

        let mut packet_type = packet.packet_type;
        match packet_type {
            PacketType::Response | PacketType::ServerStream | PacketType::ServerError => {}
            other => {
                tracing::warn!(packet_type = ?other, "ignoring unexpected packet type");
                return Status::Ok;
            }
        }

        // A stream chunk is not itself terminal; everything else carries
        // a status.
        let mut status = match (packet_type, packet.status) {
            (PacketType::ServerStream, _) => None,
            (_, Some(status)) => Some(status),
            (PacketType::ServerError, None) => {
                panic!(
                    "server error packet without a status for {}",
                    rpc.id_string()
                );
            }
            (_, None) => {
                tracing::warn!(rpc = %rpc.id_string(), "terminal packet missing status");
                return Status::DataLoss;
            }
        };

        // Payload rides on stream chunks and on the terminal response of
        // methods whose responses are not streamed.
        let wants_payload = packet_type == PacketType::ServerStream
            || (packet_type == PacketType::Response && !method.kind().server_streaming());
        let mut message = None;
        if wants_payload {
            match method.decode_response(&packet.payload) {
                Ok(decoded) => message = Some(decoded),
                Err(error) => {
                    tracing::warn!(
                        rpc = %rpc.id_string(),
                        %error,
                        "failed to decode response payload"
                    );
                    packet_type = PacketType::ServerError;
                    status = Some(Status::DataLoss);
                    self.send_error_reply(channel, &packet, Status::DataLoss);
                }
            }
        }

        // Terminal packets also clear the pending entry.
        let Some(call) = self.registry.get_pending(&rpc, status) else {
            tracing::debug!(rpc = %rpc.id_string(), "response for inactive call");
            self.send_error_reply(channel, &packet, Status::FailedPrecondition);
            return Status::Ok;
        };

        if packet_type == PacketType::ServerError {
            let status = status.expect("server error packets always carry a status");
            assert!(
                status != Status::Ok,
                "server error packet with OK status for {}",
                rpc.id_string()
            );
            call.handle_error(status);
        } else {
            if let Some(message) = message {
                call.handle_response(message);
            }
            if let Some(status) = status {
                call.handle_completion(status);
            }
        }
        Status::Ok
    }

    fn send_error_reply(&self, channel: &Channel, packet: &Packet, status: Status) {
        let reply = Packet::client_error(packet.ids(), status).encode();
        if let Err(error) = channel.send(&reply) {
            tracing::warn!(channel_id = channel.id(), %error, "failed to send error reply");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("channels", &self.channels.len())
            .field("services", &self.services.len())
            .field("pending", &self.registry.len())
            .finish()
    }
}

/// Stub layer scoped to one channel.
#[derive(Debug)]
pub struct ChannelClient<'a> {
    client: &'a Client,
    channel: Channel,
}

impl ChannelClient<'_> {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Look up a service-scoped client by fully-qualified service name.
    pub fn service(&self, name: &str) -> Option<ServiceClient> {
        let service = self.client.service(name)?.clone();
        Some(ServiceClient {
            registry: self.client.registry.clone(),
            channel: self.channel.clone(),
            service,
        })
    }

    /// Look up a method stub by `"package.Service.method"`.
    pub fn method_stub(&self, full_name: &str) -> Option<MethodStub> {
        let (service_name, method_name) = full_name.rsplit_once('.')?;
        self.service(service_name)?.method(method_name)
    }
}

/// Stub layer scoped to one service on one channel.
#[derive(Clone, Debug)]
pub struct ServiceClient {
    registry: Arc<PendingCalls>,
    channel: Channel,
    service: Arc<Service>,
}

impl ServiceClient {
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Look up a method stub by bare method name.
    pub fn method(&self, name: &str) -> Option<MethodStub> {
        let method = self.service.method(name)?.clone();
        Some(MethodStub {
            registry: self.registry.clone(),
            rpc: Rpc {
                channel: self.channel.clone(),
                service: self.service.clone(),
                method,
            },
        })
    }
}

/// Binds one method on one channel to the pending-call registry and
/// constructs calls of the matching shape.
///
/// The `invoke_*`/`open_*` constructors assert that the stub's method
/// has the shape their name says; asking a unary method for a streaming
/// call is caller misuse.
#[derive(Clone, Debug)]
pub struct MethodStub {
    registry: Arc<PendingCalls>,
    rpc: Rpc,
}

impl MethodStub {
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    pub fn kind(&self) -> MethodKind {
        self.rpc.method.kind()
    }

    fn assert_kind(&self, expected: MethodKind) {
        assert!(
            self.kind() == expected,
            "{} is {:?}, not {:?}",
            self.rpc.method.full_name(),
            self.kind(),
            expected
        );
    }

    fn new_call(&self, listeners: CallListeners) -> Arc<Call> {
        Call::new(self.registry.clone(), self.rpc.clone(), listeners)
    }

    /// Start a unary call.
    pub fn invoke_unary(
        &self,
        request: &Message,
        listeners: CallListeners,
    ) -> Result<UnaryCall, CallError> {
        self.assert_kind(MethodKind::Unary);
        let call = self.new_call(listeners);
        Call::invoke(&call, Some(request), false)?;
        Ok(UnaryCall::new(call))
    }

    /// Register a unary call without sending a request packet.
    pub fn open_unary(&self, listeners: CallListeners) -> Result<UnaryCall, CallError> {
        self.assert_kind(MethodKind::Unary);
        let call = self.new_call(listeners);
        Call::open(&call)?;
        Ok(UnaryCall::new(call))
    }

    /// Start a server-streaming call.
    pub fn invoke_server_streaming(
        &self,
        request: &Message,
        listeners: CallListeners,
    ) -> Result<ServerStreamingCall, CallError> {
        self.assert_kind(MethodKind::ServerStreaming);
        let call = self.new_call(listeners);
        Call::invoke(&call, Some(request), false)?;
        Ok(ServerStreamingCall::new(call))
    }

    /// Register a server-streaming call without sending a request packet.
    pub fn open_server_streaming(
        &self,
        listeners: CallListeners,
    ) -> Result<ServerStreamingCall, CallError> {
        self.assert_kind(MethodKind::ServerStreaming);
        let call = self.new_call(listeners);
        Call::open(&call)?;
        Ok(ServerStreamingCall::new(call))
    }

    /// Start a client-streaming call. The request stream begins empty.
    pub fn invoke_client_streaming(
        &self,
        listeners: CallListeners,
    ) -> Result<ClientStreamingCall, CallError> {
        self.assert_kind(MethodKind::ClientStreaming);
        let call = self.new_call(listeners);
        Call::invoke(&call, None, false)?;
        Ok(ClientStreamingCall::new(call))
    }

    /// Register a client-streaming call without sending a request packet.
    pub fn open_client_streaming(
        &self,
        listeners: CallListeners,
    ) -> Result<ClientStreamingCall, CallError> {
        self.assert_kind(MethodKind::ClientStreaming);
        let call = self.new_call(listeners);
        Call::open(&call)?;
        Ok(ClientStreamingCall::new(call))
    }

    /// Start a bidirectional-streaming call. The request stream begins
    /// empty.
    pub fn invoke_bidirectional(
        &self,
        listeners: CallListeners,
    ) -> Result<BidirectionalStreamingCall, CallError> {
        self.assert_kind(MethodKind::BidirectionalStreaming);
        let call = self.new_call(listeners);
        Call::invoke(&call, None, false)?;
        Ok(BidirectionalStreamingCall::new(call))
    }

    /// Register a bidirectional-streaming call without sending a request
    /// packet.
    pub fn open_bidirectional(
        &self,
        listeners: CallListeners,
    ) -> Result<BidirectionalStreamingCall, CallError> {
        self.assert_kind(MethodKind::BidirectionalStreaming);
        let call = self.new_call(listeners);
        Call::open(&call)?;
        Ok(BidirectionalStreamingCall::new(call))
    }
}
