//! Channel, service, and method descriptors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::{Codec, CodecRegistry, Message};
use crate::error::{ChannelError, CodecError, DescriptorError};
use crate::hash::hash;
use crate::packet::IdSet;

/// A numbered conduit with an opaque byte output.
///
/// The id is the unit of transport addressing; the output function is
/// whatever actually moves bytes out of the process and is never
/// inspected here.
#[derive(Clone)]
pub struct Channel {
    id: u32,
    output: Arc<dyn Fn(&[u8]) -> Result<(), ChannelError> + Send + Sync>,
}

impl Channel {
    pub fn new(
        id: u32,
        output: impl Fn(&[u8]) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            output: Arc::new(output),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand one encoded packet to the transport.
    pub fn send(&self, packet: &[u8]) -> Result<(), ChannelError> {
        (self.output)(packet)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Descriptor-source input for one method.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    /// Type path of the request payload, resolved through the codec registry.
    pub request_type: String,
    /// Type path of the response payload, resolved through the codec registry.
    pub response_type: String,
}

/// Descriptor-source input for one service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

/// The four RPC shapes, derived from the two streaming flags.
///
/// All four flag combinations are valid and exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidirectionalStreaming,
}

impl MethodKind {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => Self::Unary,
            (false, true) => Self::ServerStreaming,
            (true, false) => Self::ClientStreaming,
            (true, true) => Self::BidirectionalStreaming,
        }
    }

    pub fn client_streaming(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::BidirectionalStreaming)
    }

    pub fn server_streaming(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::BidirectionalStreaming)
    }
}

/// One RPC method, bound to its payload codecs.
pub struct Method {
    name: String,
    full_name: String,
    id: u32,
    service_id: u32,
    kind: MethodKind,
    request_codec: Arc<dyn Codec>,
    response_codec: Arc<dyn Codec>,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical `"package.Service.method"` name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Id of the service this method belongs to.
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn encode_request(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        self.request_codec.encode(message)
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        self.response_codec.decode(bytes)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("full_name", &self.full_name)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An immutable service: its methods keyed by id and by name.
pub struct Service {
    name: String,
    id: u32,
    methods_by_id: HashMap<u32, Arc<Method>>,
    methods_by_name: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Build a service from descriptor input, resolving payload type
    /// paths through the codec registry and deriving ids from names.
    ///
    /// The service id hashes the fully-qualified `"package.Service"`
    /// name; method ids hash the bare method name.
    pub fn from_descriptor(
        package: &str,
        descriptor: &ServiceDescriptor,
        codecs: &CodecRegistry,
    ) -> Result<Self, DescriptorError> {
        let full_name = if package.is_empty() {
            descriptor.name.clone()
        } else {
            format!("{package}.{}", descriptor.name)
        };
        let id = hash(&full_name);

        let mut methods_by_id = HashMap::new();
        let mut methods_by_name = HashMap::new();
        for desc in &descriptor.methods {
            let resolve = |type_path: &str| {
                codecs
                    .get(type_path)
                    .ok_or_else(|| DescriptorError::UnknownType {
                        method: format!("{full_name}.{}", desc.name),
                        type_path: type_path.to_string(),
                    })
            };
            let request_codec = resolve(&desc.request_type)?;
            let response_codec = resolve(&desc.response_type)?;

            let method = Arc::new(Method {
                name: desc.name.clone(),
                full_name: format!("{full_name}.{}", desc.name),
                id: hash(&desc.name),
                service_id: id,
                kind: MethodKind::from_flags(desc.client_streaming, desc.server_streaming),
                request_codec,
                response_codec,
            });
            let replaced_id = methods_by_id.insert(method.id(), method.clone()).is_some();
            let replaced_name = methods_by_name
                .insert(method.name().to_string(), method)
                .is_some();
            if replaced_id || replaced_name {
                return Err(DescriptorError::DuplicateMethod {
                    service: full_name,
                    method: desc.name.clone(),
                });
            }
        }

        Ok(Self {
            name: full_name,
            id,
            methods_by_id,
            methods_by_name,
        })
    }

    /// The fully-qualified service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods_by_name.get(name)
    }

    pub fn method_by_id(&self, id: u32) -> Option<&Arc<Method>> {
        self.methods_by_id.get(&id)
    }

    pub fn iter_methods(&self) -> impl Iterator<Item = &Arc<Method>> {
        self.methods_by_id.values()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("methods", &self.methods_by_id.len())
            .finish()
    }
}

/// The identity of one logical call slot: `(channel, service, method)`.
///
/// Two identities are equal exactly when the id triple matches; the
/// string form of the triple keys the pending-call registry.
#[derive(Clone)]
pub struct Rpc {
    pub channel: Channel,
    pub service: Arc<Service>,
    pub method: Arc<Method>,
}

impl Rpc {
    /// The id triple carried in packets.
    pub fn ids(&self) -> IdSet {
        [self.channel.id(), self.service.id(), self.method.id()]
    }

    /// The registry key: `"<channel>.<service>.<method>"`.
    pub fn id_string(&self) -> String {
        let [channel, service, method] = self.ids();
        format!("{channel}.{service}.{method}")
    }
}

impl PartialEq for Rpc {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
    }
}

impl Eq for Rpc {}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("channel", &self.channel.id())
            .field("service", &self.service.name())
            .field("method", &self.method.name())
            .finish()
    }
}
