//! Application payload codecs and the type-erased message value.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// A decoded application message.
///
/// Messages are type-erased so one dispatch pipeline can carry any
/// per-method payload type. They clone cheaply (shared ownership) and
/// downcast back to the concrete type at the edges.
#[derive(Clone)]
pub struct Message(Arc<dyn Any + Send + Sync>);

impl Message {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").finish_non_exhaustive()
    }
}

/// Per-method payload codec.
///
/// Bound to a method as its request and response codec; the call runtime
/// itself never interprets payload bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// Postcard-backed codec for one concrete serde type.
pub struct PostcardCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> PostcardCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for PostcardCodec<T>
where
    T: Serialize + DeserializeOwned + Any + Send + Sync,
{
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let value = message
            .downcast_ref::<T>()
            .ok_or(CodecError::WrongMessageType {
                expected: std::any::type_name::<T>(),
            })?;
        postcard::to_allocvec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        let value: T = postcard::from_bytes(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Message::new(value))
    }
}

/// Maps descriptor type paths to codecs.
///
/// Descriptor sources reference payload types by path (for example
/// `"pkg.EchoRequest"`); registering a codec under that path is what
/// makes the type usable by a method.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_path: impl Into<String>, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(type_path.into(), codec);
        self
    }

    /// Register a postcard codec for `T` under the given type path.
    pub fn register_postcard<T>(&mut self, type_path: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.register(type_path, Arc::new(PostcardCodec::<T>::new()))
    }

    pub fn get(&self, type_path: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(type_path).cloned()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.codecs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postcard_codec_round_trips() {
        let codec = PostcardCodec::<String>::new();
        let bytes = codec.encode(&Message::new("hello".to_string())).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<String>(), Some(&"hello".to_string()));
    }

    #[test]
    fn encode_rejects_wrong_message_type() {
        let codec = PostcardCodec::<String>::new();
        let result = codec.encode(&Message::new(42u32));
        assert!(matches!(
            result,
            Err(CodecError::WrongMessageType { .. })
        ));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let codec = PostcardCodec::<String>::new();
        assert!(matches!(codec.decode(&[0xFF]), Err(CodecError::Decode(_))));
    }

    #[test]
    fn registry_resolves_registered_paths_only() {
        let mut registry = CodecRegistry::new();
        registry.register_postcard::<String>("test.Text");
        assert!(registry.get("test.Text").is_some());
        assert!(registry.get("test.Missing").is_none());
    }
}
