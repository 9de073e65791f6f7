//! Conversion between typed values and stored bytes.
//!
//! Every value type that goes through the facade implements [`Storable`],
//! which names its default [`Codec`]. Text and raw bytes read the stored
//! object directly; structured values go through JSON via [`Json`]:
//!
//! | Type       | Default codec  | Content type               |
//! |------------|----------------|----------------------------|
//! | `String`   | [`TextCodec`]  | `text/plain; charset=utf-8`|
//! | `Vec<u8>`  | [`BytesCodec`] | `application/octet-stream` |
//! | `Json<T>`  | [`JsonCodec`]  | `application/json`         |
//!
//! A caller can override the codec per operation through the facade's
//! option builders.

use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::client::RawObject;
use crate::error::{Cause, RelayError};

/// Encodes values of `T` to bytes and back.
pub trait Codec<T>: Send + Sync + 'static {
    /// Short name used in error messages.
    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

/// A value type the facade can store and fetch.
pub trait Storable: Clone + Send + Sync + 'static {
    fn codec() -> Arc<dyn Codec<Self>>;
}

/// UTF-8 text, stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec<String> for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn encode(&self, value: &String) -> anyhow::Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<String> {
        String::from_utf8(bytes.to_vec()).context("stored value is not valid UTF-8")
    }
}

/// Raw bytes, stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn encode(&self, value: &Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// JSON via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(value).context("failed to serialize value as JSON")
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T> {
        serde_json::from_slice(bytes).context("failed to deserialize JSON value")
    }
}

/// Wrapper that stores any serde type as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl Storable for String {
    fn codec() -> Arc<dyn Codec<Self>> {
        Arc::new(TextCodec)
    }
}

impl Storable for Vec<u8> {
    fn codec() -> Arc<dyn Codec<Self>> {
        Arc::new(BytesCodec)
    }
}

impl<T> Storable for Json<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn codec() -> Arc<dyn Codec<Self>> {
        Arc::new(JsonCodec)
    }
}

/// Encode `value` into a stored object.
pub(crate) fn encode_object<T: 'static>(
    codec: &dyn Codec<T>,
    key: Option<String>,
    value: &T,
) -> Result<RawObject, RelayError> {
    let bytes = codec.encode(value).map_err(|e| RelayError::Codec {
        codec: codec.name(),
        cause: Cause::new(e),
    })?;
    Ok(RawObject {
        key,
        content_type: codec.content_type().to_string(),
        value: bytes,
    })
}

/// Decode a stored object into `T`.
pub(crate) fn decode_object<T: 'static>(
    codec: &dyn Codec<T>,
    object: &RawObject,
) -> Result<T, RelayError> {
    codec.decode(&object.value).map_err(|e| RelayError::Codec {
        codec: codec.name(),
        cause: Cause::new(e),
    })
}
