//! Wire codecs for envelope payloads.
//!
//! Abstracts the underlying serialization libraries behind a unified
//! interface so the transport can be configured at runtime. Messages are
//! always round-tripped through one of these formats, even by the in-memory
//! transport, to faithfully emulate a real wire.
//!
//! ```rust
//! use demesne::codec::Codec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct MyData {
//!    field: String,
//! }
//!
//! let data = MyData { field: "Hello, World!".to_string() };
//! let encoded = Codec::Cbor.to_bytes(&data).unwrap();
//! let decoded: MyData = Codec::Cbor.from_bytes(&encoded).unwrap();
//! ```
use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// A unified interface for encoding and decoding binary payloads.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default)]
pub enum Codec {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Codec {
    /// Encode the given value into binary data using the selected format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?.into()),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result.into())
            }
        }
    }

    /// Decode binary data into a value of the specified type.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Codec {
    fn from(config: &Config) -> Self {
        match config.codec {
            config::Codec::Postcard => Self::Postcard,
            config::Codec::Cbor => Self::Cbor,
        }
    }
}
