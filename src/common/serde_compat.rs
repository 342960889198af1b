//! Module providing abstractions on top of [`serde`] components for encoding wire messages.

use super::super::error::{Error, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Trait to represent a serialization provider for request and response payloads.
pub trait SerializationProvider {
    /// Serializes the given value into an owned, cheaply cloneable buffer.
    fn serialize<T>(value: &T) -> Result<Bytes>
    where
        T: Serialize;

    /// Returns the number of bytes used by the serialized representation of `value`.
    fn serialized_size<T>(value: &T) -> Result<usize>
    where
        T: Serialize;

    /// Deserializes the given serialized bytes into a `T` instance.
    fn deserialize<T>(bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned;
}

pub mod bincode {
    //! Module providing a binary encoding serialization provider.

    use super::*;

    /// Implements [`SerializationProvider`](super::SerializationProvider) for [`bincode`].
    pub struct BinCode;

    impl super::SerializationProvider for BinCode {
        fn serialize<T>(value: &T) -> Result<Bytes>
        where
            T: Serialize,
        {
            ::bincode::serialize(value)
                .map(Bytes::from)
                .map_err(|err| Error::protocol(format!("serialization failed: {}", err)))
        }

        fn serialized_size<T>(value: &T) -> Result<usize>
        where
            T: Serialize,
        {
            ::bincode::serialized_size(value)
                .map(|x| x as usize)
                .map_err(|err| Error::protocol(format!("size computation failed: {}", err)))
        }

        fn deserialize<T>(bytes: &[u8]) -> Result<T>
        where
            T: DeserializeOwned,
        {
            ::bincode::deserialize(bytes)
                .map_err(|err| Error::protocol(format!("deserialization failed: {}", err)))
        }
    }
}
