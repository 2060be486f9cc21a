use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, ErrorKind, Result, SerializeType};

/// A typed payload carried by one direction of a call.
///
/// Blanket-implemented for every serde type; the serialize type of the call
/// picks the concrete encoding.
pub trait RpcParam: Sized {
    fn into_bytes(&self, st: SerializeType) -> Result<Vec<u8>>;
    fn from_slice(st: SerializeType, data: &[u8]) -> Result<Self>;
}

impl<T> RpcParam for T
where
    T: Serialize + DeserializeOwned,
{
    fn into_bytes(&self, st: SerializeType) -> Result<Vec<u8>> {
        match st {
            SerializeType::Json => serde_json::to_vec(self).map_err(Error::from),
            SerializeType::MsgPack => {
                rmp_serde::to_vec_named(self).map_err(|err| Error::new(ErrorKind::Protocol, err))
            }
        }
    }

    fn from_slice(st: SerializeType, data: &[u8]) -> Result<Self> {
        match st {
            SerializeType::Json => serde_json::from_slice(data).map_err(Error::from),
            SerializeType::MsgPack => {
                rmp_serde::from_slice(data).map_err(|err| Error::new(ErrorKind::Protocol, err))
            }
        }
    }
}
