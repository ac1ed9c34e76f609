// Bencode codec for the masala wire protocol.
//
// Encoding is canonical: dictionary keys are always emitted in sorted byte order,
// so two implementations produce identical bytes for the same message.
// Decoding never reads past the supplied buffer and rejects non-canonical
// integers and length prefixes.

#![warn(clippy::used_underscore_binding)]

mod buffers;
mod deserialize;
mod serialize;
mod value;

pub use buffers::{ByteBuf, ByteBufOwned, ByteBufT};
pub use deserialize::{BencodeDeserializer, Error as DeserializeError, MAX_DEPTH, from_bytes};
pub use serialize::{Error as SerializeError, bencode_serialize_to_vec, bencode_serialize_to_writer};
pub use value::{BencodeValue, BencodeValueBorrowed, BencodeValueOwned, dyn_from_bytes};
