use std::{collections::BTreeMap, io::Write};

use serde::{
    Serialize,
    ser::{self, Impossible},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("bencode can't represent {0}")]
    Unsupported(&'static str),
    #[error("dictionary keys must be byte strings")]
    KeyNotBytes,
    #[error("{0} is out of range for a bencode integer")]
    IntegerOutOfRange(u64),
    #[error("dictionary value without a key")]
    ValueWithoutKey,
    #[error("{0}")]
    Custom(Box<str>),
}

impl ser::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string().into_boxed_str())
    }
}

struct Encoder<W> {
    out: W,
}

impl<W: Write> Encoder<W> {
    fn int(&mut self, v: impl std::fmt::Display) -> Result<(), Error> {
        write!(self.out, "i{v}e")?;
        Ok(())
    }

    fn string(&mut self, v: &[u8]) -> Result<(), Error> {
        write!(self.out, "{}:", v.len())?;
        self.out.write_all(v)?;
        Ok(())
    }

    fn tag(&mut self, t: u8) -> Result<(), Error> {
        self.out.write_all(&[t])?;
        Ok(())
    }
}

fn encode_nested<T: ?Sized + Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut enc = Encoder { out: Vec::new() };
    value.serialize(&mut enc)?;
    Ok(enc.out)
}

/// Lists and tuples.
struct List<'a, W> {
    enc: &'a mut Encoder<W>,
}

impl<W: Write> List<'_, W> {
    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut *self.enc)
    }
}

impl<W: Write> ser::SerializeSeq for List<'_, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<(), Error> {
        self.enc.tag(b'e')
    }
}

impl<W: Write> ser::SerializeTuple for List<'_, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<(), Error> {
        self.enc.tag(b'e')
    }
}

/// Maps and structs. Entries are buffered so they can be written out in key
/// order no matter what order serde hands them over in.
struct Dict<'a, W> {
    enc: &'a mut Encoder<W>,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    key: Option<Vec<u8>>,
}

impl<W: Write> Dict<'_, W> {
    fn finish(self) -> Result<(), Error> {
        self.enc.tag(b'd')?;
        for (k, v) in self.entries {
            self.enc.string(&k)?;
            self.enc.out.write_all(&v)?;
        }
        self.enc.tag(b'e')
    }
}

impl<W: Write> ser::SerializeMap for Dict<'_, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Error> {
        self.key = Some(key.serialize(KeyBytes)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let key = self.key.take().ok_or(Error::ValueWithoutKey)?;
        self.entries.insert(key, encode_nested(value)?);
        Ok(())
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<W: Write> ser::SerializeStruct for Dict<'_, W> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.entries
            .insert(key.as_bytes().to_vec(), encode_nested(value)?);
        Ok(())
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

macro_rules! encode_ints {
    ($($method:ident: $ty:ty),*) => {
        $(fn $method(self, v: $ty) -> Result<(), Error> {
            self.int(v)
        })*
    };
}

macro_rules! unsupported {
    ($($method:ident($($arg:ty),*) -> $ret:ty: $what:literal),* $(,)?) => {
        $(fn $method(self, $(_: $arg),*) -> Result<$ret, Error> {
            Err(Error::Unsupported($what))
        })*
    };
}

impl<'a, W: Write> ser::Serializer for &'a mut Encoder<W> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = List<'a, W>;
    type SerializeTuple = List<'a, W>;
    type SerializeTupleStruct = Impossible<(), Error>;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Dict<'a, W>;
    type SerializeStruct = Dict<'a, W>;
    type SerializeStructVariant = Impossible<(), Error>;

    encode_ints!(
        serialize_i8: i8, serialize_i16: i16, serialize_i32: i32, serialize_i64: i64,
        serialize_u8: u8, serialize_u16: u16, serialize_u32: u32
    );

    // Decoders read integers as i64.
    fn serialize_u64(self, v: u64) -> Result<(), Error> {
        let v = i64::try_from(v).map_err(|_| Error::IntegerOutOfRange(v))?;
        self.int(v)
    }

    unsupported!(
        serialize_f32(f32) -> (): "floats",
        serialize_f64(f64) -> (): "floats",
        serialize_char(char) -> (): "chars",
        serialize_none() -> (): "None",
        serialize_unit() -> (): "()",
        serialize_unit_struct(&'static str) -> (): "unit structs",
        serialize_unit_variant(&'static str, u32, &'static str) -> (): "enums",
        serialize_tuple_struct(&'static str, usize) -> Self::SerializeTupleStruct: "tuple structs",
        serialize_tuple_variant(&'static str, u32, &'static str, usize) -> Self::SerializeTupleVariant: "enums",
        serialize_struct_variant(&'static str, u32, &'static str, usize) -> Self::SerializeStructVariant: "enums",
    );

    fn serialize_bool(self, v: bool) -> Result<(), Error> {
        self.int(u8::from(v))
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.string(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), Error> {
        self.string(v)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("enums"))
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<List<'a, W>, Error> {
        self.tag(b'l')?;
        Ok(List { enc: self })
    }

    fn serialize_tuple(self, _: usize) -> Result<List<'a, W>, Error> {
        self.tag(b'l')?;
        Ok(List { enc: self })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Dict<'a, W>, Error> {
        Ok(Dict {
            enc: self,
            entries: BTreeMap::new(),
            key: None,
        })
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Dict<'a, W>, Error> {
        Ok(Dict {
            enc: self,
            entries: BTreeMap::new(),
            key: None,
        })
    }
}

/// Accepts only strings and byte strings, producing the raw key bytes.
struct KeyBytes;

impl ser::Serializer for KeyBytes {
    type Ok = Vec<u8>;
    type Error = Error;
    type SerializeSeq = Impossible<Vec<u8>, Error>;
    type SerializeTuple = Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = Impossible<Vec<u8>, Error>;
    type SerializeMap = Impossible<Vec<u8>, Error>;
    type SerializeStruct = Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>, Error> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(v.to_vec())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, Error> {
        value.serialize(self)
    }

    fn serialize_bool(self, _: bool) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_i8(self, _: i8) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_i16(self, _: i16) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_i32(self, _: i32) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_i64(self, _: i64) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_u8(self, _: u8) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_u16(self, _: u16) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_u32(self, _: u32) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_u64(self, _: u64) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_f32(self, _: f32) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_f64(self, _: f64) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_char(self, _: char) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_none(self) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, _: &T) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_unit(self) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<Vec<u8>, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct, Error> {
        Err(Error::KeyNotBytes)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(Error::KeyNotBytes)
    }
}

pub fn bencode_serialize_to_writer<T: Serialize, W: Write>(
    value: T,
    writer: &mut W,
) -> Result<(), Error> {
    value.serialize(&mut Encoder { out: writer })
}

pub fn bencode_serialize_to_vec<T: Serialize>(value: T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    bencode_serialize_to_writer(value, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Serialize;

    use crate::{ByteBuf, ByteBufOwned, SerializeError, bencode_serialize_to_vec};

    fn enc<T: Serialize>(value: T) -> Vec<u8> {
        bencode_serialize_to_vec(value).unwrap()
    }

    #[test]
    fn test_ints() {
        assert_eq!(enc(42u16), b"i42e");
        assert_eq!(enc(-7i32), b"i-7e");
        assert_eq!(enc(0i64), b"i0e");
        assert_eq!(enc(i64::MAX), b"i9223372036854775807e");
        assert_eq!(enc(i64::MIN), b"i-9223372036854775808e");
        assert_eq!(enc(true), b"i1e");
    }

    #[test]
    fn test_strings() {
        assert_eq!(enc(ByteBuf(b"abc")), b"3:abc");
        assert_eq!(enc(ByteBufOwned::from(&b"abc"[..])), b"3:abc");
        assert_eq!(enc("ping"), b"4:ping");
        assert_eq!(enc(ByteBuf(b"")), b"0:");
    }

    #[test]
    fn test_lists() {
        assert_eq!(enc([ByteBuf(b"foo"), ByteBuf(b"bar")]), b"l3:foo3:bare");
        assert_eq!(enc((1u8, "x")), b"li1e1:xe");
        assert_eq!(enc(Vec::<u8>::new()), b"le");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let m = BTreeMap::from([("zz", 1), ("a", 2), ("m", 3)]);
        assert_eq!(enc(&m), b"d1:ai2e1:mi3e2:zzi1ee");

        #[derive(Serialize)]
        struct Unsorted<'a> {
            y: u8,
            t: ByteBuf<'a>,
            #[serde(skip_serializing_if = "Option::is_none")]
            r: Option<u8>,
            a: u8,
        }
        assert_eq!(
            enc(Unsorted {
                y: 1,
                t: ByteBuf(b"aa"),
                r: None,
                a: 3
            }),
            b"d1:ai3e1:t2:aa1:yi1ee"
        );
    }

    #[test]
    fn test_u64_beyond_i64_is_rejected() {
        assert_eq!(enc(i64::MAX as u64), b"i9223372036854775807e");
        assert_eq!(
            crate::from_bytes::<u64>(&enc(i64::MAX as u64)).unwrap(),
            i64::MAX as u64
        );
        assert!(matches!(
            bencode_serialize_to_vec(u64::MAX),
            Err(SerializeError::IntegerOutOfRange(u64::MAX))
        ));
        assert!(matches!(
            bencode_serialize_to_vec(i64::MAX as u64 + 1),
            Err(SerializeError::IntegerOutOfRange(_))
        ));
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(
            bencode_serialize_to_vec(1.5f64),
            Err(SerializeError::Unsupported(_))
        ));
        assert!(matches!(
            bencode_serialize_to_vec(None::<u8>),
            Err(SerializeError::Unsupported(_))
        ));
        assert!(matches!(
            bencode_serialize_to_vec(BTreeMap::from([(1u8, 2u8)])),
            Err(SerializeError::KeyNotBytes)
        ));
    }
}
