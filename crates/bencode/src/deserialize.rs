use memchr::memchr;

/// Maximum nesting of lists and dictionaries accepted from the wire.
pub const MAX_DEPTH: usize = 32;

pub struct BencodeDeserializer<'de> {
    buf: &'de [u8],
    depth: usize,
}

impl<'de> BencodeDeserializer<'de> {
    pub fn new_from_buf(buf: &'de [u8]) -> BencodeDeserializer<'de> {
        Self { buf, depth: 0 }
    }

    fn advance(&mut self, n: usize) {
        self.buf = self.buf.get(n..).unwrap_or_default();
    }

    fn enter(&mut self) -> Result<(), Error> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        self.depth += 1;
        self.advance(1);
        Ok(())
    }

    // Consumes the "e" terminating a list or dict, if it's next.
    fn try_leave(&mut self) -> Result<bool, Error> {
        match self.buf.first() {
            Some(b'e') => {
                self.depth = self.depth.saturating_sub(1);
                self.advance(1);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::new_str(&"unterminated list or dict")),
        }
    }

    fn parse_integer(&mut self) -> Result<i64, Error> {
        if !self.buf.starts_with(b"i") {
            return Err(Error::new_str(&"expected bencode int"));
        }
        let end = memchr(b'e', self.buf).ok_or(Error::new_str(&"error parsing integer: eof"))?;
        let value = parse_canonical_int(&self.buf[1..end])?;
        self.advance(end + 1);
        Ok(value)
    }

    fn parse_bytes(&mut self) -> Result<&'de [u8], Error> {
        match self.buf.first().copied() {
            Some(b'0'..=b'9') => {}
            Some(_) => return Err(Error::new_str(&"expected byte string length")),
            None => return Err(Error::new_str(&"expected byte string, got eof")),
        };
        let length_delim =
            memchr(b':', self.buf).ok_or(Error::new_str(&"byte string: expected colon"))?;
        let length = parse_canonical_len(&self.buf[..length_delim])?;
        let bytes_start = length_delim + 1;
        let bytes_end = bytes_start
            .checked_add(length)
            .ok_or(Error::InvalidLength(length))?;
        let buf = self.buf;
        let bytes = buf
            .get(bytes_start..bytes_end)
            .ok_or(Error::Truncated { needed: length })?;
        self.advance(bytes_end);
        Ok(bytes)
    }
}

// "i-0e", "i03e", "ie" and overflowing values are all rejected.
fn parse_canonical_int(digits: &[u8]) -> Result<i64, Error> {
    let (negative, magnitude) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    match magnitude {
        [] => return Err(Error::NonCanonicalInteger),
        [b'0'] if negative => return Err(Error::NonCanonicalInteger),
        [b'0', _, ..] => return Err(Error::NonCanonicalInteger),
        _ => {}
    }
    if !magnitude.iter().all(u8::is_ascii_digit) {
        return Err(Error::NonCanonicalInteger);
    }
    // Only ASCII digits and an optional sign at this point.
    let s = std::str::from_utf8(digits).map_err(|_| Error::NonCanonicalInteger)?;
    s.parse::<i64>().map_err(|_| Error::IntegerOverflow)
}

fn parse_canonical_len(digits: &[u8]) -> Result<usize, Error> {
    match digits {
        [] => return Err(Error::new_str(&"byte string: empty length")),
        [b'0', _, ..] => return Err(Error::NonCanonicalInteger),
        _ => {}
    }
    let mut len: usize = 0;
    for d in digits {
        if !d.is_ascii_digit() {
            return Err(Error::new_str(&"byte string: expected int length"));
        }
        len = len
            .checked_mul(10)
            .and_then(|l| l.checked_add((d - b'0') as usize))
            .ok_or(Error::IntegerOverflow)?;
    }
    Ok(len)
}

pub fn from_bytes<'a, T>(buf: &'a [u8]) -> Result<T, Error>
where
    T: serde::de::Deserialize<'a>,
{
    let mut de = BencodeDeserializer::new_from_buf(buf);
    let v = T::deserialize(&mut de)?;
    if !de.buf.is_empty() {
        return Err(Error::BytesRemaining(de.buf.len()));
    }
    Ok(v)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is not supported by bencode")]
    NotSupported(&'static &'static str),
    #[error("{0}")]
    StaticStr(&'static &'static str),
    #[error("{0}")]
    Custom(Box<String>), // box to reduce size
    #[error("expected 0 or 1 for boolean, got {0}")]
    InvalidBool(i64),
    #[error("deserialized successfully, but {0} bytes remaining")]
    BytesRemaining(usize),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("not enough data: byte string needs {needed} bytes")]
    Truncated { needed: usize },
    #[error("non-canonical integer")]
    NonCanonicalInteger,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
}

impl Error {
    fn new_str(msg: &'static &'static str) -> Self {
        Error::StaticStr(msg)
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        Self::Custom(Box::new(msg.to_string()))
    }
}

impl<'de> serde::de::Deserializer<'de> for &mut BencodeDeserializer<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.buf.first().copied() {
            Some(b'd') => self.deserialize_map(visitor),
            Some(b'i') => self.deserialize_i64(visitor),
            Some(b'l') => self.deserialize_seq(visitor),
            Some(_) => self.deserialize_bytes(visitor),
            None => Err(Error::new_str(&"unexpected eof")),
        }
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let value = self.parse_integer()?;
        if !(0..=1).contains(&value) {
            return Err(Error::InvalidBool(value));
        }
        visitor.visit_bool(value == 1)
    }

    fn deserialize_i8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        visitor.visit_i64(self.parse_integer()?)
    }

    fn deserialize_u8<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u16<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u32<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u64<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_i64(visitor)
    }

    fn deserialize_f32<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"floats"))
    }

    fn deserialize_f64<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"floats"))
    }

    fn deserialize_char<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"chars"))
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let b = self.parse_bytes()?;
        let s = std::str::from_utf8(b).map_err(|_| Error::new_str(&"invalid utf-8"))?;
        visitor.visit_borrowed_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let b = self.parse_bytes()?;
        visitor.visit_borrowed_bytes(b)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        visitor.visit_some(&mut *self)
    }

    fn deserialize_unit<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"unit types"))
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"unit structs"))
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        if !self.buf.starts_with(b"l") {
            return Err(Error::new_str(&"expected \"l\" as start of list"));
        }
        self.enter()?;
        visitor.visit_seq(SeqAccess { de: self })
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        if !self.buf.starts_with(b"d") {
            return Err(Error::new_str(&"expected bencode dict"));
        }
        self.enter()?;
        visitor.visit_map(MapAccess { de: self })
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(Error::NotSupported(&"enums"))
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        let name = self.parse_bytes()?;
        visitor.visit_borrowed_bytes(name)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        self.deserialize_any(visitor)
    }
}

struct MapAccess<'a, 'de> {
    de: &'a mut BencodeDeserializer<'de>,
}

struct SeqAccess<'a, 'de> {
    de: &'a mut BencodeDeserializer<'de>,
}

impl<'de> serde::de::MapAccess<'de> for MapAccess<'_, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: serde::de::DeserializeSeed<'de>,
    {
        if self.de.try_leave()? {
            return Ok(None);
        }
        // Dict keys are always byte strings.
        if !matches!(self.de.buf.first(), Some(b'0'..=b'9')) {
            return Err(Error::new_str(&"dict key must be a byte string"));
        }
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::DeserializeSeed<'de>,
    {
        if self.de.buf.is_empty() {
            return Err(Error::new_str(&"dict key without value"));
        }
        seed.deserialize(&mut *self.de)
    }
}

impl<'de> serde::de::SeqAccess<'de> for SeqAccess<'_, 'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: serde::de::DeserializeSeed<'de>,
    {
        if self.de.try_leave()? {
            return Ok(None);
        }
        Ok(Some(seed.deserialize(&mut *self.de)?))
    }
}
