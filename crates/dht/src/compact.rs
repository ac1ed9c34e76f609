// Fixed-width binary encodings of addresses and node records as they appear
// inside bencoded byte strings.

use std::{
    marker::PhantomData,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use serde::{Deserialize, Serialize};

mod small_slice {
    pub struct SmallSlice<const N: usize> {
        data: [u8; N],
        len: usize,
    }

    impl<const N: usize> AsRef<[u8]> for SmallSlice<N> {
        fn as_ref(&self) -> &[u8] {
            &self.data[..self.len]
        }
    }

    impl<const N: usize> SmallSlice<N> {
        pub fn new_from_buf(buf: &[u8]) -> Self {
            let mut s = Self {
                data: [0u8; N],
                len: 0,
            };
            s.extend(buf);
            s
        }

        // Callers never exceed N, the input is truncated if they do.
        pub fn extend(&mut self, buf: &[u8]) {
            let n = buf.len().min(N - self.len);
            self.data[self.len..self.len + n].copy_from_slice(&buf[..n]);
            self.len += n;
        }
    }
}

pub use small_slice::SmallSlice;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Compact<T>(pub T);

impl<T> From<T> for Compact<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Compact<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub trait CompactSerialize: Sized {
    type Slice: AsRef<[u8]>;

    fn expecting() -> &'static str;
    fn as_slice(&self) -> Self::Slice;
    /// Decodes exactly `buf`, `None` if its length is wrong.
    fn from_slice(buf: &[u8]) -> Option<Self>;
}

pub trait CompactSerializeFixedLen {
    fn fixed_len() -> usize;
}

fn array<const N: usize>(buf: &[u8]) -> Option<[u8; N]> {
    buf.try_into().ok()
}

impl CompactSerialize for Ipv4Addr {
    type Slice = [u8; 4];

    fn as_slice(&self) -> Self::Slice {
        self.octets()
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        array::<4>(buf).map(Self::from)
    }

    fn expecting() -> &'static str {
        "4 bytes for IPv4"
    }
}

impl CompactSerializeFixedLen for Ipv4Addr {
    fn fixed_len() -> usize {
        4
    }
}

impl CompactSerialize for Ipv6Addr {
    type Slice = [u8; 16];

    fn as_slice(&self) -> Self::Slice {
        self.octets()
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        array::<16>(buf).map(Self::from)
    }

    fn expecting() -> &'static str {
        "16 bytes for IPv6"
    }
}

impl CompactSerializeFixedLen for Ipv6Addr {
    fn fixed_len() -> usize {
        16
    }
}

impl CompactSerialize for IpAddr {
    type Slice = SmallSlice<16>;

    fn as_slice(&self) -> Self::Slice {
        match self {
            IpAddr::V4(a) => SmallSlice::new_from_buf(&a.as_slice()),
            IpAddr::V6(a) => SmallSlice::new_from_buf(&a.as_slice()),
        }
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        match buf.len() {
            4 => Ipv4Addr::from_slice(buf).map(Into::into),
            16 => Ipv6Addr::from_slice(buf).map(Into::into),
            _ => None,
        }
    }

    fn expecting() -> &'static str {
        "16 bytes for IPv6 or 4 bytes for IPv4"
    }
}

impl CompactSerialize for SocketAddrV4 {
    type Slice = [u8; 6];

    fn as_slice(&self) -> Self::Slice {
        let mut data = [0u8; 6];
        data[..4].copy_from_slice(&self.ip().octets());
        data[4..6].copy_from_slice(&self.port().to_be_bytes());
        data
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        let buf = array::<6>(buf)?;
        let ip = Ipv4Addr::from_slice(&buf[..4])?;
        Some(SocketAddrV4::new(ip, u16::from_be_bytes([buf[4], buf[5]])))
    }

    fn expecting() -> &'static str {
        "6 bytes for SocketAddrV4"
    }
}

impl CompactSerializeFixedLen for SocketAddrV4 {
    fn fixed_len() -> usize {
        6
    }
}

impl CompactSerialize for SocketAddrV6 {
    type Slice = [u8; 18];

    fn as_slice(&self) -> Self::Slice {
        let mut data = [0u8; 18];
        data[..16].copy_from_slice(&self.ip().octets());
        data[16..18].copy_from_slice(&self.port().to_be_bytes());
        data
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        let buf = array::<18>(buf)?;
        let ip = Ipv6Addr::from_slice(&buf[..16])?;
        Some(SocketAddrV6::new(
            ip,
            u16::from_be_bytes([buf[16], buf[17]]),
            0,
            0,
        ))
    }

    fn expecting() -> &'static str {
        "18 bytes for SocketAddrV6"
    }
}

impl CompactSerializeFixedLen for SocketAddrV6 {
    fn fixed_len() -> usize {
        18
    }
}

impl CompactSerialize for SocketAddr {
    type Slice = SmallSlice<18>;

    fn as_slice(&self) -> Self::Slice {
        let mut s = SmallSlice::new_from_buf(self.ip().as_slice().as_ref());
        s.extend(&self.port().to_be_bytes());
        s
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        match buf.len() {
            6 => SocketAddrV4::from_slice(buf).map(Into::into),
            18 => SocketAddrV6::from_slice(buf).map(Into::into),
            _ => None,
        }
    }

    fn expecting() -> &'static str {
        "6 bytes for SocketAddrV4 or 18 bytes for SocketAddrV6"
    }
}

impl<T: CompactSerialize> Serialize for Compact<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.0.as_slice().as_ref())
    }
}

impl<'de, T: CompactSerialize> Deserialize<'de> for Compact<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor<T> {
            phantom: PhantomData<T>,
        }

        impl<T: CompactSerialize> serde::de::Visitor<'_> for Visitor<T> {
            type Value = Compact<T>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str(T::expecting())
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                T::from_slice(v)
                    .map(Compact)
                    .ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_bytes(Visitor {
            phantom: PhantomData,
        })
    }
}

/// Records of fixed width concatenated into one byte string.
#[derive(Clone, PartialEq, Eq)]
pub struct CompactList<T>(pub Vec<T>);

impl<T> Default for CompactList<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for CompactList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<T> CompactList<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T> IntoIterator for CompactList<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T: CompactSerialize + CompactSerializeFixedLen> CompactList<T> {
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let width = T::fixed_len();
        if width == 0 || buf.len() % width != 0 {
            return None;
        }
        buf.chunks_exact(width)
            .map(T::from_slice)
            .collect::<Option<Vec<_>>>()
            .map(CompactList)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * T::fixed_len());
        for item in self.0.iter() {
            out.extend_from_slice(item.as_slice().as_ref());
        }
        out
    }
}

impl<T: CompactSerialize + CompactSerializeFixedLen> Serialize for CompactList<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de, T: CompactSerialize + CompactSerializeFixedLen> Deserialize<'de> for CompactList<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor<T> {
            phantom: PhantomData<T>,
        }

        impl<T: CompactSerialize + CompactSerializeFixedLen> serde::de::Visitor<'_> for Visitor<T> {
            type Value = CompactList<T>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(
                    formatter,
                    "a byte string of {} byte records ({})",
                    T::fixed_len(),
                    T::expecting()
                )
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                CompactList::from_bytes(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_bytes(Visitor {
            phantom: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4};

    use super::*;

    #[test]
    fn test_ip_addr() {
        let v4: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let v6: IpAddr = Ipv6Addr::LOCALHOST.into();
        assert_eq!(v4.as_slice().as_ref(), &[10, 0, 0, 1]);
        assert_eq!(IpAddr::from_slice(v4.as_slice().as_ref()), Some(v4));
        assert_eq!(IpAddr::from_slice(v6.as_slice().as_ref()), Some(v6));
        assert_eq!(IpAddr::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_socket_addr() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 8337);
        assert_eq!(addr.as_slice(), [1, 2, 3, 4, 0x20, 0x91]);
        assert_eq!(SocketAddrV4::from_slice(&addr.as_slice()), Some(addr));
        assert_eq!(SocketAddrV4::from_slice(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_compact_list_rejects_partial_records() {
        let addrs = CompactList(vec![
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 1),
            SocketAddrV4::new(Ipv4Addr::new(5, 6, 7, 8), 2),
        ]);
        let bytes = addrs.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(CompactList::<SocketAddrV4>::from_bytes(&bytes), Some(addrs));
        assert_eq!(CompactList::<SocketAddrV4>::from_bytes(&bytes[..11]), None);
        assert_eq!(
            CompactList::<SocketAddrV4>::from_bytes(&[]),
            Some(CompactList::default())
        );
    }

    #[test]
    fn test_compact_bencode() {
        let ip = Compact(IpAddr::from(Ipv4Addr::new(127, 0, 0, 1)));
        let buf = bencode::bencode_serialize_to_vec(ip).unwrap();
        assert_eq!(buf, b"4:\x7f\x00\x00\x01");
        let back: Compact<IpAddr> = bencode::from_bytes(&buf).unwrap();
        assert_eq!(back, ip);
        assert!(bencode::from_bytes::<Compact<IpAddr>>(b"3:abc").is_err());
    }
}
