use std::{
    io::Write,
    net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bencode::{ByteBuf, ByteBufOwned, ByteBufT};
use serde::{
    Deserialize, Serialize,
    de::{IgnoredAny, Unexpected},
};

use crate::{
    compact::{Compact, CompactList, CompactSerialize, CompactSerializeFixedLen},
    id20::Id20,
};

pub const ERROR_GENERIC: i32 = 201;
pub const ERROR_PROTOCOL: i32 = 203;
pub const ERROR_METHOD_UNKNOWN: i32 = 204;

#[derive(Debug)]
enum MessageType {
    Request,
    Response,
    Error,
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = MessageType;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, r#""q", "e" or "r" bencode string"#)
            }
            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let msg = match v {
                    b"q" => MessageType::Request,
                    b"r" => MessageType::Response,
                    b"e" => MessageType::Error,
                    _ => return Err(E::invalid_value(Unexpected::Bytes(v), &self)),
                };
                Ok(msg)
            }
        }
        deserializer.deserialize_bytes(Visitor {})
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            MessageType::Request => serializer.serialize_bytes(b"q"),
            MessageType::Response => serializer.serialize_bytes(b"r"),
            MessageType::Error => serializer.serialize_bytes(b"e"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescription {
    pub code: i32,
    pub description: ByteBufOwned,
}

impl ErrorDescription {
    pub fn new(code: i32, description: &str) -> Self {
        Self {
            code,
            description: ByteBufOwned::from(description.as_bytes()),
        }
    }
}

impl Serialize for ErrorDescription {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (self.code, &self.description).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorDescription {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = ErrorDescription;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, r#"a list [i32, string]"#)
            }
            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                use serde::de::Error;
                let code = match seq.next_element::<i32>()? {
                    Some(code) => code,
                    None => return Err(A::Error::invalid_length(0, &self)),
                };
                let description = match seq.next_element::<ByteBufOwned>()? {
                    Some(d) => d,
                    None => return Err(A::Error::invalid_length(1, &self)),
                };
                // The type doesn't matter here, we are just making sure the list is over.
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }
                Ok(ErrorDescription { code, description })
            }
        }
        deserializer.deserialize_seq(Visitor)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMessage<BufT, Args = IgnoredAny, Resp = IgnoredAny> {
    #[serde(rename = "y")]
    message_type: MessageType,
    #[serde(rename = "t")]
    transaction_id: BufT,
    #[serde(rename = "e", skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDescription>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    response: Option<Resp>,
    #[serde(rename = "q", skip_serializing_if = "Option::is_none")]
    method_name: Option<BufT>,
    #[serde(rename = "a", skip_serializing_if = "Option::is_none")]
    arguments: Option<Args>,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    version: Option<BufT>,
}

// Used to salvage the transaction id of a message that failed to decode.
#[derive(Deserialize)]
struct TransactionIdOnly<'a> {
    #[serde(rename = "t", borrow)]
    transaction_id: ByteBuf<'a>,
    #[serde(rename = "y", borrow)]
    message_type: Option<ByteBuf<'a>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node<A> {
    pub id: Id20,
    pub addr: A,
}

impl<A: Into<SocketAddr> + Copy> Node<A> {
    pub fn as_socketaddr(&self) -> Node<SocketAddr> {
        Node {
            id: self.id,
            addr: self.addr.into(),
        }
    }
}

pub type CompactNodeInfo<A> = CompactList<Node<A>>;

impl<A: CompactSerialize + CompactSerializeFixedLen> CompactSerialize for Node<A> {
    type Slice = Vec<u8>;

    fn expecting() -> &'static str {
        "20 byte id followed by a compact address"
    }

    fn as_slice(&self) -> Self::Slice {
        let mut data = Vec::with_capacity(Self::fixed_len());
        data.extend_from_slice(&self.id.0);
        data.extend_from_slice(self.addr.as_slice().as_ref());
        data
    }

    fn from_slice(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::fixed_len() {
            return None;
        }
        let (id, addr) = buf.split_at(20);
        Some(Node {
            id: Id20::from_bytes(id)?,
            addr: A::from_slice(addr)?,
        })
    }
}

impl<A: CompactSerializeFixedLen> CompactSerializeFixedLen for Node<A> {
    fn fixed_len() -> usize {
        20 + A::fixed_len()
    }
}

impl<A: core::fmt::Debug> core::fmt::Debug for Node<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}={:?}", self.addr, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: Id20,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub id: Id20,
    pub target: Id20,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub id: Id20,
    pub target: Id20,
}

/// Asks the receiver to serve `target` at `addr` (or at the packet's source
/// address) for `ttl` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub id: Id20,
    pub target: Id20,
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<Compact<IpAddr>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Response {
    pub id: Id20,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<Compact<IpAddr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<CompactNodeInfo<SocketAddrV4>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes6: Option<CompactNodeInfo<SocketAddrV6>>,
}

impl Response {
    /// Builds the `nodes`/`nodes6` lists, leaving out empty ones.
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = Node<SocketAddr>>) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for node in nodes {
            match node.addr {
                SocketAddr::V4(addr) => v4.push(Node { id: node.id, addr }),
                SocketAddr::V6(addr) => v6.push(Node { id: node.id, addr }),
            }
        }
        self.nodes = (!v4.is_empty()).then_some(CompactList(v4));
        self.nodes6 = (!v6.is_empty()).then_some(CompactList(v6));
        self
    }

    /// All nodes of both address families.
    pub fn all_nodes(&self) -> impl Iterator<Item = Node<SocketAddr>> + '_ {
        let v4 = self.nodes.iter().flat_map(|l| l.iter().map(Node::as_socketaddr));
        let v6 = self
            .nodes6
            .iter()
            .flat_map(|l| l.iter().map(Node::as_socketaddr));
        v4.chain(v6)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    PingRequest(PingRequest),
    FindNodeRequest(FindNodeRequest),
    GetRequest(GetRequest),
    AnnounceRequest(AnnounceRequest),
    Response(Response),
    Error(ErrorDescription),
}

impl MessageKind {
    /// The wire method name for requests.
    pub fn method_name(&self) -> Option<&'static str> {
        match self {
            MessageKind::PingRequest(_) => Some("ping"),
            MessageKind::FindNodeRequest(_) => Some("find_node"),
            MessageKind::GetRequest(_) => Some("get"),
            MessageKind::AnnounceRequest(_) => Some("announce"),
            MessageKind::Response(_) | MessageKind::Error(_) => None,
        }
    }

    /// The sender's id, for messages that carry one.
    pub fn sender_id(&self) -> Option<Id20> {
        match self {
            MessageKind::PingRequest(r) => Some(r.id),
            MessageKind::FindNodeRequest(r) => Some(r.id),
            MessageKind::GetRequest(r) => Some(r.id),
            MessageKind::AnnounceRequest(r) => Some(r.id),
            MessageKind::Response(r) => Some(r.id),
            MessageKind::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub transaction_id: ByteBufOwned,
    pub version: Option<ByteBufOwned>,
}

impl Message {
    // This implies that the transaction id was generated by us.
    pub fn get_our_transaction_id(&self) -> Option<u16> {
        transaction_id_to_u16(self.transaction_id.as_slice())
    }
}

pub fn transaction_id_to_u16(tid: &[u8]) -> Option<u16> {
    let tid: [u8; 2] = tid.try_into().ok()?;
    Some(u16::from_be_bytes(tid))
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeErrorKind {
    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::DeserializeError),
    #[error("unknown method {0:?}")]
    UnknownMethod(ByteBufOwned),
    #[error("{0}")]
    Shape(&'static str),
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}")]
pub struct DecodeError {
    /// Set if the datagram was recognizably a request, so the sender can be
    /// told about the error.
    pub request_transaction_id: Option<ByteBufOwned>,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    fn new(buf: &[u8], kind: impl Into<DecodeErrorKind>) -> Self {
        let request_transaction_id = bencode::from_bytes::<TransactionIdOnly>(buf)
            .ok()
            .filter(|t| t.message_type.map(|y| y.as_slice() == b"q").unwrap_or(false))
            .map(|t| t.transaction_id.to_owned_buf());
        Self {
            request_transaction_id,
            kind: kind.into(),
        }
    }

    /// The error code to reply with.
    pub fn code(&self) -> i32 {
        match self.kind {
            DecodeErrorKind::UnknownMethod(_) => ERROR_METHOD_UNKNOWN,
            _ => ERROR_PROTOCOL,
        }
    }
}

fn serialize_raw<W: Write, Args: Serialize, Resp: Serialize>(
    writer: &mut W,
    msg: RawMessage<ByteBufOwned, Args, Resp>,
) -> crate::Result<()> {
    Ok(bencode::bencode_serialize_to_writer(msg, writer)?)
}

fn request<Args>(
    transaction_id: ByteBufOwned,
    version: Option<ByteBufOwned>,
    method_name: &'static [u8],
    args: Args,
) -> RawMessage<ByteBufOwned, Args, ()> {
    RawMessage {
        message_type: MessageType::Request,
        transaction_id,
        error: None,
        response: None,
        method_name: Some(ByteBufOwned::from(method_name)),
        arguments: Some(args),
        version,
    }
}

pub fn serialize_message<W: Write>(writer: &mut W, msg: Message) -> crate::Result<()> {
    let Message {
        kind,
        transaction_id,
        version,
    } = msg;
    match kind {
        MessageKind::Error(e) => serialize_raw::<_, (), ()>(
            writer,
            RawMessage {
                message_type: MessageType::Error,
                transaction_id,
                error: Some(e),
                response: None,
                method_name: None,
                arguments: None,
                version,
            },
        ),
        MessageKind::Response(resp) => serialize_raw::<_, (), _>(
            writer,
            RawMessage {
                message_type: MessageType::Response,
                transaction_id,
                error: None,
                response: Some(resp),
                method_name: None,
                arguments: None,
                version,
            },
        ),
        MessageKind::PingRequest(req) => {
            serialize_raw(writer, request(transaction_id, version, b"ping", req))
        }
        MessageKind::FindNodeRequest(req) => {
            serialize_raw(writer, request(transaction_id, version, b"find_node", req))
        }
        MessageKind::GetRequest(req) => {
            serialize_raw(writer, request(transaction_id, version, b"get", req))
        }
        MessageKind::AnnounceRequest(req) => {
            serialize_raw(writer, request(transaction_id, version, b"announce", req))
        }
    }
}

fn decode_request<'de, Args: Deserialize<'de>>(
    buf: &'de [u8],
    wrap: impl FnOnce(Args) -> MessageKind,
) -> Result<Message, DecodeError> {
    let de: RawMessage<ByteBufOwned, Args> =
        bencode::from_bytes(buf).map_err(|e| DecodeError::new(buf, e))?;
    let args = de
        .arguments
        .ok_or_else(|| DecodeError::new(buf, DecodeErrorKind::Shape("missing arguments")))?;
    Ok(Message {
        transaction_id: de.transaction_id,
        version: de.version,
        kind: wrap(args),
    })
}

/// Decodes one datagram. Never panics, whatever the input.
pub fn deserialize_message(buf: &[u8]) -> Result<Message, DecodeError> {
    let de: RawMessage<ByteBuf> = bencode::from_bytes(buf).map_err(|e| DecodeError::new(buf, e))?;
    let shape_err = |msg| DecodeError::new(buf, DecodeErrorKind::Shape(msg));
    match de.message_type {
        MessageType::Request => match (&de.arguments, &de.method_name, &de.response, &de.error) {
            (Some(_), Some(method_name), None, None) => match method_name.as_slice() {
                b"ping" => decode_request(buf, MessageKind::PingRequest),
                b"find_node" => decode_request(buf, MessageKind::FindNodeRequest),
                b"get" => decode_request(buf, MessageKind::GetRequest),
                b"announce" => decode_request(buf, MessageKind::AnnounceRequest),
                other => Err(DecodeError::new(
                    buf,
                    DecodeErrorKind::UnknownMethod(ByteBufOwned::from(other)),
                )),
            },
            _ => Err(shape_err(
                r#"request must have exactly "a" and "q" set"#,
            )),
        },
        MessageType::Response => match (&de.arguments, &de.response, &de.error) {
            (None, Some(_), None) => {
                let de: RawMessage<ByteBufOwned, IgnoredAny, Response> =
                    bencode::from_bytes(buf).map_err(|e| DecodeError::new(buf, e))?;
                let response = de
                    .response
                    .ok_or_else(|| shape_err("missing response body"))?;
                Ok(Message {
                    transaction_id: de.transaction_id,
                    version: de.version,
                    kind: MessageKind::Response(response),
                })
            }
            _ => Err(shape_err(r#"response must have exactly "r" set"#)),
        },
        MessageType::Error => match (&de.arguments, &de.response, &de.error) {
            (None, None, Some(_)) => {
                let de: RawMessage<ByteBufOwned> =
                    bencode::from_bytes(buf).map_err(|e| DecodeError::new(buf, e))?;
                let error = de.error.ok_or_else(|| shape_err("missing error body"))?;
                Ok(Message {
                    transaction_id: de.transaction_id,
                    version: de.version,
                    kind: MessageKind::Error(error),
                })
            }
            _ => Err(shape_err(r#"error must have exactly "e" set"#)),
        },
    }
}
