use bencode::SerializeError;

use crate::{bprotocol::DecodeError, config::InvalidTunables};

#[derive(thiserror::Error, Debug)]
#[error("error looking up {hostname}: {err:#}")]
pub struct LookupError {
    hostname: Box<str>,
    #[source]
    err: std::io::Error,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error binding UDP socket: {0:#}")]
    Bind(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] InvalidTunables),

    #[error("{0} failed: {1:?}")]
    TaskFailed(&'static &'static str, #[source] Box<Error>),

    #[error("{0} finished unexpectedly with no error")]
    TaskQuit(&'static &'static str),

    #[error("dht is dead")]
    DhtDead,

    #[error(transparent)]
    BootstrapLookup(Box<LookupError>),

    #[error("error with the identity file: {0:#}")]
    Persistence(anyhow::Error),

    #[error("error sending: {0:#}")]
    Send(#[source] std::io::Error),
    #[error("error in recv: {0:#}")]
    Recv(#[source] std::io::Error),

    #[error("bencode serialize error: {0:#}")]
    Serialize(#[source] Box<SerializeError>),

    #[error("error decoding message: {0:#}")]
    Deserialize(#[source] Box<DecodeError>),
}

impl From<SerializeError> for Error {
    fn from(value: SerializeError) -> Self {
        Error::Serialize(Box::new(value))
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Error::Deserialize(Box::new(value))
    }
}

impl Error {
    pub fn lookup(hostname: &str, err: std::io::Error) -> Error {
        Error::BootstrapLookup(Box::new(LookupError {
            hostname: hostname.into(),
            err,
        }))
    }

    pub fn task_finished(name: &'static &'static str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Err(Error::TaskQuit(name)),
            Err(e) => Err(Error::TaskFailed(name, Box::new(e))),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
