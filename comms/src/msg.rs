use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::group::{JoinSpec, Rejection},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const GRADIENT: Header = 2;
const PARAMS: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Locally computed gradients to be averaged across the group.
    Gradient(&'a [f32]),
    /// Model parameters to be broadcast from rank 0.
    Params(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join(JoinSpec),
    Welcome { world_size: usize },
    Reject(Rejection),
    Barrier { seq: u64 },
    Release { seq: u64 },
    Leave,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of this message's kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Data(Payload::Params(_)) => "data/params",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Gradient(grad) => (GRADIENT, *grad),
                    Payload::Params(params) => (PARAMS, *params),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ (GRADIENT | PARAMS) => {
                let nums: &[f32] = bytemuck::try_cast_slice(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}"))
                })?;

                let payload = if kind == GRADIENT {
                    Payload::Gradient(nums)
                } else {
                    Payload::Params(nums)
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}
