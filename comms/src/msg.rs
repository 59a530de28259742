use std::{borrow::Cow, io};

type Kind = u64;
const KIND_SIZE: usize = size_of::<Kind>();

const ERR_KIND: Kind = 0;
const CONTROL_KIND: Kind = 1;
const TENSOR_KIND: Kind = 2;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Tensor(&'a [f64]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello { rank: usize, world_size: usize },
    Disconnect,
}

/// A message exchanged between two workers of a mesh.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl<'a> Msg<'a> {
    /// Returns a short human readable name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Tensor(_)) => "data/tensor",
            Msg::Err(_) => "err",
        }
    }

    /// Appends the kind and any encoded body of this message to `head`.
    ///
    /// # Returns
    /// The bytes that complete the frame after `head`, borrowed from the message.
    pub(crate) fn encode<'m>(&'m self, head: &mut Vec<u8>) -> io::Result<&'m [u8]> {
        match self {
            Msg::Err(detail) => {
                head.extend_from_slice(&ERR_KIND.to_be_bytes());
                Ok(detail.as_bytes())
            }
            Msg::Control(cmd) => {
                head.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(head, cmd)?;
                Ok(&[])
            }
            Msg::Data(Payload::Tensor(values)) => {
                head.extend_from_slice(&TENSOR_KIND.to_be_bytes());
                Ok(bytemuck::cast_slice(values))
            }
        }
    }

    /// Decodes a frame, without its length prefix.
    ///
    /// `frame` must be 8 bytes aligned for tensor values to be borrowed out of it.
    pub(crate) fn decode(frame: &'a [u8]) -> io::Result<Self> {
        let Some((kind, body)) = frame.split_first_chunk::<KIND_SIZE>() else {
            return Err(invalid(format!(
                "a frame of {} bytes is too short, must at least be {KIND_SIZE} bytes",
                frame.len()
            )));
        };

        match Kind::from_be_bytes(*kind) {
            ERR_KIND => {
                let detail = std::str::from_utf8(body).map_err(|e| invalid(e.to_string()))?;
                Ok(Msg::Err(Cow::Borrowed(detail)))
            }
            CONTROL_KIND => Ok(Msg::Control(serde_json::from_slice(body)?)),
            TENSOR_KIND => {
                let values = bytemuck::try_cast_slice(body)
                    .map_err(|e| invalid(format!("bad tensor payload: {e}")))?;
                Ok(Msg::Data(Payload::Tensor(values)))
            }
            kind => Err(invalid(format!("received an invalid kind {kind}"))),
        }
    }
}

fn invalid(detail: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}
