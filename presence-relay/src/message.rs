use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::{
    descriptor::{ConnId, EndpointDescriptor},
    envelope::Envelope,
};

/// Frames an endpoint sends to the broker. `Connect` must come first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServer {
    Connect { param: EndpointDescriptor },
    SendMessage { envelope: Envelope },
    GetOnlineServices,
    GetOnlineClients,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    Connected { conn_id: ConnId },
    AddMessage { envelope: Envelope },
    Error { message: String },
}

/// Reads newline-delimited JSON frames. Blank lines are skipped.
///
/// [`FrameReader::next_frame`] is cancel safe: a line that is only partly
/// received when the future is dropped stays buffered, so it can sit in a
/// `select!` next to other branches.
pub struct FrameReader<R> {
    lines: Lines<R>,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// `Ok(None)` once the peer closes the stream. A frame that does not parse
    /// is `InvalidData`; the frames after it are still readable.
    pub async fn next_frame<T>(&mut self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map(Some).map_err(to_io_error);
        }
        Ok(None)
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
