use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{message::IpcMessage, IpcError};

/// Hard ceiling on the serialized size of a single message.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const FRAME_PREFIX_BYTES: usize = 4;

/// Serializes a message into its wire form: a 4-byte big-endian length
/// prefix followed by the JSON body.
pub fn encode_frame(message: &IpcMessage) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(message).map_err(IpcError::Serialize)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads exactly one frame from the stream.
///
/// The declared length is validated before the body is read, so an
/// oversize frame never allocates its payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<IpcMessage, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_BYTES];
    reader.read_exact(&mut prefix).await.map_err(IpcError::Read)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(IpcError::Read)?;
    serde_json::from_slice(&body).map_err(IpcError::Deserialize)
}

/// Incremental frame decoder for callers that feed bytes as they arrive.
///
/// Short input is never an error: `next_message` returns `Ok(None)` until a
/// complete frame is buffered.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Consumes and returns the next complete message, or `None` when more
    /// input is needed.
    pub fn next_message(&mut self) -> Result<Option<IpcMessage>, IpcError> {
        if self.buffer.len() < FRAME_PREFIX_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; FRAME_PREFIX_BYTES];
        prefix.copy_from_slice(&self.buffer[..FRAME_PREFIX_BYTES]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(IpcError::FrameTooLarge {
                len,
                max: MAX_FRAME_BYTES,
            });
        }
        if self.buffer.len() < FRAME_PREFIX_BYTES + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..FRAME_PREFIX_BYTES + len).collect();
        let message = serde_json::from_slice(&frame[FRAME_PREFIX_BYTES..])
            .map_err(IpcError::Deserialize)?;
        Ok(Some(message))
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}
