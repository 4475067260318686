use bincode::{Decode, Encode, config};
use sha2::{Digest, Sha256};

use super::codec::{Frame, MessageType};
use super::{MAX_PAYLOAD_DECODE, ProtocolError};
use crate::core::SharedFile;

/// All wire messages. Each variant maps to exactly one `MessageType`; its
/// fields are bincode-encoded (length-prefixed strings and byte vectors)
/// into the frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Ping,
    Pong,
    Chat { text: String },
    FileOffer(FileOffer),
    FileAccept { transfer_id: String },
    FileReject { transfer_id: String },
    FileChunk(FileChunk),
    FileComplete { transfer_id: String, checksum: String },
    /// Ask the peer what it has in its shared directory.
    SharedListRequest,
    SharedList { files: Vec<SharedFile> },
}

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Hello {
    pub identity: String,
    pub protocol_version: u8,
    /// Port the sender accepts connections on, if it listens at all.
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FileOffer {
    pub transfer_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FileChunk {
    pub transfer_id: String,
    pub sequence: u64,
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`.
    pub digest: String,
}

impl FileChunk {
    pub fn new(transfer_id: impl Into<String>, sequence: u64, data: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&data));
        Self {
            transfer_id: transfer_id.into(),
            sequence,
            data,
            digest,
        }
    }

    pub fn digest_matches(&self) -> bool {
        hex::encode(Sha256::digest(&self.data)).eq_ignore_ascii_case(&self.digest)
    }
}

#[derive(Encode, Decode)]
struct TextPayload {
    text: String,
}

#[derive(Encode, Decode)]
struct TransferRef {
    transfer_id: String,
}

#[derive(Encode, Decode)]
struct CompletePayload {
    transfer_id: String,
    checksum: String,
}

#[derive(Encode, Decode)]
struct SharedEntry {
    name: String,
    size: u64,
}

#[derive(Encode, Decode)]
struct SharedListPayload {
    files: Vec<SharedEntry>,
}

fn encode_payload<T: Encode>(value: T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::encode_to_vec(value, config::standard())?)
}

fn decode_payload<T: Decode<()>>(payload: &[u8]) -> Result<T, ProtocolError> {
    let config = config::standard().with_limit::<MAX_PAYLOAD_DECODE>();
    let (value, read) = bincode::decode_from_slice(payload, config)?;
    if read != payload.len() {
        return Err(ProtocolError::TrailingBytes {
            extra: payload.len() - read,
        });
    }
    Ok(value)
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::Chat { .. } => MessageType::Chat,
            Message::FileOffer(_) => MessageType::FileOffer,
            Message::FileAccept { .. } => MessageType::FileAccept,
            Message::FileReject { .. } => MessageType::FileReject,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::FileComplete { .. } => MessageType::FileComplete,
            Message::SharedListRequest => MessageType::SharedListRequest,
            Message::SharedList { .. } => MessageType::SharedList,
        }
    }

    /// Serialize the payload for this message.
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Message::Hello(hello) => encode_payload(hello),
            Message::Ping | Message::Pong | Message::SharedListRequest => Ok(Vec::new()),
            Message::Chat { text } => encode_payload(TextPayload { text: text.clone() }),
            Message::FileOffer(offer) => encode_payload(offer),
            Message::FileAccept { transfer_id } | Message::FileReject { transfer_id } => {
                encode_payload(TransferRef {
                    transfer_id: transfer_id.clone(),
                })
            }
            Message::FileChunk(chunk) => encode_payload(chunk),
            Message::FileComplete {
                transfer_id,
                checksum,
            } => encode_payload(CompletePayload {
                transfer_id: transfer_id.clone(),
                checksum: checksum.clone(),
            }),
            Message::SharedList { files } => encode_payload(SharedListPayload {
                files: files
                    .iter()
                    .map(|f| SharedEntry {
                        name: f.name.clone(),
                        size: f.size,
                    })
                    .collect(),
            }),
        }
    }

    /// Interpret a decoded frame.
    pub fn from_frame(frame: &Frame) -> Result<Message, ProtocolError> {
        let payload = frame.payload.as_slice();
        let message = match frame.kind {
            MessageType::Hello => Message::Hello(decode_payload(payload)?),
            MessageType::Ping | MessageType::Pong | MessageType::SharedListRequest => {
                if !payload.is_empty() {
                    return Err(ProtocolError::TrailingBytes {
                        extra: payload.len(),
                    });
                }
                match frame.kind {
                    MessageType::Ping => Message::Ping,
                    MessageType::Pong => Message::Pong,
                    _ => Message::SharedListRequest,
                }
            }
            MessageType::Chat => {
                let TextPayload { text } = decode_payload(payload)?;
                Message::Chat { text }
            }
            MessageType::FileOffer => Message::FileOffer(decode_payload(payload)?),
            MessageType::FileAccept => {
                let TransferRef { transfer_id } = decode_payload(payload)?;
                Message::FileAccept { transfer_id }
            }
            MessageType::FileReject => {
                let TransferRef { transfer_id } = decode_payload(payload)?;
                Message::FileReject { transfer_id }
            }
            MessageType::FileChunk => Message::FileChunk(decode_payload(payload)?),
            MessageType::FileComplete => {
                let CompletePayload {
                    transfer_id,
                    checksum,
                } = decode_payload(payload)?;
                Message::FileComplete {
                    transfer_id,
                    checksum,
                }
            }
            MessageType::SharedList => {
                let SharedListPayload { files } = decode_payload(payload)?;
                Message::SharedList {
                    files: files
                        .into_iter()
                        .map(|f| SharedFile {
                            name: f.name,
                            size: f.size,
                        })
                        .collect(),
                }
            }
        };
        Ok(message)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            kind: self.message_type(),
            payload: self.encode_payload()?,
        })
    }

    pub fn hello(identity: &str, listen_port: Option<u16>) -> Message {
        Message::Hello(Hello {
            identity: identity.to_string(),
            protocol_version: super::PROTOCOL_VERSION,
            listen_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_payload_keeps_binary_data() {
        let msg = Message::FileChunk(FileChunk::new("t-1", 42, vec![0, 1, 2, 255, 254]));
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.kind, MessageType::FileChunk);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn ping_with_payload_is_rejected() {
        let frame = Frame {
            kind: MessageType::Ping,
            payload: vec![1],
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::TrailingBytes { extra: 1 })
        ));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let frame = Message::Chat {
            text: "hello there".to_string(),
        }
        .to_frame()
        .unwrap();
        let truncated = Frame {
            kind: frame.kind,
            payload: frame.payload[..4].to_vec(),
        };
        assert!(matches!(
            Message::from_frame(&truncated),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut frame = Message::FileAccept {
            transfer_id: "abc".to_string(),
        }
        .to_frame()
        .unwrap();
        frame.payload.extend_from_slice(&[9, 9]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::TrailingBytes { extra: 2 })
        ));
    }

    #[test]
    fn payload_type_mismatch_does_not_decode_as_other_variant() {
        // A chunk payload labelled as an offer must not decode cleanly.
        let chunk = Message::FileChunk(FileChunk::new("t", 1, vec![7; 3]))
            .encode_payload()
        .unwrap();
        let frame = Frame {
            kind: MessageType::FileComplete,
            payload: chunk,
        };
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn chunk_digest_covers_data() {
        let mut chunk = FileChunk::new("t", 0, b"payload".to_vec());
        assert!(chunk.digest_matches());
        chunk.data[0] ^= 0xff;
        assert!(!chunk.digest_matches());
    }

    #[test]
    fn chunk_at_frame_ceiling_decodes() {
        let data = vec![0x5a; MAX_PAYLOAD_DECODE - 1024];
        let msg = Message::FileChunk(FileChunk::new("t", 3, data));
        let frame = msg.to_frame().unwrap();
        assert!(frame.payload.len() <= MAX_PAYLOAD_DECODE);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }
}
