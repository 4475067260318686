use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use super::connection::ConnectionHandle;
use crate::core::{ChatMessage, EventPublisher, SessionEvent, TransferId};
use crate::file_transfer::FileTransferManager;
use crate::protocol::Message;

/// Routes messages from Active connections to the session and the transfer
/// manager.
pub struct MessageRouter {
    transfers: Arc<FileTransferManager>,
    publisher: Arc<dyn EventPublisher>,
}

impl MessageRouter {
    pub fn new(transfers: Arc<FileTransferManager>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            transfers,
            publisher,
        }
    }

    pub async fn dispatch(&self, conn: &ConnectionHandle, message: Message) {
        let kind = message.message_type();
        let peer = conn.identity();

        let outcome = match message {
            Message::Hello(_) => {
                warn!(peer = %peer, "Ignoring HELLO on an active connection");
                Ok(())
            }
            Message::Ping => {
                match conn.try_send(Message::Pong) {
                    Ok(true) => {}
                    Ok(false) => debug!(peer = %peer, "Outbound queue full, PONG skipped"),
                    Err(e) => debug!(peer = %peer, "Cannot answer PING: {}", e),
                }
                Ok(())
            }
            Message::Pong => Ok(()),
            Message::Chat { text } => {
                self.publisher
                    .publish(SessionEvent::MessageReceived(ChatMessage {
                        sender: peer.clone(),
                        text,
                        timestamp: SystemTime::now(),
                    }))
                    .await;
                Ok(())
            }
            Message::FileOffer(offer) => self.transfers.on_offer(conn, offer).await,
            Message::FileAccept { transfer_id } => {
                self.transfers
                    .on_accept(conn, &TransferId::from_string(transfer_id))
                    .await
            }
            Message::FileReject { transfer_id } => {
                self.transfers
                    .on_reject(conn, &TransferId::from_string(transfer_id))
                    .await
            }
            Message::FileChunk(chunk) => self.transfers.on_chunk(conn, chunk).await,
            Message::FileComplete {
                transfer_id,
                checksum,
            } => {
                self.transfers
                    .on_complete(conn, &TransferId::from_string(transfer_id), &checksum)
                    .await
            }
            Message::SharedListRequest => {
                self.transfers.on_shared_list_request(conn).await;
                Ok(())
            }
            Message::SharedList { files } => {
                debug!(peer = %peer, count = files.len(), "Shared listing received");
                self.publisher
                    .publish(SessionEvent::SharedFilesListed {
                        peer: peer.clone(),
                        files,
                    })
                    .await;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(peer = %peer, ?kind, "Dropped frame: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, SharedFile};
    use crate::infrastructure::{InMemoryEventPublisher, SessionConfig};
    use crate::network::connection::test_handle;
    use crate::protocol::{Decoded, FileChunk, FrameCodec, MessageType};

    fn router() -> (MessageRouter, Arc<InMemoryEventPublisher>) {
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let config = Arc::new(SessionConfig::default());
        let transfers = Arc::new(FileTransferManager::new(config, publisher.clone()));
        (MessageRouter::new(transfers, publisher.clone()), publisher)
    }

    #[tokio::test]
    async fn chat_becomes_message_event() {
        let (router, publisher) = router();
        let (conn, _queue) = test_handle(1, "bob", Direction::Inbound);
        router
            .dispatch(&conn, Message::Chat { text: "hi".into() })
            .await;

        let events = publisher.get_events().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::MessageReceived(msg) => {
                assert_eq!(msg.sender.as_str(), "bob");
                assert_eq!(msg.text, "hi");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn ping_is_answered_without_events() {
        let (router, publisher) = router();
        let (conn, mut queue) = test_handle(1, "bob", Direction::Inbound);
        router.dispatch(&conn, Message::Ping).await;
        router.dispatch(&conn, Message::Pong).await;

        let outbound = queue.try_recv().unwrap();
        let mut codec = FrameCodec::default();
        codec.extend(&outbound.bytes);
        match codec.decode().unwrap() {
            Decoded::Frame(frame) => assert_eq!(frame.kind, MessageType::Pong),
            Decoded::NeedMoreData => panic!("incomplete PONG"),
        }
        assert!(queue.try_recv().is_err());
        assert!(publisher.get_events().await.is_empty());
    }

    #[tokio::test]
    async fn chunk_for_unknown_transfer_is_dropped() {
        let (router, publisher) = router();
        let (conn, mut queue) = test_handle(1, "bob", Direction::Inbound);
        router
            .dispatch(
                &conn,
                Message::FileChunk(FileChunk::new("nope", 0, vec![1, 2, 3])),
            )
            .await;
        assert!(publisher.get_events().await.is_empty());
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn shared_listing_becomes_event() {
        let (router, publisher) = router();
        let (conn, _queue) = test_handle(1, "bob", Direction::Inbound);
        let files = vec![SharedFile {
            name: "notes.txt".into(),
            size: 12,
        }];
        router
            .dispatch(
                &conn,
                Message::SharedList {
                    files: files.clone(),
                },
            )
            .await;

        match publisher.get_events().await.as_slice() {
            [SessionEvent::SharedFilesListed { peer, files: listed }] => {
                assert_eq!(peer.as_str(), "bob");
                assert_eq!(*listed, files);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }
}
