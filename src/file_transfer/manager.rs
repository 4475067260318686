use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use super::reassembly::ReorderBuffer;
use super::types::{FileTransfer, TransferInput};
use crate::core::{
    ConnectionId, EventPublisher, Result, SessionEvent, SharedFile, TransferDirection,
    TransferError, TransferId, TransferProgress, TransferState,
};
use crate::infrastructure::SessionConfig;
use crate::network::ConnectionHandle;
use crate::protocol::{FileChunk, FileOffer, Message};
use crate::utils::{get_filename, random_id, sanitize_filename, unique_destination};

/// Receive-side state once an offer has been accepted.
struct Sink {
    file: File,
    temp_path: PathBuf,
    reorder: ReorderBuffer,
    hasher: Sha256,
}

enum Entry {
    Outgoing {
        transfer: FileTransfer,
        conn: ConnectionHandle,
        /// Wakes the streaming task when the peer accepts.
        accepted: Option<oneshot::Sender<()>>,
    },
    Incoming {
        transfer: FileTransfer,
        conn: ConnectionHandle,
        sink: Option<Sink>,
    },
}

impl Entry {
    fn transfer(&self) -> &FileTransfer {
        match self {
            Entry::Outgoing { transfer, .. } | Entry::Incoming { transfer, .. } => transfer,
        }
    }

    fn conn(&self) -> &ConnectionHandle {
        match self {
            Entry::Outgoing { conn, .. } | Entry::Incoming { conn, .. } => conn,
        }
    }
}

enum Ending {
    Failed(TransferError),
    Cancelled,
}

fn reject_message(id: &TransferId) -> Message {
    Message::FileReject {
        transfer_id: id.to_string(),
    }
}

/// Queue a control message without ever blocking the caller, which may be
/// the connection's own read loop.
fn notify_peer(conn: &ConnectionHandle, message: Message) {
    match conn.try_send(message.clone()) {
        Ok(true) => {}
        Ok(false) => {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.send(message).await;
            });
        }
        Err(e) => debug!(peer = %conn.identity(), "Cannot notify peer: {}", e),
    }
}

async fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

async fn discard_sink(sink: Sink) {
    let Sink {
        file, temp_path, ..
    } = sink;
    drop(file);
    remove_temp(&temp_path).await;
}

/// Check one chunk against the offer, then write every chunk the reorder
/// buffer releases. Returns the number of bytes written.
async fn write_chunk(
    sink: &mut Sink,
    expected_len: Option<u64>,
    chunk: FileChunk,
) -> std::result::Result<u64, TransferError> {
    let sequence = chunk.sequence;
    let actual = chunk.data.len() as u64;
    match expected_len {
        None => return Err(TransferError::UnexpectedChunk { sequence }),
        Some(expected) if expected != actual => {
            return Err(TransferError::ChunkLength {
                sequence,
                expected,
                actual,
            });
        }
        Some(_) => {}
    }
    if !chunk.digest_matches() {
        return Err(TransferError::ChunkDigestMismatch { sequence });
    }

    let ready = sink.reorder.insert(sequence, chunk.data)?;
    let mut written = 0;
    for data in ready {
        sink.file.write_all(&data).await?;
        sink.hasher.update(&data);
        written += data.len() as u64;
    }
    Ok(written)
}

async fn verify(
    transfer: &FileTransfer,
    reorder: &ReorderBuffer,
    hasher: Sha256,
    checksum: &str,
    file: &mut File,
) -> std::result::Result<(), TransferError> {
    if reorder.pending() > 0 || transfer.bytes_transferred != transfer.total_size {
        return Err(TransferError::SizeMismatch {
            expected: transfer.total_size,
            actual: transfer.bytes_transferred,
        });
    }
    file.flush().await?;
    file.sync_all().await?;
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(checksum) {
        return Err(TransferError::ChecksumMismatch {
            expected: checksum.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Verify a finished download and move it into place. The partial file is
/// removed on any failure.
async fn finalize(
    transfer: &FileTransfer,
    sink: Sink,
    checksum: &str,
    downloads: &Path,
) -> std::result::Result<PathBuf, TransferError> {
    let Sink {
        mut file,
        temp_path,
        reorder,
        hasher,
    } = sink;
    let verified = verify(transfer, &reorder, hasher, checksum, &mut file).await;
    drop(file);

    let outcome = match verified {
        Ok(()) => {
            let destination = unique_destination(downloads, &transfer.filename);
            fs::rename(&temp_path, &destination)
                .await
                .map(|()| destination)
                .map_err(TransferError::from)
        }
        Err(err) => Err(err),
    };
    if outcome.is_err() {
        remove_temp(&temp_path).await;
    }
    outcome
}

/// Tracks every non-terminal transfer, keyed by transfer id. An entry is
/// removed exactly once, and whoever removes it publishes the terminal event.
pub struct FileTransferManager {
    config: Arc<SessionConfig>,
    publisher: Arc<dyn EventPublisher>,
    transfers: Mutex<HashMap<TransferId, Entry>>,
}

impl FileTransferManager {
    pub fn new(config: Arc<SessionConfig>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            config,
            publisher,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// A bare file name that does not exist as given is looked up in the
    /// shared directory.
    pub fn resolve_source(&self, path: &Path) -> PathBuf {
        if path.exists() || path.components().count() > 1 {
            path.to_path_buf()
        } else {
            self.config.shared_dir.join(path)
        }
    }

    /// Regular files in the shared directory, sorted by name.
    pub async fn list_shared_files(&self) -> Result<Vec<SharedFile>> {
        let mut entries = fs::read_dir(&self.config.shared_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push(SharedFile {
                    name: name.to_string(),
                    size: metadata.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Snapshot of all non-terminal transfers.
    pub async fn active_transfers(&self) -> Vec<FileTransfer> {
        self.transfers
            .lock()
            .await
            .values()
            .map(|entry| entry.transfer().clone())
            .collect()
    }

    /// Offer a file to the peer behind `conn`. Streaming starts in the
    /// background once the peer accepts.
    pub async fn send_file(
        self: &Arc<Self>,
        conn: ConnectionHandle,
        path: &Path,
    ) -> Result<TransferId> {
        let source = self.resolve_source(path);
        let metadata = fs::metadata(&source).await.map_err(TransferError::from)?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(source.display().to_string()).into());
        }
        let filename = get_filename(&source)
            .ok_or_else(|| TransferError::InvalidFilename(source.display().to_string()))?;

        let id = TransferId::new();
        let chunk_size = self.config.transfer.chunk_size;
        let mut transfer = FileTransfer::new(
            id.clone(),
            TransferDirection::Send,
            conn.identity().clone(),
            conn.id(),
            filename.clone(),
            metadata.len(),
            chunk_size,
        );
        transfer.path = Some(source.clone());

        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.transfers.lock().await.insert(
            id.clone(),
            Entry::Outgoing {
                transfer,
                conn: conn.clone(),
                accepted: Some(accepted_tx),
            },
        );

        let offer = Message::FileOffer(FileOffer {
            transfer_id: id.to_string(),
            filename: filename.clone(),
            total_size: metadata.len(),
            chunk_size,
        });
        if let Err(err) = conn.send(offer).await {
            self.transfers.lock().await.remove(&id);
            return Err(err);
        }
        info!(
            peer = %conn.identity(),
            transfer_id = %id,
            "Offered {} ({} bytes)",
            filename,
            metadata.len()
        );

        let manager = Arc::clone(self);
        tokio::spawn(manager.drive_outgoing(id.clone(), conn, source, accepted_rx));
        Ok(id)
    }

    async fn drive_outgoing(
        self: Arc<Self>,
        id: TransferId,
        conn: ConnectionHandle,
        source: PathBuf,
        accepted: oneshot::Receiver<()>,
    ) {
        match time::timeout(self.config.transfer.offer_timeout(), accepted).await {
            Ok(Ok(())) => {}
            // Entry removed by reject, cancel or connection loss.
            Ok(Err(_)) => return,
            Err(_) => {
                info!(transfer_id = %id, "Offer was not accepted in time");
                self.abort(&id, Ending::Cancelled, true).await;
                return;
            }
        }

        match self.stream_file(&id, &conn, &source).await {
            Ok(true) => {
                let entry = self.transfers.lock().await.remove(&id);
                if let Some(Entry::Outgoing { mut transfer, .. }) = entry {
                    let _ = transfer.apply(TransferInput::Complete);
                    info!(peer = %transfer.peer, transfer_id = %id, "File sent");
                    self.publisher
                        .publish(SessionEvent::FileSent {
                            peer: transfer.peer,
                            transfer_id: id,
                        })
                        .await;
                }
            }
            Ok(false) => debug!(transfer_id = %id, "Transfer stopped while streaming"),
            Err(err) => {
                let notify = !matches!(err, TransferError::ConnectionLost);
                self.abort(&id, Ending::Failed(err), notify).await;
            }
        }
    }

    async fn with_transfer<R>(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut FileTransfer) -> std::result::Result<R, TransferError>,
    ) -> Option<std::result::Result<R, TransferError>> {
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(id)? {
            Entry::Outgoing { transfer, .. } | Entry::Incoming { transfer, .. } => {
                Some(f(transfer))
            }
        }
    }

    /// Stream chunks and the closing checksum. `Ok(false)` means the
    /// transfer was settled elsewhere while streaming.
    async fn stream_file(
        &self,
        id: &TransferId,
        conn: &ConnectionHandle,
        source: &Path,
    ) -> std::result::Result<bool, TransferError> {
        let started = self
            .with_transfer(id, |t| {
                t.apply(TransferInput::Start)?;
                Ok(t.chunk_size)
            })
            .await;
        let chunk_size = match started {
            Some(result) => result?,
            None => return Ok(false),
        };

        let mut file = File::open(source).await?;
        let mut hasher = Sha256::new();
        let mut sequence = 0u64;
        loop {
            let mut data = Vec::with_capacity(chunk_size as usize);
            (&mut file)
                .take(chunk_size as u64)
                .read_to_end(&mut data)
                .await?;
            if data.is_empty() {
                break;
            }
            hasher.update(&data);
            let len = data.len() as u64;

            if self.with_transfer(id, |_| Ok(())).await.is_none() {
                return Ok(false);
            }
            // One chunk in flight per transfer: the next is not read until
            // this one reaches the transport.
            conn.send_and_wait(Message::FileChunk(FileChunk::new(id.as_str(), sequence, data)))
            .await
            .map_err(|_| TransferError::ConnectionLost)?;
            sequence += 1;

            let recorded = self
                .with_transfer(id, |t| {
                    t.record_bytes(len)?;
                    Ok(t.progress())
                })
                .await;
            let progress = match recorded {
                Some(result) => result?,
                None => return Ok(false),
            };
            self.publisher
                .publish(SessionEvent::TransferProgress {
                    transfer_id: id.clone(),
                    direction: TransferDirection::Send,
                    progress,
                })
                .await;
        }

        let finished = self
            .with_transfer(id, |t| {
                if t.bytes_transferred == t.total_size {
                    Ok(())
                } else {
                    Err(TransferError::SizeMismatch {
                        expected: t.total_size,
                        actual: t.bytes_transferred,
                    })
                }
            })
            .await;
        match finished {
            Some(result) => result?,
            None => return Ok(false),
        }

        let checksum = hex::encode(hasher.finalize());
        debug!(transfer_id = %id, chunks = sequence, "All chunks sent");
        conn.send_and_wait(Message::FileComplete {
            transfer_id: id.to_string(),
            checksum,
        })
        .await
        .map_err(|_| TransferError::ConnectionLost)?;
        Ok(true)
    }

    /// Accept an incoming offer: open a partial file under the downloads
    /// directory and tell the sender to start.
    pub async fn accept(&self, id: &TransferId) -> std::result::Result<(), TransferError> {
        let conn = {
            let mut transfers = self.transfers.lock().await;
            match transfers.get_mut(id) {
                Some(Entry::Incoming { transfer, conn, .. }) => {
                    transfer.apply(TransferInput::Accept)?;
                    conn.clone()
                }
                _ => return Err(TransferError::UnknownTransfer(id.clone())),
            }
        };

        let temp_path = self
            .config
            .downloads_dir
            .join(format!(".{}.part", random_id(16)));
        let file = match File::create(&temp_path).await {
            Ok(file) => file,
            Err(err) => {
                self.abort(id, Ending::Failed(err.into()), true).await;
                return Ok(());
            }
        };
        let sink = Sink {
            file,
            temp_path,
            reorder: ReorderBuffer::new(self.config.transfer.reorder_window),
            hasher: Sha256::new(),
        };

        let leftover = {
            let mut transfers = self.transfers.lock().await;
            match transfers.get_mut(id) {
                Some(Entry::Incoming {
                    transfer,
                    sink: slot,
                    ..
                }) => match transfer.apply(TransferInput::Start) {
                    Ok(_) => {
                        *slot = Some(sink);
                        None
                    }
                    Err(_) => Some(sink),
                },
                _ => Some(sink),
            }
        };
        if let Some(sink) = leftover {
            // Settled while the partial file was being created.
            discard_sink(sink).await;
            return Ok(());
        }

        info!(peer = %conn.identity(), transfer_id = %id, "Accepted offer");
        notify_peer(
            &conn,
            Message::FileAccept {
                transfer_id: id.to_string(),
            },
        );
        Ok(())
    }

    /// Decline an incoming offer that has not been accepted yet.
    pub async fn reject(&self, id: &TransferId) -> std::result::Result<(), TransferError> {
        {
            let transfers = self.transfers.lock().await;
            match transfers.get(id) {
                Some(Entry::Incoming { transfer, .. })
                    if transfer.state == TransferState::Offered => {}
                Some(entry) => {
                    return Err(TransferError::InvalidTransition {
                        id: id.clone(),
                        from: entry.transfer().state,
                        to: TransferState::Cancelled,
                    });
                }
                None => return Err(TransferError::UnknownTransfer(id.clone())),
            }
        }
        self.abort(id, Ending::Cancelled, true).await;
        Ok(())
    }

    /// Cancel any non-terminal transfer and tell the peer.
    pub async fn cancel(&self, id: &TransferId) -> std::result::Result<(), TransferError> {
        if self.abort(id, Ending::Cancelled, true).await {
            Ok(())
        } else {
            Err(TransferError::UnknownTransfer(id.clone()))
        }
    }

    pub async fn on_offer(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        offer: FileOffer,
    ) -> std::result::Result<(), TransferError> {
        let id = TransferId::from_string(offer.transfer_id);
        let Some(filename) = sanitize_filename(&offer.filename) else {
            notify_peer(conn, reject_message(&id));
            return Err(TransferError::InvalidFilename(offer.filename));
        };
        if offer.chunk_size == 0 || offer.chunk_size > self.config.network.max_frame_size {
            notify_peer(conn, reject_message(&id));
            return Err(TransferError::InvalidChunkSize(offer.chunk_size));
        }

        let transfer = FileTransfer::new(
            id.clone(),
            TransferDirection::Receive,
            conn.identity().clone(),
            conn.id(),
            filename.clone(),
            offer.total_size,
            offer.chunk_size,
        );
        let limit = self.config.transfer.max_incoming_per_peer;
        {
            let mut transfers = self.transfers.lock().await;
            if transfers.contains_key(&id) {
                return Err(TransferError::DuplicateTransfer(id));
            }
            let open = transfers
                .values()
                .filter(|e| matches!(e, Entry::Incoming { .. }) && e.conn().id() == conn.id())
                .count();
            if open >= limit {
                drop(transfers);
                notify_peer(conn, reject_message(&id));
                return Err(TransferError::TooManyTransfers(limit));
            }
            transfers.insert(
                id.clone(),
                Entry::Incoming {
                    transfer,
                    conn: conn.clone(),
                    sink: None,
                },
            );
        }
        tokio::spawn(Arc::clone(self).expire_offer(id.clone(), conn.id()));

        info!(
            peer = %conn.identity(),
            transfer_id = %id,
            "Offer received: {} ({} bytes)",
            filename,
            offer.total_size
        );
        self.publisher
            .publish(SessionEvent::FileOffered {
                peer: conn.identity().clone(),
                transfer_id: id.clone(),
                filename,
                total_size: offer.total_size,
            })
            .await;

        if self.config.transfer.auto_accept {
            self.accept(&id).await?;
        }
        Ok(())
    }

    /// Cancel an incoming offer that is still waiting for the caller.
    async fn expire_offer(self: Arc<Self>, id: TransferId, conn_id: ConnectionId) {
        time::sleep(self.config.transfer.offer_timeout()).await;
        let expired = {
            let mut transfers = self.transfers.lock().await;
            let waiting = matches!(
                transfers.get(&id),
                Some(Entry::Incoming { transfer, conn, .. })
                    if transfer.state == TransferState::Offered && conn.id() == conn_id
            );
            if waiting {
                transfers.remove(&id)
            } else {
                None
            }
        };
        if let Some(entry) = expired {
            info!(transfer_id = %id, "Incoming offer expired");
            self.settle(entry, Ending::Cancelled, true).await;
        }
    }

    /// Answer a peer's request for our shared listing.
    pub async fn on_shared_list_request(&self, conn: &ConnectionHandle) {
        let files = match self.list_shared_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(peer = %conn.identity(), "Cannot list shared files: {}", e);
                Vec::new()
            }
        };
        debug!(peer = %conn.identity(), count = files.len(), "Sending shared listing");
        notify_peer(conn, Message::SharedList { files });
    }

    pub async fn on_accept(
        &self,
        conn: &ConnectionHandle,
        id: &TransferId,
    ) -> std::result::Result<(), TransferError> {
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(id) {
            Some(Entry::Outgoing {
                transfer,
                conn: owner,
                accepted,
            }) if owner.id() == conn.id() => {
                transfer.apply(TransferInput::Accept)?;
                debug!(peer = %conn.identity(), transfer_id = %id, "Offer accepted by peer");
                if let Some(accepted) = accepted.take() {
                    let _ = accepted.send(());
                }
                Ok(())
            }
            _ => Err(TransferError::UnknownTransfer(id.clone())),
        }
    }

    /// The peer declined an offer or abandoned a transfer in either direction.
    pub async fn on_reject(
        &self,
        conn: &ConnectionHandle,
        id: &TransferId,
    ) -> std::result::Result<(), TransferError> {
        let owned = {
            let transfers = self.transfers.lock().await;
            matches!(transfers.get(id), Some(entry) if entry.conn().id() == conn.id())
        };
        if !owned {
            return Err(TransferError::UnknownTransfer(id.clone()));
        }
        info!(peer = %conn.identity(), transfer_id = %id, "Peer declined transfer");
        self.abort(id, Ending::Cancelled, false).await;
        Ok(())
    }

    /// Stale chunks are returned as errors for the caller to log; anything
    /// else that goes wrong fails the transfer. The sink is taken out of the
    /// index while it is written so other transfers never wait on this disk.
    pub async fn on_chunk(
        &self,
        conn: &ConnectionHandle,
        chunk: FileChunk,
    ) -> std::result::Result<(), TransferError> {
        let id = TransferId::from_string(chunk.transfer_id.clone());
        let (mut sink, expected_len) = {
            let mut transfers = self.transfers.lock().await;
            let Some(Entry::Incoming {
                transfer,
                conn: owner,
                sink,
            }) = transfers.get_mut(&id)
            else {
                return Err(TransferError::UnknownTransfer(id));
            };
            if owner.id() != conn.id() {
                return Err(TransferError::UnknownTransfer(id));
            }
            let Some(taken) = sink.take() else {
                return Err(TransferError::InvalidTransition {
                    id: id.clone(),
                    from: transfer.state,
                    to: TransferState::InProgress,
                });
            };
            (taken, transfer.expected_chunk_len(chunk.sequence))
        };

        let (written, stale) = match write_chunk(&mut sink, expected_len, chunk).await {
            Ok(written) => (written, None),
            Err(err @ TransferError::StaleChunk { .. }) => (0, Some(err)),
            Err(err) => {
                discard_sink(sink).await;
                self.abort(&id, Ending::Failed(err), true).await;
                return Ok(());
            }
        };

        match self.restore_sink(&id, sink, written).await {
            Some(Ok(progress)) if written > 0 => {
                self.publisher
                    .publish(SessionEvent::TransferProgress {
                        transfer_id: id,
                        direction: TransferDirection::Receive,
                        progress,
                    })
                    .await;
            }
            Some(Err(err)) => {
                self.abort(&id, Ending::Failed(err), true).await;
            }
            _ => {}
        }
        match stale {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Put a sink back after writing and count the bytes. `None` means the
    /// transfer was settled meanwhile; the sink is then discarded here.
    async fn restore_sink(
        &self,
        id: &TransferId,
        sink: Sink,
        written: u64,
    ) -> Option<std::result::Result<TransferProgress, TransferError>> {
        let orphan = {
            let mut transfers = self.transfers.lock().await;
            match transfers.get_mut(id) {
                Some(Entry::Incoming {
                    transfer,
                    sink: slot,
                    ..
                }) if slot.is_none() => {
                    *slot = Some(sink);
                    return Some(transfer.record_bytes(written).map(|()| transfer.progress()));
                }
                _ => sink,
            }
        };
        discard_sink(orphan).await;
        None
    }

    pub async fn on_complete(
        &self,
        conn: &ConnectionHandle,
        id: &TransferId,
        checksum: &str,
    ) -> std::result::Result<(), TransferError> {
        let (mut transfer, owner, sink) = {
            let mut transfers = self.transfers.lock().await;
            match transfers.remove(id) {
                Some(Entry::Incoming {
                    transfer,
                    conn: owner,
                    sink: Some(sink),
                }) if owner.id() == conn.id() => (transfer, owner, sink),
                Some(other) => {
                    transfers.insert(id.clone(), other);
                    return Err(TransferError::UnknownTransfer(id.clone()));
                }
                None => return Err(TransferError::UnknownTransfer(id.clone())),
            }
        };

        match finalize(&transfer, sink, checksum, &self.config.downloads_dir).await {
            Ok(path) => {
                let _ = transfer.apply(TransferInput::Complete);
                info!(
                    peer = %transfer.peer,
                    transfer_id = %id,
                    "File received: {}",
                    path.display()
                );
                self.publisher
                    .publish(SessionEvent::FileReceived {
                        peer: transfer.peer,
                        transfer_id: id.clone(),
                        path,
                    })
                    .await;
            }
            Err(err) => {
                let entry = Entry::Incoming {
                    transfer,
                    conn: owner,
                    sink: None,
                };
                self.settle(entry, Ending::Failed(err), false).await;
            }
        }
        Ok(())
    }

    /// Fail every transfer that was riding on the closed connection.
    pub async fn on_connection_lost(&self, conn_id: ConnectionId) {
        let lost: Vec<Entry> = {
            let mut transfers = self.transfers.lock().await;
            let ids: Vec<TransferId> = transfers
                .iter()
                .filter(|(_, entry)| entry.conn().id() == conn_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| transfers.remove(id)).collect()
        };
        for entry in lost {
            self.settle(entry, Ending::Failed(TransferError::ConnectionLost), false)
                .await;
        }
    }

    /// Remove and settle `id`. Returns `false` if it was already gone.
    async fn abort(&self, id: &TransferId, ending: Ending, notify: bool) -> bool {
        let entry = self.transfers.lock().await.remove(id);
        match entry {
            Some(entry) => {
                self.settle(entry, ending, notify).await;
                true
            }
            None => false,
        }
    }

    async fn settle(&self, entry: Entry, ending: Ending, notify: bool) {
        let (mut transfer, conn, sink) = match entry {
            Entry::Outgoing { transfer, conn, .. } => (transfer, conn, None),
            Entry::Incoming {
                transfer,
                conn,
                sink,
            } => (transfer, conn, sink),
        };
        if let Some(sink) = sink {
            discard_sink(sink).await;
        }
        if notify {
            notify_peer(&conn, reject_message(&transfer.transfer_id));
        }

        let peer = transfer.peer.clone();
        let transfer_id = transfer.transfer_id.clone();
        let event = match ending {
            Ending::Failed(err) => {
                let _ = transfer.apply(TransferInput::Fail);
                warn!(peer = %peer, transfer_id = %transfer_id, "Transfer failed: {}", err);
                SessionEvent::TransferFailed {
                    peer,
                    transfer_id,
                    reason: err.to_string(),
                }
            }
            Ending::Cancelled => {
                let _ = transfer.apply(TransferInput::Cancel);
                info!(peer = %peer, transfer_id = %transfer_id, "Transfer cancelled");
                SessionEvent::TransferCancelled { peer, transfer_id }
            }
        };
        self.publisher.publish(event).await;
    }
}
