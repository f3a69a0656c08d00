use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ferry_bus::{EventBus, FerryEvent, Payload, ReceiveProgress, ReceivedFile};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::label::ChannelLabel;
use crate::protocol::{FileFrame, FrameError, decode_frame, total_chunks};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug)]
struct FileTransfer {
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    // Filled as chunks arrive; the header alone never sizes an allocation.
    chunks: BTreeMap<u32, Bytes>,
    channel_label: String,
}

impl FileTransfer {
    fn progress(&self, transfer_id: u32) -> ReceiveProgress {
        ReceiveProgress {
            transfer_id,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            total_chunks: self.total_chunks,
            received_chunks: self.received_count(),
        }
    }

    fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn buffered_bytes(&self) -> usize {
        self.chunks.values().map(Bytes::len).sum()
    }

    fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    fn assemble(self) -> ReceivedFile {
        let mut content = BytesMut::with_capacity(self.buffered_bytes());
        for chunk in self.chunks.into_values() {
            content.extend_from_slice(&chunk);
        }
        ReceivedFile {
            name: self.file_name,
            size: self.file_size,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content: content.freeze(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub progress: ReceiveProgress,
    pub completed: Option<ReceivedFile>,
}

/// Reassembles inbound files keyed by transfer id. A transfer lives from its
/// first chunk until the chunk that completes it.
#[derive(Debug, Default)]
pub struct TransferAssembler {
    transfers: Mutex<HashMap<u32, FileTransfer>>,
}

impl TransferAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&self, frame: FileFrame, channel_label: &str) -> Result<IngestOutcome, FrameError> {
        let FileFrame {
            transfer_id,
            file_name,
            file_size,
            total_chunks: frame_total,
            chunk_index,
            content,
        } = frame;
        if frame_total > 0 && chunk_index >= frame_total {
            return Err(FrameError::IndexOutOfRange {
                index: chunk_index,
                total: frame_total,
            });
        }

        let mut transfers = self.transfers.lock();
        let transfer = match transfers.entry(transfer_id) {
            Entry::Occupied(entry) => {
                let transfer = entry.into_mut();
                if transfer.total_chunks != frame_total || transfer.file_size != file_size {
                    return Err(FrameError::TransferMismatch(transfer_id));
                }
                transfer
            }
            Entry::Vacant(entry) => {
                if total_chunks(file_size) != u64::from(frame_total) {
                    return Err(FrameError::InconsistentHeader {
                        transfer_id,
                        file_size,
                        total_chunks: frame_total,
                    });
                }
                debug!(
                    target = "ferry::transfer::receiver",
                    transfer_id,
                    file_name = %file_name,
                    file_size,
                    total_chunks = frame_total,
                    "incoming file transfer"
                );
                entry.insert(FileTransfer {
                    file_name,
                    file_size,
                    total_chunks: frame_total,
                    chunks: BTreeMap::new(),
                    channel_label: channel_label.to_string(),
                })
            }
        };

        // A zero-chunk transfer carries no content.
        if frame_total > 0 && transfer.chunks.insert(chunk_index, content).is_some() {
            warn!(
                target = "ferry::transfer::receiver",
                transfer_id,
                chunk_index,
                "duplicate chunk; keeping the latest copy"
            );
        }
        trace!(
            target = "ferry::transfer::receiver",
            transfer_id,
            chunk_index,
            received = transfer.received_count(),
            total = transfer.total_chunks,
            "chunk stored"
        );

        let progress = transfer.progress(transfer_id);
        let completed = if transfer.is_complete() {
            transfers.remove(&transfer_id).map(FileTransfer::assemble)
        } else {
            None
        };
        Ok(IngestOutcome {
            progress,
            completed,
        })
    }

    /// Drops whichever of `transfer_ids` are still unfinished.
    pub fn abandon(&self, transfer_ids: &HashSet<u32>) -> Vec<u32> {
        self.abandon_where(|transfer_id, _| transfer_ids.contains(&transfer_id))
    }

    /// Drops unfinished transfers matching `predicate`, which sees the
    /// transfer id and the label of the channel it first arrived on.
    pub fn abandon_where(&self, predicate: impl Fn(u32, &str) -> bool) -> Vec<u32> {
        let mut dropped = Vec::new();
        self.transfers.lock().retain(|transfer_id, transfer| {
            if !predicate(*transfer_id, &transfer.channel_label) {
                return true;
            }
            warn!(
                target = "ferry::transfer::receiver",
                transfer_id,
                label = %transfer.channel_label,
                received = transfer.received_count(),
                total = transfer.total_chunks,
                "file channel closed mid-transfer; discarding partial file"
            );
            dropped.push(*transfer_id);
            false
        });
        dropped
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.lock().len()
    }

    #[cfg(test)]
    fn buffered_bytes(&self, transfer_id: u32) -> Option<usize> {
        self.transfers
            .lock()
            .get(&transfer_id)
            .map(FileTransfer::buffered_bytes)
    }
}

/// Turns file-channel traffic into receive events.
#[derive(Clone)]
pub struct FileReceiver {
    assembler: Arc<TransferAssembler>,
    bus: Arc<dyn EventBus>,
}

impl FileReceiver {
    pub fn new(assembler: Arc<TransferAssembler>, bus: Arc<dyn EventBus>) -> Self {
        Self { assembler, bus }
    }

    pub fn assembler(&self) -> &Arc<TransferAssembler> {
        &self.assembler
    }

    /// Feeds one file-channel message to the assembler. Returns the transfer
    /// id when the message was accepted as a chunk.
    pub fn on_payload(&self, channel_label: &str, payload: Payload) -> Option<u32> {
        let bytes = match payload {
            Payload::Binary(bytes) => bytes,
            Payload::Text(_) => {
                warn!(
                    target = "ferry::transfer::receiver",
                    label = channel_label,
                    "ignoring text message on file channel"
                );
                return None;
            }
        };
        let outcome = decode_frame(&bytes).and_then(|frame| self.assembler.ingest(frame, channel_label));
        match outcome {
            Ok(outcome) => {
                let transfer_id = outcome.progress.transfer_id;
                self.bus.publish(FerryEvent::FileReceiveProgress(outcome.progress));
                if let Some(file) = outcome.completed {
                    debug!(
                        target = "ferry::transfer::receiver",
                        label = channel_label,
                        file_name = %file.name,
                        size = file.size,
                        "file received"
                    );
                    self.bus.publish(FerryEvent::FileReceived(file));
                }
                Some(transfer_id)
            }
            Err(err) => {
                warn!(
                    target = "ferry::transfer::receiver",
                    label = channel_label,
                    error = %err,
                    "dropping malformed file frame"
                );
                None
            }
        }
    }

    /// A file channel closed. Only the transfers it carried are dropped;
    /// another channel with the same label may still be mid-transfer.
    pub fn on_channel_closed(&self, transfer_ids: &HashSet<u32>) {
        self.assembler.abandon(transfer_ids);
    }

    /// Drops partial transfers from every file channel of the call with this
    /// control label.
    pub fn on_call_closed(&self, control_label: &ChannelLabel) {
        self.assembler
            .abandon_where(|_, label| control_label.resolve(label).is_some());
    }
}
