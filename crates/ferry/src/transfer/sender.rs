use std::sync::Arc;

use bytes::Bytes;
use ferry_bus::{EventBus, FerryEvent, Payload, SendProgress};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::backpressure::BackpressureGate;
use crate::error::FerryError;
use crate::protocol::{CHUNK_SIZE, FileFrame, chunk_len, encode_frame, total_chunks_u32};
use crate::transport::{ChannelEvent, DataChannel, ReadyState, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: u32,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

/// Streams one file over a dedicated channel: paced by the backpressure gate,
/// one frame per chunk, progress published after every send.
pub struct FileSender {
    bus: Arc<dyn EventBus>,
    gate: BackpressureGate,
}

impl FileSender {
    pub fn new(bus: Arc<dyn EventBus>, gate: BackpressureGate) -> Self {
        Self { bus, gate }
    }

    /// Sends `file_size` bytes read from `reader`. The channel is closed
    /// afterwards whether or not the transfer succeeded.
    pub async fn send<R>(
        &self,
        channel: &dyn DataChannel,
        events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
        file_name: &str,
        file_size: u64,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, FerryError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self
            .stream(channel, events, file_name, file_size, reader, cancel)
            .await;
        if let Err(err) = &result {
            warn!(
                target = "ferry::transfer::sender",
                label = channel.label(),
                error = %err,
                "file transfer aborted"
            );
        }
        if let Err(err) = channel.close().await {
            debug!(
                target = "ferry::transfer::sender",
                label = channel.label(),
                error = %err,
                "file channel close failed"
            );
        }
        result
    }

    async fn stream<R>(
        &self,
        channel: &dyn DataChannel,
        events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
        file_name: &str,
        file_size: u64,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, FerryError>
    where
        R: AsyncRead + Unpin + Send,
    {
        wait_until_open(channel, events, cancel).await?;

        let total_chunks = total_chunks_u32(file_size)?;
        // Collisions with another in-flight transfer are possible and accepted.
        let transfer_id: u32 = rand::random();
        let report = TransferReport {
            transfer_id,
            file_name: file_name.to_string(),
            file_size,
            total_chunks,
        };
        debug!(
            target = "ferry::transfer::sender",
            transfer_id,
            file_name,
            file_size,
            total_chunks,
            "starting file transfer"
        );

        if total_chunks == 0 {
            self.send_frame(channel, &report, 0, Bytes::new()).await?;
            self.publish_progress(&report, 0);
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        for index in 0..total_chunks {
            self.gate.wait(channel, cancel).await?;
            let len = chunk_len(file_size, u64::from(index));
            reader.read_exact(&mut buf[..len]).await?;
            self.send_frame(channel, &report, index, Bytes::copy_from_slice(&buf[..len]))
                .await?;
            self.publish_progress(&report, index + 1);
        }

        self.gate.wait_drained(channel, cancel).await?;
        debug!(
            target = "ferry::transfer::sender",
            transfer_id,
            file_name,
            "file transfer sent"
        );
        Ok(report)
    }

    async fn send_frame(
        &self,
        channel: &dyn DataChannel,
        report: &TransferReport,
        chunk_index: u32,
        content: Bytes,
    ) -> Result<(), FerryError> {
        let frame = FileFrame {
            transfer_id: report.transfer_id,
            file_name: report.file_name.clone(),
            file_size: report.file_size,
            total_chunks: report.total_chunks,
            chunk_index,
            content,
        };
        let encoded = encode_frame(&frame)?;
        trace!(
            target = "ferry::transfer::sender",
            transfer_id = report.transfer_id,
            chunk_index,
            bytes = encoded.len(),
            "sending chunk"
        );
        channel.send(&Payload::Binary(encoded)).await?;
        Ok(())
    }

    fn publish_progress(&self, report: &TransferReport, sent_chunks: u32) {
        self.bus.publish(FerryEvent::FileSendProgress(SendProgress {
            transfer_id: report.transfer_id,
            file_name: report.file_name.clone(),
            file_size: report.file_size,
            total_chunks: report.total_chunks,
            sent_chunks,
        }));
    }
}

/// Resolves once `channel` is open. Without an event stream the ready state is
/// all there is to go on.
pub async fn wait_until_open(
    channel: &dyn DataChannel,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    cancel: &CancellationToken,
) -> Result<(), FerryError> {
    let closed = || FerryError::from(TransportError::ChannelClosed(channel.label().to_string()));
    match channel.ready_state() {
        ReadyState::Open => return Ok(()),
        ReadyState::Closing | ReadyState::Closed => return Err(closed()),
        ReadyState::Connecting => {}
    }
    let Some(mut events) = events else {
        return Err(FerryError::ChannelNotOpen(channel.label().to_string()));
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            event = events.recv() => match event {
                Some(ChannelEvent::Open) => return Ok(()),
                Some(ChannelEvent::Message(_)) => continue,
                Some(ChannelEvent::Error(reason)) => {
                    return Err(TransportError::Setup(reason).into());
                }
                Some(ChannelEvent::Closed) | None => return Err(closed()),
            },
        }
    }
}
