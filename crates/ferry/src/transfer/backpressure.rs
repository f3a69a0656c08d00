use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::TransferConfig;
use crate::error::FerryError;
use crate::transport::{DataChannel, ReadyState, TransportError};

/// Holds a sender back while a channel's outbound buffer is too full.
#[derive(Debug, Clone)]
pub struct BackpressureGate {
    high_water_mark: usize,
    poll_interval: Duration,
}

impl BackpressureGate {
    pub fn new(high_water_mark: usize, poll_interval: Duration) -> Self {
        Self {
            high_water_mark,
            poll_interval,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.high_water_mark, config.poll_interval())
    }

    /// Returns once the buffered amount is at or below the high-water mark.
    pub async fn wait(
        &self,
        channel: &dyn DataChannel,
        cancel: &CancellationToken,
    ) -> Result<(), FerryError> {
        self.wait_below(channel, self.high_water_mark, cancel).await
    }

    /// Returns once everything queued has left the buffer.
    pub async fn wait_drained(
        &self,
        channel: &dyn DataChannel,
        cancel: &CancellationToken,
    ) -> Result<(), FerryError> {
        self.wait_below(channel, 0, cancel).await
    }

    async fn wait_below(
        &self,
        channel: &dyn DataChannel,
        threshold: usize,
        cancel: &CancellationToken,
    ) -> Result<(), FerryError> {
        let mut low_water = None;
        let mut registered = false;
        loop {
            if cancel.is_cancelled() {
                return Err(FerryError::Cancelled);
            }
            if channel.ready_state() != ReadyState::Open {
                return Err(TransportError::ChannelClosed(channel.label().to_string()).into());
            }
            let buffered = channel.buffered_amount().await;
            if buffered <= threshold {
                return Ok(());
            }
            if !registered {
                low_water = channel.buffered_amount_low(threshold).await;
                registered = true;
            }
            trace!(
                target = "ferry::transfer::backpressure",
                label = channel.label(),
                buffered,
                threshold,
                "waiting for channel buffer to drain"
            );
            // A drain that lands before registration fires nothing, so keep polling.
            match &low_water {
                Some(notify) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                        _ = notify.notified() => {}
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }
}
