//! Chunked file transfer over dedicated data channels.

mod backpressure;
mod receiver;
mod sender;

pub use backpressure::BackpressureGate;
pub use receiver::{DEFAULT_CONTENT_TYPE, FileReceiver, IngestOutcome, TransferAssembler};
pub use sender::{FileSender, TransferReport, wait_until_open};
