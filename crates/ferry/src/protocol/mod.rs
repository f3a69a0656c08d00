//! Binary file-transfer framing.

mod frame;

pub use frame::{
    BUFFER_HIGH_WATER_MARK, CHUNK_SIZE, FileFrame, FrameError, HEADER_LEN, chunk_len,
    decode_frame, encode_frame, total_chunks, total_chunks_u32,
};
