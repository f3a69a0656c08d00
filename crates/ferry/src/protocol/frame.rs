use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Payload bytes carried by every chunk except possibly the last.
pub const CHUNK_SIZE: usize = 16 * 1024;
/// Outbound buffer level above which file senders stop queueing chunks.
pub const BUFFER_HIGH_WATER_MARK: usize = 64 * 1024;

// transfer_id(4) + name_len(2) + file_size(8) + total_chunks(4) + chunk_index(4) + content_len(2)
pub const HEADER_LEN: usize = 4 + 2 + 8 + 4 + 4 + 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need {needed}")]
    TooShort { len: usize, needed: usize },
    #[error("chunk content of {0} bytes exceeds the 16384 byte limit")]
    ContentTooLarge(usize),
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("file name is not valid utf-8")]
    InvalidFileName,
    #[error("file name of {0} bytes does not fit the header")]
    FileNameTooLong(usize),
    #[error("file of {0} bytes needs more chunks than the header can count")]
    FileTooLarge(u64),
    #[error("header of transfer {transfer_id} claims {total_chunks} chunks for {file_size} bytes")]
    InconsistentHeader {
        transfer_id: u32,
        file_size: u64,
        total_chunks: u32,
    },
    #[error("transfer {0} changed its file metadata mid-stream")]
    TransferMismatch(u32),
}

/// One chunk of a file on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFrame {
    pub transfer_id: u32,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunk_index: u32,
    pub content: Bytes,
}

impl FileFrame {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.file_name.len() + self.content.len()
    }
}

/// Number of chunks needed for `file_size` bytes. Zero for an empty file.
pub fn total_chunks(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_SIZE as u64)
}

/// [`total_chunks`] narrowed to the header's field width.
pub fn total_chunks_u32(file_size: u64) -> Result<u32, FrameError> {
    u32::try_from(total_chunks(file_size)).map_err(|_| FrameError::FileTooLarge(file_size))
}

/// Content length of chunk `index` of a `file_size` byte file.
pub fn chunk_len(file_size: u64, index: u64) -> usize {
    let start = index.saturating_mul(CHUNK_SIZE as u64);
    let remaining = file_size.saturating_sub(start);
    remaining.min(CHUNK_SIZE as u64) as usize
}

pub fn encode_frame(frame: &FileFrame) -> Result<Bytes, FrameError> {
    let name = frame.file_name.as_bytes();
    let name_len =
        u16::try_from(name.len()).map_err(|_| FrameError::FileNameTooLong(name.len()))?;
    if frame.content.len() > CHUNK_SIZE {
        return Err(FrameError::ContentTooLarge(frame.content.len()));
    }
    check_index(frame.chunk_index, frame.total_chunks)?;

    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    buf.put_u32(frame.transfer_id);
    buf.put_u16(name_len);
    buf.put_u64(frame.file_size);
    buf.put_u32(frame.total_chunks);
    buf.put_u32(frame.chunk_index);
    buf.put_u16(frame.content.len() as u16);
    buf.put_slice(name);
    buf.put_slice(&frame.content);
    Ok(buf.freeze())
}

/// Content is sliced out of `bytes` without copying. Trailing bytes past the
/// declared content are ignored.
pub fn decode_frame(bytes: &Bytes) -> Result<FileFrame, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort {
            len: bytes.len(),
            needed: HEADER_LEN,
        });
    }
    let mut header = &bytes[..HEADER_LEN];
    let transfer_id = header.get_u32();
    let name_len = header.get_u16() as usize;
    let file_size = header.get_u64();
    let total_chunks = header.get_u32();
    let chunk_index = header.get_u32();
    let content_len = header.get_u16() as usize;

    if content_len > CHUNK_SIZE {
        return Err(FrameError::ContentTooLarge(content_len));
    }
    check_index(chunk_index, total_chunks)?;

    let needed = HEADER_LEN + name_len + content_len;
    if bytes.len() < needed {
        return Err(FrameError::TooShort {
            len: bytes.len(),
            needed,
        });
    }
    let name_end = HEADER_LEN + name_len;
    let file_name = std::str::from_utf8(&bytes[HEADER_LEN..name_end])
        .map_err(|_| FrameError::InvalidFileName)?
        .to_string();
    let content = bytes.slice(name_end..name_end + content_len);

    Ok(FileFrame {
        transfer_id,
        file_name,
        file_size,
        total_chunks,
        chunk_index,
        content,
    })
}

fn check_index(index: u32, total: u32) -> Result<(), FrameError> {
    // Empty files travel as a single header-only frame with zero chunks.
    if total == 0 && index == 0 {
        return Ok(());
    }
    if index >= total {
        return Err(FrameError::IndexOutOfRange { index, total });
    }
    Ok(())
}
