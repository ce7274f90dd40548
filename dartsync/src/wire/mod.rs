use bytes::{Buf, BufMut, BytesMut};
use crate::{
    table::FileEntry,
    FILE_NAME_MAX_LEN, IP_LEN, MAX_PEER_NUM,
};

mod control;
mod piece;

pub use control::{PacketKind, PeerPacket, PeerSideCodec, TrackerPacket, TrackerSideCodec};
pub use piece::{PieceRequest, PieceRequestCodec, PIECE_REQUEST_LEN};

// All integers are big-endian fixed-width fields; strings are NUL-padded.

// Bytes of one serialised file entry.
pub const ENTRY_WIRE_LEN: usize = FILE_NAME_MAX_LEN + 8 + 8 + 4 + MAX_PEER_NUM * IP_LEN;

// Sanity cap on entry counts read off the wire.
const MAX_ENTRY_COUNT: u32 = 1 << 16;

#[derive(thiserror::Error, Debug)]
pub enum WireError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid packet kind: {0}")]
    InvalidKind(u32),

    #[error("{field} is {len} bytes, exceeding the {max}-byte field")]
    FieldTooLong { field: &'static str, len: usize, max: usize },

    #[error("{0} field is not valid utf-8")]
    InvalidString(&'static str),

    #[error("entry count {0} exceeds limit")]
    EntryCountTooLarge(u32),

    #[error("entry advertises {0} sources, more than fit on the wire")]
    TooManySources(usize),

}

pub type Result<T> = std::result::Result<T, WireError>;

// Writes `value` NUL-padded to exactly `width` bytes.
fn put_fixed_str(dst: &mut BytesMut, field: &'static str, value: &str, width: usize) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(WireError::FieldTooLong { field, len: bytes.len(), max: width });
    }
    dst.extend_from_slice(bytes);
    dst.put_bytes(0, width - bytes.len());
    Ok(())
}

// Reads a `width`-byte NUL-padded string.
fn get_fixed_str(src: &mut BytesMut, field: &'static str, width: usize) -> Result<String> {
    let mut buf = vec![0u8; width];
    src.copy_to_slice(&mut buf);
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| WireError::InvalidString(field))
}

fn put_file_entry(dst: &mut BytesMut, entry: &FileEntry) -> Result<()> {
    if entry.sources.len() > MAX_PEER_NUM {
        return Err(WireError::TooManySources(entry.sources.len()));
    }
    put_fixed_str(dst, "name", &entry.name, FILE_NAME_MAX_LEN)?;
    dst.put_u64(entry.size);
    dst.put_u64(entry.timestamp);
    dst.put_u32(entry.file_type);
    for source in &entry.sources {
        put_fixed_str(dst, "source", source, IP_LEN)?;
    }
    // Empty slots have a leading NUL.
    dst.put_bytes(0, (MAX_PEER_NUM - entry.sources.len()) * IP_LEN);
    Ok(())
}

// Caller must have checked that ENTRY_WIRE_LEN bytes are available.
fn get_file_entry(src: &mut BytesMut) -> Result<FileEntry> {
    let name = get_fixed_str(src, "name", FILE_NAME_MAX_LEN)?;
    let size = src.get_u64();
    let timestamp = src.get_u64();
    let file_type = src.get_u32();

    let mut sources = Vec::new();
    for _ in 0..MAX_PEER_NUM {
        let slot = get_fixed_str(src, "source", IP_LEN)?;
        if !slot.is_empty() {
            sources.push(slot);
        }
    }

    Ok(FileEntry { name, size, timestamp, file_type, sources })
}
