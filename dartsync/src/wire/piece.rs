use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::FILE_NAME_MAX_LEN;
use super::{get_fixed_str, put_fixed_str, WireError};

pub const PIECE_REQUEST_LEN: usize = FILE_NAME_MAX_LEN + 8 + 4 + 4;

// One piece request on a P2P stream. The uploader replies with exactly
// `size` raw bytes, no framing header. A request whose file name starts
// with a NUL is the end-of-stream sentinel.
#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub struct PieceRequest {
    pub file_name: String,
    pub start: u64,
    pub size: u32,
    pub piece_num: u32,
}

impl PieceRequest {

    pub fn sentinel() -> Self {
        PieceRequest {
            file_name: String::new(),
            start: 0,
            size: 0,
            piece_num: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.file_name.is_empty()
    }
}

pub struct PieceRequestCodec;

impl Encoder<PieceRequest> for PieceRequestCodec {

    type Error = WireError;

    fn encode(&mut self, req: PieceRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_fixed_str(dst, "file_name", &req.file_name, FILE_NAME_MAX_LEN)?;
        dst.put_u64(req.start);
        dst.put_u32(req.size);
        dst.put_u32(req.piece_num);
        Ok(())
    }
}

impl Decoder for PieceRequestCodec {

    type Item = PieceRequest;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < PIECE_REQUEST_LEN {
            return Ok(None);
        }

        let file_name = get_fixed_str(src, "file_name", FILE_NAME_MAX_LEN)?;
        let start = src.get_u64();
        let size = src.get_u32();
        let piece_num = src.get_u32();

        Ok(Some(PieceRequest { file_name, start, size, piece_num }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = PieceRequest {
            file_name: "sub/data.bin".to_string(),
            start: 512,
            size: 256,
            piece_num: 2,
        };
        let mut buf = BytesMut::new();
        PieceRequestCodec.encode(req.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), PIECE_REQUEST_LEN);

        let decoded = PieceRequestCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert!(!decoded.is_sentinel());
    }

    #[test]
    fn test_sentinel_round_trip() {
        let mut buf = BytesMut::new();
        PieceRequestCodec.encode(PieceRequest::sentinel(), &mut buf).unwrap();
        let decoded = PieceRequestCodec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_sentinel());
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = BytesMut::new();
        PieceRequestCodec.encode(PieceRequest::sentinel(), &mut buf).unwrap();
        let tail = buf.split_off(PIECE_REQUEST_LEN - 3);
        assert!(PieceRequestCodec.decode(&mut buf).unwrap().is_none());

        buf.unsplit(tail);
        assert!(PieceRequestCodec.decode(&mut buf).unwrap().is_some());
    }
}
