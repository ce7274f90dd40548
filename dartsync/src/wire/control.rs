use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{table::FileEntry, IP_LEN};
use super::{
    get_file_entry, get_fixed_str, put_file_entry, put_fixed_str,
    WireError, ENTRY_WIRE_LEN, MAX_ENTRY_COUNT,
};

// Fixed header bytes ahead of the entry list.
const PEER_HEADER_LEN: usize = 4 + IP_LEN + 4 + 4;
const TRACKER_HEADER_LEN: usize = 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {

    // Sent once, immediately after connecting.
    Register = 1,

    // Sent every heartbeat interval.
    KeepAlive = 2,

    // Carries the peer's full local file table.
    FileUpdate = 3,

}

impl TryFrom<u32> for PacketKind {
    type Error = WireError;

    fn try_from(kind: u32) -> Result<Self, WireError> {
        match kind {
            1 => Ok(PacketKind::Register),
            2 => Ok(PacketKind::KeepAlive),
            3 => Ok(PacketKind::FileUpdate),
            other => Err(WireError::InvalidKind(other)),
        }
    }
}

// Peer to tracker, on the persistent control stream.
#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub struct PeerPacket {
    pub kind: PacketKind,
    pub ip: String,
    pub port: u32,
    pub entries: Vec<FileEntry>,
}

impl PeerPacket {

    pub fn register(ip: &str, port: u16) -> Self {
        PeerPacket {
            kind: PacketKind::Register,
            ip: ip.to_string(),
            port: port as u32,
            entries: Vec::new(),
        }
    }

    pub fn keep_alive(ip: &str) -> Self {
        PeerPacket {
            kind: PacketKind::KeepAlive,
            ip: ip.to_string(),
            port: 0,
            entries: Vec::new(),
        }
    }

    pub fn file_update(ip: &str, entries: Vec<FileEntry>) -> Self {
        PeerPacket {
            kind: PacketKind::FileUpdate,
            ip: ip.to_string(),
            port: 0,
            entries,
        }
    }
}

// Tracker to peer: the merged file table plus the two parameters a peer
// needs before it can run.
#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub struct TrackerPacket {
    pub heartbeat_interval: u32,
    pub piece_len: u32,
    pub entries: Vec<FileEntry>,
}

// Codec for the peer's end of the control stream: encodes PeerPacket,
// decodes TrackerPacket.
pub struct PeerSideCodec;

impl Encoder<PeerPacket> for PeerSideCodec {

    type Error = WireError;

    fn encode(&mut self, pkt: PeerPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u32(pkt.kind as u32);
        put_fixed_str(dst, "ip", &pkt.ip, IP_LEN)?;
        dst.put_u32(pkt.port);
        dst.put_u32(pkt.entries.len() as u32);
        for entry in &pkt.entries {
            put_file_entry(dst, entry)?;
        }
        Ok(())
    }
}

impl Decoder for PeerSideCodec {

    type Item = TrackerPacket;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < TRACKER_HEADER_LEN {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        peeker.advance(8);
        let entry_count = peeker.get_u32();
        if entry_count > MAX_ENTRY_COUNT {
            return Err(WireError::EntryCountTooLarge(entry_count));
        }
        if src.remaining() < TRACKER_HEADER_LEN + entry_count as usize * ENTRY_WIRE_LEN {
            return Ok(None);
        }

        let heartbeat_interval = src.get_u32();
        let piece_len = src.get_u32();
        src.advance(4);
        let entries = (0..entry_count)
            .map(|_| get_file_entry(src))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(TrackerPacket { heartbeat_interval, piece_len, entries }))
    }
}

// Codec for the tracker's end: encodes TrackerPacket, decodes PeerPacket.
pub struct TrackerSideCodec;

impl Encoder<TrackerPacket> for TrackerSideCodec {

    type Error = WireError;

    fn encode(&mut self, pkt: TrackerPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u32(pkt.heartbeat_interval);
        dst.put_u32(pkt.piece_len);
        dst.put_u32(pkt.entries.len() as u32);
        for entry in &pkt.entries {
            put_file_entry(dst, entry)?;
        }
        Ok(())
    }
}

impl Decoder for TrackerSideCodec {

    type Item = PeerPacket;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < PEER_HEADER_LEN {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let kind = peeker.get_u32();
        peeker.advance(IP_LEN + 4);
        let entry_count = peeker.get_u32();

        // Reject garbage before waiting on a bogus length.
        let kind = PacketKind::try_from(kind)?;
        if entry_count > MAX_ENTRY_COUNT {
            return Err(WireError::EntryCountTooLarge(entry_count));
        }
        if src.remaining() < PEER_HEADER_LEN + entry_count as usize * ENTRY_WIRE_LEN {
            return Ok(None);
        }

        src.advance(4);
        let ip = get_fixed_str(src, "ip", IP_LEN)?;
        let port = src.get_u32();
        src.advance(4);
        let entries = (0..entry_count)
            .map(|_| get_file_entry(src))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PeerPacket { kind, ip, port, entries }))
    }
}
