//! Wire buffers and the byte layout of every control message.
//!
//! All multi-byte fields are little-endian and packed without padding.
//!
//! Immediate word (32 bits):
//!
//! | bits  | field        |
//! |-------|--------------|
//! | 0-3   | message kind |
//! | 4-15  | endpoint id  |
//! | 16-31 | tag          |
//!
//! RTS: `rdv_type u8 | send_ctx u64 | count u32 | piggy_back_len u64 | size u64 * count | piggy_back`
//!
//! RTR: `rdv_type u8 | mode u8 | send_ctx u64 | recv_ctx u64 | count u32 | (rkey u64, base u64, offset u64) * count`
//!
//! FIN: `recv_ctx u64`

use crate::error::fatal;
use crate::Tag;

/// Size in bytes of the inline payload of a short message.
pub const SHORT_SIZE: usize = 32;

pub(crate) const MAX_ENDPOINTS: usize = 1 << 12;

/// smallest packet that holds a short payload and a single-buffer RTS or RTR
pub(crate) const MIN_PACKET_SIZE: usize = 64;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MsgKind {
    None = 0,
    Short = 1,
    Medium = 2,
    RdmaShort = 3,
    RdmaMedium = 4,
    Rts = 5,
    Rtr = 6,
    RdvData = 7,
    Fin = 8,
}

impl MsgKind {
    fn from_bits(bits: u32) -> MsgKind {
        match bits {
            0 => MsgKind::None,
            1 => MsgKind::Short,
            2 => MsgKind::Medium,
            3 => MsgKind::RdmaShort,
            4 => MsgKind::RdmaMedium,
            5 => MsgKind::Rts,
            6 => MsgKind::Rtr,
            7 => MsgKind::RdvData,
            8 => MsgKind::Fin,
            _ => fatal!("unknown message kind {}", bits),
        }
    }
}

/// The immediate word attached to every send and to write-with-immediate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Proto(pub(crate) u32);

impl Proto {
    pub(crate) fn new(gid: u16, kind: MsgKind, tag: Tag) -> Proto {
        debug_assert!((gid as usize) < MAX_ENDPOINTS);
        Proto(kind as u32 | ((gid as u32 & 0xFFF) << 4) | ((tag as u32) << 16))
    }
    pub(crate) fn kind(&self) -> MsgKind {
        MsgKind::from_bits(self.0 & 0xF)
    }
    pub(crate) fn gid(&self) -> u16 {
        ((self.0 >> 4) & 0xFFF) as u16
    }
    pub(crate) fn tag(&self) -> Tag {
        ((self.0 >> 16) & 0xFFFF) as Tag
    }
}

#[derive(Debug)]
pub(crate) struct PacketHeader {
    /// pool the packet goes back to, `None` means the pool of the releasing thread
    pub(crate) return_pool: Option<usize>,
    pub(crate) src_rank: usize,
    pub(crate) length: usize,
}

/// A fixed-size wire buffer owned by a [PacketPool][crate::packet_pool::PacketPool].
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) header: PacketHeader,
    buf: Box<[u8]>,
}

impl Packet {
    pub(crate) fn new(size: usize) -> Box<Packet> {
        Box::new(Packet {
            header: PacketHeader {
                return_pool: None,
                src_rank: 0,
                length: 0,
            },
            buf: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf[..self.header.length]
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// copies `data` to the start of the buffer and sets the payload length
    pub(crate) fn fill(&mut self, data: &[u8]) {
        if data.len() > self.buf.len() {
            fatal!(
                "payload of {} bytes does not fit a {} byte packet",
                data.len(),
                self.buf.len()
            );
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.header.length = data.len();
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RdvType {
    TwoSided = 0,
    OneSided = 1,
    Iovec = 2,
}

impl RdvType {
    fn from_byte(b: u8) -> RdvType {
        match b {
            0 => RdvType::TwoSided,
            1 => RdvType::OneSided,
            2 => RdvType::Iovec,
            _ => fatal!("unknown rendezvous type {}", b),
        }
    }
}

/// How the receiver expects to learn that the data has landed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RtrMode {
    WriteFin = 0,
    WriteImm = 1,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Rts {
    pub(crate) rdv_type: RdvType,
    pub(crate) send_ctx: u64,
    pub(crate) sizes: Vec<u64>,
    pub(crate) piggy_back: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RemoteBuffer {
    pub(crate) rkey: u64,
    pub(crate) base: u64,
    pub(crate) offset: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Rtr {
    pub(crate) rdv_type: RdvType,
    pub(crate) mode: RtrMode,
    pub(crate) send_ctx: u64,
    pub(crate) recv_ctx: u64,
    pub(crate) buffers: Vec<RemoteBuffer>,
}

const RTS_FIXED: usize = 1 + 8 + 4 + 8;
const RTR_FIXED: usize = 1 + 1 + 8 + 8 + 4;
const RTR_ITEM: usize = 24;
pub(crate) const FIN_SIZE: usize = 8;

/// Writes fields sequentially into a byte buffer.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }
    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }
    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }
    fn bytes(&mut self, len: usize) -> &'a [u8] {
        if self.pos + len > self.buf.len() {
            fatal!(
                "truncated control message: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.buf.len()
            );
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        out
    }
    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }
    fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.bytes(4));
        u32::from_le_bytes(b)
    }
    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.bytes(8));
        u64::from_le_bytes(b)
    }
}

impl Rts {
    pub(crate) fn packed_size(&self) -> usize {
        RTS_FIXED + 8 * self.sizes.len() + self.piggy_back.len()
    }

    /// largest piggy-back that still fits next to `count` sizes in one packet
    pub(crate) fn max_piggy_back(packet_size: usize, count: usize) -> usize {
        packet_size.saturating_sub(RTS_FIXED + 8 * count)
    }

    /// packs into `buf`, returning the number of bytes written
    pub(crate) fn pack(&self, buf: &mut [u8]) -> usize {
        let len = self.packed_size();
        if len > buf.len() {
            fatal!("RTS of {} bytes does not fit a {} byte packet", len, buf.len());
        }
        let mut w = Writer::new(buf);
        w.u8(self.rdv_type as u8);
        w.u64(self.send_ctx);
        w.u32(self.sizes.len() as u32);
        w.u64(self.piggy_back.len() as u64);
        for size in &self.sizes {
            w.u64(*size);
        }
        w.bytes(&self.piggy_back);
        w.pos
    }

    /// rendezvous type of a packed RTS, without parsing the rest
    pub(crate) fn peek_type(buf: &[u8]) -> RdvType {
        RdvType::from_byte(Reader::new(buf).u8())
    }

    pub(crate) fn unpack(buf: &[u8]) -> Rts {
        let mut r = Reader::new(buf);
        let rdv_type = RdvType::from_byte(r.u8());
        let send_ctx = r.u64();
        let count = r.u32() as usize;
        let piggy_len = r.u64() as usize;
        let sizes = (0..count).map(|_| r.u64()).collect();
        let piggy_back = r.bytes(piggy_len).to_vec();
        Rts {
            rdv_type,
            send_ctx,
            sizes,
            piggy_back,
        }
    }
}

impl Rtr {
    pub(crate) fn packed_size(&self) -> usize {
        RTR_FIXED + RTR_ITEM * self.buffers.len()
    }

    pub(crate) fn pack(&self, buf: &mut [u8]) -> usize {
        let len = self.packed_size();
        if len > buf.len() {
            fatal!("RTR of {} bytes does not fit a {} byte packet", len, buf.len());
        }
        let mut w = Writer::new(buf);
        w.u8(self.rdv_type as u8);
        w.u8(self.mode as u8);
        w.u64(self.send_ctx);
        w.u64(self.recv_ctx);
        w.u32(self.buffers.len() as u32);
        for rb in &self.buffers {
            w.u64(rb.rkey);
            w.u64(rb.base);
            w.u64(rb.offset);
        }
        w.pos
    }

    pub(crate) fn unpack(buf: &[u8]) -> Rtr {
        let mut r = Reader::new(buf);
        let rdv_type = RdvType::from_byte(r.u8());
        let mode = match r.u8() {
            0 => RtrMode::WriteFin,
            1 => RtrMode::WriteImm,
            m => fatal!("unknown RTR mode {}", m),
        };
        let send_ctx = r.u64();
        let recv_ctx = r.u64();
        let count = r.u32() as usize;
        let buffers = (0..count)
            .map(|_| RemoteBuffer {
                rkey: r.u64(),
                base: r.u64(),
                offset: r.u64(),
            })
            .collect();
        Rtr {
            rdv_type,
            mode,
            send_ctx,
            recv_ctx,
            buffers,
        }
    }
}

/// Number of scatter items whose RTS and RTR both fit one packet.
pub(crate) fn max_iovec_count(packet_size: usize) -> usize {
    std::cmp::min(
        packet_size.saturating_sub(RTS_FIXED) / 8,
        packet_size.saturating_sub(RTR_FIXED) / RTR_ITEM,
    )
}

pub(crate) fn pack_fin(recv_ctx: u64) -> [u8; FIN_SIZE] {
    recv_ctx.to_le_bytes()
}

pub(crate) fn unpack_fin(buf: &[u8]) -> u64 {
    Reader::new(buf).u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_fields() {
        let proto = Proto::new(0xABC, MsgKind::Rtr, 0xBEEF);
        assert_eq!(proto.kind(), MsgKind::Rtr);
        assert_eq!(proto.gid(), 0xABC);
        assert_eq!(proto.tag(), 0xBEEF);
        assert_eq!(proto.0, 0xBEEF_ABC6);
    }

    #[test]
    fn rts_layout() {
        let rts = Rts {
            rdv_type: RdvType::Iovec,
            send_ctx: 0x1122_3344_5566_7788,
            sizes: vec![3, 5],
            piggy_back: vec![9, 9],
        };
        let mut buf = [0u8; 64];
        let len = rts.pack(&mut buf);
        assert_eq!(len, RTS_FIXED + 16 + 2);
        assert_eq!(buf[0], RdvType::Iovec as u8);
        assert_eq!(&buf[1..9], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[9..13], &2u32.to_le_bytes());
        assert_eq!(&buf[13..21], &2u64.to_le_bytes());
        assert_eq!(&buf[21..29], &3u64.to_le_bytes());
        assert_eq!(&buf[37..39], &[9, 9]);
        assert_eq!(Rts::peek_type(&buf[..len]), RdvType::Iovec);
        assert_eq!(Rts::unpack(&buf[..len]), rts);
    }

    #[test]
    fn rtr_layout() {
        let rtr = Rtr {
            rdv_type: RdvType::TwoSided,
            mode: RtrMode::WriteImm,
            send_ctx: 7,
            recv_ctx: 42,
            buffers: vec![RemoteBuffer {
                rkey: 1,
                base: 0x1000,
                offset: 16,
            }],
        };
        let mut buf = [0u8; 64];
        let len = rtr.pack(&mut buf);
        assert_eq!(len, RTR_FIXED + RTR_ITEM);
        assert_eq!(buf[1], RtrMode::WriteImm as u8);
        assert_eq!(&buf[10..18], &42u64.to_le_bytes());
        assert_eq!(Rtr::unpack(&buf[..len]), rtr);
    }

    #[test]
    fn iovec_count_fits_packet() {
        let packet_size = 8192;
        let count = max_iovec_count(packet_size);
        let rtr = Rtr {
            rdv_type: RdvType::Iovec,
            mode: RtrMode::WriteFin,
            send_ctx: 0,
            recv_ctx: 0,
            buffers: vec![
                RemoteBuffer {
                    rkey: 0,
                    base: 0,
                    offset: 0
                };
                count
            ],
        };
        assert!(rtr.packed_size() <= packet_size);
        assert!(RTS_FIXED + 8 * count <= packet_size);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_fill() {
        let mut packet = Packet::new(8);
        packet.fill(&[0u8; 9]);
    }
}
