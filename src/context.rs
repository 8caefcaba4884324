use crate::completion::Completion;
use crate::error::fatal;
use crate::network::MemRegion;
use crate::packet::{RdvType, SHORT_SIZE};
use crate::Tag;

use std::sync::Arc;

/// Opaque word the caller attaches to an operation and gets back on completion.
pub type UserContext = usize;

/// The kind of data an operation carried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataType {
    None,
    Short,
    Medium,
    Long,
    Iovec,
}

/// Inline payload of a short message, at most [SHORT_SIZE] bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortData {
    len: u8,
    bytes: [u8; SHORT_SIZE],
}

impl ShortData {
    pub fn new(data: &[u8]) -> ShortData {
        if data.len() > SHORT_SIZE {
            fatal!(
                "short message of {} bytes exceeds the maximum of {}",
                data.len(),
                SHORT_SIZE
            );
        }
        let mut bytes = [0u8; SHORT_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ShortData {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for ShortData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ShortData({:?})", self.as_bytes())
    }
}

/// Memory registered with the fabric ahead of time, see [Device::register].
///
/// Rendezvous transfers from or into it reuse the registration instead of
/// registering the buffer for every transfer. The data can be rewritten but
/// never grown, the registration covers the bytes present at registration.
///
/// [Device::register]: crate::Device::register
#[derive(Debug)]
pub struct RegisteredBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) mr: MemRegion,
}

impl RegisteredBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A long message buffer: owned by the library, shared with the caller, or
/// registered with the fabric by the caller.
#[derive(Debug)]
pub enum Buffer {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
    Registered(RegisteredBuffer),
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Shared(s) => s,
            Buffer::Registered(r) => r.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts into an owned vector, copying only if the data is shared.
    ///
    /// A registered buffer stays registered, take it out of the
    /// [Buffer::Registered] variant and pass it to
    /// [Device::deregister](crate::Device::deregister) to release both.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Shared(s) => s.to_vec(),
            Buffer::Registered(r) => r.data,
        }
    }

    /// the existing registration, if the caller registered this buffer
    pub(crate) fn region(&self) -> Option<MemRegion> {
        match self {
            Buffer::Registered(r) => Some(r.mr),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Buffer {
        Buffer::Owned(v)
    }
}

impl From<Arc<[u8]>> for Buffer {
    fn from(s: Arc<[u8]>) -> Buffer {
        Buffer::Shared(s)
    }
}

impl From<RegisteredBuffer> for Buffer {
    fn from(r: RegisteredBuffer) -> Buffer {
        Buffer::Registered(r)
    }
}

/// A scatter/gather payload: several buffers plus a small piggy-back that
/// travels inside the handshake itself.
#[derive(Debug, Default)]
pub struct IovecData {
    pub piggy_back: Vec<u8>,
    pub buffers: Vec<Buffer>,
}

#[derive(Debug)]
pub enum RequestData {
    None,
    Short(ShortData),
    Medium(Vec<u8>),
    Long(Buffer),
    Iovec(IovecData),
}

impl RequestData {
    pub fn data_type(&self) -> DataType {
        match self {
            RequestData::None => DataType::None,
            RequestData::Short(_) => DataType::Short,
            RequestData::Medium(_) => DataType::Medium,
            RequestData::Long(_) => DataType::Long,
            RequestData::Iovec(_) => DataType::Iovec,
        }
    }
}

/// What a completion object receives once an operation finishes.
#[derive(Debug)]
pub struct Request {
    /// the peer of the operation
    pub rank: usize,
    pub tag: Tag,
    pub data: RequestData,
    pub user_context: UserContext,
}

impl Request {
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }
}

const DEREG_BIT: u8 = 1;
const RDV_SHIFT: u8 = 1;
const RDV_MASK: u8 = 0b11 << RDV_SHIFT;

/// Flags of a pending operation.
///
/// | bit | meaning |
/// |-----|---------|
/// | 0   | deregister memory registered on the fly when completing |
/// | 1-2 | rendezvous type |
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CompAttr(u8);

impl CompAttr {
    pub(crate) fn dereg(&self) -> bool {
        self.0 & DEREG_BIT != 0
    }
    pub(crate) fn set_dereg(&mut self, dereg: bool) {
        if dereg {
            self.0 |= DEREG_BIT;
        } else {
            self.0 &= !DEREG_BIT;
        }
    }
    pub(crate) fn rdv_type(&self) -> RdvType {
        match (self.0 & RDV_MASK) >> RDV_SHIFT {
            1 => RdvType::OneSided,
            2 => RdvType::Iovec,
            _ => RdvType::TwoSided,
        }
    }
    pub(crate) fn set_rdv_type(&mut self, rdv_type: RdvType) {
        self.0 = (self.0 & !RDV_MASK) | ((rdv_type as u8) << RDV_SHIFT);
    }
}

/// The record of an operation in flight.
///
/// Owned by the operation until dispatch turns it into a [Request].
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) attr: CompAttr,
    pub(crate) data: RequestData,
    pub(crate) rank: usize,
    pub(crate) tag: Tag,
    pub(crate) completion: Completion,
    pub(crate) user_context: UserContext,
    pub(crate) mrs: Vec<MemRegion>,
}

impl Context {
    pub(crate) fn new(
        data: RequestData,
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> Box<Context> {
        Box::new(Context {
            attr: CompAttr::default(),
            data,
            rank,
            tag,
            completion,
            user_context,
            mrs: Vec::new(),
        })
    }

    pub(crate) fn into_request(self) -> Request {
        Request {
            rank: self.rank,
            tag: self.tag,
            data: self.data,
            user_context: self.user_context,
        }
    }

    /// Leaks the context into a word that can travel over the wire and come
    /// back to this process.
    pub(crate) fn into_wire(ctx: Box<Context>) -> u64 {
        Box::into_raw(ctx) as usize as u64
    }

    /// Reclaims a context leaked by [into_wire][Context::into_wire].
    ///
    /// # Safety
    /// `word` must come from `into_wire` in this process and must not have
    /// been reclaimed before.
    pub(crate) unsafe fn from_wire(word: u64) -> Box<Context> {
        if word == 0 {
            fatal!("null context pointer received");
        }
        Box::from_raw(word as usize as *mut Context)
    }
}
