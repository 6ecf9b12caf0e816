//! Fixed, little-endian wire layer for entity migration.
//!
//! Entity payloads are written field by field through [`WireWriter`] and read
//! back through the bounds-checked [`WireReader`]; message framing (per-entity
//! global id and byte size) uses the Pod record [`WireEntityHdr`] so header
//! arrays can be cast to and from bytes directly.
//!
//! All multi-byte values are **little-endian** on the wire.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::error::{RepartError, Result};

/// Framing record preceding each entity payload in a migration message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEntityHdr {
    pub gid_le: u64,
    pub size_le: u64,
}

impl WireEntityHdr {
    pub fn new(gid: u64, size: usize) -> Self {
        Self {
            gid_le: gid.to_le(),
            size_le: (size as u64).to_le(),
        }
    }
    pub fn gid(&self) -> u64 {
        u64::from_le(self.gid_le)
    }
    pub fn size(&self) -> usize {
        u64::from_le(self.size_le) as usize
    }
}

/// Import/export record as exchanged between ranks while deriving an
/// assignment. `part_le` is u32 on the wire (never usize).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRecord {
    pub gid_le: u64,
    pub component_le: u32,
    pub row_le: u32,
    pub part_le: u32,
    pub _pad: u32,
}

impl WireRecord {
    pub const SIZE: usize = 24;

    pub fn new(gid: u64, component: u32, row: u32, part: u32) -> Self {
        Self {
            gid_le: gid.to_le(),
            component_le: component.to_le(),
            row_le: row.to_le(),
            part_le: part.to_le(),
            _pad: 0,
        }
    }

    pub fn decode(&self) -> (u64, u32, u32, u32) {
        (
            u64::from_le(self.gid_le),
            u32::from_le(self.component_le),
            u32::from_le(self.row_le),
            u32::from_le(self.part_le),
        )
    }
}

const_assert_eq!(std::mem::size_of::<WireEntityHdr>(), 16);
const_assert_eq!(std::mem::size_of::<WireRecord>(), WireRecord::SIZE);
const_assert_eq!(std::mem::align_of::<WireRecord>(), 8);

/// Append-only field writer over a growable byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked field reader over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(RepartError::WireTruncated { need: n, have });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn f64(&mut self) -> Result<f64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Encode a record list with a leading count.
pub fn encode_records(records: &[WireRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + records.len() * WireRecord::SIZE);
    out.extend_from_slice(&(records.len() as u64).to_le_bytes());
    out.extend_from_slice(bytemuck::cast_slice(records));
    out
}

/// Decode a record list produced by [`encode_records`].
pub fn decode_records(buf: &[u8]) -> Result<Vec<WireRecord>> {
    let mut rd = WireReader::new(buf);
    let count = rd.u64()? as usize;
    // count comes off the wire; the size product must not wrap before the
    // bounds check
    let need = count
        .checked_mul(WireRecord::SIZE)
        .ok_or(RepartError::WireTruncated {
            need: usize::MAX,
            have: rd.remaining(),
        })?;
    if rd.remaining() < need {
        return Err(RepartError::WireTruncated {
            need,
            have: rd.remaining(),
        });
    }
    let mut out = vec![WireRecord::zeroed(); count];
    bytemuck::cast_slice_mut::<WireRecord, u8>(&mut out)
        .copy_from_slice(&buf[8..8 + need]);
    Ok(out)
}
