//! Log entry wire format
//!
//! ```text
//! 0   magic    u32      8   txn_id u64      24  target u64
//! 4   kind     u8       16  seq    u32      32  crc32  u32
//! 5   flags    u8       20  len    u32      36  (pad)  u32
//! 6   (pad)    u16
//! 40  payload  [len bytes], entry padded to 8 bytes
//! ```
//!
//! The CRC covers bytes 0..32 of the header and the payload. Update and
//! CAS payloads are `before ‖ after`, both halves the same length.

use crate::pmem::layout::align_to;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

/// Marks the start of a log entry ("LOGE")
pub const ENTRY_MAGIC: u32 = 0x4547_4F4C;

pub const ENTRY_HEADER_SIZE: usize = 40;

const CRC_OFFSET: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Begin = 1,
    /// Logged in-place write: before and after images
    Update = 2,
    /// Logged single-word compare-and-swap: expected and new word
    Cas = 3,
    /// Block at `target` handed out by this transaction; `flags` = size class
    Alloc = 4,
    /// Block at `target` released when this transaction commits
    Free = 5,
    Commit = 6,
    Abort = 7,
}

impl EntryKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => EntryKind::Begin,
            2 => EntryKind::Update,
            3 => EntryKind::Cas,
            4 => EntryKind::Alloc,
            5 => EntryKind::Free,
            6 => EntryKind::Commit,
            7 => EntryKind::Abort,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub flags: u8,
    pub txn_id: u64,
    pub seq: u32,
    pub target: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn marker(kind: EntryKind, txn_id: u64, seq: u32) -> Self {
        Self {
            kind,
            flags: 0,
            txn_id,
            seq,
            target: 0,
            payload: Vec::new(),
        }
    }

    pub fn update(txn_id: u64, seq: u32, target: u64, before: &[u8], after: &[u8]) -> Self {
        debug_assert_eq!(before.len(), after.len());
        let mut payload = Vec::with_capacity(before.len() * 2);
        payload.extend_from_slice(before);
        payload.extend_from_slice(after);
        Self {
            kind: EntryKind::Update,
            flags: 0,
            txn_id,
            seq,
            target,
            payload,
        }
    }

    pub fn cas(txn_id: u64, seq: u32, target: u64, expected: u64, new: u64) -> Self {
        let mut entry = Self::update(
            txn_id,
            seq,
            target,
            &expected.to_le_bytes(),
            &new.to_le_bytes(),
        );
        entry.kind = EntryKind::Cas;
        entry
    }

    pub fn block(kind: EntryKind, txn_id: u64, seq: u32, block: u64, class: u8) -> Self {
        Self {
            kind,
            flags: class,
            txn_id,
            seq,
            target: block,
            payload: Vec::new(),
        }
    }

    /// Bytes this entry occupies in a lane
    #[inline]
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.payload.len())
    }

    pub fn before(&self) -> &[u8] {
        &self.payload[..self.payload.len() / 2]
    }

    pub fn after(&self) -> &[u8] {
        &self.payload[self.payload.len() / 2..]
    }

    /// CAS images as words
    pub fn cas_words(&self) -> (u64, u64) {
        (
            LittleEndian::read_u64(self.before()),
            LittleEndian::read_u64(self.after()),
        )
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u32::<LittleEndian>(ENTRY_MAGIC)?;
        buf.write_u8(self.kind as u8)?;
        buf.write_u8(self.flags)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.txn_id)?;
        buf.write_u32::<LittleEndian>(self.seq)?;
        buf.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        buf.write_u64::<LittleEndian>(self.target)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.extend_from_slice(&self.payload);
        buf.resize(self.encoded_len(), 0);

        let crc = entry_crc(&buf[..CRC_OFFSET], &self.payload);
        LittleEndian::write_u32(&mut buf[CRC_OFFSET..CRC_OFFSET + 4], crc);
        Ok(buf)
    }

    /// Decode the entry at the start of `bytes`; `None` if it is torn,
    /// zeroed or otherwise invalid
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(bytes);
        if cursor.read_u32::<LittleEndian>().ok()? != ENTRY_MAGIC {
            return None;
        }
        let kind = EntryKind::from_u8(cursor.read_u8().ok()?)?;
        let flags = cursor.read_u8().ok()?;
        let _pad = cursor.read_u16::<LittleEndian>().ok()?;
        let txn_id = cursor.read_u64::<LittleEndian>().ok()?;
        let seq = cursor.read_u32::<LittleEndian>().ok()?;
        let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
        let target = cursor.read_u64::<LittleEndian>().ok()?;
        let crc = cursor.read_u32::<LittleEndian>().ok()?;
        let _pad = cursor.read_u32::<LittleEndian>().ok()?;

        if ENTRY_HEADER_SIZE.checked_add(len)? > bytes.len() {
            return None;
        }
        let mut payload = vec![0u8; len];
        cursor.read_exact(&mut payload).ok()?;

        if entry_crc(&bytes[..CRC_OFFSET], &payload) != crc {
            return None;
        }
        match kind {
            EntryKind::Update if len % 2 != 0 => return None,
            EntryKind::Cas if len != 16 => return None,
            _ => {}
        }

        Some(Self {
            kind,
            flags,
            txn_id,
            seq,
            target,
            payload,
        })
    }
}

/// Lane bytes taken by an entry with `payload_len` bytes of payload
#[inline]
pub fn encoded_len(payload_len: usize) -> usize {
    align_to(ENTRY_HEADER_SIZE + payload_len, 8)
}

fn entry_crc(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}
