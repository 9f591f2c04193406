use crate::error::{DbError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub type Lsn = u64;
pub type TxnId = u64;

/// LSN 0 is never assigned; records with no predecessor carry it as
/// their previous-LSN.
pub const INVALID_LSN: Lsn = 0;

/// Upper bound on a single logged image, so a corrupt length field
/// cannot drive an allocation through the roof.
const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

const KIND_BEGIN: u8 = 0;
const KIND_COMMIT: u8 = 1;
const KIND_ABORT: u8 = 2;
const KIND_UPDATE: u8 = 3;
const KIND_CLR: u8 = 4;
const KIND_CHECKPOINT: u8 = 5;

/// Kind-specific payload of a log record. A closed set of variants
/// sharing the common header, not a class hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Update {
        page_id: u64,
        offset: u32,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    Clr {
        page_id: u64,
        offset: u32,
        undo_image: Vec<u8>,
        undo_next_lsn: Lsn,
    },
    Checkpoint {
        active_txns: Vec<TxnId>,
    },
}

/// One WAL record: common header {LSN, txn id, previous LSN, kind}
/// plus the kind payload. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn kind(&self) -> u8 {
        match &self.payload {
            LogPayload::Begin => KIND_BEGIN,
            LogPayload::Commit => KIND_COMMIT,
            LogPayload::Abort => KIND_ABORT,
            LogPayload::Update { .. } => KIND_UPDATE,
            LogPayload::Clr { .. } => KIND_CLR,
            LogPayload::Checkpoint { .. } => KIND_CHECKPOINT,
        }
    }

    /// Serializes the record body (header + payload). The on-disk
    /// framing adds a u32 length prefix around this.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        // Writing into a Vec cannot fail.
        buf.write_u64::<LittleEndian>(self.lsn).unwrap();
        buf.write_u64::<LittleEndian>(self.txn_id).unwrap();
        buf.write_u64::<LittleEndian>(self.prev_lsn).unwrap();
        buf.write_u8(self.kind()).unwrap();

        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Update {
                page_id,
                offset,
                before_image,
                after_image,
            } => {
                buf.write_u64::<LittleEndian>(*page_id).unwrap();
                buf.write_u32::<LittleEndian>(*offset).unwrap();
                buf.write_u32::<LittleEndian>(before_image.len() as u32).unwrap();
                buf.extend_from_slice(before_image);
                buf.write_u32::<LittleEndian>(after_image.len() as u32).unwrap();
                buf.extend_from_slice(after_image);
            }
            LogPayload::Clr {
                page_id,
                offset,
                undo_image,
                undo_next_lsn,
            } => {
                buf.write_u64::<LittleEndian>(*page_id).unwrap();
                buf.write_u32::<LittleEndian>(*offset).unwrap();
                buf.write_u32::<LittleEndian>(undo_image.len() as u32).unwrap();
                buf.extend_from_slice(undo_image);
                buf.write_u64::<LittleEndian>(*undo_next_lsn).unwrap();
            }
            LogPayload::Checkpoint { active_txns } => {
                buf.write_u32::<LittleEndian>(active_txns.len() as u32).unwrap();
                for txn in active_txns {
                    buf.write_u64::<LittleEndian>(*txn).unwrap();
                }
            }
        }
        buf
    }

    /// Decodes a record body. Any short read or unknown kind is
    /// `Corruption`; the caller has already stripped the length prefix.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let lsn = read_u64(&mut cur)?;
        let txn_id = read_u64(&mut cur)?;
        let prev_lsn = read_u64(&mut cur)?;
        let kind = cur
            .read_u8()
            .map_err(|_| DbError::Corruption("log record header truncated".to_string()))?;

        let payload = match kind {
            KIND_BEGIN => LogPayload::Begin,
            KIND_COMMIT => LogPayload::Commit,
            KIND_ABORT => LogPayload::Abort,
            KIND_UPDATE => {
                let page_id = read_u64(&mut cur)?;
                let offset = read_u32(&mut cur)?;
                let before_image = read_image(&mut cur)?;
                let after_image = read_image(&mut cur)?;
                LogPayload::Update {
                    page_id,
                    offset,
                    before_image,
                    after_image,
                }
            }
            KIND_CLR => {
                let page_id = read_u64(&mut cur)?;
                let offset = read_u32(&mut cur)?;
                let undo_image = read_image(&mut cur)?;
                let undo_next_lsn = read_u64(&mut cur)?;
                LogPayload::Clr {
                    page_id,
                    offset,
                    undo_image,
                    undo_next_lsn,
                }
            }
            KIND_CHECKPOINT => {
                let count = read_u32(&mut cur)? as usize;
                if count > buf.len() {
                    return Err(DbError::Corruption(
                        "checkpoint record txn count exceeds record size".to_string(),
                    ));
                }
                let mut active_txns = Vec::with_capacity(count);
                for _ in 0..count {
                    active_txns.push(read_u64(&mut cur)?);
                }
                LogPayload::Checkpoint { active_txns }
            }
            other => {
                return Err(DbError::Corruption(format!(
                    "unknown log record kind {}",
                    other
                )))
            }
        };

        Ok(Self {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        })
    }
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    cur.read_u64::<LittleEndian>()
        .map_err(|_| DbError::Corruption("log record truncated".to_string()))
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    cur.read_u32::<LittleEndian>()
        .map_err(|_| DbError::Corruption("log record truncated".to_string()))
}

fn read_image(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = read_u32(cur)? as usize;
    if len > MAX_IMAGE_BYTES {
        return Err(DbError::Corruption(format!(
            "log image of {} bytes exceeds maximum",
            len
        )));
    }
    let mut image = vec![0u8; len];
    std::io::Read::read_exact(cur, &mut image)
        .map_err(|_| DbError::Corruption("log image truncated".to_string()))?;
    Ok(image)
}
