//! # Durable Journal
//!
//! **Crash-Safe Transaction Log + Audit Trail**
//!
//! Every state change that touches money or stock is journaled before the
//! engine acknowledges it. If the process dies, reopening the journal
//! rebuilds exactly the committed state:
//! - Committed transactions: replay and apply
//! - A torn or uncommitted tail: truncate and forget
//!
//! ## Guarantees
//!
//! 1. **Durability**: once `commit()` returns, the transaction is on disk
//! 2. **Atomicity**: a transaction's records are written contiguously under
//!    the writer lock and fsync'd once, so recovery sees all of it or none
//! 3. **Audit**: the journal is never compacted or truncated in normal
//!    operation; the full financial history stays replayable
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "MDJL"]
//! [4 bytes: version]
//! [8 bytes: reserved]
//!
//! Record format:
//! [8 bytes: LSN]
//! [1 byte: record type (BEGIN/OP/COMMIT)]
//! [4 bytes: payload length]
//! [N bytes: payload (serialized operation)]
//! [4 bytes: CRC32 of above]
//! ```
//!
//! There is no rollback record type. Transactions are buffered in memory
//! and only ever written whole, so the only incomplete state a journal can
//! contain is the tail the process died while writing.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use midas_shared::{OrderId, RaffleId, SkuId, SlotIndex, Tier, UserId};
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::ledger::{LedgerReason, LedgerRef};
use crate::prize::GrantedItem;

/// Magic bytes identifying a journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"MDJL";

/// Current journal format version.
const JOURNAL_VERSION: u32 = 1;

/// Header is magic + version + reserved.
const HEADER_LEN: u64 = 16;

/// Upper bound on a single record payload. A length field above this is
/// treated as frame damage rather than allocated.
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Journal record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Begin a transaction.
    Begin = 1,
    /// An operation within a transaction.
    Operation = 2,
    /// Commit the transaction (durable).
    Commit = 3,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// State changes that can be journaled and replayed.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalOp {
    /// A ledger credit or debit (sign of `delta`).
    TokenMutation {
        /// Account owner.
        user: UserId,
        /// Signed token movement.
        delta: i64,
        /// Why the tokens moved.
        reason: LedgerReason,
        /// Idempotency reference of the entry.
        reference: LedgerRef,
        /// Wall-clock stamp of the movement, preserved through replay so
        /// the rebuilt audit trail keeps its real times.
        at_ms: u64,
    },
    /// Units permanently sold from a SKU.
    StockCommit {
        /// The SKU sold from.
        sku: SkuId,
        /// Units sold.
        quantity: u32,
    },
    /// Raffle slots permanently assigned to a user.
    SlotsCommit {
        /// The raffle.
        raffle: RaffleId,
        /// The buyer.
        user: UserId,
        /// First slot index assigned.
        first_slot: SlotIndex,
        /// Number of consecutive slots.
        count: u32,
    },
    /// A raffle stopped accepting slot purchases.
    RaffleClosed {
        /// The raffle.
        raffle: RaffleId,
    },
    /// A raffle's winning slots were drawn.
    RaffleSettled {
        /// The raffle.
        raffle: RaffleId,
        /// Winning slots, in prize-position order.
        winning_slots: Vec<SlotIndex>,
    },
    /// A raffle was voided; its refunds travel as separate
    /// [`JournalOp::TokenMutation`]s in the same transaction.
    RaffleCancelled {
        /// The raffle.
        raffle: RaffleId,
    },
    /// A purchase reached the vault; the order is complete.
    OrderFulfilled {
        /// Client order id.
        order: OrderId,
        /// The buyer.
        user: UserId,
        /// The SKU purchased.
        sku: SkuId,
        /// Units purchased.
        quantity: u32,
        /// Tokens charged.
        cost: u64,
        /// Items granted.
        items: Vec<GrantedItem>,
    },
}

impl JournalOp {
    /// Serializes the operation to bytes.
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Self::TokenMutation {
                user,
                delta,
                reason,
                reference,
                at_ms,
            } => {
                buf.push(1); // Type tag
                buf.extend_from_slice(&user.to_le_bytes());
                buf.extend_from_slice(&delta.to_le_bytes());
                buf.push(*reason as u8);
                write_ledger_ref(&mut buf, *reference);
                buf.extend_from_slice(&at_ms.to_le_bytes());
            }
            Self::StockCommit { sku, quantity } => {
                buf.push(2);
                buf.extend_from_slice(&sku.to_le_bytes());
                buf.extend_from_slice(&quantity.to_le_bytes());
            }
            Self::SlotsCommit {
                raffle,
                user,
                first_slot,
                count,
            } => {
                buf.push(3);
                buf.extend_from_slice(&raffle.to_le_bytes());
                buf.extend_from_slice(&user.to_le_bytes());
                buf.extend_from_slice(&first_slot.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            Self::RaffleClosed { raffle } => {
                buf.push(4);
                buf.extend_from_slice(&raffle.to_le_bytes());
            }
            Self::RaffleSettled {
                raffle,
                winning_slots,
            } => {
                buf.push(5);
                buf.extend_from_slice(&raffle.to_le_bytes());
                buf.extend_from_slice(&(winning_slots.len() as u32).to_le_bytes());
                for slot in winning_slots {
                    buf.extend_from_slice(&slot.to_le_bytes());
                }
            }
            Self::OrderFulfilled {
                order,
                user,
                sku,
                quantity,
                cost,
                items,
            } => {
                buf.push(6);
                buf.extend_from_slice(&order.to_le_bytes());
                buf.extend_from_slice(&user.to_le_bytes());
                buf.extend_from_slice(&sku.to_le_bytes());
                buf.extend_from_slice(&quantity.to_le_bytes());
                buf.extend_from_slice(&cost.to_le_bytes());
                buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for granted in items {
                    buf.extend_from_slice(&granted.item.to_le_bytes());
                    buf.push(granted.tier as u8);
                }
            }
            Self::RaffleCancelled { raffle } => {
                buf.push(7);
                buf.extend_from_slice(&raffle.to_le_bytes());
            }
        }

        buf
    }

    /// Deserializes an operation from bytes.
    fn deserialize(data: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(data);
        let tag = r.u8()?;

        let op = match tag {
            1 => {
                let user = r.u64()?;
                let delta = r.i64()?;
                let reason = LedgerReason::from_u8(r.u8()?)?;
                let reference = read_ledger_ref(&mut r)?;
                let at_ms = r.u64()?;
                Self::TokenMutation {
                    user,
                    delta,
                    reason,
                    reference,
                    at_ms,
                }
            }
            2 => Self::StockCommit {
                sku: r.u32()?,
                quantity: r.u32()?,
            },
            3 => Self::SlotsCommit {
                raffle: r.u32()?,
                user: r.u64()?,
                first_slot: r.u32()?,
                count: r.u32()?,
            },
            4 => Self::RaffleClosed { raffle: r.u32()? },
            5 => {
                let raffle = r.u32()?;
                let len = r.u32()? as usize;
                let mut winning_slots = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    winning_slots.push(r.u32()?);
                }
                Self::RaffleSettled {
                    raffle,
                    winning_slots,
                }
            }
            6 => {
                let order = r.u64()?;
                let user = r.u64()?;
                let sku = r.u32()?;
                let quantity = r.u32()?;
                let cost = r.u64()?;
                let len = r.u32()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let item = r.u32()?;
                    let tier = Tier::from_u8(r.u8()?)?;
                    items.push(GrantedItem { item, tier });
                }
                Self::OrderFulfilled {
                    order,
                    user,
                    sku,
                    quantity,
                    cost,
                    items,
                }
            }
            7 => Self::RaffleCancelled { raffle: r.u32()? },
            _ => return None,
        };

        if r.done() {
            Some(op)
        } else {
            None
        }
    }
}

fn write_ledger_ref(buf: &mut Vec<u8>, reference: LedgerRef) {
    match reference {
        LedgerRef::Order(order) => {
            buf.push(1);
            buf.extend_from_slice(&order.to_le_bytes());
        }
        LedgerRef::Deposit(seq) => {
            buf.push(2);
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        LedgerRef::Consolation { raffle, slot } => {
            buf.push(3);
            buf.extend_from_slice(&raffle.to_le_bytes());
            buf.extend_from_slice(&slot.to_le_bytes());
        }
        LedgerRef::SlotRefund { raffle, slot } => {
            buf.push(4);
            buf.extend_from_slice(&raffle.to_le_bytes());
            buf.extend_from_slice(&slot.to_le_bytes());
        }
        LedgerRef::Session(session) => {
            buf.push(5);
            buf.extend_from_slice(&session.to_le_bytes());
        }
    }
}

fn read_ledger_ref(r: &mut ByteReader<'_>) -> Option<LedgerRef> {
    match r.u8()? {
        1 => Some(LedgerRef::Order(r.u64()?)),
        2 => Some(LedgerRef::Deposit(r.u64()?)),
        3 => Some(LedgerRef::Consolation {
            raffle: r.u32()?,
            slot: r.u32()?,
        }),
        4 => Some(LedgerRef::SlotRefund {
            raffle: r.u32()?,
            slot: r.u32()?,
        }),
        5 => Some(LedgerRef::Session(r.u64()?)),
        _ => None,
    }
}

/// Little-endian field reader over a payload slice.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// One parsed record.
struct JournalRecord {
    lsn: u64,
    record_type: RecordType,
    payload: Vec<u8>,
}

/// What `read_record` found at the cursor.
enum ScanStep {
    /// A complete, CRC-valid record.
    Record(JournalRecord),
    /// Cursor was exactly at end of file.
    CleanEof,
    /// The file ends partway through a frame.
    TornFrame,
    /// A fully readable frame failed validation.
    BadFrame(String),
}

/// Everything recovery learned from the file.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Committed transactions, oldest first, each a list of operations in
    /// append order.
    pub transactions: Vec<Vec<JournalOp>>,
    /// Transactions discarded because their commit never hit the disk.
    pub discarded: u64,
    /// Bytes cut off the tail of the file.
    pub truncated_bytes: u64,
}

/// Writer-side counters, cheap enough to read any time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Transactions committed since open.
    pub commits: u64,
    /// Records appended since open (including begin/commit framing).
    pub records: u64,
}

/// Append-only crash-safe journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    current_lsn: AtomicU64,
    file: Mutex<BufWriter<File>>,
    commits: AtomicU64,
    records: AtomicU64,
}

impl Journal {
    /// Opens or creates a journal, recovering committed transactions from
    /// an existing file. A torn or uncommitted tail is truncated away so
    /// the next append starts at a clean boundary.
    ///
    /// # Errors
    ///
    /// [`EngineError::Journal`] on I/O failure, header mismatch, or
    /// corruption that is not confined to the tail.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<(Self, Recovery)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::Journal(format!("open {}: {e}", path.display())))?;

        let len = file
            .metadata()
            .map_err(|e| EngineError::Journal(format!("metadata: {e}")))?
            .len();

        let (recovery, max_lsn) = if len == 0 {
            file.write_all(JOURNAL_MAGIC)
                .and_then(|()| file.write_all(&JOURNAL_VERSION.to_le_bytes()))
                .and_then(|()| file.write_all(&0u64.to_le_bytes()))
                .and_then(|()| file.sync_all())
                .map_err(|e| EngineError::Journal(format!("write header: {e}")))?;
            (Recovery::default(), 0)
        } else {
            let (recovery, boundary, max_lsn) = Self::scan(&path, len)?;
            if boundary < len {
                file.set_len(boundary)
                    .map_err(|e| EngineError::Journal(format!("truncate tail: {e}")))?;
                file.sync_all()
                    .map_err(|e| EngineError::Journal(format!("sync truncate: {e}")))?;
                tracing::warn!(
                    "journal tail truncated: {} bytes dropped, {} transactions discarded",
                    len - boundary,
                    recovery.discarded
                );
            }
            (recovery, max_lsn)
        };

        file.seek(SeekFrom::End(0))
            .map_err(|e| EngineError::Journal(format!("seek to end: {e}")))?;

        tracing::info!(
            "journal open: {} committed transactions recovered from {}",
            recovery.transactions.len(),
            path.display()
        );

        Ok((
            Self {
                path,
                current_lsn: AtomicU64::new(max_lsn + 1),
                file: Mutex::new(BufWriter::new(file)),
                commits: AtomicU64::new(0),
                records: AtomicU64::new(0),
            },
            recovery,
        ))
    }

    /// Appends one transaction: BEGIN, the operations, COMMIT, then a
    /// single fsync. Once this returns the transaction is durable.
    ///
    /// A mid-append I/O failure leaves a torn tail that the next open will
    /// truncate; the caller unwinds its in-memory state.
    ///
    /// # Errors
    ///
    /// [`EngineError::Journal`] when an operation serializes over the frame
    /// cap (refused up front, nothing written) or when the filesystem
    /// refuses the append.
    pub fn commit(&self, ops: &[JournalOp]) -> EngineResult<u64> {
        // Serialize and size-check before anything hits the file. Recovery
        // treats any frame over the cap as damage, so an oversized payload
        // written here would read back as a torn tail and be truncated.
        let mut payloads = Vec::with_capacity(ops.len());
        for op in ops {
            let payload = op.serialize();
            if payload.len() > MAX_PAYLOAD_LEN as usize {
                return Err(EngineError::Journal(format!(
                    "operation payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit",
                    payload.len()
                )));
            }
            payloads.push(payload);
        }

        let mut file = self.file.lock();

        let txn_id = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        Self::append_record(&mut file, txn_id, RecordType::Begin, &[])?;
        for payload in &payloads {
            let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
            Self::append_record(&mut file, lsn, RecordType::Operation, payload)?;
        }
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        Self::append_record(&mut file, lsn, RecordType::Commit, &[])?;

        file.flush()
            .map_err(|e| EngineError::Journal(format!("flush: {e}")))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| EngineError::Journal(format!("fsync: {e}")))?;

        self.commits.fetch_add(1, Ordering::Relaxed);
        self.records
            .fetch_add(ops.len() as u64 + 2, Ordering::Relaxed);
        Ok(txn_id)
    }

    /// Writer-side counters since open.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        JournalStats {
            commits: self.commits.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
        }
    }

    /// Current size of the journal file in bytes.
    ///
    /// # Errors
    ///
    /// [`EngineError::Journal`] when the file cannot be stat'd.
    pub fn file_bytes(&self) -> EngineResult<u64> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| EngineError::Journal(format!("metadata: {e}")))
    }

    fn append_record(
        file: &mut BufWriter<File>,
        lsn: u64,
        record_type: RecordType,
        payload: &[u8],
    ) -> EngineResult<()> {
        let mut frame = Vec::with_capacity(8 + 1 + 4 + payload.len() + 4);
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.push(record_type as u8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        file.write_all(&frame)
            .map_err(|e| EngineError::Journal(format!("append: {e}")))
    }

    /// Scans the whole file, returning committed transactions, the byte
    /// offset of the last durable boundary, and the highest LSN seen.
    fn scan(path: &Path, file_len: u64) -> EngineResult<(Recovery, u64, u64)> {
        let file = File::open(path)
            .map_err(|e| EngineError::Journal(format!("open for recovery: {e}")))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| EngineError::Journal(format!("read magic: {e}")))?;
        if &magic != JOURNAL_MAGIC {
            return Err(EngineError::Journal("bad journal magic".to_string()));
        }

        let mut version_bytes = [0u8; 4];
        reader
            .read_exact(&mut version_bytes)
            .map_err(|e| EngineError::Journal(format!("read version: {e}")))?;
        let version = u32::from_le_bytes(version_bytes);
        if version != JOURNAL_VERSION {
            return Err(EngineError::Journal(format!(
                "unsupported journal version {version}"
            )));
        }

        let mut reserved = [0u8; 8];
        reader
            .read_exact(&mut reserved)
            .map_err(|e| EngineError::Journal(format!("read header: {e}")))?;

        let mut recovery = Recovery::default();
        let mut max_lsn = 0u64;
        // Offset after the last record that is part of a committed
        // transaction (or the header, if none are).
        let mut boundary = HEADER_LEN;
        let mut cursor = HEADER_LEN;
        // Operations of the transaction currently open in the scan, with
        // the offset of its BEGIN for truncation.
        let mut open_txn: Option<(u64, Vec<JournalOp>)> = None;

        loop {
            let step = Self::read_record(&mut reader);
            match step {
                ScanStep::Record(record) => {
                    let frame_len = 8 + 1 + 4 + record.payload.len() as u64 + 4;
                    max_lsn = max_lsn.max(record.lsn);

                    match record.record_type {
                        RecordType::Begin => {
                            if open_txn.is_some() {
                                return Err(EngineError::Journal(format!(
                                    "nested BEGIN at offset {cursor}"
                                )));
                            }
                            open_txn = Some((cursor, Vec::new()));
                        }
                        RecordType::Operation => {
                            let Some((_, ops)) = open_txn.as_mut() else {
                                return Err(EngineError::Journal(format!(
                                    "operation outside transaction at offset {cursor}"
                                )));
                            };
                            let Some(op) = JournalOp::deserialize(&record.payload) else {
                                return Err(EngineError::Journal(format!(
                                    "undecodable operation at offset {cursor}"
                                )));
                            };
                            ops.push(op);
                        }
                        RecordType::Commit => {
                            let Some((_, ops)) = open_txn.take() else {
                                return Err(EngineError::Journal(format!(
                                    "commit outside transaction at offset {cursor}"
                                )));
                            };
                            recovery.transactions.push(ops);
                            boundary = cursor + frame_len;
                        }
                    }
                    cursor += frame_len;
                }
                ScanStep::CleanEof => break,
                ScanStep::TornFrame => {
                    // Process died mid-append. Everything from the last
                    // committed boundary on is unusable.
                    break;
                }
                ScanStep::BadFrame(detail) => {
                    // A damaged frame with valid data after it means real
                    // corruption, not a crash. Refuse to guess.
                    if Self::has_valid_record_after(path, cursor, file_len) {
                        return Err(EngineError::Journal(format!(
                            "corrupt record mid-file at offset {cursor}: {detail}"
                        )));
                    }
                    break;
                }
            }
        }

        if open_txn.is_some() {
            recovery.discarded += 1;
        }
        recovery.truncated_bytes = file_len.saturating_sub(boundary);

        Ok((recovery, boundary, max_lsn))
    }

    /// Looks past a damaged frame for any complete, CRC-valid record. Used
    /// to tell a torn tail (safe to truncate) from mid-file damage (fatal).
    fn has_valid_record_after(path: &Path, from: u64, file_len: u64) -> bool {
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut probe = from + 1;
        // Frames are self-checking, so a sliding probe is reliable; 17 is
        // the smallest frame (empty payload). One max-size frame past the
        // damage is as far as an intact successor record can start.
        let window_end = file_len.min(from + u64::from(MAX_PAYLOAD_LEN) + 17);
        while probe + 17 <= window_end {
            if file.seek(SeekFrom::Start(probe)).is_err() {
                return false;
            }
            let mut reader = BufReader::new(&mut file);
            if matches!(Self::read_record(&mut reader), ScanStep::Record(_)) {
                return true;
            }
            probe += 1;
        }
        false
    }

    /// Reads one frame at the reader's cursor.
    fn read_record(reader: &mut BufReader<impl Read>) -> ScanStep {
        // The LSN field is read byte-loop style so a cursor sitting exactly
        // at EOF reads as clean while a partial field reads as torn.
        let mut lsn_bytes = [0u8; 8];
        let mut filled = 0;
        while filled < 8 {
            match reader.read(&mut lsn_bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return ScanStep::TornFrame,
            }
        }
        if filled == 0 {
            return ScanStep::CleanEof;
        }
        if filled < 8 {
            return ScanStep::TornFrame;
        }
        let lsn = u64::from_le_bytes(lsn_bytes);

        let mut type_byte = [0u8; 1];
        if reader.read_exact(&mut type_byte).is_err() {
            return ScanStep::TornFrame;
        }
        let Some(record_type) = RecordType::from_u8(type_byte[0]) else {
            return ScanStep::BadFrame(format!("unknown record type {}", type_byte[0]));
        };

        let mut len_bytes = [0u8; 4];
        if reader.read_exact(&mut len_bytes).is_err() {
            return ScanStep::TornFrame;
        }
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len > MAX_PAYLOAD_LEN {
            return ScanStep::BadFrame(format!("payload length {payload_len} over limit"));
        }

        let mut payload = vec![0u8; payload_len as usize];
        if reader.read_exact(&mut payload).is_err() {
            return ScanStep::TornFrame;
        }

        let mut crc_bytes = [0u8; 4];
        if reader.read_exact(&mut crc_bytes).is_err() {
            return ScanStep::TornFrame;
        }
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let mut crc_data = Vec::with_capacity(8 + 1 + 4 + payload.len());
        crc_data.extend_from_slice(&lsn_bytes);
        crc_data.push(type_byte[0]);
        crc_data.extend_from_slice(&len_bytes);
        crc_data.extend_from_slice(&payload);

        if crc32fast::hash(&crc_data) != stored_crc {
            return ScanStep::BadFrame("crc mismatch".to_string());
        }

        ScanStep::Record(JournalRecord {
            lsn,
            record_type,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_journal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_journal_{id}.mdjl"))
    }

    fn sample_txn() -> Vec<JournalOp> {
        vec![
            JournalOp::TokenMutation {
                user: 7,
                delta: -500,
                reason: LedgerReason::Purchase,
                reference: LedgerRef::Order(42),
                at_ms: 1_234,
            },
            JournalOp::StockCommit {
                sku: 3,
                quantity: 2,
            },
            JournalOp::OrderFulfilled {
                order: 42,
                user: 7,
                sku: 3,
                quantity: 2,
                cost: 500,
                items: vec![
                    GrantedItem {
                        item: 100,
                        tier: Tier::SSS,
                    },
                    GrantedItem {
                        item: 101,
                        tier: Tier::S,
                    },
                ],
            },
        ]
    }

    #[test]
    fn test_create_and_reopen_empty() {
        let path = temp_journal_path();
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert!(recovery.transactions.is_empty());
        }
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert!(recovery.transactions.is_empty());
            assert_eq!(recovery.truncated_bytes, 0);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_committed_transactions_survive_reopen() {
        let path = temp_journal_path();
        let txn = sample_txn();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&txn).unwrap();
            journal
                .commit(&[JournalOp::RaffleClosed { raffle: 9 }])
                .unwrap();
            assert_eq!(journal.stats().commits, 2);
        }
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 2);
            assert_eq!(recovery.transactions[0], txn);
            assert_eq!(
                recovery.transactions[1],
                vec![JournalOp::RaffleClosed { raffle: 9 }]
            );
            assert_eq!(recovery.discarded, 0);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_oversized_operation_refused_before_write() {
        let path = temp_journal_path();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&sample_txn()).unwrap();

            // An order big enough that its frame would read back as damage.
            let monster = JournalOp::OrderFulfilled {
                order: 99,
                user: 7,
                sku: 3,
                quantity: 10,
                cost: 1_000,
                items: vec![
                    GrantedItem {
                        item: 100,
                        tier: Tier::S,
                    };
                    250_000
                ],
            };
            let err = journal.commit(&[monster]).unwrap_err();
            assert!(matches!(err, EngineError::Journal(_)));
            assert!(err.to_string().contains("frame limit"));

            // The refusal wrote nothing; the journal keeps appending.
            journal
                .commit(&[JournalOp::StockCommit {
                    sku: 3,
                    quantity: 1,
                }])
                .unwrap();
        }
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 2);
            assert_eq!(recovery.discarded, 0);
            assert_eq!(recovery.truncated_bytes, 0);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_every_op_kind_replays_identically() {
        let path = temp_journal_path();
        let ops = vec![
            JournalOp::TokenMutation {
                user: 1,
                delta: 250,
                reason: LedgerReason::Consolation,
                reference: LedgerRef::Consolation { raffle: 2, slot: 5 },
                at_ms: 10,
            },
            JournalOp::TokenMutation {
                user: 1,
                delta: 80,
                reason: LedgerReason::SlotRefund,
                reference: LedgerRef::SlotRefund { raffle: 2, slot: 5 },
                at_ms: 11,
            },
            JournalOp::TokenMutation {
                user: 1,
                delta: 30,
                reason: LedgerReason::MinigameReward,
                reference: LedgerRef::Session(77),
                at_ms: 12,
            },
            JournalOp::TokenMutation {
                user: 1,
                delta: 1_000,
                reason: LedgerReason::Deposit,
                reference: LedgerRef::Deposit(3),
                at_ms: 13,
            },
            JournalOp::StockCommit {
                sku: 4,
                quantity: 1,
            },
            JournalOp::SlotsCommit {
                raffle: 2,
                user: 1,
                first_slot: 6,
                count: 3,
            },
            JournalOp::RaffleClosed { raffle: 2 },
            JournalOp::RaffleSettled {
                raffle: 2,
                winning_slots: vec![8, 1, 4],
            },
            JournalOp::RaffleCancelled { raffle: 3 },
        ];
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&ops).unwrap();
        }
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions, vec![ops]);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let path = temp_journal_path();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&sample_txn()).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Half a frame of garbage, as if the process died mid-append.
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE]);
        fs::write(&path, &bytes).unwrap();

        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 1);
            assert_eq!(recovery.truncated_bytes, 3);
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_uncommitted_tail_transaction_is_discarded() {
        let path = temp_journal_path();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&sample_txn()).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Hand-build a valid BEGIN + operation with no COMMIT, the state a
        // crash between flush and fsync can leave behind.
        let mut bytes = fs::read(&path).unwrap();
        for (lsn, ty, payload) in [
            (100u64, 1u8, Vec::new()),
            (
                101,
                2,
                JournalOp::StockCommit {
                    sku: 1,
                    quantity: 1,
                }
                .serialize(),
            ),
        ] {
            let mut frame = Vec::new();
            frame.extend_from_slice(&lsn.to_le_bytes());
            frame.push(ty);
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&payload);
            let crc = crc32fast::hash(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
            bytes.extend_from_slice(&frame);
        }
        fs::write(&path, &bytes).unwrap();

        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 1);
            assert_eq!(recovery.discarded, 1);
            assert!(recovery.truncated_bytes > 0);
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mid_file_corruption_refuses_to_open() {
        let path = temp_journal_path();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&sample_txn()).unwrap();
            journal.commit(&sample_txn()).unwrap();
        }

        // Damage a byte inside the first transaction's frames.
        let mut bytes = fs::read(&path).unwrap();
        let target = HEADER_LEN as usize + 20;
        bytes[target] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = Journal::open(&path).unwrap_err();
        assert!(matches!(err, EngineError::Journal(_)));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_writes_append_after_reopen() {
        let path = temp_journal_path();
        {
            let (journal, _) = Journal::open(&path).unwrap();
            journal.commit(&sample_txn()).unwrap();
        }
        {
            let (journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 1);
            journal
                .commit(&[JournalOp::RaffleClosed { raffle: 1 }])
                .unwrap();
        }
        {
            let (_journal, recovery) = Journal::open(&path).unwrap();
            assert_eq!(recovery.transactions.len(), 2);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_refuses_to_open() {
        let path = temp_journal_path();
        fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        let err = Journal::open(&path).unwrap_err();
        assert!(matches!(err, EngineError::Journal(_)));
        fs::remove_file(&path).ok();
    }
}
