use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Transaction;

/// Encode one transaction as a single `[len][bincode][crc32]` frame.
fn encode_frame(txn: &Transaction) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(txn).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Transaction][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A transaction is one frame, so a crash mid-write drops the whole
///   transaction on replay, never half of it.
/// - The file never grows past a torn frame: `recover` cuts it off before the
///   log is reopened, and a failed batch is rolled back to `synced_len`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    pending_bytes: u64,
    pending_frames: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`. Call `recover` first if the
    /// file may end in a torn frame.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending_bytes: 0,
            pending_frames: 0,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, txn: &Transaction) -> io::Result<()> {
        self.append_buffered(txn)?;
        self.flush_sync()
    }

    /// Buffer a frame without syncing. Follow with `flush_sync()`, or
    /// `rollback()` if anything in the batch failed.
    pub fn append_buffered(&mut self, txn: &Transaction) -> io::Result<()> {
        let frame = encode_frame(txn)?;
        self.writer.write_all(&frame)?;
        self.pending_bytes += frame.len() as u64;
        self.pending_frames += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_frames = 0;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`, both the
    /// buffer and any bytes that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Dropping the old writer may still push its buffer to disk; the
        // truncate below removes it.
        self.writer = BufWriter::new(file);
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_frames);
        self.pending_bytes = 0;
        self.pending_frames = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted transactions to a temp file and fsync.
    pub fn write_compact_file(path: &Path, txns: &[Transaction]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for txn in txns {
            writer.write_all(&encode_frame(txn)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_bytes = 0;
        self.pending_frames = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, txns: &[Transaction]) -> io::Result<()> {
        Self::write_compact_file(&self.path, txns)?;
        self.swap_compact_file()
    }

    /// Count frames already on disk (from replay) toward the next compaction.
    pub fn resume_count(&mut self, replayed: u64) {
        self.appends_since_compact = replayed;
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid transactions.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Transaction>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut the file back to its last valid frame so later
    /// appends are not hidden behind a torn tail. Returns the transactions
    /// and the number of bytes dropped.
    pub fn recover(path: &Path) -> io::Result<(Vec<Transaction>, u64)> {
        let (txns, valid_len) = Self::scan(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((txns, 0)),
            Err(e) => return Err(e),
        };
        if file_len > valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((txns, file_len - valid_len))
    }

    /// Valid transactions and the byte length they cover.
    fn scan(path: &Path) -> io::Result<(Vec<Transaction>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut txns = Vec::new();
        let mut valid_len: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Transaction>(&payload) {
                Ok(txn) => txns.push(txn),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        Ok((txns, valid_len))
    }
}
