use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of committed transactions.
///
/// Record layout: `[u32 len][bincode Commit][u32 crc32]`, little-endian.
/// A torn or corrupt tail (crash mid-write) is dropped on replay, so a
/// transaction is either fully recovered or not at all.
///
/// Appends are buffered in memory and written by `flush_sync`. A flush that
/// fails cuts the file back to its last synced length, so no later record
/// ever lands behind a torn one. If that cut fails too the log is poisoned
/// and refuses further appends.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the file up to the last successful fsync.
    synced_len: u64,
    pending: Vec<u8>,
    pending_commits: u64,
    appends_since_compact: u64,
    syncs: u64,
    poisoned: bool,
    #[cfg(test)]
    fail_next_write: Option<usize>,
}

fn poisoned_error() -> io::Error {
    io::Error::other("write-ahead log poisoned by an earlier failed flush")
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            synced_len,
            pending: Vec::new(),
            pending_commits: 0,
            appends_since_compact: 0,
            syncs: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_write: None,
        })
    }

    /// Replay the log at `path`, cut off any torn or corrupt tail, and open
    /// it for appends right behind the last intact record.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, intact_len) = Self::scan(path)?;
        let mut wal = Self::open(path)?;
        if wal.synced_len > intact_len {
            tracing::warn!(
                "WAL {}: truncating {} bytes of torn tail",
                path.display(),
                wal.synced_len - intact_len
            );
            wal.file.set_len(intact_len)?;
            wal.file.sync_all()?;
            wal.synced_len = intact_len;
        }
        Ok((wal, commits))
    }

    /// Buffer a record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_error());
        }
        let mark = self.pending.len();
        if let Err(e) = encode_commit(&mut self.pending, commit) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_commits += 1;
        Ok(())
    }

    /// Write and fsync every buffered record. On failure all of them are
    /// dropped, on disk and in memory.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard_pending();
            return Err(poisoned_error());
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self.write_pending().and_then(|()| self.file.sync_all());
        match &result {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_commits;
                self.syncs += 1;
            }
            Err(e) => {
                tracing::error!("WAL {}: flush failed ({e}), rolling back", self.path.display());
                let cut = self.file.set_len(self.synced_len).and_then(|()| self.file.sync_all());
                if let Err(cut_err) = cut {
                    tracing::error!("WAL {}: rollback failed ({cut_err}), poisoned", self.path.display());
                    self.poisoned = true;
                }
            }
        }
        self.discard_pending();
        result
    }

    /// Drop buffered records without writing them.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_commits = 0;
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if let Some(written) = self.fail_next_write.take() {
            let written = written.min(self.pending.len());
            self.file.write_all(&self.pending[..written])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(&self.pending)
    }

    /// Make the next flush write only `written` bytes and then fail.
    #[cfg(test)]
    pub fn fail_next_write(&mut self, written: usize) {
        self.fail_next_write = Some(written);
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Successful fsyncs since open.
    pub fn syncs(&self) -> u64 {
        self.syncs
    }

    /// Replace the log with `snapshot`: write a temp file, fsync, rename
    /// over the live file, reopen for appends.
    pub fn rewrite(&mut self, snapshot: &[Commit]) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned_error());
        }
        // Pending bytes belong to the old file; push them out before it goes away.
        self.flush_sync()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for commit in snapshot {
                encode_commit(&mut writer, commit)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = self.file.metadata()?.len();
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact record in order. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        Ok(Self::scan(path)?.0)
    }

    /// Intact records plus the byte length they span.
    fn scan(path: &Path) -> io::Result<(Vec<Commit>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        let mut intact_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(
                    "WAL {}: checksum mismatch after {} commits, discarding tail",
                    path.display(),
                    commits.len()
                );
                break;
            }
            match bincode::deserialize::<Commit>(&payload) {
                Ok(commit) => commits.push(commit),
                Err(e) => {
                    tracing::warn!("WAL {}: undecodable record ({e}), discarding tail", path.display());
                    break;
                }
            }
            intact_len += 8 + payload.len() as u64;
        }

        Ok((commits, intact_len))
    }
}
