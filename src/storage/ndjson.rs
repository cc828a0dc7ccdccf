// src/storage/ndjson.rs

//! Append-only NDJSON artifacts.
//!
//! ```text
//! {output}/{org_id}/
//! ├── events.ndjson[.gz]
//! ├── sessions.ndjson[.gz]
//! ├── laps.ndjson[.gz]
//! └── announcements.ndjson[.gz]
//! ```
//!
//! Appended lines are buffered until `flush`, which writes them (as one gzip
//! member when compressed) and fsyncs the file. A flushed prefix of the file
//! is therefore always a sequence of complete lines or complete members.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::EntityType;

/// Sequence number of an appended line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlushToken(pub u64);

struct WriterState {
    file: File,
    pending: Vec<u8>,
    appended: u64,
    durable: u64,
}

/// Single writer for one artifact file.
pub struct NdjsonWriter {
    path: PathBuf,
    compress: bool,
    state: Mutex<WriterState>,
}

impl NdjsonWriter {
    /// Create (or truncate) an artifact.
    pub fn create(path: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::with_file(path, compress, file))
    }

    /// Open an artifact for appending, cutting off any torn tail first.
    pub fn open_append(path: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let removed = if compress {
                repair_gzip_tail(&path)?
            } else {
                repair_plain_tail(&path)?
            };
            if removed > 0 {
                log::warn!(
                    "Removed {} bytes of incomplete data from the end of {}",
                    removed,
                    path.display()
                );
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::with_file(path, compress, file))
    }

    fn with_file(path: PathBuf, compress: bool, file: File) -> Self {
        Self {
            path,
            compress,
            state: Mutex::new(WriterState {
                file,
                pending: Vec::new(),
                appended: 0,
                durable: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one line. It becomes durable with the next `flush`.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<FlushToken> {
        let line = serde_json::to_vec(record)?;
        let mut state = self.lock()?;
        state.pending.extend_from_slice(&line);
        state.pending.push(b'\n');
        state.appended += 1;
        Ok(FlushToken(state.appended))
    }

    /// Write and fsync everything appended so far.
    ///
    /// Returns the highest token that is now durable.
    pub fn flush(&self) -> Result<FlushToken> {
        let mut state = self.lock()?;
        if state.pending.is_empty() {
            return Ok(FlushToken(state.durable));
        }

        let pending = std::mem::take(&mut state.pending);
        if self.compress {
            let mut encoder = GzEncoder::new(&mut state.file, Compression::default());
            encoder.write_all(&pending)?;
            encoder.finish()?;
        } else {
            state.file.write_all(&pending)?;
        }
        state.file.sync_data()?;

        state.durable = state.appended;
        Ok(FlushToken(state.durable))
    }

    pub fn is_durable(&self, token: FlushToken) -> bool {
        self.lock().map(|s| token.0 <= s.durable).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.state.lock().map_err(|_| {
            AppError::Io(io::Error::other(format!(
                "writer for {} poisoned",
                self.path.display()
            )))
        })
    }
}

/// The four artifact writers of one organization directory.
pub struct ArtifactSet {
    events: NdjsonWriter,
    sessions: NdjsonWriter,
    laps: NdjsonWriter,
    announcements: NdjsonWriter,
}

impl ArtifactSet {
    /// Open every artifact under `dir`; `append` keeps existing content.
    pub fn open(dir: &Path, compress: bool, append: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let open = |entity: EntityType| {
            let path = dir.join(entity.file_name(compress));
            if append {
                NdjsonWriter::open_append(path, compress)
            } else {
                NdjsonWriter::create(path, compress)
            }
        };
        Ok(Self {
            events: open(EntityType::Events)?,
            sessions: open(EntityType::Sessions)?,
            laps: open(EntityType::Laps)?,
            announcements: open(EntityType::Announcements)?,
        })
    }

    pub fn writer(&self, entity: EntityType) -> &NdjsonWriter {
        match entity {
            EntityType::Events => &self.events,
            EntityType::Sessions => &self.sessions,
            EntityType::Laps => &self.laps,
            EntityType::Announcements => &self.announcements,
        }
    }

    pub fn flush_all(&self) -> Result<()> {
        for entity in EntityType::ALL {
            self.writer(entity).flush()?;
        }
        Ok(())
    }
}

/// Cut a plain artifact back to its last newline. Returns bytes removed.
fn repair_plain_tail(path: &Path) -> Result<u64> {
    const CHUNK: u64 = 64 * 1024;

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut keep = 0;
    let mut buf = vec![0u8; CHUNK as usize];

    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if keep < len {
        file.set_len(keep)?;
        file.sync_data()?;
    }
    Ok(len - keep)
}

/// Cut a gzip artifact back to the end of its last complete member.
fn repair_gzip_tail(path: &Path) -> Result<u64> {
    let len = fs::metadata(path)?.len();
    let mut reader = CountingReader::new(BufReader::new(File::open(path)?));
    let mut keep = 0;

    loop {
        if reader.fill_buf()?.is_empty() {
            break;
        }
        let decoded = {
            let mut member = flate2::bufread::GzDecoder::new(&mut reader);
            io::copy(&mut member, &mut io::sink())
        };
        match decoded {
            Ok(_) => keep = reader.consumed,
            Err(_) => break,
        }
    }

    if keep < len {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(keep)?;
        file.sync_data()?;
    }
    Ok(len - keep)
}

/// Tracks how many bytes a decoder has consumed from the underlying file.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.consumed += amt as u64;
        self.inner.consume(amt);
    }
}
