//! Segment log reader for append-only mail archives.
//!
//! A mail archive is a directory of segment files, each an append-only log
//! of length-prefix-framed RFC822 messages. Progress is tracked as a
//! watermark: an ordered list of [`FileSeg`] entries recording how many
//! bytes of each segment have been consumed. A walk resumes from the
//! watermark and delivers only records in the unconsumed suffix, so a
//! restart re-derives events deterministically. Downstream conversion is
//! idempotent under re-delivery.
//!
//! Record framing: 4-byte big-endian length prefix, then the raw message
//! bytes. Offsets are only ever recorded at record boundaries.

mod message;

pub use message::{MailMessage, MessageError};

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Upper bound on a single framed record. A longer length prefix means the
/// segment is corrupt, not that a very large message arrived.
pub const MAX_RECORD_LEN: u32 = 1 << 24;

/// How far a segment file has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSeg {
    /// Segment file name (relative to the archive directory)
    pub file: String,
    /// Number of bytes consumed, always a record boundary
    pub size: u64,
}

/// Seekable byte source for one segment.
pub trait SegmentRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SegmentRead for T {}

/// Directory listing and byte-range access to a mail archive.
pub trait MailStore: Send + Sync {
    /// Current segments with their on-disk sizes. Order is not significant;
    /// the walk sorts by file name.
    fn read_dir(&self) -> io::Result<Vec<FileSeg>>;

    /// Open one segment for seekable reading.
    fn open(&self, file: &str) -> io::Result<Box<dyn SegmentRead>>;
}

/// [`MailStore`] over a local filesystem directory.
pub struct FsMailStore {
    dir: PathBuf,
}

impl FsMailStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MailStore for FsMailStore {
    fn read_dir(&self) -> io::Result<Vec<FileSeg>> {
        let mut segs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            segs.push(FileSeg {
                file: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
            });
        }
        Ok(segs)
    }

    fn open(&self, file: &str) -> io::Result<Box<dyn SegmentRead>> {
        Ok(Box::new(fs::File::open(self.dir.join(file))?))
    }
}

/// Error aborting a segment walk. Carries the watermark the caller should
/// adopt: everything fully processed before the failure, with the failing
/// segment left at its previous position.
#[derive(Debug, thiserror::Error)]
#[error("segment {file} at offset {offset}: {kind}")]
pub struct WalkError {
    pub file: String,
    pub offset: u64,
    pub kind: WalkErrorKind,
    /// Safe watermark at the time of failure.
    pub handled: Vec<FileSeg>,
}

#[derive(Debug, thiserror::Error)]
pub enum WalkErrorKind {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Frame(String),
    #[error("malformed message: {0}")]
    Message(#[from] MessageError),
}

/// Walk exactly the bytes not covered by `handled`, invoking `each` for
/// every decoded message, and return the advanced watermark.
///
/// A segment whose recorded size equals its on-disk size is skipped. A
/// segment that grew is resumed from the recorded size. Frames that extend
/// past the size snapshot taken at enumeration time are left for the next
/// walk (a writer may be mid-append). Cancellation is honored between
/// records and yields a valid partial watermark.
pub fn walk_new<F>(
    store: &dyn MailStore,
    handled: &[FileSeg],
    cancel: &AtomicBool,
    mut each: F,
) -> Result<Vec<FileSeg>, WalkError>
where
    F: FnMut(MailMessage),
{
    let mut current = store.read_dir().map_err(|e| WalkError {
        file: String::new(),
        offset: 0,
        kind: WalkErrorKind::Io(e),
        handled: handled.to_vec(),
    })?;
    current.sort_by(|a, b| a.file.cmp(&b.file));

    let prev: HashMap<&str, u64> = handled.iter().map(|s| (s.file.as_str(), s.size)).collect();

    let mut out: Vec<FileSeg> = Vec::with_capacity(current.len());
    let mut stopped = false;

    for (idx, seg) in current.iter().enumerate() {
        if stopped || cancel.load(Ordering::Relaxed) {
            // Preserve prior progress for segments we are not visiting
            if let Some(&size) = prev.get(seg.file.as_str()) {
                out.push(FileSeg {
                    file: seg.file.clone(),
                    size,
                });
            }
            stopped = true;
            continue;
        }

        let start = match prev.get(seg.file.as_str()) {
            Some(&size) if size == seg.size => {
                // Fully consumed, skip
                out.push(seg.clone());
                continue;
            }
            Some(&size) if size > seg.size => {
                // A segment shrank underneath us. Re-consume from the start;
                // downstream conversion tolerates re-delivery.
                tracing::warn!(
                    file = %seg.file,
                    recorded = size,
                    on_disk = seg.size,
                    "Segment shrank, re-reading from start"
                );
                0
            }
            Some(&size) => size,
            None => 0,
        };

        match walk_segment(store, seg, start, cancel, &mut each) {
            Ok(consumed) => {
                // A partial trailing frame legitimately leaves consumed
                // short of the snapshot size; only cancellation stops the
                // walk of later segments.
                out.push(FileSeg {
                    file: seg.file.clone(),
                    size: consumed,
                });
                if cancel.load(Ordering::Relaxed) {
                    stopped = true;
                }
            }
            Err((offset, kind)) => {
                // Leave the failing segment at its previous position and
                // keep prior progress for everything after it.
                if let Some(&size) = prev.get(seg.file.as_str()) {
                    out.push(FileSeg {
                        file: seg.file.clone(),
                        size,
                    });
                }
                for later in &current[idx + 1..] {
                    if let Some(&size) = prev.get(later.file.as_str()) {
                        out.push(FileSeg {
                            file: later.file.clone(),
                            size,
                        });
                    }
                }
                return Err(WalkError {
                    file: seg.file.clone(),
                    offset,
                    kind,
                    handled: out,
                });
            }
        }
    }

    Ok(out)
}

/// Decode records in `[start, seg.size)`, returning the boundary offset
/// reached. A frame extending past `seg.size` stops the segment cleanly.
fn walk_segment<F>(
    store: &dyn MailStore,
    seg: &FileSeg,
    start: u64,
    cancel: &AtomicBool,
    each: &mut F,
) -> Result<u64, (u64, WalkErrorKind)>
where
    F: FnMut(MailMessage),
{
    let mut reader = store.open(&seg.file).map_err(|e| (start, e.into()))?;
    reader
        .seek(SeekFrom::Start(start))
        .map_err(|e| (start, e.into()))?;

    let mut offset = start;
    while offset < seg.size {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        if offset + 4 > seg.size {
            // Partial length prefix past the snapshot; next walk gets it
            break;
        }
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .map_err(|e| (offset, e.into()))?;
        let len = u32::from_be_bytes(len_buf);

        if len == 0 || len > MAX_RECORD_LEN {
            return Err((
                offset,
                WalkErrorKind::Frame(format!("length prefix {} out of range", len)),
            ));
        }
        if offset + 4 + u64::from(len) > seg.size {
            // Record not fully visible in this snapshot
            break;
        }

        let mut record = vec![0u8; len as usize];
        reader
            .read_exact(&mut record)
            .map_err(|e| (offset, e.into()))?;

        let msg = MailMessage::parse(&record).map_err(|e| (offset, e.into()))?;
        each(msg);

        offset += 4 + u64::from(len);
    }

    Ok(offset)
}

/// Append one framed record. This is the writer side of the format; tests
/// and archive import tooling use it.
pub fn append_record<W: Write>(w: &mut W, message: &[u8]) -> io::Result<()> {
    let len = u32::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(message)
}
