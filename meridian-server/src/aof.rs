//! The append-only command log.
//!
//! Frames are canonical length-prefixed arrays, byte-identical to wire
//! requests, concatenated with no headers or per-record checksums.
//! Corruption is caught by the parser refusing a truncated or malformed
//! frame; a torn tail is truncated away at startup.
//!
//! An older fixed-record format (u32-LE length + body + u32-LE length +
//! NUL) is migrated in place before replay.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::{Result, ServerError};
use crate::protocol::{encode_frame, parse_frame, tokenize_line};

/// Log file name inside the data directory.
pub const AOF_FILE: &str = "appendonly.aof";

/// Durability log state: the open file plus its logical size.
#[derive(Debug)]
pub struct Aof {
    path: PathBuf,
    file: Option<File>,
    /// Byte length of the valid frame prefix. Trailing garbage past this
    /// point is truncated at load.
    pub size: u64,
    pub shrinking: bool,
}

impl Aof {
    /// Open (creating if needed) the log at `<dir>/appendonly.aof`,
    /// migrating the legacy record format first when present.
    pub fn open(dir: &Path) -> Result<Aof> {
        let path = dir.join(AOF_FILE);
        migrate_legacy(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(Aof {
            path,
            file: Some(file),
            size: 0,
            shrinking: false,
        })
    }

    /// A log without a backing file; appends only count bytes. Unit
    /// tests of engine logic use this to stay off disk.
    pub fn detached() -> Aof {
        Aof {
            path: PathBuf::new(),
            file: None,
            size: 0,
            shrinking: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one canonical frame and grow the logical size.
    pub fn append_frame(&mut self, args: &[String]) -> Result<()> {
        let frame = encode_frame(args);
        if let Some(f) = self.file.as_mut() {
            f.write_all(&frame)?;
        }
        self.size += frame.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.sync_all()?;
        }
        Ok(())
    }

    /// Truncate the file (and logical size) to `size` bytes.
    pub fn truncate_to(&mut self, size: u64) -> Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.set_len(size)?;
            f.seek(SeekFrom::End(0))?;
        }
        self.size = size;
        Ok(())
    }

    /// Reopen after an external rename (log shrink) and adopt the new
    /// file's length as the logical size.
    pub fn reopen(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// MD5 of `len` bytes at `pos`, from an independent read handle.
    /// [`ServerError::Eof`] when the range runs past the logical size.
    pub fn checksum(&self, pos: u64, len: u64) -> Result<String> {
        if pos + len > self.size {
            return Err(ServerError::Eof);
        }
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(pos))?;
        let mut data = vec![0u8; len as usize];
        f.read_exact(&mut data).map_err(|_| ServerError::Eof)?;
        let mut hasher = Md5::new();
        hasher.update(&data);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Streaming frame reader used for replay and follower tailing.
pub struct FrameReader<R: Read> {
    r: R,
    buf: Vec<u8>,
    pos: usize,
    /// Bytes of complete frames handed out so far.
    offset: u64,
    eof: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(r: R) -> Self {
        FrameReader {
            r,
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            eof: false,
        }
    }

    /// Byte offset just past the last complete frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next frame: `Ok(None)` at clean end-of-log. A torn or malformed
    /// tail is [`ServerError::CorruptedLog`]; the caller truncates to
    /// [`FrameReader::offset`].
    pub fn next(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            match parse_frame(&self.buf[self.pos..])? {
                Some((args, used)) => {
                    self.pos += used;
                    self.offset += used as u64;
                    if self.pos > 64 * 1024 {
                        self.buf.drain(..self.pos);
                        self.pos = 0;
                    }
                    return Ok(Some(args));
                }
                None => {
                    if self.eof {
                        if self.pos < self.buf.len() {
                            return Err(ServerError::CorruptedLog);
                        }
                        return Ok(None);
                    }
                    let mut chunk = [0u8; 64 * 1024];
                    let n = self.r.read(&mut chunk)?;
                    if n == 0 {
                        self.eof = true;
                    } else {
                        self.buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    }
}

/// Find the last frame boundary at or before `pos` by parsing forward
/// from the start of the log.
pub fn frame_boundary_at_or_before(path: &Path, pos: u64) -> Result<u64> {
    let file = File::open(path)?;
    let mut reader = FrameReader::new(std::io::BufReader::new(file));
    let mut boundary = 0u64;
    loop {
        match reader.next() {
            Ok(Some(_)) => {
                if reader.offset() > pos {
                    return Ok(boundary);
                }
                boundary = reader.offset();
                if boundary == pos {
                    return Ok(boundary);
                }
            }
            // The tail past the last whole frame does not move the
            // boundary.
            Ok(None) | Err(_) => return Ok(boundary),
        }
    }
}

/// Rewrite a legacy-format log (u32-LE length-framed command lines) into
/// canonical array frames. No-op when the file is empty or already
/// canonical.
fn migrate_legacy(path: &Path) -> Result<()> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() || data[0] == b'*' {
        return Ok(());
    }
    tracing::info!(path = %path.display(), "migrating legacy log format");

    let mut out: Vec<u8> = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    while pos + 9 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let total = len + 9;
        if pos + total > data.len() {
            break; // torn tail
        }
        let body = &data[pos + 4..pos + 4 + len];
        let len2 = u32::from_le_bytes([
            data[pos + 4 + len],
            data[pos + 5 + len],
            data[pos + 6 + len],
            data[pos + 7 + len],
        ]) as usize;
        if len2 != len || data[pos + 8 + len] != 0 {
            return Err(ServerError::CorruptedLog);
        }
        let line = std::str::from_utf8(body).map_err(|_| ServerError::CorruptedLog)?;
        let args = tokenize_line(line)?;
        if !args.is_empty() {
            out.extend_from_slice(&encode_frame(&args));
        }
        pos += total;
    }

    let tmp = path.with_extension("migrate");
    std::fs::write(&tmp, &out)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
