use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// File header: magic + format version.
const MAGIC: &[u8; 4] = b"RMWL";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;
/// Longest payload accepted on replay; a larger length prefix is corruption.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())
}

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only write-ahead log of room events.
///
/// Layout: an 8-byte header (`RMWL` + u32 version), then one record per event:
/// `[u32: len][bincode: Event][u32: crc32]`. A torn tail record left by a
/// crash fails the length or CRC check; `recover` drops it and truncates the
/// file before appending.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, discarding any torn tail.
    #[cfg(test)]
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay the log and open it for appends.
    ///
    /// Bytes past the last valid record (a write torn by a crash) are cut off
    /// and fsynced before the first append, so new records always follow a
    /// readable prefix. A file without a complete header starts over empty.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Scan { events, valid_len } = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "WAL {}: truncating {} bytes after offset {valid_len}",
                path.display(),
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let mut writer = BufWriter::new(file);
        if valid_len == 0 {
            write_header(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let wal = Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing; durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event set to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the compacted temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|scan| scan.events)
    }
}

/// Valid events and the byte length of the prefix that holds them.
/// `valid_len == 0` means there is no complete header.
struct Scan {
    events: Vec<Event>,
    valid_len: u64,
}

/// Read the log up to the first torn or corrupt record.
///
/// A missing file or a partial header scans as empty. A complete header with
/// the wrong magic or version is an error.
fn scan(path: &Path) -> io::Result<Scan> {
    let empty = Scan {
        events: Vec::new(),
        valid_len: 0,
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(empty),
        Err(e) => return Err(e),
    }
    if &header[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a roomd WAL", path.display()),
        ));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported WAL version {version}"),
        ));
    }

    let mut events = Vec::new();
    let mut valid_len = HEADER_LEN as u64;
    loop {
        let mut len_buf = [0u8; 4];
        if !read_record_part(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            tracing::warn!("WAL {}: record length {len} out of range, dropping tail", path.display());
            break;
        }

        let mut payload = vec![0u8; len];
        if !read_record_part(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_record_part(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!("WAL {}: CRC mismatch, dropping tail", path.display());
            break;
        }

        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("WAL {}: undecodable record ({e}), dropping tail", path.display());
                break;
            }
        }
        valid_len += (4 + len + 4) as u64;
    }

    Ok(Scan { events, valid_len })
}

/// `Ok(false)` when the file ends inside the record.
fn read_record_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
