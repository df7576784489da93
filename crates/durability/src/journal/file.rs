//! Journal log file.
//!
//! One append-only file per journal root, `journal.log`:
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │ Magic (4)  Version (2)  Reserved (4)  │
//! ├───────────────────────────────────────┤
//! │ Record: length (4) + entry bytes      │
//! ├───────────────────────────────────────┤
//! │ ...                                   │
//! └───────────────────────────────────────┘
//! ```
//!
//! A clean EOF lands exactly on a record boundary; EOF inside a length or
//! payload is a malformed file. Compaction rewrites the whole file through
//! a temp file and rename, so the live file is never torn.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use histree_core::{Error, Result};

use super::entry::{deserialize_entry, serialize_entry, JournalEntry};
use crate::fsio;

/// Magic bytes identifying a journal file: "PSJF"
pub const JOURNAL_FILE_MAGIC: u32 = 0x5053_4A46;

/// Current journal file format version
pub const JOURNAL_FILE_VERSION: u16 = 1;

const HEADER_SIZE: u64 = 10;

/// Appending writer over a journal log file.
///
/// The file is opened lazily; the header is created (and optionally
/// fsynced) when the file is missing or empty, and validated otherwise.
#[derive(Debug)]
pub struct JournalFileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl JournalFileWriter {
    /// A writer for the journal file at `path`. No I/O happens yet.
    pub fn new(path: PathBuf) -> Self {
        JournalFileWriter { path, file: None }
    }

    /// The journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file, creating and validating the header as needed.
    pub fn open(&mut self, fsync_header: bool) -> Result<()> {
        self.ensure_opened(fsync_header)
    }

    /// Serialize `entry` and append it as one length-prefixed record.
    pub fn append(&mut self, entry: &JournalEntry, fsync: bool) -> Result<()> {
        self.ensure_opened(fsync)?;
        let serialized = serialize_entry(entry)?;
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Unknown("journal writer not open".into()));
        };

        file.write_all(&(serialized.len() as u32).to_le_bytes())
            .map_err(|e| Error::io("failed to write journal entry length", &e))?;
        file.write_all(&serialized)
            .map_err(|e| Error::io("failed to write journal entry payload", &e))?;

        if fsync {
            fsio::fsync_file(file)?;
        }
        Ok(())
    }

    /// Flush buffered writes and fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .map_err(|e| Error::io("failed to flush journal writer", &e))?;
            fsio::fsync_file(file)?;
        }
        Ok(())
    }

    /// Flush buffered writes without fsync.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .map_err(|e| Error::io("failed to flush journal writer", &e))?;
        }
        Ok(())
    }

    fn ensure_opened(&mut self, fsync_header: bool) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io("failed to create journal directory", &e))?;
        }

        let need_header = fsio::file_size_or_zero(&self.path) == 0;
        if need_header {
            write_header(&self.path, fsync_header)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::io("failed to open journal file", &e))?;

        if !need_header {
            if let Err(err) = validate_header(&mut file) {
                self.file = None;
                return Err(err);
            }
        }

        file.seek(SeekFrom::End(0))
            .map_err(|e| Error::io("failed to seek journal file", &e))?;
        self.file = Some(file);
        Ok(())
    }
}

fn header_bytes() -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&JOURNAL_FILE_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&JOURNAL_FILE_VERSION.to_le_bytes());
    // Bytes 6..10 are reserved and stay zero.
    header
}

fn write_header(path: &Path, fsync: bool) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| Error::io("failed to create journal file", &e))?;
    file.write_all(&header_bytes())
        .map_err(|e| Error::io("failed to write journal header", &e))?;
    if fsync {
        fsio::fsync_file(&file)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fsio::fsync_dir(parent)?;
        }
    }
    Ok(())
}

fn validate_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| Error::MalformedInput("journal file header truncated".into()))?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != JOURNAL_FILE_MAGIC {
        return Err(Error::MalformedInput(
            "journal file header magic mismatch".into(),
        ));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != JOURNAL_FILE_VERSION {
        return Err(Error::MalformedInput(
            "unsupported journal file version".into(),
        ));
    }
    Ok(())
}

/// Read `buf.len()` bytes. `Ok(false)` means a clean EOF before the first
/// byte; a partial read is an error shaped by `truncated_message`.
fn read_exact_or_eof(
    file: &mut File,
    buf: &mut [u8],
    truncated_message: &str,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file
            .read(&mut buf[filled..])
            .map_err(|e| Error::io("failed to read journal file", &e))?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::MalformedInput(truncated_message.into()));
        }
        filled += read;
    }
    Ok(true)
}

/// Replay every record in the journal file through `on_entry`.
///
/// The visitor's error aborts the replay and is returned unchanged.
pub fn replay_journal(
    path: &Path,
    mut on_entry: impl FnMut(JournalEntry) -> Result<()>,
) -> Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound("journal file not found".into()))
        }
        Err(e) => return Err(Error::io("failed to open journal file for replay", &e)),
    };

    let mut header = [0u8; HEADER_SIZE as usize];
    if !read_exact_or_eof(&mut file, &mut header, "journal file header truncated")? {
        return Err(Error::MalformedInput("journal file header truncated".into()));
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != JOURNAL_FILE_MAGIC {
        return Err(Error::MalformedInput("journal file magic mismatch".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != JOURNAL_FILE_VERSION {
        return Err(Error::MalformedInput(
            "unsupported journal file version".into(),
        ));
    }

    loop {
        let mut length_bytes = [0u8; 4];
        if !read_exact_or_eof(
            &mut file,
            &mut length_bytes,
            "truncated journal entry length",
        )? {
            break; // clean EOF on a record boundary
        }
        let length = u32::from_le_bytes(length_bytes) as usize;

        let mut payload = vec![0u8; length];
        if length > 0
            && !read_exact_or_eof(&mut file, &mut payload, "truncated journal entry payload")?
        {
            return Err(Error::MalformedInput(
                "truncated journal entry payload".into(),
            ));
        }

        let entry = deserialize_entry(&payload)?;
        on_entry(entry)?;
    }

    Ok(())
}

/// Rewrite the journal file to contain exactly `entries`.
///
/// Writes a fresh header plus the records to `<path>.tmp`, optionally
/// fsyncs, renames over the live file, then fsyncs the parent directory.
pub fn compact_journal(path: &Path, entries: &[JournalEntry], fsync: bool) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io("failed to create journal directory", &e))?;
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let write_result = (|| -> Result<()> {
        let mut file = File::create(&tmp)
            .map_err(|e| Error::io("failed to open journal temp file", &e))?;
        file.write_all(&header_bytes())
            .map_err(|e| Error::io("failed to write journal header", &e))?;
        for entry in entries {
            let serialized = serialize_entry(entry)?;
            file.write_all(&(serialized.len() as u32).to_le_bytes())
                .map_err(|e| Error::io("failed to write compacted entry length", &e))?;
            file.write_all(&serialized)
                .map_err(|e| Error::io("failed to write compacted entry", &e))?;
        }
        if fsync {
            fsio::fsync_file(&file)?;
        } else {
            file.flush()
                .map_err(|e| Error::io("failed to flush journal temp file", &e))?;
        }
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io("failed to replace journal file", &e));
    }

    if fsync {
        if let Some(parent) = parent {
            fsio::fsync_dir(parent)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::entry::{OperationKind, SerializedPayload};
    use tempfile::tempdir;

    fn make_entry(seq: u64) -> JournalEntry {
        JournalEntry {
            operation: OperationKind::Insert,
            path: format!("/doc/{seq}"),
            value: SerializedPayload::from_bytes(vec![seq as u8; 8]),
            sequence: seq,
            ..JournalEntry::default()
        }
    }

    fn replay_all(path: &Path) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        replay_journal(path, |entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let mut writer = JournalFileWriter::new(path.clone());
        writer.append(&make_entry(1), false).unwrap();
        writer.append(&make_entry(2), true).unwrap();
        drop(writer);

        let entries = replay_all(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_reopen_appends_after_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let mut writer = JournalFileWriter::new(path.clone());
            writer.append(&make_entry(1), true).unwrap();
        }
        {
            let mut writer = JournalFileWriter::new(path.clone());
            writer.append(&make_entry(2), true).unwrap();
        }

        let entries = replay_all(&path).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_replay_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = replay_all(&dir.path().join("absent.log"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reopen_rejects_corrupt_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        fs::write(&path, b"not a journal").unwrap();

        let mut writer = JournalFileWriter::new(path.clone());
        let result = writer.open(false);
        assert!(matches!(result, Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_replay_rejects_truncated_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let mut writer = JournalFileWriter::new(path.clone());
        writer.append(&make_entry(1), true).unwrap();
        drop(writer);

        // Chop bytes off the tail so EOF lands inside the record payload.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let result = replay_all(&path);
        assert!(matches!(result, Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_replay_aborts_on_visitor_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let mut writer = JournalFileWriter::new(path.clone());
        writer.append(&make_entry(1), false).unwrap();
        writer.append(&make_entry(2), true).unwrap();
        drop(writer);

        let mut seen = 0;
        let result = replay_journal(&path, |_| {
            seen += 1;
            Err(Error::Unknown("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_compaction_rewrites_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let mut writer = JournalFileWriter::new(path.clone());
        for seq in 1..=4 {
            writer.append(&make_entry(seq), false).unwrap();
        }
        writer.sync().unwrap();
        drop(writer);

        let kept = vec![make_entry(3), make_entry(4)];
        compact_journal(&path, &kept, true).unwrap();

        let entries = replay_all(&path).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(!path.with_extension("log.tmp").exists());
    }

    #[test]
    fn test_compaction_to_empty_leaves_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        compact_journal(&path, &[], true).unwrap();
        assert_eq!(fsio::file_size_or_zero(&path), HEADER_SIZE);
        assert!(replay_all(&path).unwrap().is_empty());
    }
}
