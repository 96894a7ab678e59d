//! Directory-backed persistence that survives process restarts.
//!
//! Layout:
//!
//! ```text
//! <dir>/
//! ├─ LOCK                  # Advisory lock, one owning process per directory
//! ├─ <hex(key)>.rec        # One blob per short key
//! ├─ <sha256(key)>.lrec    # One blob per long key, prefixed with the key
//! └─ <name>.<ext>.tmp      # In-flight write, renamed over the blob
//! ```
//!
//! Hex names double the key length, which would overflow the file name
//! limit of common filesystems (255 bytes) for long keys. Keys whose hex
//! name exceeds `MAX_PLAIN_STEM` are stored under their SHA-256 digest
//! instead, with a header carrying the real key:
//!
//! ```text
//! [key_len: u32 LE][key: UTF-8][value]
//! ```

use crate::backend::Persistence;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const RECORD_EXT: &str = "rec";
const HASHED_EXT: &str = "lrec";
const TEMP_SUFFIX: &str = "tmp";
const KEY_HEADER_LEN: usize = 4;

/// Longest hex file stem stored as-is. Longer keys are hashed.
const MAX_PLAIN_STEM: usize = 200;

/// Where one key's blob lives.
#[derive(Debug)]
enum RecordFile {
    /// `<hex(key)>.rec`, value only.
    Plain(PathBuf),
    /// `<sha256(key)>.lrec`, key header then value.
    Hashed(PathBuf),
}

impl RecordFile {
    fn path(&self) -> &Path {
        match self {
            RecordFile::Plain(path) | RecordFile::Hashed(path) => path,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path().as_os_str().to_owned();
        name.push(".");
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }
}

/// A persistence backend storing one file per key inside a directory.
///
/// # Durability
///
/// `set` writes to a temporary file, calls `sync_all`, renames it over the
/// previous blob and then syncs the directory, so a crash leaves either the
/// old or the new value, never a torn one.
///
/// # Locking
///
/// The directory holds an exclusive `LOCK` file for as long as the backend
/// is alive. A second `open` of the same directory fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use resync_storage::{FilePersistence, Persistence};
/// use std::path::Path;
///
/// let store = FilePersistence::open(Path::new("records")).unwrap();
/// store.set("app/user/progress_1", b"payload").unwrap();
/// ```
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    _lock_file: File,
    write_lock: Mutex<()>,
}

impl FilePersistence {
    /// Opens (creating if needed) a persistence directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path exists but is not a directory
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        debug!(path = %path.display(), "opened file persistence");

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the directory this backend writes into.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_file(&self, key: &str) -> RecordFile {
        let stem = encode_key(key);
        if stem.len() <= MAX_PLAIN_STEM {
            RecordFile::Plain(self.path.join(format!("{stem}.{RECORD_EXT}")))
        } else {
            let digest = to_hex(&Sha256::digest(key.as_bytes()));
            RecordFile::Hashed(self.path.join(format!("{digest}.{HASHED_EXT}")))
        }
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals directory metadata itself
        Ok(())
    }
}

impl Persistence for FilePersistence {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let record_file = self.record_file(key);
        let data = match fs::read(record_file.path()) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match record_file {
            RecordFile::Plain(_) => Ok(Some(data)),
            RecordFile::Hashed(path) => {
                let (stored_key, value) = split_key_header(&data).ok_or_else(|| {
                    StorageError::Corrupted(format!("bad key header in {}", path.display()))
                })?;
                if stored_key != key {
                    return Err(StorageError::Corrupted(format!(
                        "{} holds a different key",
                        path.display()
                    )));
                }
                Ok(Some(value.to_vec()))
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let record_file = self.record_file(key);
        let temp_path = record_file.temp_path();

        let mut file = File::create(&temp_path)?;
        if let RecordFile::Hashed(_) = record_file {
            let key_len = u32::try_from(key.len()).map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("key of {} bytes is too long", key.len()),
                ))
            })?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key.as_bytes())?;
        }
        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, record_file.path())?;
        self.sync_directory()
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.record_file(key).path()) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_path = entry.path();
            let key = match file_path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXT) => file_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(decode_key),
                Some(HASHED_EXT) => read_key_header(&file_path)?,
                _ => continue,
            };
            let key = key.ok_or_else(|| {
                StorageError::Corrupted(format!("unrecognised record file: {}", file_path.display()))
            })?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Hex-encodes a key so any string maps to a portable file name.
fn encode_key(key: &str) -> String {
    to_hex(key.as_bytes())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn split_key_header(data: &[u8]) -> Option<(&str, &[u8])> {
    let len_bytes: [u8; KEY_HEADER_LEN] = data.get(..KEY_HEADER_LEN)?.try_into().ok()?;
    let key_end = KEY_HEADER_LEN.checked_add(u32::from_le_bytes(len_bytes) as usize)?;
    let key = std::str::from_utf8(data.get(KEY_HEADER_LEN..key_end)?).ok()?;
    Some((key, &data[key_end..]))
}

/// Reads only the key header of a hashed blob.
fn read_key_header(path: &Path) -> StorageResult<Option<String>> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; KEY_HEADER_LEN];
    if file.read_exact(&mut len_bytes).is_err() {
        return Ok(None);
    }
    let key_len = u64::from(u32::from_le_bytes(len_bytes));
    if key_len > file.metadata()?.len() {
        return Ok(None);
    }
    let mut key = vec![0u8; key_len as usize];
    if file.read_exact(&mut key).is_err() {
        return Ok(None);
    }
    Ok(String::from_utf8(key).ok())
}

fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&name[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
