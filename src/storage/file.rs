use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64ct::{Base64UrlUnpadded, Encoding};

use super::{Error, Persistence, Record};

const RECORD_EXTENSION: &str = "msg";
const TEMP_EXTENSION: &str = "tmp";

/// Length prefix plus CRC trailer.
const FRAMING_LEN: usize = 8;

/// File-backed [`Persistence`].
///
/// `open` selects (and creates) a directory below `root` whose name is the
/// URL-safe base64 encoding of `"<client id>-<server uri>"`, so distinct
/// client/server pairs never share records and any client id is usable.
///
/// Each record is written to `<key>.msg` as
///
/// ```text
/// +----------------+--------+---------+---------------------+
/// | header len u32 | header | payload | crc32 of all before |
/// +----------------+--------+---------+---------------------+
/// ```
///
/// via a temporary file and a rename, so a crash leaves either the old
/// record, the new record, or a stray `.tmp` file that the next `open`
/// deletes. A record that is truncated or fails its checksum is reported as
/// [`Error::Corrupt`].
#[derive(Debug)]
pub struct FilePersistence {
    root: PathBuf,
    dir: Option<PathBuf>,
}

impl FilePersistence {
    /// Store session directories below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir: None,
        }
    }

    /// Directory currently in use, if open.
    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn dir(&self) -> Result<&Path, Error> {
        self.dir.as_deref().ok_or(Error::NotOpen)
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, Error> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(self.dir()?.join(format!("{key}.{RECORD_EXTENSION}")))
    }

    fn record_files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.dir()?)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn encode_record(record: &Record) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAMING_LEN + record.header.len() + record.payload.len());
    bytes.extend_from_slice(&(record.header.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&record.header);
    bytes.extend_from_slice(&record.payload);
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());
    bytes
}

fn decode_record(key: &str, bytes: &[u8]) -> Result<Record, Error> {
    if bytes.len() < FRAMING_LEN {
        return Err(Error::Corrupt(key.to_string()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != expected {
        return Err(Error::Corrupt(key.to_string()));
    }
    let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let rest = &body[4..];
    if header_len > rest.len() {
        return Err(Error::Corrupt(key.to_string()));
    }
    let (header, payload) = rest.split_at(header_len);
    Ok(Record::new(header.to_vec(), payload.to_vec()))
}

impl Persistence for FilePersistence {
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), Error> {
        let name = Base64UrlUnpadded::encode_string(format!("{client_id}-{server_uri}").as_bytes());
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;

        // Leftovers from writes interrupted by a crash.
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                log::warn!("persistence: removing interrupted write {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        self.dir = Some(dir);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.dir = None;
        Ok(())
    }

    fn put(&mut self, key: &str, record: &Record) -> Result<(), Error> {
        let path = self.record_path(key)?;
        let temp = path.with_extension(TEMP_EXTENSION);
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&encode_record(record))?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        };
        write().map_err(|e| {
            log::error!("persistence: failed to write {key}: {e}");
            Error::WriteError(key.to_string())
        })
    }

    fn get(&mut self, key: &str) -> Result<Option<Record>, Error> {
        let path = self.record_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => decode_record(key, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(Error::ReadError(key.to_string())),
        }
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains_key(&mut self, key: &str) -> Result<bool, Error> {
        Ok(self.record_path(key)?.is_file())
    }

    fn keys(&mut self) -> Result<Vec<String>, Error> {
        Ok(self
            .record_files()?
            .iter()
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .collect())
    }

    fn clear(&mut self) -> Result<(), Error> {
        for path in self.record_files()? {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
