//! RPA-3.0 container format reading and writing
//!
//! An RPA-3.0 archive is a 40-byte ASCII header (`RPA-3.0 `, a 16-hex-digit
//! index offset, a space, an 8-hex-digit obfuscation key, NUL padding),
//! followed by concatenated content blobs, followed by a zlib-compressed
//! pickle index mapping each name to `[(offset ^ key, length ^ key, prefix)]`.

use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_pickle::{HashableValue, Value};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header magic, including the trailing space.
const MAGIC: &[u8; 8] = b"RPA-3.0 ";

/// Fixed header size; everything after the key is NUL padding.
const HEADER_LEN: usize = 40;

/// A single entry in an archive index.
///
/// `prefix` is a short byte string that must be prepended to the stored
/// bytes to reconstruct the original file. Archives written by [`RpaWriter`]
/// always use an empty prefix.
#[derive(Debug, Clone)]
pub struct RpaEntry {
    /// Original logical name, case preserved.
    pub name: String,
    /// Byte offset of the content in the archive file.
    pub offset: u64,
    /// Stored byte length (excluding the prefix).
    pub length: u64,
    /// Bytes to prepend when reconstructing the file.
    pub prefix: Vec<u8>,
}

impl RpaEntry {
    /// Full reconstructed size of the entry, prefix included.
    pub fn total_length(&self) -> u64 {
        self.length + self.prefix.len() as u64
    }
}

/// An archive index: name → entry, preserving the order the entries were
/// listed in. Lookups are case-insensitive; names keep their original casing.
#[derive(Debug, Default)]
pub struct RpaIndex {
    entries: Vec<RpaEntry>,
    by_name: HashMap<String, usize>,
    by_folded: HashMap<String, usize>,
}

impl RpaIndex {
    /// Inserts an entry, keeping the first occurrence of a duplicate name.
    fn insert_first(&mut self, entry: RpaEntry) {
        if self.by_name.contains_key(&entry.name) {
            return;
        }
        let pos = self.entries.len();
        self.by_name.insert(entry.name.clone(), pos);
        self.by_folded
            .entry(entry.name.to_lowercase())
            .or_insert(pos);
        self.entries.push(entry);
    }

    /// Looks up an entry by name; exact match first, case-insensitive after.
    pub fn get(&self, name: &str) -> Option<&RpaEntry> {
        self.by_name
            .get(name)
            .or_else(|| self.by_folded.get(&name.to_lowercase()))
            .map(|&pos| &self.entries[pos])
    }

    pub fn entries(&self) -> &[RpaEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpaEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads RPA-3.0 archives.
#[derive(Debug)]
pub struct RpaReader {
    file: File,
    path: PathBuf,
    index_offset: u64,
    key: u32,
}

impl RpaReader {
    /// Opens an archive and parses its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let mut header = [0u8; HEADER_LEN];
        let mut read = 0;
        while read < HEADER_LEN {
            let n = file.read(&mut header[read..])?;
            if n == 0 {
                return Err(Error::BadHeader(format!(
                    "{}: file shorter than the {} byte header",
                    path.display(),
                    HEADER_LEN
                )));
            }
            read += n;
        }

        if !header.starts_with(MAGIC) {
            return Err(Error::BadHeader(format!(
                "{}: missing \"RPA-3.0 \" magic",
                path.display()
            )));
        }

        let index_offset = parse_hex(&header[8..24])?;
        let key = parse_hex(&header[25..33])? as u32;

        Ok(Self {
            file,
            path,
            index_offset,
            key,
        })
    }

    /// The obfuscation key from the header.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// The index offset from the header.
    pub fn index_offset(&self) -> u64 {
        self.index_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and deobfuscates the archive index.
    ///
    /// Only the first tuple per name is used. Both `(offset, length)` and
    /// `(offset, length, prefix)` tuple shapes are accepted; the first
    /// occurrence of a duplicate name wins.
    pub fn read_index(&mut self) -> Result<RpaIndex> {
        self.file.seek(SeekFrom::Start(self.index_offset))?;
        let mut compressed = Vec::new();
        self.file.read_to_end(&mut compressed)?;
        if compressed.is_empty() {
            return Err(Error::CorruptIndex("no index data after offset".into()));
        }

        let mut raw = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut raw)
            .map_err(|e| Error::CorruptIndex(format!("zlib: {e}")))?;

        let value: Value = serde_pickle::from_slice(&raw, serde_pickle::DeOptions::new())
            .map_err(|e| Error::CorruptIndex(format!("pickle: {e}")))?;

        let dict = match value {
            Value::Dict(d) => d,
            other => {
                return Err(Error::CorruptIndex(format!(
                    "index is not a dict (got {other:?})"
                )))
            }
        };

        let mut index = RpaIndex::default();
        for (k, v) in dict {
            let name = match k {
                HashableValue::String(s) => s,
                HashableValue::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                other => {
                    return Err(Error::CorruptIndex(format!(
                        "index key is not a string (got {other:?})"
                    )))
                }
            };
            let entry = self.parse_entry(name, &v)?;
            index.insert_first(entry);
        }
        Ok(index)
    }

    fn parse_entry(&self, name: String, value: &Value) -> Result<RpaEntry> {
        let list = match value {
            Value::List(l) | Value::Tuple(l) => l,
            other => {
                return Err(Error::CorruptIndex(format!(
                    "{name}: entry is not a list (got {other:?})"
                )))
            }
        };
        let first = list
            .first()
            .ok_or_else(|| Error::CorruptIndex(format!("{name}: empty entry list")))?;
        let tuple = match first {
            Value::Tuple(t) | Value::List(t) => t,
            other => {
                return Err(Error::CorruptIndex(format!(
                    "{name}: entry item is not a tuple (got {other:?})"
                )))
            }
        };
        if tuple.len() < 2 {
            return Err(Error::CorruptIndex(format!("{name}: entry tuple too short")));
        }

        let offset = pickle_int(&name, &tuple[0])? ^ u64::from(self.key);
        let length = pickle_int(&name, &tuple[1])? ^ u64::from(self.key);
        let prefix = match tuple.get(2) {
            None | Some(Value::None) => Vec::new(),
            Some(Value::Bytes(b)) => b.clone(),
            Some(Value::String(s)) => latin1_bytes(s),
            Some(other) => {
                return Err(Error::CorruptIndex(format!(
                    "{name}: prefix is not bytes (got {other:?})"
                )))
            }
        };

        if offset + length > self.index_offset {
            return Err(Error::CorruptIndex(format!(
                "{name}: content [{offset}, +{length}] extends past the index at {}",
                self.index_offset
            )));
        }

        Ok(RpaEntry {
            name,
            offset,
            length,
            prefix,
        })
    }

    /// Reads the full content of one entry, prefix prepended.
    pub fn read_file(&mut self, entry: &RpaEntry) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut data = Vec::with_capacity(entry.total_length() as usize);
        data.extend_from_slice(&entry.prefix);
        let got = (&mut self.file)
            .take(entry.length)
            .read_to_end(&mut data)? as u64;
        if got < entry.length {
            return Err(Error::ShortRead {
                name: entry.name.clone(),
                wanted: entry.length,
                got,
            });
        }
        Ok(data)
    }
}

/// Writes RPA-3.0 archives.
///
/// Entries are appended with [`add_file`](RpaWriter::add_file); the index and
/// header are written by [`finish`](RpaWriter::finish), which is idempotent.
/// A writer dropped before `finish` leaves a file whose header is all NUL;
/// every RPA-3.0 reader rejects such a file, so the state is ignorable.
pub struct RpaWriter {
    file: BufWriter<File>,
    key: u32,
    entries: Vec<(String, u64, u64)>,
    names: HashSet<String>,
    finished: bool,
}

impl RpaWriter {
    /// Creates an archive with a random obfuscation key.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_key(path, rand::random())
    }

    /// Creates an archive with an explicit obfuscation key.
    pub fn with_key<P: AsRef<Path>>(path: P, key: u32) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(&[0u8; HEADER_LEN])?;
        Ok(Self {
            file,
            key,
            entries: Vec::new(),
            names: HashSet::new(),
            finished: false,
        })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Appends one entry. Duplicate names are rejected.
    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(Error::DuplicateEntry(name.to_string()));
        }
        let offset = self.file.stream_position()?;
        self.file.write_all(data)?;
        self.entries
            .push((name.to_string(), offset, data.len() as u64));
        Ok(())
    }

    /// Writes the index and header. Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let index_offset = self.file.stream_position()?;

        let pickled = serde_pickle::to_vec(
            &PickleIndex {
                entries: &self.entries,
                key: self.key,
            },
            serde_pickle::SerOptions::new(),
        )
        .map_err(|e| Error::CorruptIndex(format!("pickle: {e}")))?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&pickled)?;
        let compressed = encoder.finish()?;
        self.file.write_all(&compressed)?;

        let mut header = format!("RPA-3.0 {:016x} {:08x}\n", index_offset, self.key).into_bytes();
        header.resize(HEADER_LEN, 0);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Serializes the recorded entries as the legacy pickle index, in insertion
/// order, each value a single `(offset ^ key, length ^ key, "")` tuple.
/// The prefix slot is a string because downstream readers accept either
/// shape and pickled byte strings round-trip poorly through serde.
struct PickleIndex<'a> {
    entries: &'a [(String, u64, u64)],
    key: u32,
}

impl Serialize for PickleIndex<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let key = u64::from(self.key);
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, offset, length) in self.entries {
            map.serialize_entry(name, &vec![(offset ^ key, length ^ key, "")])?;
        }
        map.end()
    }
}

fn parse_hex(field: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(field)
        .map_err(|_| Error::BadHeader("non-ASCII hex field".into()))?;
    u64::from_str_radix(text, 16)
        .map_err(|_| Error::BadHeader(format!("unparseable hex field {text:?}")))
}

/// Pickle prefixes written by legacy tools may arrive as str; they were
/// produced by latin-1 decoding raw bytes, so map code points straight back.
fn latin1_bytes(s: &str) -> Vec<u8> {
    if s.chars().all(|c| (c as u32) < 0x100) {
        s.chars().map(|c| c as u8).collect()
    } else {
        s.as_bytes().to_vec()
    }
}

fn pickle_int(name: &str, value: &Value) -> Result<u64> {
    let signed = match value {
        Value::I64(i) => *i,
        Value::Int(i) => i
            .try_into()
            .map_err(|_| Error::CorruptIndex(format!("{name}: integer out of range")))?,
        other => {
            return Err(Error::CorruptIndex(format!(
                "{name}: expected integer, got {other:?}"
            )))
        }
    };
    Ok(signed as u64)
}
