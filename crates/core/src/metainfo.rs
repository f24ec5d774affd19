//! BitTorrent metainfo parsing and canonical re-emission.
//!
//! The raw `info` dictionary is kept as a bencode value so keys we do not
//! model survive a round trip and the infohash stays reproducible.
//! serde_bencode writes dictionaries with sorted keys and minimal integers,
//! which is exactly the BEP-3 canonical form the infohash depends on.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Errors raised while decoding or re-encoding metainfo.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("failed to parse torrent: {0}")]
    Parse(String),

    #[error("torrent is not a bencoded dictionary")]
    NotADict,

    #[error("info dictionary missing required field: {0}")]
    MissingField(&'static str),

    #[error("info dictionary field has unexpected type: {0}")]
    InvalidField(&'static str),

    #[error("failed to re-encode torrent: {0}")]
    Encode(String),

    #[error("invalid infohash: {0}")]
    InvalidHash(String),
}

/// 20-byte SHA-1 infohash, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

impl FromStr for InfoHash {
    type Err = MetainfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 40 {
            return Err(MetainfoError::InvalidHash(s.to_string()));
        }
        let mut out = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .map_err(|_| MetainfoError::InvalidHash(s.to_string()))?;
            out[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| MetainfoError::InvalidHash(s.to_string()))?;
        }
        Ok(InfoHash(out))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One file in the torrent, relative to the content root.
///
/// For multi-file torrents `path` excludes the root directory name; for
/// single-file torrents it equals the torrent name. `offset` is the byte
/// position within the concatenated content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub length: u64,
    pub offset: u64,
}

/// Portion of a piece occupied by one file: byte range within piece `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpan {
    pub index: usize,
    pub begin: u64,
    pub end: u64,
}

impl PieceSpan {
    /// True when the file covers the whole piece.
    pub fn covers_whole_piece(&self, piece_length: u64) -> bool {
        self.begin == 0 && self.end == piece_length
    }
}

/// Parsed torrent metainfo with the raw dictionaries retained.
#[derive(Debug, Clone)]
pub struct Metainfo {
    root: HashMap<Vec<u8>, Value>,
    name: String,
    piece_length: u64,
    pieces: Vec<[u8; 20]>,
    files: Vec<FileEntry>,
    source: Option<String>,
}

impl Metainfo {
    /// Parse bencoded torrent bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let value: Value =
            serde_bencode::from_bytes(bytes).map_err(|e| MetainfoError::Parse(e.to_string()))?;
        let root = match value {
            Value::Dict(d) => d,
            _ => return Err(MetainfoError::NotADict),
        };
        Self::from_root(root)
    }

    pub(crate) fn from_root(root: HashMap<Vec<u8>, Value>) -> Result<Self, MetainfoError> {
        let info = match root.get(b"info".as_slice()) {
            Some(Value::Dict(d)) => d,
            Some(_) => return Err(MetainfoError::InvalidField("info")),
            None => return Err(MetainfoError::MissingField("info")),
        };

        let name = info_str(info, b"name")?.ok_or(MetainfoError::MissingField("name"))?;

        let piece_length = match info.get(b"piece length".as_slice()) {
            Some(Value::Int(n)) if *n > 0 => *n as u64,
            Some(_) => return Err(MetainfoError::InvalidField("piece length")),
            None => return Err(MetainfoError::MissingField("piece length")),
        };

        let pieces = match info.get(b"pieces".as_slice()) {
            Some(Value::Bytes(b)) if b.len() % 20 == 0 => b
                .chunks_exact(20)
                .map(|c| {
                    let mut p = [0u8; 20];
                    p.copy_from_slice(c);
                    p
                })
                .collect(),
            Some(_) => return Err(MetainfoError::InvalidField("pieces")),
            None => return Err(MetainfoError::MissingField("pieces")),
        };

        let source = info_str(info, b"source")?;

        let files = match info.get(b"files".as_slice()) {
            Some(Value::List(entries)) => {
                let mut files = Vec::with_capacity(entries.len());
                let mut offset = 0u64;
                for entry in entries {
                    let dict = match entry {
                        Value::Dict(d) => d,
                        _ => return Err(MetainfoError::InvalidField("files")),
                    };
                    let length = match dict.get(b"length".as_slice()) {
                        Some(Value::Int(n)) if *n >= 0 => *n as u64,
                        _ => return Err(MetainfoError::InvalidField("files.length")),
                    };
                    let parts = match dict.get(b"path".as_slice()) {
                        Some(Value::List(parts)) => parts,
                        _ => return Err(MetainfoError::InvalidField("files.path")),
                    };
                    let mut components = Vec::with_capacity(parts.len());
                    for part in parts {
                        match part {
                            Value::Bytes(b) => {
                                components.push(String::from_utf8_lossy(b).into_owned())
                            }
                            _ => return Err(MetainfoError::InvalidField("files.path")),
                        }
                    }
                    files.push(FileEntry {
                        path: components.join("/"),
                        length,
                        offset,
                    });
                    offset += length;
                }
                if files.is_empty() {
                    return Err(MetainfoError::MissingField("files"));
                }
                files
            }
            Some(_) => return Err(MetainfoError::InvalidField("files")),
            None => {
                // Single-file torrent: synthesize a one-entry list.
                let length = match info.get(b"length".as_slice()) {
                    Some(Value::Int(n)) if *n >= 0 => *n as u64,
                    Some(_) => return Err(MetainfoError::InvalidField("length")),
                    None => return Err(MetainfoError::MissingField("length")),
                };
                vec![FileEntry {
                    path: name.clone(),
                    length,
                    offset: 0,
                }]
            }
        };

        Ok(Self {
            root,
            name,
            piece_length,
            pieces,
            files,
            source,
        })
    }

    /// Torrent name: root directory for multi-file, file name otherwise.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn pieces(&self) -> &[[u8; 20]] {
        &self.pieces
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// True when the torrent declares a `files` list.
    pub fn is_multi_file(&self) -> bool {
        matches!(self.info_dict().get(b"files".as_slice()), Some(Value::List(_)))
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Announce URL, if present.
    pub fn announce(&self) -> Option<String> {
        match self.root.get(b"announce".as_slice()) {
            Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    fn info_dict(&self) -> &HashMap<Vec<u8>, Value> {
        match self.root.get(b"info".as_slice()) {
            Some(Value::Dict(d)) => d,
            _ => unreachable!("validated at parse time"),
        }
    }

    /// SHA-1 of the canonical re-encoding of the info dictionary.
    pub fn infohash(&self) -> Result<InfoHash, MetainfoError> {
        let info = self
            .root
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let encoded =
            serde_bencode::to_bytes(info).map_err(|e| MetainfoError::Encode(e.to_string()))?;
        let digest = Sha1::digest(&encoded);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Ok(InfoHash(out))
    }

    /// Re-emit the whole torrent canonically.
    pub fn encode(&self) -> Result<Vec<u8>, MetainfoError> {
        serde_bencode::to_bytes(&Value::Dict(self.root.clone()))
            .map_err(|e| MetainfoError::Encode(e.to_string()))
    }

    /// Copy of this metainfo with the info `source` key set (or removed when
    /// `flag` is empty). The infohash changes iff the source differs.
    pub fn with_source(&self, flag: &str) -> Self {
        let mut root = self.root.clone();
        if let Some(Value::Dict(info)) = root.get_mut(b"info".as_slice()) {
            if flag.is_empty() {
                info.remove(b"source".as_slice());
            } else {
                info.insert(b"source".to_vec(), Value::Bytes(flag.as_bytes().to_vec()));
            }
        }
        let mut out = self.clone();
        out.root = root;
        out.source = if flag.is_empty() {
            None
        } else {
            Some(flag.to_string())
        };
        out
    }

    /// Copy of this metainfo with the announce URL replaced. Used when a
    /// hash hit lets us reuse the local torrent for the target tracker.
    pub fn with_announce(&self, url: &str) -> Self {
        let mut root = self.root.clone();
        root.insert(b"announce".to_vec(), Value::Bytes(url.as_bytes().to_vec()));
        root.remove(b"announce-list".as_slice());
        let mut out = self.clone();
        out.root = root;
        out
    }

    /// Pieces overlapping file `i`, each with the byte range the file
    /// occupies within that piece.
    pub fn pieces_for_file(&self, i: usize) -> Vec<PieceSpan> {
        let Some(file) = self.files.get(i) else {
            return Vec::new();
        };
        if file.length == 0 {
            return Vec::new();
        }
        let pl = self.piece_length;
        let first = (file.offset / pl) as usize;
        let last = ((file.offset + file.length - 1) / pl) as usize;
        (first..=last)
            .map(|index| {
                let piece_start = index as u64 * pl;
                let begin = file.offset.saturating_sub(piece_start);
                let end = (file.offset + file.length - piece_start).min(pl);
                PieceSpan { index, begin, end }
            })
            .collect()
    }
}

fn info_str(
    info: &HashMap<Vec<u8>, Value>,
    key: &'static [u8],
) -> Result<Option<String>, MetainfoError> {
    match info.get(key) {
        Some(Value::Bytes(b)) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
        Some(_) => Err(MetainfoError::InvalidField("string field")),
        None => Ok(None),
    }
}
