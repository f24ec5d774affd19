//! Synthetic torrent construction for tests.

use std::collections::HashMap;

use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

use crate::metainfo::Metainfo;

struct BuilderFile {
    path: String,
    length: u64,
    fill: u8,
}

/// Builds bencoded torrents with real piece hashes.
///
/// File contents are synthesized as a repeated fill byte, so two builders
/// declaring the same lengths and fills in the same order produce torrents
/// whose piece hashes agree — which is what piece verification compares.
pub struct TorrentBuilder {
    name: String,
    piece_length: u64,
    files: Vec<BuilderFile>,
    single: Option<(u64, u8)>,
    announce: Option<String>,
    source: Option<String>,
}

impl TorrentBuilder {
    pub fn new(name: &str, piece_length: u64) -> Self {
        Self {
            name: name.to_string(),
            piece_length,
            files: Vec::new(),
            single: None,
            announce: None,
            source: None,
        }
    }

    /// Add a file with content derived from its declared position.
    pub fn file(self, path: &str, length: u64) -> Self {
        let fill = (self.files.len() as u8).wrapping_mul(7).wrapping_add(1);
        self.file_with_fill(path, length, fill)
    }

    /// Add a file with an explicit fill byte.
    pub fn file_with_fill(mut self, path: &str, length: u64, fill: u8) -> Self {
        self.files.push(BuilderFile {
            path: path.to_string(),
            length,
            fill,
        });
        self
    }

    /// Make this a single-file torrent of the given length.
    pub fn single_file(mut self, length: u64) -> Self {
        self.single = Some((length, 1));
        self
    }

    pub fn announce(mut self, url: &str) -> Self {
        self.announce = Some(url.to_string());
        self
    }

    pub fn source(mut self, flag: &str) -> Self {
        self.source = Some(flag.to_string());
        self
    }

    fn piece_hashes(&self) -> Vec<u8> {
        let mut stream: Vec<(u64, u8)> = Vec::new();
        if let Some((length, fill)) = self.single {
            stream.push((length, fill));
        } else {
            for f in &self.files {
                stream.push((f.length, f.fill));
            }
        }

        let mut hashes = Vec::new();
        let mut hasher = Sha1::new();
        let mut in_piece = 0u64;
        for (length, fill) in stream {
            let mut remaining = length;
            while remaining > 0 {
                let take = remaining.min(self.piece_length - in_piece);
                hasher.update(vec![fill; take as usize]);
                in_piece += take;
                remaining -= take;
                if in_piece == self.piece_length {
                    hashes.extend_from_slice(&hasher.finalize_reset());
                    in_piece = 0;
                }
            }
        }
        if in_piece > 0 {
            hashes.extend_from_slice(&hasher.finalize_reset());
        }
        hashes
    }

    pub fn build(self) -> Metainfo {
        let pieces = self.piece_hashes();

        let mut info: HashMap<Vec<u8>, Value> = HashMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(self.name.as_bytes().to_vec()));
        info.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        if let Some(source) = &self.source {
            info.insert(b"source".to_vec(), Value::Bytes(source.as_bytes().to_vec()));
        }

        if let Some((length, _)) = self.single {
            info.insert(b"length".to_vec(), Value::Int(length as i64));
        } else {
            let files: Vec<Value> = self
                .files
                .iter()
                .map(|f| {
                    let mut d: HashMap<Vec<u8>, Value> = HashMap::new();
                    d.insert(b"length".to_vec(), Value::Int(f.length as i64));
                    d.insert(
                        b"path".to_vec(),
                        Value::List(
                            f.path
                                .split('/')
                                .map(|p| Value::Bytes(p.as_bytes().to_vec()))
                                .collect(),
                        ),
                    );
                    Value::Dict(d)
                })
                .collect();
            info.insert(b"files".to_vec(), Value::List(files));
        }

        let mut root: HashMap<Vec<u8>, Value> = HashMap::new();
        if let Some(announce) = &self.announce {
            root.insert(
                b"announce".to_vec(),
                Value::Bytes(announce.as_bytes().to_vec()),
            );
        }
        root.insert(b"info".to_vec(), Value::Dict(info));

        Metainfo::from_root(root).expect("builder produces valid metainfo")
    }

    pub fn build_bytes(self) -> Vec<u8> {
        self.build().encode().expect("builder output encodes")
    }
}
