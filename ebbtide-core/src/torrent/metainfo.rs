//! Typed view over a parsed metainfo dictionary.
//!
//! Derives the info-hash from the raw byte range of the `info` value, so the
//! digest is independent of key ordering anywhere else in the file.

use sha1::{Digest, Sha1};

use super::bencode::BencodeValue;
use super::{InfoHash, PieceIndex, TorrentError};

/// One file entry of a torrent; `path` holds the components without
/// separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl TorrentFile {
    /// Returns the slash-joined relative path of this file.
    pub fn joined_path(&self) -> String {
        self.path.join("/")
    }
}

/// Parsed torrent metainfo.
///
/// Immutable after load; announce tiers are snapshotted into the session and
/// reordered there (BEP 12 shuffle), never here.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    pub announce_tiers: Vec<Vec<String>>,
}

impl Metainfo {
    /// Parses a metainfo buffer per BEP 3, honoring the BEP 12 announce-list
    /// as the primary source of tracker tiers.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MalformedEncoding` - If the buffer is not bencode, is
    ///   missing required keys, or carries an invalid piece table
    pub fn from_bytes(torrent_bytes: &[u8]) -> Result<Self, TorrentError> {
        let root = BencodeValue::parse(torrent_bytes)?;
        if root.as_dict().is_none() {
            return Err(malformed("root element must be a dictionary"));
        }

        let info = root
            .get(b"info")
            .ok_or_else(|| malformed("missing 'info' dictionary"))?;
        if info.as_dict().is_none() {
            return Err(malformed("'info' must be a dictionary"));
        }

        // The info-hash covers the exact source bytes of the info value.
        let info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(info.span().slice(torrent_bytes));
            InfoHash::new(hasher.finalize().into())
        };

        let name = required_str(info, b"name")?.to_string();
        let piece_length = required_integer(info, b"piece length")?;
        if piece_length <= 0 {
            return Err(malformed("'piece length' must be positive"));
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = required_bytes(info, b"pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(malformed("'pieces' length is not a multiple of 20"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = if let Some(length) = info.get(b"length") {
            let length = length
                .as_integer()
                .ok_or_else(|| malformed("'length' must be an integer"))?;
            if length < 0 {
                return Err(malformed("'length' must be non-negative"));
            }
            let files = vec![TorrentFile {
                path: vec![name.clone()],
                length: length as u64,
            }];
            (files, length as u64)
        } else {
            let files_list = info
                .get(b"files")
                .and_then(|value| value.as_list())
                .ok_or_else(|| malformed("missing 'files' or 'length' in info"))?;
            extract_files(files_list)?
        };

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(malformed("piece table does not match total length"));
        }

        let announce_tiers = extract_announce_tiers(&root)?;

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_tiers,
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Returns the byte size of piece `index`; the final piece is truncated
    /// to the remainder of the total length.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let count = self.piece_count();
        if count == 0 {
            return 0;
        }
        if index.as_u32() + 1 == count {
            let full = u64::from(self.piece_length) * u64::from(count - 1);
            (self.total_length - full) as u32
        } else {
            self.piece_length
        }
    }
}

fn malformed(reason: impl Into<String>) -> TorrentError {
    TorrentError::MalformedEncoding {
        reason: reason.into(),
    }
}

fn required_bytes<'a>(dict: &'a BencodeValue, key: &[u8]) -> Result<&'a [u8], TorrentError> {
    dict.get(key).and_then(|value| value.as_bytes()).ok_or_else(|| {
        malformed(format!(
            "missing or invalid field: {}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn required_str<'a>(dict: &'a BencodeValue, key: &[u8]) -> Result<&'a str, TorrentError> {
    dict.get(key).and_then(|value| value.as_str()).ok_or_else(|| {
        malformed(format!(
            "missing or non-UTF-8 field: {}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn required_integer(dict: &BencodeValue, key: &[u8]) -> Result<i64, TorrentError> {
    dict.get(key).and_then(|value| value.as_integer()).ok_or_else(|| {
        malformed(format!(
            "missing or invalid integer field: {}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn extract_files(files_list: &[BencodeValue]) -> Result<(Vec<TorrentFile>, u64), TorrentError> {
    let mut files = Vec::new();
    let mut total_length = 0u64;

    for file_value in files_list {
        if file_value.as_dict().is_none() {
            return Err(malformed("file entry must be a dictionary"));
        }
        let length = required_integer(file_value, b"length")?;
        if length < 0 {
            return Err(malformed("file length must be non-negative"));
        }
        total_length += length as u64;

        let path_list = file_value
            .get(b"path")
            .and_then(|value| value.as_list())
            .ok_or_else(|| malformed("missing or invalid 'path' in file entry"))?;
        let mut path = Vec::with_capacity(path_list.len());
        for component in path_list {
            let component = component
                .as_str()
                .ok_or_else(|| malformed("non-UTF-8 path component"))?;
            path.push(component.to_string());
        }
        if path.is_empty() {
            return Err(malformed("empty 'path' in file entry"));
        }

        files.push(TorrentFile {
            path,
            length: length as u64,
        });
    }

    Ok((files, total_length))
}

fn extract_announce_tiers(root: &BencodeValue) -> Result<Vec<Vec<String>>, TorrentError> {
    if let Some(announce_list) = root.get(b"announce-list").and_then(|value| value.as_list()) {
        let mut tiers = Vec::with_capacity(announce_list.len());
        for tier_value in announce_list {
            let tier_urls = tier_value
                .as_list()
                .ok_or_else(|| malformed("announce-list tier must be a list"))?;
            let mut tier = Vec::with_capacity(tier_urls.len());
            for url_value in tier_urls {
                if let Some(url) = url_value.as_str() {
                    tier.push(url.to_string());
                }
            }
            tiers.push(tier);
        }
        if tiers.iter().any(|tier| !tier.is_empty()) {
            return Ok(tiers);
        }
    }

    if let Some(announce) = root.get(b"announce").and_then(|value| value.as_str()) {
        return Ok(vec![vec![announce.to_string()]]);
    }

    Err(malformed("no announce URLs found"))
}

/// Serializes announce tiers as a canonical bencoded list of lists.
///
/// Persisted tier order must survive byte-exactly, so this goes through the
/// codec rather than string concatenation.
pub fn encode_announce_tiers(tiers: &[Vec<String>]) -> Vec<u8> {
    BencodeValue::list(
        tiers
            .iter()
            .map(|tier| {
                BencodeValue::list(
                    tier.iter()
                        .map(|url| BencodeValue::bytes(url.as_bytes()))
                        .collect(),
                )
            })
            .collect(),
    )
    .encode()
}

/// Decodes announce tiers previously written by [`encode_announce_tiers`].
///
/// # Errors
///
/// - `TorrentError::MalformedEncoding` - If the buffer is not a bencoded
///   list of lists of byte-strings
pub fn decode_announce_tiers(bytes: &[u8]) -> Result<Vec<Vec<String>>, TorrentError> {
    let value = BencodeValue::parse(bytes)?;
    let tier_values = value
        .as_list()
        .ok_or_else(|| malformed("announce tiers must be a list"))?;
    let mut tiers = Vec::with_capacity(tier_values.len());
    for tier_value in tier_values {
        let urls = tier_value
            .as_list()
            .ok_or_else(|| malformed("announce tier must be a list"))?;
        let mut tier = Vec::with_capacity(urls.len());
        for url_value in urls {
            let url = url_value
                .as_str()
                .ok_or_else(|| malformed("announce URL must be a UTF-8 string"))?;
            tier.push(url.to_string());
        }
        tiers.push(tier);
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::super::test_data::{multi_file_torrent, sha1_of, single_file_torrent, torrent_with_tiers};
    use super::*;

    #[test]
    fn test_parse_single_file_torrent() {
        let content = vec![0xabu8; 48];
        let torrent = single_file_torrent("http://tracker.example.com/announce", "a.bin", 32, &content);
        let metainfo = Metainfo::from_bytes(&torrent).unwrap();

        assert_eq!(metainfo.name, "a.bin");
        assert_eq!(metainfo.piece_length, 32);
        assert_eq!(metainfo.total_length, 48);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, vec!["a.bin"]);
        assert_eq!(
            metainfo.announce_tiers,
            vec![vec!["http://tracker.example.com/announce".to_string()]]
        );
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        let content = vec![1u8; 16];
        let torrent = single_file_torrent("http://a/announce", "f", 16, &content);

        // Hash of the raw info slice, located independently of the parser.
        let root = BencodeValue::parse(&torrent).unwrap();
        let span = root.get(b"info").unwrap().span();
        let expected = InfoHash::new(sha1_of(span.slice(&torrent)));

        let metainfo = Metainfo::from_bytes(&torrent).unwrap();
        assert_eq!(metainfo.info_hash, expected);
    }

    #[test]
    fn test_info_hash_independent_of_other_keys() {
        let content = vec![7u8; 16];
        let one = single_file_torrent("http://first/announce", "f", 16, &content);
        let two = single_file_torrent("http://second.example.org/announce", "f", 16, &content);
        assert_eq!(
            Metainfo::from_bytes(&one).unwrap().info_hash,
            Metainfo::from_bytes(&two).unwrap().info_hash
        );
    }

    #[test]
    fn test_announce_list_takes_precedence() {
        let tiers: &[&[&str]] = &[
            &["http://a/announce", "http://b/announce"],
            &["http://c/announce"],
        ];
        let torrent = torrent_with_tiers("http://primary/announce", tiers, "f", 16, &[0u8; 16]);
        let metainfo = Metainfo::from_bytes(&torrent).unwrap();
        assert_eq!(metainfo.announce_tiers.len(), 2);
        assert_eq!(
            metainfo.announce_tiers[0],
            vec!["http://a/announce".to_string(), "http://b/announce".to_string()]
        );
        assert_eq!(metainfo.announce_tiers[1], vec!["http://c/announce".to_string()]);
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let content = vec![3u8; 40];
        let files: &[(&[&str], u64)] = &[(&["docs", "a.txt"], 24), (&["b.dat"], 16)];
        let torrent = multi_file_torrent("http://t/announce", "bundle", 16, files, &content);
        let metainfo = Metainfo::from_bytes(&torrent).unwrap();

        assert_eq!(metainfo.total_length, 40);
        assert_eq!(metainfo.files.len(), 2);
        assert_eq!(metainfo.files[0].joined_path(), "docs/a.txt");
        assert_eq!(metainfo.files[1].joined_path(), "b.dat");
        assert_eq!(metainfo.piece_count(), 3);
    }

    #[test]
    fn test_final_piece_is_truncated() {
        let content = vec![9u8; 40];
        let torrent = single_file_torrent("http://t/announce", "f", 16, &content);
        let metainfo = Metainfo::from_bytes(&torrent).unwrap();
        assert_eq!(metainfo.piece_size(PieceIndex::new(0)), 16);
        assert_eq!(metainfo.piece_size(PieceIndex::new(1)), 16);
        assert_eq!(metainfo.piece_size(PieceIndex::new(2)), 8);
    }

    #[test]
    fn test_rejects_invalid_pieces_length() {
        // 19 bytes of piece hashes: not a multiple of 20.
        let torrent = b"d8:announce12:http://t/ann4:infod6:lengthi16e4:name1:f12:piece lengthi16e6:pieces19:0123456789012345678ee";
        let result = Metainfo::from_bytes(torrent);
        assert!(matches!(
            result,
            Err(TorrentError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_info() {
        let result = Metainfo::from_bytes(b"d8:announce12:http://t/anne");
        assert!(matches!(
            result,
            Err(TorrentError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_announce() {
        let torrent = b"d4:infod6:lengthi0e4:name1:f12:piece lengthi16e6:pieces0:ee";
        let result = Metainfo::from_bytes(torrent);
        assert!(matches!(
            result,
            Err(TorrentError::MalformedEncoding { .. })
        ));
    }

    #[test]
    fn test_announce_tiers_round_trip() {
        let tiers = vec![
            vec!["http://a/announce".to_string(), "http://b/announce".to_string()],
            vec!["http://c/announce".to_string()],
        ];
        let encoded = encode_announce_tiers(&tiers);
        assert_eq!(decode_announce_tiers(&encoded).unwrap(), tiers);
    }
}
