//! Range file parsing and checksumming.

use crate::error::SyncError;
use crate::prefix::Prefix;
use crate::types::{FileData, HashOccurrence};
use sha1::{Digest, Sha1};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Separator between suffix and occurrence on a range line.
const FIELD_SEPARATOR: char = ':';

/// Incremental SHA-1 over a range file's parsed content.
///
/// Feeds the prefix first, then `SUFFIX:OCCURRENCE` for every accepted line in
/// file order, with nothing in between. Two files produce the same checksum
/// exactly when they have the same prefix and the same ordered pairs.
pub struct Checksum {
    hasher: Sha1,
}

impl Checksum {
    pub fn new(prefix: Prefix) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(prefix.to_string().as_bytes());
        Self { hasher }
    }

    pub fn update(&mut self, hash: &HashOccurrence) {
        self.hasher.update(hash.suffix.as_bytes());
        self.hasher.update([FIELD_SEPARATOR as u8]);
        self.hasher.update(hash.occurrence.to_string().as_bytes());
    }

    /// Uppercase hex digest.
    pub fn finish(self) -> String {
        format!("{:X}", self.hasher.finalize())
    }
}

/// Parses one `SUFFIX:OCCURRENCE` line.
///
/// Returns `None` for anything that does not split into exactly two fields
/// or whose occurrence is not a non-negative integer. The suffix is
/// uppercased.
pub fn parse_line(line: &str) -> Option<HashOccurrence> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = line.split(FIELD_SEPARATOR);
    let suffix = fields.next()?;
    let occurrence = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    let occurrence = occurrence.parse::<u64>().ok()?;
    Some(HashOccurrence::new(suffix.to_ascii_uppercase(), occurrence))
}

/// Parses range content for `prefix`, skipping malformed lines.
pub fn parse_range(prefix: Prefix, reader: impl BufRead) -> Result<FileData, SyncError> {
    let mut checksum = Checksum::new(prefix);
    let mut hashes = Vec::new();
    let mut skipped = 0usize;

    for line in reader.split(b'\n') {
        let line = line?;
        match std::str::from_utf8(&line).ok().and_then(parse_line) {
            Some(hash) => {
                checksum.update(&hash);
                hashes.push(hash);
            }
            None => skipped += 1,
        }
    }

    let checksum = checksum.finish();
    trace!(
        "Parsed {} hashes for {} ({} lines skipped), checksum {}",
        hashes.len(),
        prefix,
        skipped,
        checksum
    );
    Ok(FileData {
        prefix,
        hashes,
        checksum,
    })
}

/// Derives the prefix from a cache file name (`<PREFIX>.txt`).
pub fn prefix_from_path(path: &Path) -> Result<Prefix, SyncError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SyncError::InvalidPrefix(path.display().to_string()))?;
    stem.parse()
}

/// Reads and parses one cache file.
pub fn ingest_file(path: &Path) -> Result<FileData, SyncError> {
    let prefix = prefix_from_path(path)?;
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::with_capacity(256 * 1024, file);
    parse_range(prefix, reader)
}

/// Reads and parses one cache file on the blocking pool.
///
/// Parsing and hashing are CPU work, so they run in a blocking task to keep
/// the async workers free.
pub async fn ingest(path: PathBuf) -> Result<FileData, SyncError> {
    tokio::task::spawn_blocking(move || ingest_file(&path)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("AAAA:3", Some(("AAAA", 3)))]
    #[case("aaaa:3", Some(("AAAA", 3)))]
    #[case("AAAA:3\r", Some(("AAAA", 3)))]
    #[case("AAAA:0", Some(("AAAA", 0)))]
    #[case("BADLINE", None)]
    #[case("BBBB:x", None)]
    #[case("BBBB:-1", None)]
    #[case("BBBB:1:2", None)]
    #[case("BBBB:", None)]
    #[case("", None)]
    fn test_parse_line(#[case] line: &str, #[case] expected: Option<(&str, u64)>) {
        let expected = expected.map(|(s, o)| HashOccurrence::new(s, o));
        assert_eq!(parse_line(line), expected);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let content = "AAAA:3\nBADLINE\nBBBB:x\nCCCC:5\n";
        let data = parse_range(prefix("00000"), Cursor::new(content)).unwrap();
        assert_eq!(
            data.hashes,
            vec![HashOccurrence::new("AAAA", 3), HashOccurrence::new("CCCC", 5)]
        );
    }

    #[test]
    fn test_invalid_utf8_lines_are_skipped() {
        let content: &[u8] = b"AAAA:3\n\xFF\xFE:1\nCCCC:5\n";
        let data = parse_range(prefix("00000"), Cursor::new(content)).unwrap();
        assert_eq!(
            data.hashes,
            vec![HashOccurrence::new("AAAA", 3), HashOccurrence::new("CCCC", 5)]
        );
        let clean = parse_range(prefix("00000"), Cursor::new("AAAA:3\nCCCC:5\n")).unwrap();
        assert_eq!(data.checksum, clean.checksum);
    }

    #[test]
    fn test_crlf_and_lf_produce_same_checksum() {
        let lf = parse_range(prefix("0A0A0"), Cursor::new("AAAA:3\nBBBB:1\n")).unwrap();
        let crlf = parse_range(prefix("0A0A0"), Cursor::new("AAAA:3\r\nBBBB:1\r\n")).unwrap();
        assert_eq!(lf, crlf);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let content = "AAAA:3\nBBBB:1\n";
        let a = parse_range(prefix("12345"), Cursor::new(content)).unwrap();
        let b = parse_range(prefix("12345"), Cursor::new(content)).unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.checksum.len(), 40);
        assert!(a.checksum.bytes().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let base = parse_range(prefix("12345"), Cursor::new("AAAA:3\nBBBB:1\n")).unwrap();
        let occurrence = parse_range(prefix("12345"), Cursor::new("AAAA:4\nBBBB:1\n")).unwrap();
        let order = parse_range(prefix("12345"), Cursor::new("BBBB:1\nAAAA:3\n")).unwrap();
        let other_prefix = parse_range(prefix("12346"), Cursor::new("AAAA:3\nBBBB:1\n")).unwrap();
        assert_ne!(base.checksum, occurrence.checksum);
        assert_ne!(base.checksum, order.checksum);
        assert_ne!(base.checksum, other_prefix.checksum);
    }

    #[test]
    fn test_skipped_lines_do_not_affect_checksum() {
        let clean = parse_range(prefix("00000"), Cursor::new("AAAA:3\nCCCC:5\n")).unwrap();
        let noisy =
            parse_range(prefix("00000"), Cursor::new("AAAA:3\nBADLINE\nBBBB:x\nCCCC:5\n")).unwrap();
        assert_eq!(clean.checksum, noisy.checksum);
    }

    #[test]
    fn test_empty_file_checksums_prefix_only() {
        let data = parse_range(prefix("FFFFF"), Cursor::new("")).unwrap();
        assert!(data.hashes.is_empty());

        let expected = format!("{:X}", Sha1::digest(b"FFFFF"));
        assert_eq!(data.checksum, expected);
    }

    #[test]
    fn test_prefix_from_path() {
        assert_eq!(
            prefix_from_path(Path::new("/cache/00A1F.txt")).unwrap(),
            prefix("00A1F")
        );
        assert_eq!(
            prefix_from_path(Path::new("/cache/00a1f.txt")).unwrap(),
            prefix("00A1F")
        );
        assert!(prefix_from_path(Path::new("/cache/00A1F.txt.part")).is_err());
        assert!(prefix_from_path(Path::new("/cache/notes.txt")).is_err());
    }

    #[tokio::test]
    async fn test_ingest_reads_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ABCDE.txt");
        std::fs::write(&path, "0005AD76BD555C1D6D771DE417A4B87E4B4:10\r\n000A8DAE4228F821FB418F59826079BF368:4\r\n").unwrap();

        let data = ingest(path).await.unwrap();
        assert_eq!(data.prefix, prefix("ABCDE"));
        assert_eq!(data.hashes.len(), 2);
        assert_eq!(data.hashes[0].occurrence, 10);
    }
}
