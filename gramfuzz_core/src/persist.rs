use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while moving seeds and hex dumps between memory and disk.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Persistence I/O error: {0}")]
    Io(String),

    /// The text is not a sequence of hex-digit pairs.
    #[error("Invalid hex text: {0}")]
    InvalidHex(String),

    #[error("Seed path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for PersistError {
    fn from(err: hex::FromHexError) -> Self {
        PersistError::InvalidHex(err.to_string())
    }
}

/// Lowercase, two digits per byte.
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decodes hex-digit pairs, ignoring any whitespace between them.
pub fn hex_decode(text: &str) -> Result<Vec<u8>, PersistError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(compact)?)
}

pub fn read_file_as_hex(path: &Path) -> Result<String, PersistError> {
    let bytes = fs::read(path)
        .map_err(|e| PersistError::Io(format!("Failed to read {:?}: {}", path, e)))?;
    Ok(hex_encode(&bytes))
}

pub fn write_hex_as_bytes(path: &Path, hex_text: &str) -> Result<(), PersistError> {
    let bytes = hex_decode(hex_text)?;
    fs::write(path, bytes)
        .map_err(|e| PersistError::Io(format!("Failed to write {:?}: {}", path, e)))?;
    Ok(())
}

const MESSAGE_TERMINATOR: &str = "\r\n\r\n";

/// Strips leading whitespace and makes sure the seed ends with a blank line.
pub fn normalize_seed(contents: &str) -> String {
    let trimmed = contents.trim_start_matches([' ', '\t', '\r', '\n']);
    if trimmed.ends_with(MESSAGE_TERMINATOR) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{MESSAGE_TERMINATOR}")
    }
}

/// Turns every bare `\n` into `\r\n`, then terminates the message with a blank line.
pub fn format_request_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + MESSAGE_TERMINATOR.len());
    let mut previous = None;
    for c in message.chars() {
        if c == '\n' && previous != Some('\r') {
            out.push('\r');
        }
        out.push(c);
        previous = Some(c);
    }
    out.push_str(MESSAGE_TERMINATOR);
    out
}

/// Resolves `\n`, `\t`, `\r` and `\\` escapes in an oracle answer. Any other escaped
/// character stands for itself; a trailing lone backslash is kept.
pub fn unescape_answer(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// A directory of seed files named by the MD5 of their normalised contents.
///
/// Writing the same seed twice is a no-op, so repeated enrichment rounds never
/// duplicate a file.
#[derive(Debug)]
pub struct SeedStore {
    dir: PathBuf,
    known: BTreeSet<String>,
}

impl SeedStore {
    const FILE_PREFIX: &'static str = "enriched_";
    const FILE_EXTENSION: &'static str = "raw";

    /// Opens `dir`, creating it if needed, and indexes the seeds already in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                PersistError::Io(format!("Failed to create seed directory {:?}: {}", dir, e))
            })?;
        } else if !dir.is_dir() {
            return Err(PersistError::NotADirectory(dir));
        }

        let mut known = BTreeSet::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(digest) = Self::digest_of(&path) {
                known.insert(digest.to_string());
            }
        }
        debug!(dir = ?dir, seeds = known.len(), "Opened seed store");
        Ok(Self { dir, known })
    }

    fn digest_of(path: &Path) -> Option<&str> {
        if path.extension()? != Self::FILE_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.strip_prefix(Self::FILE_PREFIX)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// The file a seed with these contents lives in.
    pub fn path_for(&self, contents: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(normalize_seed(contents)));
        self.path_for_digest(&digest)
    }

    fn path_for_digest(&self, digest: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", Self::FILE_PREFIX, digest))
            .with_extension(Self::FILE_EXTENSION)
    }

    /// Normalises and writes one seed. Returns the new file's path, or `None` when an
    /// identical seed is already stored.
    pub fn write(&mut self, contents: &str) -> Result<Option<PathBuf>, PersistError> {
        let normalized = normalize_seed(contents);
        let digest = format!("{:x}", md5::compute(&normalized));
        if self.known.contains(&digest) {
            debug!(digest = %digest, "Seed already stored, skipping");
            return Ok(None);
        }

        let path = self.path_for_digest(&digest);
        fs::write(&path, &normalized)
            .map_err(|e| PersistError::Io(format!("Failed to write seed {:?}: {}", path, e)))?;
        info!(path = ?path, bytes = normalized.len(), "Wrote seed");
        self.known.insert(digest);
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hex_codec_is_lowercase_and_ignores_whitespace() {
        assert_eq!(hex_encode(&[0x00, 0xAB, 0x7f]), "00ab7f");
        assert_eq!(hex_decode("00 AB\n7f").unwrap(), vec![0x00, 0xAB, 0x7f]);
        assert!(hex_decode("").unwrap().is_empty());
    }

    #[test]
    fn hex_decode_rejects_odd_length_and_bad_digits() {
        assert!(matches!(hex_decode("abc"), Err(PersistError::InvalidHex(_))));
        assert!(matches!(hex_decode("zz"), Err(PersistError::InvalidHex(_))));
    }

    #[test]
    fn file_hex_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("message.bin");
        write_hex_as_bytes(&path, "de ad be ef").unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(read_file_as_hex(&path).unwrap(), "deadbeef");
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = read_file_as_hex(&dir.path().join("absent"));
        assert!(matches!(result, Err(PersistError::Io(_))));
    }

    #[test]
    fn normalize_seed_strips_leading_whitespace_and_terminates() {
        assert_eq!(normalize_seed("\n\t USER a\r\n"), "USER a\r\n\r\n\r\n");
        assert_eq!(normalize_seed("QUIT\r\n\r\n"), "QUIT\r\n\r\n");
        assert_eq!(normalize_seed(""), "\r\n\r\n");
    }

    #[test]
    fn format_request_message_pads_bare_newlines() {
        assert_eq!(
            format_request_message("PLAY rtsp://x RTSP/1.0\nCSeq: 4\r\n"),
            "PLAY rtsp://x RTSP/1.0\r\nCSeq: 4\r\n\r\n\r\n"
        );
        assert_eq!(format_request_message("\n"), "\r\n\r\n\r\n");
    }

    #[test]
    fn unescape_answer_resolves_common_escapes() {
        assert_eq!(unescape_answer(r"USER a\r\nPASS b\\c\q"), "USER a\r\nPASS b\\cq");
        assert_eq!(unescape_answer(r"tail\"), "tail\\");
    }

    #[test]
    fn seed_store_skips_duplicates() {
        let dir = tempdir().unwrap();
        let mut store = SeedStore::open(dir.path().join("seeds")).unwrap();
        assert!(store.is_empty());

        let first = store.write("USER anonymous\r\n").unwrap();
        assert!(first.is_some());
        let again = store.write("  USER anonymous\r\n").unwrap();
        assert!(again.is_none(), "leading whitespace normalises away");
        assert!(store.write("QUIT\r\n").unwrap().is_some());
        assert_eq!(store.len(), 2);

        let path = first.unwrap();
        assert_eq!(path, store.path_for("USER anonymous\r\n"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "USER anonymous\r\n\r\n\r\n"
        );
    }

    #[test]
    fn seed_store_reindexes_existing_files() {
        let dir = tempdir().unwrap();
        {
            let mut store = SeedStore::open(dir.path()).unwrap();
            store.write("NOOP\r\n\r\n").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "not a seed").unwrap();

        let mut reopened = SeedStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.write("NOOP\r\n\r\n").unwrap().is_none());
    }

    #[test]
    fn seed_store_rejects_file_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            SeedStore::open(&file),
            Err(PersistError::NotADirectory(_))
        ));
    }
}
