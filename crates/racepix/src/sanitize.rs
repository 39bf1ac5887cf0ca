//! Filename sanitizing and archive validation.
//!
//! Everything an organizer hands us passes through here before a job row or a
//! network request exists. The byte-level ZIP signature check is mandatory:
//! extension and declared content type are never enough on their own.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Local file header magic of a ZIP archive (`PK\x03\x04`).
pub const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Default maximum sanitized filename length, in characters.
pub const DEFAULT_MAX_NAME_LENGTH: usize = 200;

/// Default archive size cap: 5 GiB.
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Extensions longer than this are treated as part of the stem when truncating.
const MAX_PRESERVED_EXTENSION: usize = 16;

/// `#` and `%` are included because names end up inside object URLs.
const UNSAFE_CHARS: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '<', '>', '|', '&', '\'', ';', '`', '#', '%',
];

fn is_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1F | 0x7F..=0x9F)
}

fn trim_edges(s: &str) -> &str {
    s.trim_matches(|c: char| c == '.' || c.is_whitespace())
}

/// Normalizes a user supplied filename.
///
/// Returns `None` when nothing usable is left. Callers must treat that as a
/// rejection rather than substituting a default name.
pub fn sanitize_filename(name: &str, max_length: usize) -> Option<String> {
    let mut cleaned = String::with_capacity(name.len());
    for c in name.chars() {
        if is_control(c) || UNSAFE_CHARS.contains(&c) {
            continue;
        }
        let c = if c.is_whitespace() { ' ' } else { c };
        if (c == ' ' || c == '.') && cleaned.ends_with(c) {
            continue;
        }
        cleaned.push(c);
    }

    let trimmed = trim_edges(&cleaned);
    if trimmed.is_empty() || max_length == 0 {
        return None;
    }

    let result = if trimmed.chars().count() > max_length {
        trim_edges(&truncate_keeping_extension(trimmed, max_length)).to_string()
    } else {
        trimmed.to_string()
    };

    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

fn truncate_keeping_extension(name: &str, max_length: usize) -> String {
    if let Some(dot) = name.rfind('.') {
        let extension = &name[dot..];
        let ext_len = extension.chars().count();
        if dot > 0 && ext_len <= MAX_PRESERVED_EXTENSION && ext_len < max_length {
            let stem: String = name[..dot].chars().take(max_length - ext_len).collect();
            let stem = trim_edges(&stem);
            if !stem.is_empty() {
                return format!("{}{}", stem, extension);
            }
        }
    }
    name.chars().take(max_length).collect()
}

/// Checks the first four bytes against the ZIP local file header magic.
pub fn validate_archive_signature(bytes: &[u8]) -> bool {
    bytes.len() >= ZIP_SIGNATURE.len() && bytes[..ZIP_SIGNATURE.len()] == ZIP_SIGNATURE
}

/// Size bounds applied to incoming archives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArchiveLimits {
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
}

fn default_max_archive_bytes() -> u64 {
    DEFAULT_MAX_ARCHIVE_BYTES
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
        }
    }
}

/// An archive that passed every check in [`validate_archive_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    /// Sanitized display name.
    pub name: String,
    pub size_bytes: u64,
}

/// Validates an archive on disk: name, extension, size bounds and signature.
pub fn validate_archive_file(
    path: &Path,
    limits: &ArchiveLimits,
) -> Result<ArchiveFile, ValidationError> {
    let original = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = sanitize_filename(&original, DEFAULT_MAX_NAME_LENGTH).ok_or_else(|| {
        ValidationError::UnsafeName {
            original: original.clone(),
        }
    })?;

    if !name.to_lowercase().ends_with(".zip") {
        return Err(ValidationError::WrongExtension { name });
    }

    let unreadable = |source| ValidationError::Unreadable {
        path: path.to_path_buf(),
        source,
    };

    let size_bytes = std::fs::metadata(path).map_err(unreadable)?.len();
    if size_bytes == 0 {
        return Err(ValidationError::Empty { name });
    }
    if size_bytes > limits.max_archive_bytes {
        return Err(ValidationError::TooLarge {
            name,
            size: size_bytes,
            max: limits.max_archive_bytes,
        });
    }

    let mut header = Vec::with_capacity(ZIP_SIGNATURE.len());
    std::fs::File::open(path)
        .and_then(|f| f.take(ZIP_SIGNATURE.len() as u64).read_to_end(&mut header))
        .map_err(unreadable)?;
    if !validate_archive_signature(&header) {
        return Err(ValidationError::BadSignature { name });
    }

    Ok(ArchiveFile {
        path: path.to_path_buf(),
        name,
        size_bytes,
    })
}

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}
