//! Reading the member list of an uploaded archive.

use std::path::Path;

use crate::error::ValidationError;
use crate::sanitize::{sanitize_filename, DEFAULT_MAX_NAME_LENGTH};

/// Extensions treated as photos. Everything else in an archive is ignored.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff", "heic", "heif",
];

/// True if `name` has a photo extension (case-insensitive).
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lists the photo members of a ZIP in archive order.
///
/// Directory entries, `__MACOSX/` resource forks and dot-files are skipped.
/// Each remaining member is reduced to its sanitized base name; members whose
/// name sanitizes to nothing are dropped.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, ValidationError> {
    let archive_name = crate::sanitize::redact_path(path);
    let file = std::fs::File::open(path).map_err(|source| ValidationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |reason: String| ValidationError::CorruptArchive {
        name: archive_name.clone(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

    let mut names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| corrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        if let Some(name) = manifest_name(entry.name()) {
            names.push(name);
        }
    }

    tracing::debug!(archive = %archive_name, members = names.len(), "Read archive manifest");
    Ok(names)
}

fn manifest_name(member: &str) -> Option<String> {
    let member = member.replace('\\', "/");
    if member.split('/').any(|segment| segment == "__MACOSX") {
        return None;
    }
    let base = member.rsplit('/').next().unwrap_or(&member);
    if base.is_empty() || base.starts_with('.') || !is_image_name(base) {
        return None;
    }
    sanitize_filename(base, DEFAULT_MAX_NAME_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(dir: &Path, members: &[&str]) -> std::path::PathBuf {
        let path = dir.join("race.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for member in members {
            if member.ends_with('/') {
                zip.add_directory(*member, options).unwrap();
            } else {
                zip.start_file(*member, options).unwrap();
                zip.write_all(b"data").unwrap();
            }
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_manifest_keeps_archive_order() {
        let dir = TempDir::new().unwrap();
        let path = write_zip(
            dir.path(),
            &[
                "finish/",
                "finish/z-last.jpg",
                "finish/a-first.PNG",
                "__MACOSX/finish/._z-last.jpg",
                "finish/.DS_Store",
                "finish/notes.txt",
                "start/photo 1.jpeg",
            ],
        );

        let names = read_manifest(&path).unwrap();
        assert_eq!(names, vec!["z-last.jpg", "a-first.PNG", "photo 1.jpeg"]);
    }

    #[test]
    fn test_member_names_are_sanitized() {
        assert_eq!(
            manifest_name("evil/<script>.jpg").as_deref(),
            Some("script.jpg")
        );
        assert_eq!(manifest_name("dir\\win.jpg").as_deref(), Some("win.jpg"));
        assert_eq!(manifest_name("dir/"), None);
    }

    #[test]
    fn test_not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.zip");
        std::fs::write(&path, b"PK\x03\x04 but not really").unwrap();
        assert!(matches!(
            read_manifest(&path),
            Err(ValidationError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_image_extensions() {
        assert!(is_image_name("a.JPG"));
        assert!(is_image_name("b.heic"));
        assert!(!is_image_name("c.txt"));
        assert!(!is_image_name("noext"));
    }
}
