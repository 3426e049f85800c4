//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Text-safe encoding of service artifacts.
//!
//! A single file travels as the base64 of its raw bytes; a directory travels as
//! the base64 of a deflated zip of its tree. [`unpack`] tells the two apart by the
//! zip magic bytes, so callers never need to say which one they expect.
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

/// Upper bound on the bytes a single archive may expand to.
pub const MAX_UNPACKED_BYTES: u64 = 256 * 1024 * 1024;

/// Errors raised while packing or unpacking artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Source path does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    /// Filesystem read or write failure.
    #[error("io failure on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Payload is not valid base64.
    #[error("payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    /// Zip stream could not be read or written.
    #[error("zip failure: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// Entry or file name would resolve outside the target directory.
    #[error("refusing to write outside target directory: {0}")]
    UnsafePath(String),
    /// Archive expands past the extraction limit.
    #[error("archive expands beyond {limit} bytes")]
    TooLarge {
        /// Limit in bytes.
        limit: u64,
    },
}

impl ArchiveError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }
}

type Result<T> = std::result::Result<T, ArchiveError>;

/// What [`unpack`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpacked {
    /// A single file at the given path.
    File(PathBuf),
    /// An extracted tree; `files` lists every regular file written, sorted.
    Tree {
        /// Target directory.
        root: PathBuf,
        /// Files written under `root`.
        files: Vec<PathBuf>,
    },
}

/// Encode raw bytes as payload text.
pub fn encode_bytes(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode payload text into raw bytes. Surrounding whitespace is ignored.
pub fn decode_text(text: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(text.trim())?)
}

/// Read a file, or zip a directory tree, and return it as payload text.
pub fn pack_path(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::FileNotFound(path.to_path_buf()))
        }
        Err(err) => return Err(ArchiveError::io(path, err)),
    };

    let bytes = if metadata.is_dir() {
        zip_tree(path)?
    } else {
        fs::read(path).map_err(|err| ArchiveError::io(path, err))?
    };
    debug!(path = %path.display(), bytes = bytes.len(), directory = metadata.is_dir(), "packed artifact");
    Ok(encode_bytes(&bytes))
}

fn zip_tree(root: &Path) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            ArchiveError::io(path, err.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| ArchiveError::UnsafePath(entry.path().display().to_string()))?;
        let name = entry_name(relative);

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            let bytes = fs::read(entry.path()).map_err(|err| ArchiveError::io(entry.path(), err))?;
            writer.start_file(name, options)?;
            writer
                .write_all(&bytes)
                .map_err(|err| ArchiveError::io(entry.path(), err))?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether decoded bytes are a zip stream rather than a single file.
pub fn is_archive(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE)
}

/// Decode `text` and materialise it under `target_dir`.
///
/// Archives are extracted entry by entry; anything else is written as a single
/// file called `file_name`. Every write goes through a temporary file in the
/// destination directory followed by a rename, so concurrent writers of the same
/// path never interleave bytes.
pub fn unpack(text: &str, target_dir: impl AsRef<Path>, file_name: &str) -> Result<Unpacked> {
    let target_dir = target_dir.as_ref();
    let bytes = decode_text(text)?;

    if is_archive(&bytes) {
        let files = extract_archive(&bytes, target_dir, MAX_UNPACKED_BYTES)?;
        debug!(target = %target_dir.display(), files = files.len(), "extracted archive");
        return Ok(Unpacked::Tree {
            root: target_dir.to_path_buf(),
            files,
        });
    }

    store_file(&bytes, target_dir, file_name).map(Unpacked::File)
}

/// Decode `text` and write it verbatim as `target_dir/file_name`.
///
/// The bytes are never inspected, so a zip-shaped artifact (a jar, say) is
/// stored as one file like any other.
pub fn write_file(text: &str, target_dir: impl AsRef<Path>, file_name: &str) -> Result<PathBuf> {
    store_file(&decode_text(text)?, target_dir.as_ref(), file_name)
}

fn store_file(bytes: &[u8], target_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let relative = safe_relative(file_name)?;
    let destination = target_dir.join(relative);
    write_atomic(&destination, bytes)?;
    debug!(path = %destination.display(), bytes = bytes.len(), "wrote artifact file");
    Ok(destination)
}

/// Decode `text`, which must be a zip stream, and extract it under `target_dir`.
pub fn unpack_archive(text: &str, target_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    unpack_archive_with_limit(text, target_dir, MAX_UNPACKED_BYTES)
}

/// [`unpack_archive`] with an explicit bound on the total extracted bytes.
pub fn unpack_archive_with_limit(
    text: &str,
    target_dir: impl AsRef<Path>,
    limit: u64,
) -> Result<Vec<PathBuf>> {
    let target_dir = target_dir.as_ref();
    let files = extract_archive(&decode_text(text)?, target_dir, limit)?;
    debug!(target = %target_dir.display(), files = files.len(), "extracted archive");
    Ok(files)
}

fn extract_archive(bytes: &[u8], target_dir: &Path, limit: u64) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    ensure_dir(target_dir)?;

    let mut written = Vec::new();
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = safe_relative(entry.name())?;
        let destination = target_dir.join(&relative);

        if entry.is_dir() {
            ensure_dir(&destination)?;
            continue;
        }

        // Header sizes are not trusted; read at most one byte past the budget.
        let remaining = limit.saturating_sub(total);
        let mut contents = Vec::new();
        Read::by_ref(&mut entry)
            .take(remaining.saturating_add(1))
            .read_to_end(&mut contents)
            .map_err(|err| ArchiveError::io(&destination, err))?;
        if contents.len() as u64 > remaining {
            return Err(ArchiveError::TooLarge { limit });
        }
        total += contents.len() as u64;
        write_atomic(&destination, &contents)?;
        written.push(destination);
    }
    written.sort();
    Ok(written)
}

/// Reject absolute names and anything climbing out through `..`.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(name.to_owned()))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafePath(name.to_owned()));
    }
    Ok(relative)
}

fn ensure_dir(path: &Path) -> Result<()> {
    // create_dir_all already treats a concurrently created directory as success.
    fs::create_dir_all(path).map_err(|err| ArchiveError::io(path, err))
}

fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| ArchiveError::UnsafePath(destination.display().to_string()))?;
    ensure_dir(parent)?;

    let mut staging =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| ArchiveError::io(parent, err))?;
    staging
        .write_all(bytes)
        .and_then(|_| staging.as_file().sync_all())
        .map_err(|err| ArchiveError::io(staging.path(), err))?;
    staging
        .persist(destination)
        .map_err(|err| ArchiveError::io(destination, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let source = dir.path().join("Servico.class");
        fs::write(&source, b"\xca\xfe\xba\xbe bytes").expect("write source");

        let text = pack_path(&source).expect("pack");
        let out = dir.path().join("out");
        let unpacked = unpack(&text, &out, "Servico.class").expect("unpack");

        assert_eq!(unpacked, Unpacked::File(out.join("Servico.class")));
        assert_eq!(
            fs::read(out.join("Servico.class")).expect("read back"),
            b"\xca\xfe\xba\xbe bytes"
        );
    }

    #[test]
    fn directory_roundtrip_keeps_relative_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let source = dir.path().join("bundle");
        fs::create_dir_all(source.join("pkg/inner")).expect("mkdir");
        fs::create_dir_all(source.join("empty")).expect("mkdir");
        fs::write(source.join("README"), "top").expect("write");
        fs::write(source.join("pkg/inner/Model.java"), "class Model {}").expect("write");

        let text = pack_path(&source).expect("pack");
        assert!(is_archive(&decode_text(&text).expect("decode")));

        let out = dir.path().join("modelos");
        let unpacked = unpack(&text, &out, "ignored").expect("unpack");
        match unpacked {
            Unpacked::Tree { root, files } => {
                assert_eq!(root, out);
                assert_eq!(files.len(), 2);
            }
            other => panic!("expected tree, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(out.join("README")).expect("read"), "top");
        assert_eq!(
            fs::read_to_string(out.join("pkg/inner/Model.java")).expect("read"),
            "class Model {}"
        );
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn unpack_archive_rejects_plain_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = unpack_archive(&encode_bytes(b"plain text"), dir.path()).expect_err("not zip");
        assert!(matches!(err, ArchiveError::Zip(_)));
    }

    #[test]
    fn missing_source_is_file_not_found() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = pack_path(dir.path().join("nope")).expect_err("missing");
        assert!(matches!(err, ArchiveError::FileNotFound(_)));
    }

    #[test]
    fn malformed_base64_is_decode_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = unpack("@@not base64@@", dir.path(), "x").expect_err("bad text");
        assert!(matches!(err, ArchiveError::Decode(_)));
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../escape.txt", FileOptions::default())
            .expect("start");
        writer.write_all(b"owned").expect("write");
        let bytes = writer.finish().expect("finish").into_inner();

        let dir = tempfile::tempdir().expect("temp dir");
        let target = dir.path().join("target");
        let err = unpack(&encode_bytes(&bytes), &target, "x").expect_err("traversal");
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn unsafe_file_names_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let text = encode_bytes(b"hello");
        for name in ["../Foo", "/etc/Foo", "", "."] {
            assert!(
                matches!(
                    unpack(&text, dir.path(), name),
                    Err(ArchiveError::UnsafePath(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn write_file_stores_zip_shaped_bytes_verbatim() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("META-INF/MANIFEST.MF", FileOptions::default())
            .expect("start");
        writer.write_all(b"Manifest-Version: 1.0\n").expect("write");
        let jar = writer.finish().expect("finish").into_inner();

        let dir = tempfile::tempdir().expect("temp dir");
        let path = write_file(&encode_bytes(&jar), dir.path(), "Foo").expect("write");
        assert_eq!(path, dir.path().join("Foo"));
        assert_eq!(fs::read(&path).expect("read"), jar);
        assert!(!dir.path().join("META-INF").exists());
    }

    #[test]
    fn extraction_stops_at_the_byte_limit() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file("small.txt", options).expect("start");
        writer.write_all(&[b'a'; 512]).expect("write");
        writer.start_file("zeros.bin", options).expect("start");
        writer.write_all(&vec![0u8; 64 * 1024]).expect("write");
        let bytes = writer.finish().expect("finish").into_inner();
        assert!(bytes.len() < 4096);

        let dir = tempfile::tempdir().expect("temp dir");
        let err = unpack_archive_with_limit(&encode_bytes(&bytes), dir.path(), 4096)
            .expect_err("over limit");
        assert!(matches!(err, ArchiveError::TooLarge { limit: 4096 }));
        assert!(!dir.path().join("zeros.bin").exists());

        let files = unpack_archive_with_limit(&encode_bytes(&bytes), dir.path(), 128 * 1024)
            .expect("within limit");
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn existing_target_directory_is_not_fatal() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("servicos")).expect("mkdir");
        unpack(&encode_bytes(b"a"), dir.path().join("servicos"), "Foo").expect("first");
        unpack(&encode_bytes(b"b"), dir.path().join("servicos"), "Foo").expect("second");
        assert_eq!(
            fs::read(dir.path().join("servicos/Foo")).expect("read"),
            b"b"
        );
    }
}
