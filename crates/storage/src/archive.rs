//! Gzip tarball packing and extraction
//!
//! Packing walks a source tree, applies the [`PathFilter`] rules and writes
//! every regular file under a single top-level directory. Extraction strips
//! that directory again and refuses entries that would escape the
//! destination.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use keepsake_core::{Error, Result};
use tar::{Archive, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::filter::PathFilter;

/// A file selected for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// `/`-separated path relative to the source root
    pub relative: String,
    /// Location on the local filesystem
    pub absolute: PathBuf,
}

/// Basename of a tar key without its extensions
///
/// `checkpoints/abc.tar.gz` becomes `abc`.
pub fn tar_basename(tar_key: &str) -> String {
    let base = tar_key.rsplit('/').next().unwrap_or(tar_key);
    base.split('.').next().unwrap_or(base).to_string()
}

/// Collect the regular files under `root/include_path`
///
/// Symlinks are followed. Paths stay relative to `root` even when only a
/// subtree is walked. Results are sorted by path.
pub fn collect_files(root: &Path, include_path: &str) -> Result<Vec<SourceFile>> {
    let include = include_path.trim_matches('/');
    let start = if include.is_empty() || include == "." {
        root.to_path_buf()
    } else {
        root.join(include)
    };
    if !start.exists() {
        return Err(Error::does_not_exist(start.display().to_string()));
    }

    let filter = PathFilter::load(root);
    let walker = WalkDir::new(&start)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let Ok(relative) = entry.path().strip_prefix(root) else {
                return true;
            };
            !filter.is_excluded(relative, entry.file_type().is_dir())
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.push(SourceFile {
            relative: to_key(relative),
            absolute: entry.path().to_path_buf(),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    debug!(root = %root.display(), include_path, count = files.len(), "Collected files");
    Ok(files)
}

/// Write a gzip tarball of `root/include_path` to `writer`
///
/// Every entry is named `<top_dir>/<path relative to root>`.
pub fn pack<W: Write>(root: &Path, include_path: &str, top_dir: &str, writer: W) -> Result<W> {
    let files = collect_files(root, include_path)?;
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for source in &files {
        let file = File::open(&source.absolute)?;
        let metadata = file.metadata()?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(file_mode(&metadata));
        header.set_mtime(
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        header.set_uid(0);
        header.set_gid(0);

        let name = format!("{}/{}", top_dir, source.relative);
        builder.append_data(&mut header, &name, file)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Pack into a temporary file that is removed when dropped
pub fn pack_to_tempfile(root: &Path, include_path: &str, top_dir: &str) -> Result<NamedTempFile> {
    let temp = NamedTempFile::new()?;
    let writer = BufWriter::new(temp.reopen()?);
    let writer = pack(root, include_path, top_dir, writer)?;
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(temp)
}

/// Extract a gzip tarball into `dst`
///
/// When every entry shares one top-level directory it is stripped,
/// otherwise entries are extracted as named. Existing files are replaced
/// only when `overwrite` is set. Returns the written paths relative to
/// `dst`.
pub fn unpack_file(archive: &Path, dst: &Path, overwrite: bool) -> Result<Vec<PathBuf>> {
    let strip = plan(archive)?;
    fs::create_dir_all(dst)?;
    let root = dst.canonicalize()?;

    let mut archive_reader = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut written = Vec::new();
    for entry in archive_reader.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let relative = match relative_target(&raw, strip) {
            Some(relative) => relative,
            None => continue,
        };
        let target = root.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                ensure_inside(&root, &target, &raw)?;
            }
            kind if kind.is_file() => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                    ensure_inside(&root, parent, &raw)?;
                }
                if target.exists() && !overwrite {
                    return Err(Error::write(
                        target.display().to_string(),
                        "file already exists",
                    ));
                }
                entry.unpack(&target)?;
                written.push(relative);
            }
            kind => {
                warn!(path = %raw.display(), ?kind, "Skipping unsupported archive entry");
            }
        }
    }

    debug!(dst = %dst.display(), files = written.len(), strip, "Unpacked archive");
    Ok(written)
}

/// Validate every entry and decide whether to strip the top directory
///
/// Runs before anything is written so a malicious archive leaves the
/// destination untouched.
fn plan(archive: &Path) -> Result<bool> {
    let mut reader = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut top: Option<PathBuf> = None;
    let mut shared = true;
    let mut any_nested = false;

    for entry in reader.entries()? {
        let entry = entry?;
        let raw = entry.path()?.into_owned();
        let components = normal_components(&raw)?;
        let Some(first) = components.first() else {
            continue;
        };

        match &top {
            None => top = Some(first.clone()),
            Some(existing) if existing != first => shared = false,
            Some(_) => {}
        }
        if components.len() > 1 {
            any_nested = true;
        } else if entry.header().entry_type().is_file() {
            shared = false;
        }
    }

    Ok(shared && any_nested)
}

/// Path components of an archive entry, rejecting anything that escapes
fn normal_components(raw: &Path) -> Result<Vec<PathBuf>> {
    let mut components = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => components.push(PathBuf::from(part)),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafeArchivePath {
                    path: raw.display().to_string(),
                });
            }
        }
    }
    Ok(components)
}

fn relative_target(raw: &Path, strip: bool) -> Option<PathBuf> {
    let components = normal_components(raw).ok()?;
    let skip = usize::from(strip);
    if components.len() <= skip {
        return None;
    }
    Some(components.into_iter().skip(skip).collect())
}

/// Reject targets that resolve outside `root` through existing symlinks
fn ensure_inside(root: &Path, path: &Path, raw: &Path) -> Result<()> {
    let resolved = path.canonicalize()?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(Error::UnsafeArchivePath {
            path: raw.display().to_string(),
        })
    }
}

fn to_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Read the names of every entry in a gzip tarball
pub fn entry_names<R: Read>(reader: R) -> io::Result<Vec<String>> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
