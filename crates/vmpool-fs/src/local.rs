//! The `system` backend: a directory on the local disk.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::FsError;
use crate::path::ext_name;
use crate::FileSystem;

/// Attempts before `mkdir_temp` gives up on finding an unused name.
const TEMP_ATTEMPTS: usize = 64;

/// Bytes read when a MIME type has to be guessed from content.
const SNIFF_LEN: u64 = 512;

/// A filesystem rooted at a local directory.
///
/// Every path is resolved below the root; `..` components that would climb
/// above it are rejected rather than clamped.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, FsError> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(FsError::OutsideRoot(name.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }

    /// Backend-relative form of a resolved path.
    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!("/{}", parts.join("/"))
    }

    fn collect_dir(&self, dir: &Path, recursive: bool, out: &mut Vec<String>) -> Result<(), FsError> {
        let display = self.relative(dir);
        let mut entries = fs::read_dir(dir)
            .map_err(|e| FsError::io(&display, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FsError::io(&display, e))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            out.push(self.relative(&path));
            let is_dir = entry
                .file_type()
                .map(|t| t.is_dir())
                .map_err(|e| FsError::io(&display, e))?;
            if recursive && is_dir {
                self.collect_dir(&path, true, out)?;
            }
        }
        Ok(())
    }
}

impl FileSystem for LocalFileSystem {
    fn read_file(&self, file: &str) -> Result<Vec<u8>, FsError> {
        let path = self.resolve(file)?;
        fs::read(path).map_err(|e| FsError::io(file, e))
    }

    fn write_file(&self, file: &str, data: &[u8], perm: u32) -> Result<usize, FsError> {
        let path = self.resolve(file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::io(file, e))?;
        }
        let existed = path.exists();
        fs::write(&path, data).map_err(|e| FsError::io(file, e))?;
        if !existed {
            set_mode(&path, perm).map_err(|e| FsError::io(file, e))?;
        }
        Ok(data.len())
    }

    fn read_dir(&self, dir: &str, recursive: bool) -> Result<Vec<String>, FsError> {
        let path = self.resolve(dir)?;
        let mut out = Vec::new();
        self.collect_dir(&path, recursive, &mut out)?;
        Ok(out)
    }

    fn mkdir(&self, dir: &str, perm: u32) -> Result<(), FsError> {
        let path = self.resolve(dir)?;
        fs::create_dir(&path).map_err(|e| FsError::io(dir, e))?;
        set_mode(&path, perm).map_err(|e| FsError::io(dir, e))
    }

    fn mkdir_all(&self, dir: &str, perm: u32) -> Result<(), FsError> {
        let path = self.resolve(dir)?;
        if path.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&path).map_err(|e| FsError::io(dir, e))?;
        set_mode(&path, perm).map_err(|e| FsError::io(dir, e))
    }

    fn mkdir_temp(&self, dir: &str, pattern: &str) -> Result<String, FsError> {
        let parent = self.resolve(if dir.is_empty() { "/" } else { dir })?;
        fs::create_dir_all(&parent).map_err(|e| FsError::io(dir, e))?;

        for _ in 0..TEMP_ATTEMPTS {
            let random: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(10)
                .map(char::from)
                .collect();
            let name = match pattern.rfind('*') {
                Some(idx) => format!("{}{}{}", &pattern[..idx], random, &pattern[idx + 1..]),
                None => format!("{}{}", pattern, random),
            };
            let candidate = parent.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(self.relative(&candidate)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(FsError::io(dir, e)),
            }
        }

        Err(FsError::io(
            dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "no unused temporary name"),
        ))
    }

    fn chmod(&self, name: &str, mode: u32) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        set_mode(&path, mode).map_err(|e| FsError::io(name, e))
    }

    fn remove(&self, name: &str) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        let result = if path.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| FsError::io(name, e))
    }

    fn remove_all(&self, name: &str) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        if path == self.root {
            return Err(FsError::OutsideRoot(name.to_string()));
        }
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| FsError::io(name, e))
    }

    fn move_to(&self, name: &str, dst: &str) -> Result<(), FsError> {
        let from = self.resolve(name)?;
        let to = self.resolve(dst)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::io(dst, e))?;
        }
        fs::rename(from, to).map_err(|e| FsError::io(name, e))
    }

    fn copy(&self, name: &str, dst: &str) -> Result<(), FsError> {
        let from = self.resolve(name)?;
        let to = self.resolve(dst)?;
        copy_path(&from, &to).map_err(|e| FsError::io(name, e))
    }

    fn exists(&self, name: &str) -> Result<bool, FsError> {
        let path = self.resolve(name)?;
        path.try_exists().map_err(|e| FsError::io(name, e))
    }

    fn size(&self, name: &str) -> Result<u64, FsError> {
        let path = self.resolve(name)?;
        fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|e| FsError::io(name, e))
    }

    fn mode(&self, name: &str) -> Result<u32, FsError> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(path).map_err(|e| FsError::io(name, e))?;
        Ok(mode_bits(&meta))
    }

    fn mod_time(&self, name: &str) -> Result<DateTime<Utc>, FsError> {
        let path = self.resolve(name)?;
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .map_err(|e| FsError::io(name, e))
    }

    fn is_dir(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_dir()).unwrap_or(false)
    }

    fn is_file(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn is_link(&self, name: &str) -> bool {
        self.resolve(name)
            .and_then(|p| fs::symlink_metadata(p).map_err(|e| FsError::io(name, e)))
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn mime_type(&self, name: &str) -> Result<String, FsError> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path).map_err(|e| FsError::io(name, e))?;
        if meta.is_dir() {
            return Ok("inode/directory".to_string());
        }
        if let Some(mime) = mime_from_extension(&ext_name(name)) {
            return Ok(mime.to_string());
        }

        // Unknown extension: sniff the head of the file.
        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        fs::File::open(&path)
            .and_then(|file| file.take(SNIFF_LEN).read_to_end(&mut head))
            .map_err(|e| FsError::io(name, e))?;
        Ok(sniff(&head).to_string())
    }
}

/// Text when the head is valid UTF-8 without NUL bytes. A multibyte sequence
/// cut off at the end of the head still counts as text.
fn sniff(head: &[u8]) -> &'static str {
    if head.contains(&0) {
        return "application/octet-stream";
    }
    match std::str::from_utf8(head) {
        Ok(_) => "text/plain; charset=utf-8",
        Err(e) if e.error_len().is_none() => "text/plain; charset=utf-8",
        Err(_) => "application/octet-stream",
    }
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "js" | "mjs" => "application/javascript",
        "ts" => "application/typescript",
        "json" => "application/json",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "txt" | "log" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "xml" => "application/xml",
        "yml" | "yaml" => "application/yaml",
        "toml" => "application/toml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(mime)
}

fn copy_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, LocalFileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, fs) = fixture();
        let written = fs.write_file("/notes/today.txt", b"hello", 0o644).unwrap();
        assert_eq!(written, 5);
        assert_eq!(fs.read_file("/notes/today.txt").unwrap(), b"hello");
        assert!(fs.is_file("/notes/today.txt"));
        assert!(fs.is_dir("/notes"));
        assert_eq!(fs.size("/notes/today.txt").unwrap(), 5);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (_dir, fs) = fixture();
        assert!(matches!(
            fs.read_file("../etc/passwd"),
            Err(FsError::OutsideRoot(_))
        ));
        // Climbing back down below the root is fine.
        fs.write_file("/a/../b.txt", b"x", 0o644).unwrap();
        assert!(fs.exists("/b.txt").unwrap());
    }

    #[test]
    fn test_read_dir_recursive() {
        let (_dir, fs) = fixture();
        fs.write_file("/src/b.js", b"", 0o644).unwrap();
        fs.write_file("/src/a.js", b"", 0o644).unwrap();
        fs.write_file("/src/lib/c.js", b"", 0o644).unwrap();

        let flat = fs.read_dir("/src", false).unwrap();
        assert_eq!(flat, vec!["/src/a.js", "/src/b.js", "/src/lib"]);

        let deep = fs.read_dir("/src", true).unwrap();
        assert_eq!(
            deep,
            vec!["/src/a.js", "/src/b.js", "/src/lib", "/src/lib/c.js"]
        );
    }

    #[test]
    fn test_mkdir_temp_replaces_last_star() {
        let (_dir, fs) = fixture();
        let name = fs.mkdir_temp("/tmp", "job-*-work").unwrap();
        assert!(name.starts_with("/tmp/job-"));
        assert!(name.ends_with("-work"));
        assert!(fs.is_dir(&name));
    }

    #[test]
    fn test_move_copy_remove() {
        let (_dir, fs) = fixture();
        fs.write_file("/one/file.txt", b"data", 0o644).unwrap();
        fs.copy("/one", "/two").unwrap();
        assert_eq!(fs.read_file("/two/file.txt").unwrap(), b"data");

        fs.move_to("/two/file.txt", "/three/moved.txt").unwrap();
        assert!(!fs.exists("/two/file.txt").unwrap());
        assert!(fs.exists("/three/moved.txt").unwrap());

        fs.remove_all("/one").unwrap();
        assert!(!fs.exists("/one").unwrap());
        // Removing something that is already gone is not an error.
        fs.remove_all("/one").unwrap();
        assert!(fs.remove_all("/").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_chmod_and_mode() {
        let (_dir, fs) = fixture();
        fs.write_file("/run.sh", b"#!/bin/sh", 0o644).unwrap();
        fs.chmod("/run.sh", 0o755).unwrap();
        assert_eq!(fs.mode("/run.sh").unwrap(), 0o755);
    }

    #[test]
    fn test_mime_type() {
        let (_dir, fs) = fixture();
        fs.write_file("/index.js", b"export {}", 0o644).unwrap();
        fs.write_file("/notes", b"plain words", 0o644).unwrap();
        fs.write_file("/blob", &[0u8, 159, 146, 150], 0o644).unwrap();
        fs.mkdir("/dir", 0o755).unwrap();

        assert_eq!(fs.mime_type("/index.js").unwrap(), "application/javascript");
        assert_eq!(fs.mime_type("/notes").unwrap(), "text/plain; charset=utf-8");
        assert_eq!(fs.mime_type("/blob").unwrap(), "application/octet-stream");
        assert_eq!(fs.mime_type("/dir").unwrap(), "inode/directory");
    }

    #[test]
    fn test_mime_type_sniffs_only_the_head() {
        let (_dir, fs) = fixture();

        // 511 ASCII bytes, then a two-byte character split by the cut
        let mut split = vec![b'a'; 511];
        split.extend_from_slice("é".as_bytes());
        fs.write_file("/split", &split, 0o644).unwrap();
        assert_eq!(fs.mime_type("/split").unwrap(), "text/plain; charset=utf-8");

        // Binary past the head is never looked at
        let mut tail = vec![b'a'; 512];
        tail.extend_from_slice(&[0, 0xff, 0xfe]);
        fs.write_file("/tail", &tail, 0o644).unwrap();
        assert_eq!(fs.mime_type("/tail").unwrap(), "text/plain; charset=utf-8");

        assert_eq!(sniff(&[b'a', 0xff, b'b']), "application/octet-stream");
    }
}
