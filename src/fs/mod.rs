//! Semantic layer over the host filesystem.
//!
//! [`PathResolver`] turns client-supplied paths into absolute paths and
//! enforces the root-escape rule for relative inputs. [`FileStore`] wraps
//! the host filesystem with the operations the transports need: existence
//! checks, reads with ownership metadata, (streamed) writes, listing and
//! deletion.

pub mod multipart;
pub mod tree;
pub mod watch;

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{AgentError, Result};
use crate::util::format_permissions;
use tree::{Directory, FileSummary, Subdirectory};

/// File metadata as returned by the API, permissions as an octal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub permissions: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub owner: String,
    pub group: String,
}

/// File metadata plus its content decoded as UTF-8 (lossy for binary data;
/// callers use download mode for those).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithContent {
    #[serde(flatten)]
    pub info: FileInfo,
    pub content: String,
}

/// Resolves client paths against a process-wide working directory.
///
/// Absolute inputs bypass the root check. Relative inputs resolve from the
/// working directory and must remain inside the root after `..`
/// normalization.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    working_dir: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// `.` and `./` display as the working directory.
    pub fn display_path(&self, path: &str) -> String {
        if path == "." || path == "./" {
            self.working_dir.to_string_lossy().to_string()
        } else {
            path.to_string()
        }
    }

    /// Resolve to an absolute path, enforcing the root-escape rule for
    /// relative inputs.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let input = Path::new(path);
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.working_dir.join(input)
        };

        let cleaned = clean_path(&joined);

        if !input.is_absolute() && !cleaned.starts_with(&self.root) {
            return Err(AgentError::PathEscape);
        }

        Ok(cleaned)
    }
}

/// Lexically fold `.` and `..` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Thin semantic layer over the host filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    resolver: PathResolver,
}

impl FileStore {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        self.resolver.resolve(path)
    }

    /// True if `path` exists and is a regular file (or symlink to one).
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let abs = self.resolve(path)?;
        match tokio::fs::metadata(&abs).await {
            Ok(meta) => Ok(!meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True if `path` exists and is a directory.
    pub async fn directory_exists(&self, path: &str) -> Result<bool> {
        let abs = self.resolve(path)?;
        match tokio::fs::metadata(&abs).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a file along with its metadata.
    pub async fn read_file(&self, path: &str) -> Result<FileWithContent> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        if meta.is_dir() {
            return Err(AgentError::InvalidInput(
                "path points to a directory, not a file".to_string(),
            ));
        }

        let content = tokio::fs::read(&abs).await?;
        let (owner, group) = owner_and_group(&meta);
        let display = self.resolver.display_path(path);

        Ok(FileWithContent {
            info: FileInfo {
                name: file_name(&display),
                path: display,
                permissions: format_permissions(meta.permissions().mode()),
                size: meta.len(),
                last_modified: modified_time(&meta),
                owner,
                group,
            },
            content: String::from_utf8_lossy(&content).to_string(),
        })
    }

    /// File metadata without reading the content.
    pub async fn file_info(&self, path: &str) -> Result<FileInfo> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        if meta.is_dir() {
            return Err(AgentError::InvalidInput(
                "path points to a directory, not a file".to_string(),
            ));
        }
        let (owner, group) = owner_and_group(&meta);
        let display = self.resolver.display_path(path);
        Ok(FileInfo {
            name: file_name(&display),
            path: display,
            permissions: format_permissions(meta.permissions().mode()),
            size: meta.len(),
            last_modified: modified_time(&meta),
            owner,
            group,
        })
    }

    /// Write `content` to a file, creating parent directories as needed.
    pub async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&abs)
            .await?;
        file.write_all(content).await?;
        file.flush().await?;
        // An existing file keeps its old mode; apply the requested one.
        tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    /// Stream content from a reader to a file on disk. The partially
    /// written file is removed on error.
    pub async fn write_file_from_reader<R>(&self, path: &str, reader: &mut R, mode: u32) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&abs)
            .await?;

        match tokio::io::copy(reader, &mut file).await {
            Ok(written) => {
                file.flush().await?;
                tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode)).await?;
                Ok(written)
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&abs).await;
                Err(e.into())
            }
        }
    }

    /// Create a directory (and parents) at the given path.
    pub async fn create_directory(&self, path: &str, mode: u32) -> Result<()> {
        let abs = self.resolve(path)?;
        tokio::fs::create_dir_all(&abs).await?;
        tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    /// List files and subdirectories at the given path.
    pub async fn list_directory(&self, path: &str) -> Result<Directory> {
        let abs = self.resolve(path)?;
        let display = self.resolver.display_path(path);
        let mut dir = Directory::new(&display);

        let mut entries = tokio::fs::read_dir(&abs).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = Path::new(&display).join(&name).to_string_lossy().to_string();
            // symlink_metadata so dangling symlinks still list
            let meta = tokio::fs::symlink_metadata(entry.path()).await?;

            if meta.is_dir() {
                dir.subdirectories.push(Subdirectory {
                    path: entry_path,
                    name,
                });
            } else {
                let (owner, group) = owner_and_group(&meta);
                dir.files.push(FileSummary {
                    path: entry_path,
                    name,
                    permissions: format_permissions(meta.permissions().mode()),
                    size: meta.len(),
                    last_modified: modified_time(&meta),
                    owner,
                    group,
                });
            }
        }

        Ok(dir)
    }

    /// Delete a file at the given path.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        if meta.is_dir() {
            return Err(AgentError::InvalidInput(
                "path points to a directory, not a file".to_string(),
            ));
        }
        tokio::fs::remove_file(&abs).await?;
        Ok(())
    }

    /// Delete a directory. Non-recursive deletion of a non-empty directory
    /// fails.
    pub async fn delete_directory(&self, path: &str, recursive: bool) -> Result<()> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        if !meta.is_dir() {
            return Err(AgentError::InvalidInput(
                "path points to a file, not a directory".to_string(),
            ));
        }
        if recursive {
            tokio::fs::remove_dir_all(&abs).await?;
        } else {
            tokio::fs::remove_dir(&abs).await?;
        }
        Ok(())
    }

    /// Write every `(relative path, content)` entry under `root`, creating
    /// the root and parent directories as needed. Any failure
    /// short-circuits.
    pub async fn create_or_update_tree(
        &self,
        root: &str,
        files: &HashMap<String, String>,
    ) -> Result<Directory> {
        if !self.directory_exists(root).await? {
            self.create_directory(root, 0o755).await?;
        }

        for (relative, content) in files {
            let full = Path::new(root).join(relative).to_string_lossy().to_string();
            self.write_file(&full, content.as_bytes(), 0o644).await?;
        }

        self.list_directory(root).await
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Owner and group names for a file, numeric ids when the lookup fails.
fn owner_and_group(meta: &std::fs::Metadata) -> (String, String) {
    (user_name(meta.uid()), group_name(meta.gid()))
}

// These run concurrently on multiple worker threads; the non-reentrant
// getpwuid/getgrgid variants share one process-global buffer.

fn user_name(uid: u32) -> String {
    let mut buf = vec![0u8; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < 64 * 1024 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc == 0 && !result.is_null() {
            if let Ok(name) = unsafe { CStr::from_ptr(pwd.pw_name) }.to_str() {
                return name.to_string();
            }
        }
        return uid.to_string();
    }
}

fn group_name(gid: u32) -> String {
    let mut buf = vec![0u8; 1024];
    loop {
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < 64 * 1024 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc == 0 && !result.is_null() {
            if let Ok(name) = unsafe { CStr::from_ptr(grp.gr_name) }.to_str() {
                return name.to_string();
            }
        }
        return gid.to_string();
    }
}
