//! The per-user staging filesystem.
//!
//! Every user gets `storage_path/<username>` as a chroot: it backs the SFTP
//! subsystem served directly by the bastion and doubles as the buffer for
//! data-REPL transfers. Path resolution is purely lexical — user input is
//! joined under the chroot and normalized, and anything that would climb out
//! is answered with *no-such-file* so the real layout never leaks.

use derive_more::Display;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use slog::o;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Mode for files the VFS creates when the client supplies none.
pub const DEFAULT_FILE_MODE: u32 = 0o600;
/// Mode for directories the VFS creates.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// The error type of staging filesystem operations.
#[derive(Debug, Error)]
#[error("staging filesystem error: {kind}")]
pub struct VfsError {
    kind: VfsErrorKind,
}

/// Categories of VFS failures, pre-shaped for the SFTP status mapping.
#[derive(Debug, Display, Eq, PartialEq, Clone, Copy)]
pub enum VfsErrorKind {
    /// The path does not exist — also the answer for every path that would
    /// escape the chroot.
    #[display("No such file")]
    NoSuchFile,
    /// The staging area is out of space. Kind 15 in the SFTP extended error
    /// space; carried as a failure status on the v3 wire.
    #[display("Quota Exceeded")]
    QuotaExceeded,
    /// Directory listing exhausted.
    #[display("End of file")]
    Eof,
    /// The operation is not supported by this filesystem.
    #[display("Operation unsupported")]
    OpUnsupported,
    /// Any other local error.
    #[display("Failure")]
    Failure,
}

impl VfsError {
    fn new(kind: VfsErrorKind) -> Self {
        VfsError { kind }
    }

    /// Return the inner error kind.
    pub fn kind(&self) -> VfsErrorKind {
        self.kind
    }
}

impl From<VfsErrorKind> for VfsError {
    fn from(kind: VfsErrorKind) -> Self {
        VfsError::new(kind)
    }
}

impl From<std::io::Error> for VfsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => VfsError::new(VfsErrorKind::NoSuchFile),
            _ => VfsError::new(VfsErrorKind::Failure),
        }
    }
}

impl From<VfsError> for StatusCode {
    fn from(e: VfsError) -> StatusCode {
        match e.kind {
            VfsErrorKind::NoSuchFile => StatusCode::NoSuchFile,
            VfsErrorKind::Eof => StatusCode::Eof,
            VfsErrorKind::OpUnsupported => StatusCode::OpUnsupported,
            VfsErrorKind::QuotaExceeded | VfsErrorKind::Failure => StatusCode::Failure,
        }
    }
}

impl From<VfsError> for russh_sftp::server::StatusReply {
    fn from(e: VfsError) -> russh_sftp::server::StatusReply {
        russh_sftp::server::StatusReply::from(StatusCode::from(e))
    }
}

type Result<T> = std::result::Result<T, VfsError>;

/// A chrooted filesystem rooted at one user's staging directory.
pub struct StagingFs {
    chroot: PathBuf,
    has_disk_space: Box<dyn Fn() -> bool + Send + Sync>,
    lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for StagingFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingFs").field("chroot", &self.chroot).finish()
    }
}

impl StagingFs {
    /// Open (and create, mode 0700) the staging chroot at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> std::io::Result<StagingFs> {
        let chroot = lexical_clean(&root.into());
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&chroot)?;
        Ok(StagingFs {
            chroot,
            has_disk_space: Box::new(|| true),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replace the disk-space predicate gating writes.
    pub fn with_disk_space_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.has_disk_space = Box::new(check);
        self
    }

    /// The chroot directory backing this filesystem.
    pub fn root(&self) -> &Path {
        &self.chroot
    }

    /// Resolve a client-supplied path inside the chroot. The input is taken
    /// as relative regardless of a leading slash, joined under the chroot
    /// and lexically normalized; a result outside the chroot is
    /// *no-such-file*.
    pub fn resolve(&self, p: &str) -> Result<PathBuf> {
        let rel = Path::new(p);
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        let joined = lexical_clean(&self.chroot.join(rel));
        if joined.starts_with(&self.chroot) {
            Ok(joined)
        } else {
            Err(VfsError::new(VfsErrorKind::NoSuchFile))
        }
    }

    fn check_disk_space(&self) -> Result<()> {
        if (self.has_disk_space)() {
            Ok(())
        } else {
            Err(VfsError::new(VfsErrorKind::QuotaExceeded))
        }
    }
}

// Resolve `.` and `..` lexically, never touching the disk.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn attrs_of(meta: &fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.permissions().mode()),
        atime: Some(meta.atime() as u32),
        mtime: Some(meta.mtime() as u32),
        ..FileAttributes::default()
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

/// The SFTP server handler exposing a [`StagingFs`] on the inbound session
/// channel when the client asks for the `sftp` subsystem.
pub struct SftpHandler {
    fs: std::sync::Arc<StagingFs>,
    logger: slog::Logger,
    files: HashMap<String, fs::File>,
    dirs: HashMap<String, Vec<File>>,
    next_handle: u64,
}

impl SftpHandler {
    /// A handler serving `fs`.
    pub fn new(fs: std::sync::Arc<StagingFs>, logger: slog::Logger) -> SftpHandler {
        SftpHandler {
            fs,
            logger: logger.new(o!("subsystem" => "sftp")),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 0,
        }
    }

    fn issue_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }

    fn file(&self, handle: &str) -> Result<&fs::File> {
        self.files.get(handle).ok_or_else(|| VfsError::new(VfsErrorKind::Failure))
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = VfsError;

    fn unimplemented(&self) -> Self::Error {
        VfsError::new(VfsErrorKind::OpUnsupported)
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version> {
        slog::debug!(self.logger, "sftp client init"; "version" => version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle> {
        let fs = self.fs.clone();
        let _guard = fs.lock.lock().await;
        let path = fs.resolve(&filename)?;
        let writing = pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::APPEND);
        if writing {
            fs.check_disk_space()?;
            if let Some(parent) = path.parent() {
                fs::DirBuilder::new().recursive(true).mode(DEFAULT_DIR_MODE).create(parent)?;
            }
        }
        let mode = match attrs.permissions.map(|m| m & 0o7777) {
            Some(0) | None => DEFAULT_FILE_MODE,
            Some(m) => m,
        };
        let file = fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .mode(mode)
            .open(&path)?;
        let handle = self.issue_handle();
        self.files.insert(handle.clone(), file);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status> {
        self.files.remove(&handle);
        self.dirs.remove(&handle);
        Ok(ok_status(id))
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data> {
        let file = self.file(&handle)?;
        let mut buf = vec![0u8; len as usize];
        let n = file.read_at(&mut buf, offset)?;
        if n == 0 {
            return Err(VfsError::new(VfsErrorKind::Eof));
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status> {
        self.fs.check_disk_space()?;
        let file = self.file(&handle)?;
        file.write_all_at(&data, offset)?;
        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle> {
        let dir = self.fs.resolve(&path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(File::new(entry.file_name().to_string_lossy().into_owned(), attrs_of(&meta)));
        }
        let handle = self.issue_handle();
        self.dirs.insert(handle.clone(), entries);
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name> {
        let entries = self.dirs.get_mut(&handle).ok_or_else(|| VfsError::new(VfsErrorKind::Failure))?;
        if entries.is_empty() {
            return Err(VfsError::new(VfsErrorKind::Eof));
        }
        Ok(Name {
            id,
            files: std::mem::take(entries),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs> {
        let path = self.fs.resolve(&path)?;
        Ok(Attrs { id, attrs: attrs_of(&fs::metadata(path)?) })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs> {
        let path = self.fs.resolve(&path)?;
        Ok(Attrs { id, attrs: attrs_of(&fs::symlink_metadata(path)?) })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs> {
        let file = self.file(&handle)?;
        Ok(Attrs { id, attrs: attrs_of(&file.metadata()?) })
    }

    async fn setstat(&mut self, id: u32, path: String, attrs: FileAttributes) -> Result<Status> {
        let path = self.fs.resolve(&path)?;
        let meta = fs::metadata(&path)?;
        let mode = match attrs.permissions.map(|m| m & 0o7777) {
            Some(0) | None => {
                if meta.is_dir() {
                    DEFAULT_DIR_MODE
                } else {
                    DEFAULT_FILE_MODE
                }
            }
            Some(m) => m,
        };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status> {
        let path = self.fs.resolve(&filename)?;
        fs::remove_file(path)?;
        Ok(ok_status(id))
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status> {
        let path = self.fs.resolve(&path)?;
        fs::DirBuilder::new().recursive(true).mode(DEFAULT_DIR_MODE).create(path)?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status> {
        let path = self.fs.resolve(&path)?;
        fs::remove_dir_all(path)?;
        Ok(ok_status(id))
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status> {
        let from = self.fs.resolve(&oldpath)?;
        let to = self.fs.resolve(&newpath)?;
        fs::rename(from, to)?;
        Ok(ok_status(id))
    }

    async fn symlink(&mut self, id: u32, linkpath: String, targetpath: String) -> Result<Status> {
        let link = self.fs.resolve(&linkpath)?;
        let target = self.fs.resolve(&targetpath)?;
        std::os::unix::fs::symlink(target, link)?;
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name> {
        let path = self.fs.resolve(&path)?;
        let target = fs::read_link(path)?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy())],
        })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name> {
        // Virtual view: the chroot is "/" as far as the client is concerned.
        let rel = Path::new(&path);
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        let virt = lexical_clean(&Path::new("/").join(rel));
        Ok(Name {
            id,
            files: vec![File::dummy(virt.to_string_lossy())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use russh_sftp::server::Handler as _;
    use std::sync::Arc;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn staging() -> (tempfile::TempDir, Arc<StagingFs>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = StagingFs::new(dir.path().join("alice")).unwrap();
        (dir, Arc::new(fs))
    }

    #[test]
    fn resolve_keeps_paths_under_the_chroot() {
        let (_dir, fs) = staging();
        let root = fs.root().to_path_buf();

        assert_eq!(fs.resolve("notes.txt").unwrap(), root.join("notes.txt"));
        assert_eq!(fs.resolve("/notes.txt").unwrap(), root.join("notes.txt"));
        assert_eq!(fs.resolve("a/./b/../c").unwrap(), root.join("a/c"));
        assert_eq!(fs.resolve("").unwrap(), root);
    }

    #[test]
    fn resolve_rejects_escapes_as_no_such_file() {
        let (_dir, fs) = staging();
        for path in ["../../etc/passwd", "../sibling", "a/../../..", "/../etc"] {
            let err = fs.resolve(path).unwrap_err();
            assert_eq!(err.kind(), VfsErrorKind::NoSuchFile, "path {path:?}");
        }
    }

    #[tokio::test]
    async fn open_write_read_roundtrip() {
        let (_dir, fs) = staging();
        let mut handler = SftpHandler::new(fs.clone(), test_logger());

        let h = handler
            .open(1, "hello.txt".into(), OpenFlags::WRITE | OpenFlags::CREATE, FileAttributes::default())
            .await
            .unwrap();
        handler.write(2, h.handle.clone(), 0, b"hello staging".to_vec()).await.unwrap();
        handler.close(3, h.handle).await.unwrap();

        // Default file mode applies when the client sends none.
        let mode = fs::metadata(fs.root().join("hello.txt")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, DEFAULT_FILE_MODE);

        let h = handler
            .open(4, "/hello.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = handler.read(5, h.handle.clone(), 0, 64).await.unwrap();
        assert_eq!(data.data, b"hello staging");
        assert!(matches!(
            handler.read(6, h.handle, 13, 64).await.unwrap_err().kind(),
            VfsErrorKind::Eof
        ));
    }

    #[tokio::test]
    async fn writes_are_gated_by_disk_space() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(
            StagingFs::new(dir.path().join("alice")).unwrap().with_disk_space_check(|| false),
        );
        let mut handler = SftpHandler::new(fs, test_logger());

        let err = handler
            .open(1, "big".into(), OpenFlags::WRITE | OpenFlags::CREATE, FileAttributes::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::QuotaExceeded);
        // Reads are unaffected by the gate.
        let err = handler.open(2, "absent".into(), OpenFlags::READ, FileAttributes::default()).await.unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NoSuchFile);
    }

    #[tokio::test]
    async fn escape_through_sftp_is_no_such_file() {
        let (_dir, fs) = staging();
        let mut handler = SftpHandler::new(fs, test_logger());
        let err = handler
            .open(1, "../../etc/passwd".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NoSuchFile);
    }

    #[tokio::test]
    async fn setstat_mode_defaults() {
        let (_dir, fs) = staging();
        let root = fs.root().to_path_buf();
        let mut handler = SftpHandler::new(fs, test_logger());

        fs::write(root.join("f"), b"x").unwrap();
        fs::create_dir(root.join("d")).unwrap();

        // Zero mode falls back to the per-type default.
        let zeroed = FileAttributes { permissions: Some(0), ..FileAttributes::default() };
        handler.setstat(1, "f".into(), zeroed.clone()).await.unwrap();
        handler.setstat(2, "d".into(), zeroed).await.unwrap();
        assert_eq!(fs::metadata(root.join("f")).unwrap().permissions().mode() & 0o7777, DEFAULT_FILE_MODE);
        assert_eq!(fs::metadata(root.join("d")).unwrap().permissions().mode() & 0o7777, DEFAULT_DIR_MODE);

        // A requested mode is preserved.
        let explicit = FileAttributes { permissions: Some(0o640), ..FileAttributes::default() };
        handler.setstat(3, "f".into(), explicit).await.unwrap();
        assert_eq!(fs::metadata(root.join("f")).unwrap().permissions().mode() & 0o7777, 0o640);
    }

    #[tokio::test]
    async fn directory_listing_drains_then_eofs() {
        let (_dir, fs) = staging();
        let root = fs.root().to_path_buf();
        fs::write(root.join("a"), b"1").unwrap();
        fs::write(root.join("b"), b"2").unwrap();
        let mut handler = SftpHandler::new(fs, test_logger());

        let h = handler.opendir(1, "/".into()).await.unwrap();
        let name = handler.readdir(2, h.handle.clone()).await.unwrap();
        let mut names: Vec<String> = name.files.iter().map(|f| f.filename.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            handler.readdir(3, h.handle).await.unwrap_err().kind(),
            VfsErrorKind::Eof
        ));
    }
}
