//! The data-transfer engine behind the Ctrl-T REPL: moves files between the
//! bastion's staging area and the *target* host over the already
//! authenticated target connection, via SFTP (default) or an OpenSSH
//! compatible SCP exchange.

pub(crate) mod scp;
pub(crate) mod sftp;

use md5::{Digest, Md5};
use russh::client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors of a single transfer. These never tear down the outer relay; the
/// REPL reports them and keeps its prompt.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The remote scp reported an error on its control stream.
    #[error("{0}")]
    Remote(String),
    /// A download path named a directory.
    #[error("remote file is a directory")]
    IsDirectory,
    /// The scp control stream produced a byte we do not understand.
    #[error("unexpected server response ({0:#04x})")]
    UnexpectedResponse(u8),
    /// The scp file header did not parse.
    #[error("can't parse server response ({0})")]
    BadHeader(String),
    /// The scp file header announced a negative size.
    #[error("negative file size")]
    NegativeSize,
    /// The remote command exited 127.
    #[error("SCP failed to start. This usually means that SCP is not properly installed on the remote system")]
    ScpNotInstalled,
    /// The remote command exited nonzero for another reason.
    #[error("scp exited with status {0}")]
    ExitStatus(u32),
    /// SSH-level failure opening or driving the transfer session.
    #[error("ssh session error: {0}")]
    Ssh(#[from] russh::Error),
    /// SFTP-level failure.
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    /// Local file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The staged byte count does not match the file's size on disk.
    #[error("Bad file size")]
    BadFileSize,
}

/// Which wire protocol the REPL uses against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// SFTP subsystem (default).
    #[default]
    Sftp,
    /// OpenSSH scp control stream.
    Scp,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Sftp => write!(f, "sftp"),
            TransferMode::Scp => write!(f, "scp"),
        }
    }
}

impl FromStr for TransferMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sftp" => Ok(TransferMode::Sftp),
            "scp" => Ok(TransferMode::Scp),
            _ => Err(()),
        }
    }
}

/// One REPL's transfer context against the current target connection.
pub struct DataSession<'c, H: client::Handler> {
    client: &'c client::Handle<H>,
    mode: TransferMode,
    staging_root: PathBuf,
    logger: slog::Logger,
}

impl<'c, H: client::Handler> DataSession<'c, H> {
    /// A session in the default (sftp) mode. `staging_root` is where scp
    /// uploads spool when the input size is unknown — same filesystem as
    /// the staged files, so no cross-device surprises.
    pub fn new(client: &'c client::Handle<H>, staging_root: PathBuf, logger: slog::Logger) -> Self {
        DataSession {
            client,
            mode: TransferMode::default(),
            staging_root,
            logger,
        }
    }

    /// The currently selected wire protocol.
    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Switch between sftp and scp.
    pub fn set_mode(&mut self, mode: TransferMode) {
        self.mode = mode;
    }

    /// Fetch `path` from the target into `output`.
    pub async fn download<W>(&self, path: &str, output: &mut W) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match self.mode {
            TransferMode::Scp => {
                slog::debug!(self.logger, "starting scp download"; "path" => path);
                scp::download(self.client, path, output, &self.logger).await
            }
            TransferMode::Sftp => {
                slog::debug!(self.logger, "starting sftp download"; "path" => path);
                sftp::download(self.client, path, output).await
            }
        }
    }

    /// Send `input` to `path` on the target. `meta` carries the local
    /// file's mode and size when the input is a regular file.
    pub async fn upload<R>(
        &self,
        path: &str,
        input: &mut R,
        meta: Option<&std::fs::Metadata>,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self.mode {
            TransferMode::Scp => {
                slog::debug!(self.logger, "starting scp upload"; "path" => path);
                scp::upload(self.client, path, input, meta, &self.staging_root, &self.logger).await
            }
            TransferMode::Sftp => {
                slog::debug!(self.logger, "starting sftp upload"; "path" => path);
                sftp::upload(self.client, path, input, meta).await
            }
        }
    }
}

/// Integrity control over a staged file: its MD5 (hex) and length, failing
/// when the bytes read disagree with what stat reports.
pub fn control_file(path: &Path) -> Result<(String, i64), TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let copied = std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    let md5 = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    let size = file.metadata()?.len();
    if copied != size {
        return Err(TransferError::BadFileSize);
    }
    Ok((md5, size as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_file_reports_md5_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        std::fs::write(&path, b"hello").unwrap();
        let (md5, size) = control_file(&path).unwrap();
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(size, 5);
    }

    #[test]
    fn control_file_missing_is_io_error() {
        let err = control_file(Path::new("/nonexistent/f")).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("sftp".parse::<TransferMode>(), Ok(TransferMode::Sftp));
        assert_eq!("scp".parse::<TransferMode>(), Ok(TransferMode::Scp));
        assert!("ftp".parse::<TransferMode>().is_err());
        assert_eq!(TransferMode::default(), TransferMode::Sftp);
    }
}
