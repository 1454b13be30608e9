//! The in-band data-transfer prompt, entered from a relayed session with
//! Ctrl-T. Downloads land in the user's staging directory, uploads read
//! from it; every completed or refused transfer leaves an audit record
//! with name, size and MD5.

use super::error::RelayError;
use super::terminal::{LineEvent, Terminal};
use crate::audit::{AuditChannel, TransferRecord};
use crate::transfer::{DataSession, TransferMode, control_file};
use crate::vfs::StagingFs;
use russh::Channel;
use russh::client;
use russh::server::Msg;
use std::path::{Component, Path, PathBuf};

const USAGE: &str = "\r\nUsage:\r\n\
    \tmode {sftp|scp}   select the transfer protocol (default sftp)\r\n\
    \tget <remote-path> download a file into your staging area\r\n\
    \tput <local-name>  upload a staged file to the target\r\n\
    \r\n\
    Type 'exit' or 'quit' to resume the session\r\n\
    \r\n";

// Same lexical cleanup the staging filesystem applies, for the remote side
// of a transfer where no chroot applies but `a/../b` noise is unwanted.
fn clean(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in Path::new(path).components() {
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

fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Run the `(data)$ ` prompt until the user exits back to the relay.
/// `Err` means the inbound channel went away and the session is over.
pub(crate) async fn run<H: client::Handler>(
    term: &mut Terminal,
    channel: &mut Channel<Msg>,
    audit: &AuditChannel,
    client: &client::Handle<H>,
    staging: &StagingFs,
    logger: &slog::Logger,
) -> Result<(), RelayError> {
    let mut data = DataSession::new(client, staging.root().to_path_buf(), logger.clone());

    loop {
        let line = match term.read_line(channel, audit, "(data)$ ", None).await? {
            LineEvent::Line(line) => line,
            LineEvent::Cancelled => return Ok(()),
            LineEvent::Eof => return Err(RelayError::ChannelClosed),
        };
        let parts: Vec<&str> = line.split(' ').collect();

        match parts[0] {
            "" => {}
            "help" | "?" => audit.write_str(USAGE).await?,
            "exit" | "quit" => {
                audit.write_str("Exiting...").await?;
                return Ok(());
            }
            "mode" => {
                if parts.len() != 2 {
                    audit.write_str("Missing mode (sftp or scp)\r\n").await?;
                    continue;
                }
                match parts[1].parse::<TransferMode>() {
                    Ok(mode) => {
                        data.set_mode(mode);
                        audit.write_str(&format!("Transfer mode set to {mode}\r\n")).await?;
                    }
                    Err(()) => audit.write_str("Unknown transfer mode\r\n").await?,
                }
            }
            "get" => {
                if parts.len() != 2 {
                    audit.write_str("Missing file name\r\n").await?;
                    continue;
                }
                download(audit, &data, staging, parts[1]).await?;
            }
            "put" => {
                if parts.len() != 2 {
                    audit.write_str("Missing file name\r\n").await?;
                    continue;
                }
                upload(audit, &data, staging, parts[1]).await?;
            }
            _ => {}
        }
    }
}

async fn download<H: client::Handler>(
    audit: &AuditChannel,
    data: &DataSession<'_, H>,
    staging: &StagingFs,
    raw_path: &str,
) -> Result<(), RelayError> {
    let remote = clean(raw_path);
    let remote_str = remote.to_string_lossy().into_owned();
    let local = match base_name(&remote).and_then(|b| staging.resolve(&b).ok()) {
        Some(p) => p,
        None => {
            audit.write_str("Error writing target file : invalid name\r\n").await?;
            return Ok(());
        }
    };
    audit.write_str(&format!("Downloading {remote_str}\r\n")).await?;

    let open = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&local)
        .await;
    let mut file = match open {
        Ok(f) => f,
        Err(e) => {
            audit.write_str(&format!("Error writing target file : {e}\r\n")).await?;
            return Ok(());
        }
    };
    if let Err(e) = data.download(&remote_str, &mut file).await {
        audit.write_str(&format!("Error downloading file : {e}\r\n")).await?;
        return Ok(());
    }
    drop(file);

    match control_file(&local) {
        Ok((md5, size)) => {
            audit
                .log_transfer(&TransferRecord {
                    upload: false,
                    name: &remote_str,
                    size,
                    md5: &md5,
                    error: None,
                })
                .await?;
            audit.write_str("Done\r\n").await?;
        }
        Err(e) => {
            audit
                .log_transfer(&TransferRecord {
                    upload: false,
                    name: &remote_str,
                    size: -1,
                    md5: "",
                    error: Some(e.to_string()),
                })
                .await?;
            audit.write_str(&format!("Downloaded aborted ({e})\r\n")).await?;
            let _ = tokio::fs::remove_file(&local).await;
        }
    }
    Ok(())
}

async fn upload<H: client::Handler>(
    audit: &AuditChannel,
    data: &DataSession<'_, H>,
    staging: &StagingFs,
    raw_name: &str,
) -> Result<(), RelayError> {
    let rel = clean(raw_name);
    let local = match staging.resolve(&rel.to_string_lossy()) {
        Ok(p) => p,
        Err(_) => {
            audit.write_str("Error reading source file : invalid name\r\n").await?;
            return Ok(());
        }
    };
    let local_str = local.to_string_lossy().into_owned();
    audit.write_str(&format!("Uploading {local_str}\r\n")).await?;

    let (md5, size) = match control_file(&local) {
        Ok(v) => v,
        Err(e) => {
            audit
                .log_transfer(&TransferRecord {
                    upload: true,
                    name: &local_str,
                    size: -1,
                    md5: "",
                    error: Some(e.to_string()),
                })
                .await?;
            audit.write_str(&format!("Upload aborted ({e})\r\n")).await?;
            let _ = tokio::fs::remove_file(&local).await;
            return Ok(());
        }
    };

    let mut file = match tokio::fs::File::open(&local).await {
        Ok(f) => f,
        Err(e) => {
            audit.write_str(&format!("Error reading source file : {e}\r\n")).await?;
            return Ok(());
        }
    };
    let meta = match std::fs::metadata(&local) {
        Ok(m) => m,
        Err(e) => {
            audit.write_str(&format!("Error stat reading source file : {e}\r\n")).await?;
            return Ok(());
        }
    };

    let remote = match base_name(&local) {
        Some(b) => format!("./{b}"),
        None => {
            audit.write_str("Error reading source file : invalid name\r\n").await?;
            return Ok(());
        }
    };
    if let Err(e) = data.upload(&remote, &mut file, Some(&meta)).await {
        audit.write_str(&format!("Error uploading file : {e}\r\n")).await?;
        return Ok(());
    }

    audit
        .log_transfer(&TransferRecord {
            upload: true,
            name: &local_str,
            size,
            md5: &md5,
            error: None,
        })
        .await?;
    audit.write_str("Done\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_collapses_dot_segments() {
        assert_eq!(clean("/etc/../etc/hostname"), PathBuf::from("/etc/hostname"));
        assert_eq!(clean("a/./b"), PathBuf::from("a/b"));
        assert_eq!(clean("../up"), PathBuf::from("up"));
    }

    #[test]
    fn base_name_extracts_the_final_component() {
        assert_eq!(base_name(Path::new("/etc/hostname")).as_deref(), Some("hostname"));
        assert_eq!(base_name(Path::new("plain")).as_deref(), Some("plain"));
        assert_eq!(base_name(Path::new("/")), None);
    }
}
