//! SFTP against the target: a thin wrapper over the russh-sftp client,
//! one subsystem channel per transfer.

use super::TransferError;
use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::os::unix::fs::PermissionsExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

type Result<T> = std::result::Result<T, TransferError>;

async fn session<H: client::Handler>(client: &client::Handle<H>) -> Result<SftpSession> {
    let channel = client.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    Ok(SftpSession::new(channel.into_stream()).await?)
}

#[tracing_attributes::instrument(skip_all, fields(path = %path))]
pub(crate) async fn download<H, W>(client: &client::Handle<H>, path: &str, output: &mut W) -> Result<()>
where
    H: client::Handler,
    W: AsyncWrite + Unpin + Send,
{
    let sftp = session(client).await?;
    let mut file = sftp.open_with_flags(path, OpenFlags::READ).await?;
    tokio::io::copy(&mut file, output).await?;
    output.flush().await?;
    Ok(())
}

#[tracing_attributes::instrument(skip_all, fields(path = %path))]
pub(crate) async fn upload<H, R>(
    client: &client::Handle<H>,
    path: &str,
    input: &mut R,
    meta: Option<&std::fs::Metadata>,
) -> Result<()>
where
    H: client::Handler,
    R: AsyncRead + Unpin + Send,
{
    let sftp = session(client).await?;
    let mut file = sftp.create(path).await?;
    tokio::io::copy(input, &mut file).await?;
    file.shutdown().await?;

    // Carry the local mode over, but only when the input really is a file.
    if let Some(m) = meta.filter(|m| m.is_file()) {
        let attrs = FileAttributes {
            permissions: Some(m.permissions().mode() & 0o7777),
            ..FileAttributes::default()
        };
        sftp.set_metadata(path, attrs).await?;
    }
    Ok(())
}
