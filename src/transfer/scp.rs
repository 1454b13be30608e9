//! OpenSSH-compatible SCP over a target session channel.
//!
//! The remote side runs `scp -vf <path>` (source, for downloads) or
//! `scp -vt <dir>` (sink, for uploads); we speak the classic control stream:
//! zero-byte acks, one `C<mode> <size> <name>` header per file and a status
//! byte (nonzero followed by a message line) after every phase.

use super::TransferError;
use bytes::{Buf, BytesMut};
use russh::ChannelMsg;
use russh::client;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

type Result<T> = std::result::Result<T, TransferError>;

#[tracing_attributes::instrument(skip_all, fields(path = %path))]
pub(crate) async fn download<H, W>(
    client: &client::Handle<H>,
    path: &str,
    output: &mut W,
    logger: &slog::Logger,
) -> Result<()>
where
    H: client::Handler,
    W: AsyncWrite + Unpin + Send,
{
    let command = format!("scp -vf {}", quote(path));
    let mut session = ScpExchange::start(client, &command, logger).await?;

    session.send_ack().await?;
    let line = session.read_line().await?;
    if line.is_empty() {
        return Err(TransferError::BadHeader("empty response from server".to_string()));
    }
    match line.as_bytes()[0] {
        b'\x01' | b'\x02' => return Err(TransferError::Remote(line[1..].trim_end().to_string())),
        b'C' => {}
        b'D' => return Err(TransferError::IsDirectory),
        other => return Err(TransferError::UnexpectedResponse(other)),
    }
    let (_mode, size, _name) = parse_header(&line)?;

    session.send_ack().await?;
    session.copy_to(output, size).await?;
    session.send_ack().await?;
    session.check_status().await?;

    session.finish(logger).await
}

#[tracing_attributes::instrument(skip_all, fields(path = %path))]
pub(crate) async fn upload<H, R>(
    client: &client::Handle<H>,
    path: &str,
    input: &mut R,
    meta: Option<&std::fs::Metadata>,
    spool_dir: &Path,
    logger: &slog::Logger,
) -> Result<()>
where
    H: client::Handler,
    R: AsyncRead + Unpin + Send,
{
    let (target_dir, target_file) = split_path(path);
    let command = format!("scp -vt {}", quote(target_dir));

    // A regular file tells us its mode and length up front. Anything else is
    // spooled to a temporary file in the staging root to discover the length
    // scp insists on announcing.
    let (mode, size, mut spool) = match meta {
        Some(m) if m.is_file() => (m.permissions().mode() & 0o7777, m.len(), None),
        _ => {
            slog::debug!(logger, "spooling upload input to measure its length");
            let tmp = tempfile::tempfile_in(spool_dir)?;
            let mut tmp = tokio::fs::File::from_std(tmp);
            tokio::io::copy(input, &mut tmp).await?;
            tmp.flush().await?;
            let size = tmp.metadata().await?.len();
            tmp.seek(std::io::SeekFrom::Start(0)).await?;
            (0o644, size, Some(tmp))
        }
    };

    let mut session = ScpExchange::start(client, &command, logger).await?;

    let header = format!("C{mode:04o} {size} {target_file}\n");
    session.send(header.as_bytes()).await?;
    session.check_status().await?;
    match spool.as_mut() {
        Some(tmp) => session.copy_from(tmp, size).await?,
        None => session.copy_from(input, size).await?,
    }
    session.send_ack().await?;
    session.check_status().await?;

    session.finish(logger).await
}

// Shell-quote the path when it contains a space, as a remote shell will
// word-split the scp command line.
fn quote(path: &str) -> String {
    if path.contains(' ') {
        format!("{path:?}")
    } else {
        path.to_string()
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => (".", path),
    }
}

// Parse the file header. The canonical form is `C<mode> <size> <name>`, but
// some servers have been seen emitting only the mode token and the size;
// the name is not needed for a single-file fetch, so both forms pass.
fn parse_header(line: &str) -> Result<(u32, u64, Option<String>)> {
    let bad = || TransferError::BadHeader(line.trim_end().to_string());
    let mut tokens = line.trim_end().split_whitespace();

    let mode_tok = tokens.next().ok_or_else(bad)?;
    let mode_digits = mode_tok.strip_prefix('C').unwrap_or(mode_tok);
    let mode = u32::from_str_radix(mode_digits, 8).map_err(|_| bad())?;

    let size: i64 = tokens.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if size < 0 {
        return Err(TransferError::NegativeSize);
    }

    let rest: Vec<&str> = tokens.collect();
    let name = if rest.is_empty() { None } else { Some(rest.join(" ")) };
    Ok((mode, size as u64, name))
}

// One running scp command: a writer towards its stdin and a buffered view
// of its stdout that also tracks the exit status.
struct ScpExchange {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: ChannelOutput,
}

impl ScpExchange {
    async fn start<H: client::Handler>(
        client: &client::Handle<H>,
        command: &str,
        logger: &slog::Logger,
    ) -> Result<ScpExchange> {
        slog::debug!(logger, "starting remote scp process"; "command" => command);
        let channel = client.channel_open_session().await?;
        channel.exec(true, command).await?;
        let (read_half, write_half) = channel.split();
        Ok(ScpExchange {
            writer: Box::new(write_half.make_writer()),
            reader: ChannelOutput::new(read_half),
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<()> {
        self.send(b"\x00").await
    }

    async fn read_line(&mut self) -> Result<String> {
        self.reader.read_line().await
    }

    // Status byte: zero is fine, anything else is an error whose message
    // follows on the next line.
    async fn check_status(&mut self) -> Result<()> {
        let code = self.reader.read_byte().await?;
        if code == 0 {
            return Ok(());
        }
        let message = self.reader.read_line().await?;
        Err(TransferError::Remote(message.trim_end().to_string()))
    }

    async fn copy_to<W: AsyncWrite + Unpin + Send>(&mut self, output: &mut W, n: u64) -> Result<()> {
        self.reader.copy_to(output, n).await
    }

    async fn copy_from<R: AsyncRead + Unpin + Send>(&mut self, input: &mut R, n: u64) -> Result<()> {
        let mut taken = input.take(n);
        tokio::io::copy(&mut taken, &mut self.writer).await?;
        self.writer.flush().await?;
        Ok(())
    }

    // Close stdin and wait for the command to exit; 127 means no scp binary
    // on the remote end.
    async fn finish(mut self, logger: &slog::Logger) -> Result<()> {
        self.writer.shutdown().await?;
        let (status, stderr) = self.reader.drain().await;
        if !stderr.is_empty() {
            slog::debug!(logger, "scp stderr"; "len" => stderr.len(), "text" => String::from_utf8_lossy(&stderr).into_owned());
        }
        match status {
            None | Some(0) => Ok(()),
            Some(127) => Err(TransferError::ScpNotInstalled),
            Some(code) => Err(TransferError::ExitStatus(code)),
        }
    }
}

// Buffered reader over the data messages of a client channel, capturing
// stderr and the exit status on the side.
struct ChannelOutput {
    channel: russh::ChannelReadHalf,
    buf: BytesMut,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
}

impl ChannelOutput {
    fn new(channel: russh::ChannelReadHalf) -> ChannelOutput {
        ChannelOutput {
            channel,
            buf: BytesMut::new(),
            stderr: Vec::new(),
            exit_status: None,
            eof: false,
        }
    }

    // Pull one message off the channel. Returns false once the channel is
    // done for good.
    async fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                self.buf.extend_from_slice(&data);
                true
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                self.stderr.extend_from_slice(&data);
                true
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
                true
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                self.eof = true;
                false
            }
            Some(_) => true,
        }
    }

    async fn read_byte(&mut self) -> Result<u8> {
        while self.buf.is_empty() {
            if !self.fill().await {
                return Err(unexpected_eof());
            }
        }
        Ok(self.buf.get_u8())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            while self.buf.is_empty() {
                if !self.fill().await {
                    return Err(unexpected_eof());
                }
            }
            let byte = self.buf.get_u8();
            if byte == b'\n' {
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            line.push(byte);
        }
    }

    async fn copy_to<W: AsyncWrite + Unpin + Send>(&mut self, output: &mut W, mut n: u64) -> Result<()> {
        while n > 0 {
            if self.buf.is_empty() && !self.fill().await {
                return Err(unexpected_eof());
            }
            let take = (self.buf.len() as u64).min(n) as usize;
            if take > 0 {
                output.write_all(&self.buf[..take]).await?;
                self.buf.advance(take);
                n -= take as u64;
            }
        }
        output.flush().await?;
        Ok(())
    }

    // Read to channel end, returning the exit status and captured stderr.
    async fn drain(mut self) -> (Option<u32>, Vec<u8>) {
        while self.fill().await {}
        (self.exit_status, self.stderr)
    }
}

fn unexpected_eof() -> TransferError {
    TransferError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "scp channel closed mid-exchange",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_canonical_form() {
        let (mode, size, name) = parse_header("C0644 1234 notes.txt\n").unwrap();
        assert_eq!(mode, 0o644);
        assert_eq!(size, 1234);
        assert_eq!(name.as_deref(), Some("notes.txt"));
    }

    #[test]
    fn header_name_with_spaces_survives() {
        let (_, _, name) = parse_header("C0600 7 foo bar baz\n").unwrap();
        assert_eq!(name.as_deref(), Some("foo bar baz"));
    }

    #[test]
    fn header_nameless_form_is_tolerated() {
        let (mode, size, name) = parse_header("C0755 42\n").unwrap();
        assert_eq!(mode, 0o755);
        assert_eq!(size, 42);
        assert_eq!(name, None);
        // The bare variant without the leading C, as older parsers produced.
        let (mode, size, _) = parse_header("0640 9\n").unwrap();
        assert_eq!(mode, 0o640);
        assert_eq!(size, 9);
    }

    #[test]
    fn header_rejects_garbage_and_negative_sizes() {
        assert!(matches!(parse_header("Cabc 12 x\n"), Err(TransferError::BadHeader(_))));
        assert!(matches!(parse_header("C0644\n"), Err(TransferError::BadHeader(_))));
        assert!(matches!(parse_header("C0644 -3 x\n"), Err(TransferError::NegativeSize)));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        assert_eq!(quote("/tmp/plain"), "/tmp/plain");
        assert_eq!(quote("/tmp/with space"), "\"/tmp/with space\"");
    }

    #[test]
    fn split_path_variants() {
        assert_eq!(split_path("/var/tmp/f"), ("/var/tmp", "f"));
        assert_eq!(split_path("/f"), ("/", "f"));
        assert_eq!(split_path("f"), (".", "f"));
        assert_eq!(split_path("./staging/alice"), ("./staging", "alice"));
    }
}
