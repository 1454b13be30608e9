//! Session auditing: the buffered triple writer every relayed byte goes
//! through.
//!
//! An [`AuditChannel`] wraps the write side of the inbound session channel.
//! Everything the user sees is pushed through [`AuditChannel::write`], which
//! appends the bytes to the session text log, stamps a ttyrec frame, and
//! only then forwards them to the peer — all under one mutex, so every
//! observer sees the byte order the peer saw. Until the relay target is
//! known the records accumulate in memory; [`AuditChannel::relay_start`]
//! promotes them to disk (or to the remote collector).

pub mod collector;
pub mod ttyrec;

use crate::audit::collector::{Collector, CollectorError};
use chrono::{DateTime, Local, SecondsFormat};
use russh::server::Handle;
use russh::ChannelId;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Failures of the audit trail. These are hard errors: a session that
/// cannot be audited is torn down.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Audit file creation or append failed.
    #[error("audit file error: {0}")]
    Io(#[from] std::io::Error),
    /// The remote collector rejected a record.
    #[error(transparent)]
    Collector(#[from] CollectorError),
    /// The session channel is gone.
    #[error("session channel closed")]
    ChannelClosed,
}

/// Identity of the audited session, fixed at channel accept time.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Authenticated username.
    pub user: String,
    /// Remote address of the inbound connection.
    pub ip: String,
    /// `password` or `pk`.
    pub auth_type: String,
    /// Session start, also the timestamp in the audit file names.
    pub start: DateTime<Local>,
}

/// Outcome of one data-REPL transfer, for the audit record.
#[derive(Debug)]
pub struct TransferRecord<'a> {
    /// Upload (`put`) or download (`get`).
    pub upload: bool,
    /// The file name as the user gave it.
    pub name: &'a str,
    /// Byte count, -1 when unknown.
    pub size: i64,
    /// Hex MD5 of the staged file.
    pub md5: &'a str,
    /// Failure description when the security controls did not pass.
    pub error: Option<String>,
}

// Where a record stream currently lands: in the pre-start memory buffer or
// in its on-disk file.
enum Sink {
    Buffer(Vec<u8>),
    File(fs::File),
}

impl Sink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::File(f) => f.write_all(data),
        }
    }

    // Flush the buffered bytes into `file` and route future writes there.
    fn promote(&mut self, mut file: fs::File) -> std::io::Result<()> {
        if let Sink::Buffer(buf) = self {
            file.write_all(buf)?;
        }
        *self = Sink::File(file);
        Ok(())
    }
}

// The bookkeeping half of the audit channel, separated from the russh
// handle so the buffering and formatting logic is testable on its own.
pub(crate) struct Journal {
    meta: SessionMeta,
    collector: Option<Collector>,
    log_root: PathBuf,
    text: Sink,
    requests: Sink,
    ttyrec: Sink,
    closed: bool,
}

impl Journal {
    pub(crate) fn new(meta: SessionMeta, collector: Option<Collector>, log_root: PathBuf) -> Journal {
        Journal {
            meta,
            collector,
            log_root,
            text: Sink::Buffer(Vec::new()),
            requests: Sink::Buffer(Vec::new()),
            ttyrec: Sink::Buffer(Vec::new()),
            closed: false,
        }
    }

    // First record of the session, collector mode only.
    pub(crate) async fn announce(&mut self) -> Result<(), AuditError> {
        if let Some(c) = &self.collector {
            c.send(
                "daemon",
                &format!(
                    "Authentication successful ({}), starting local session at time {}",
                    self.meta.auth_type,
                    self.meta.start.to_rfc3339_opts(SecondsFormat::Secs, false)
                ),
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn session_bytes(&mut self, data: &[u8]) -> Result<(), AuditError> {
        if self.closed {
            return Ok(());
        }
        match &self.collector {
            Some(c) => c.send("session", &String::from_utf8_lossy(data)).await?,
            None => self.text.write(data)?,
        }
        let mut frame = Vec::with_capacity(ttyrec::HEADER_LEN + data.len());
        ttyrec::append_frame(&mut frame, Local::now(), data);
        self.ttyrec.write(&frame)?;
        Ok(())
    }

    pub(crate) async fn request(&mut self, req_type: &str, want_reply: bool, payload: &[u8]) -> Result<(), AuditError> {
        if self.closed {
            return Ok(());
        }
        match &self.collector {
            Some(c) => {
                c.send(
                    "request",
                    &format!(
                        "Request Type: {req_type}\nWant Reply: {want_reply}\nPayload: {}\r\n",
                        hex_escape(payload)
                    ),
                )
                .await?;
            }
            None => {
                let line = format!(
                    "{}: Request Type - {req_type} - Want Reply: {want_reply} - Payload: {}\r\n",
                    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                    hex_escape(payload)
                );
                self.requests.write(line.as_bytes())?;
            }
        }
        Ok(())
    }

    pub(crate) async fn transfer(&mut self, record: &TransferRecord<'_>) -> Result<(), AuditError> {
        if self.closed {
            return Ok(());
        }
        let direction = if record.upload { "upload" } else { "download" };
        let outcome = match record.error {
            None => "Success".to_string(),
            Some(ref e) => format!("Failed security controls\nError: {e}"),
        };
        match &self.collector {
            Some(c) => {
                c.send(
                    "data_transfer",
                    &format!(
                        "File {direction}: {outcome}\nName: {}\nSize: {}\nMD5 sum: {}\n",
                        record.name, record.size, record.md5
                    ),
                )
                .await?;
            }
            None => {
                let mut block = format!(
                    "[LOGGER] File {direction}: {}\n[LOGGER] Name: {}\n[LOGGER] Size: {}\n[LOGGER] MD5 sum: {}\n",
                    if record.error.is_none() { "Success" } else { "Failed security controls" },
                    record.name,
                    record.size,
                    record.md5
                );
                if let Some(e) = &record.error {
                    block.push_str(&format!("[LOGGER] Error: {e}\n"));
                }
                block.push('\n');
                self.text.write(block.as_bytes())?;
            }
        }
        Ok(())
    }

    pub(crate) async fn relay_start(&mut self, target: &str) -> Result<(), AuditError> {
        let dir = self
            .log_root
            .join(format!("{}", self.meta.start.format("%Y")))
            .join(format!("{}", chrono::Datelike::month(&self.meta.start)));
        fs::DirBuilder::new().recursive(true).mode(0o750).create(&dir)?;
        let base = dir.join(format!(
            "ssh_log_{}_{}_{}",
            self.meta.start.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.meta.user,
            target
        ));

        match &self.collector {
            Some(c) => {
                c.send("daemon", "Starting relay logging").await?;
            }
            None => {
                let mut text = open_audit_file(&base.with_extension("txt"))?;
                let header = format!(
                    "[LOGGER] Timestamp: {}\n\
                     [LOGGER] Event: Starting SSH relay session\n\
                     [LOGGER] Username: {}\n\
                     [LOGGER] Authenticated by: {}\n\
                     [LOGGER] Source ip address: {}\n\n",
                    self.meta.start.to_rfc3339_opts(SecondsFormat::Secs, false),
                    self.meta.user,
                    self.meta.auth_type,
                    self.meta.ip
                );
                text.write_all(header.as_bytes())?;
                self.text.promote(text)?;
                self.requests.promote(open_audit_file(&base.with_extension("sshreq"))?)?;
            }
        }
        self.ttyrec.promote(open_audit_file(&base.with_extension("ttyrec"))?)?;
        Ok(())
    }

    // Emit the closing record and drop the descriptors. Safe to call twice.
    pub(crate) async fn close(&mut self) -> Result<(), AuditError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let end = Local::now();
        let duration = (end - self.meta.start).to_std().unwrap_or_default();
        match &self.collector {
            Some(c) => {
                c.send("daemon", &format!("Closing session, duration=[{duration:?}]")).await?;
            }
            None => {
                let block = format!(
                    "\n[LOGGER] Timestamp: {}\n\
                     [LOGGER] Event: Closing SSH session\n\
                     [LOGGER] Duration: {duration:?}\n\n",
                    end.to_rfc3339_opts(SecondsFormat::Secs, false)
                );
                self.text.write(block.as_bytes())?;
            }
        }
        // Dropping the File sinks closes the descriptors.
        self.text = Sink::Buffer(Vec::new());
        self.requests = Sink::Buffer(Vec::new());
        self.ttyrec = Sink::Buffer(Vec::new());
        Ok(())
    }
}

fn open_audit_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o640).open(path)
}

fn hex_escape(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 4);
    for b in payload {
        out.push_str(&format!("\\x{b:02x}"));
    }
    out
}

/// The audit sink wrapping one inbound session channel.
pub struct AuditChannel {
    journal: Mutex<Journal>,
    handle: Handle,
    id: ChannelId,
    meta: SessionMeta,
}

impl AuditChannel {
    /// Create the sink for a freshly accepted session channel. Buffers in
    /// memory until [`relay_start`](Self::relay_start).
    pub async fn new(
        handle: Handle,
        id: ChannelId,
        meta: SessionMeta,
        collector_url: Option<&str>,
        log_root: PathBuf,
    ) -> Result<AuditChannel, AuditError> {
        let collector = collector_url.map(|url| Collector::new(url, &meta.user, &meta.ip));
        let mut journal = Journal::new(meta.clone(), collector, log_root);
        journal.announce().await?;
        Ok(AuditChannel {
            journal: Mutex::new(journal),
            handle,
            id,
            meta,
        })
    }

    /// Identity of the audited session.
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Write `data` to the peer, recording it first. The audit mutex is held
    /// across the record and the channel write so the log order equals the
    /// wire order.
    pub async fn write(&self, data: &[u8]) -> Result<(), AuditError> {
        let mut journal = self.journal.lock().await;
        if !data.is_empty() {
            journal.session_bytes(data).await?;
        }
        self.handle
            .data(self.id, bytes::Bytes::copy_from_slice(data))
            .await
            .map_err(|_| AuditError::ChannelClosed)
    }

    /// Convenience for prompt and status strings.
    pub async fn write_str(&self, text: &str) -> Result<(), AuditError> {
        self.write(text.as_bytes()).await
    }

    /// Record one channel request as observed by the request pump.
    pub async fn log_request(&self, req_type: &str, want_reply: bool, payload: &[u8]) -> Result<(), AuditError> {
        self.journal.lock().await.request(req_type, want_reply, payload).await
    }

    /// Record the outcome of a data-REPL transfer.
    pub async fn log_transfer(&self, record: &TransferRecord<'_>) -> Result<(), AuditError> {
        self.journal.lock().await.transfer(record).await
    }

    /// Promote the in-memory buffers to the session's on-disk audit files
    /// (or announce relaying to the collector).
    pub async fn relay_start(&self, target: &str) -> Result<(), AuditError> {
        self.journal.lock().await.relay_start(target).await
    }

    /// Emit the closing record, release the audit files and close the
    /// session channel. Idempotent.
    pub async fn close(&self) -> Result<(), AuditError> {
        self.journal.lock().await.close().await?;
        // The channel may already be gone when the peer hung up first.
        let _ = self.handle.close(self.id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta() -> SessionMeta {
        SessionMeta {
            user: "alice".to_string(),
            ip: "198.51.100.7:61000".to_string(),
            auth_type: "pk".to_string(),
            start: Local::now(),
        }
    }

    fn read(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    fn audit_base(root: &Path, j: &Journal) -> PathBuf {
        root.join(format!("{}", j.meta.start.format("%Y")))
            .join(format!("{}", chrono::Datelike::month(&j.meta.start)))
            .join(format!(
                "ssh_log_{}_alice_web1",
                j.meta.start.to_rfc3339_opts(SecondsFormat::Secs, false)
            ))
    }

    #[tokio::test]
    async fn buffers_flush_in_order_on_relay_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::new(meta(), None, dir.path().to_path_buf());

        j.session_bytes(b"before-").await.unwrap();
        j.session_bytes(b"start").await.unwrap();
        j.request("pty-req", true, &[0, 0, 0, 2, b'x', b't']).await.unwrap();
        j.relay_start("web1").await.unwrap();
        j.session_bytes(b"|after").await.unwrap();

        let base = audit_base(dir.path(), &j);
        let text = read(&base.with_extension("txt"));
        let text = String::from_utf8(text).unwrap();
        assert!(text.starts_with("[LOGGER] Timestamp: "));
        assert!(text.contains("[LOGGER] Event: Starting SSH relay session"));
        assert!(text.contains("[LOGGER] Authenticated by: pk"));
        // Pre-start bytes land after the header, post-start bytes after them.
        assert!(text.ends_with("before-start|after"));

        let requests = String::from_utf8(read(&base.with_extension("sshreq"))).unwrap();
        assert!(requests.contains("Request Type - pty-req - Want Reply: true - Payload: \\x00\\x00\\x00\\x02\\x78\\x74"));
    }

    #[tokio::test]
    async fn ttyrec_stream_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::new(meta(), None, dir.path().to_path_buf());
        j.session_bytes(b"ab").await.unwrap();
        j.relay_start("web1").await.unwrap();
        j.session_bytes(b"cdef").await.unwrap();

        let raw = read(&audit_base(dir.path(), &j).with_extension("ttyrec"));
        let mut frames = Vec::new();
        let mut rest = raw.as_slice();
        while !rest.is_empty() {
            let len = i32::from_le_bytes(rest[8..12].try_into().unwrap()) as usize;
            frames.push(rest[12..12 + len].to_vec());
            rest = &rest[12 + len..];
        }
        assert_eq!(frames, vec![b"ab".to_vec(), b"cdef".to_vec()]);
    }

    #[tokio::test]
    async fn close_appends_duration_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::new(meta(), None, dir.path().to_path_buf());
        j.relay_start("web1").await.unwrap();
        j.close().await.unwrap();
        // Second close is a no-op.
        j.close().await.unwrap();

        let text = String::from_utf8(read(&audit_base(dir.path(), &j).with_extension("txt"))).unwrap();
        assert!(text.contains("[LOGGER] Event: Closing SSH session"));
        assert_eq!(text.matches("Closing SSH session").count(), 1);
        assert!(text.contains("[LOGGER] Duration: "));
    }

    #[tokio::test]
    async fn transfer_records_both_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let mut j = Journal::new(meta(), None, dir.path().to_path_buf());
        j.relay_start("web1").await.unwrap();
        j.transfer(&TransferRecord {
            upload: false,
            name: "hostname",
            size: 9,
            md5: "abcdef0123456789abcdef0123456789",
            error: None,
        })
        .await
        .unwrap();
        j.transfer(&TransferRecord {
            upload: true,
            name: "big.iso",
            size: -1,
            md5: "",
            error: Some("Bad file size".to_string()),
        })
        .await
        .unwrap();

        let text = String::from_utf8(read(&audit_base(dir.path(), &j).with_extension("txt"))).unwrap();
        assert!(text.contains("[LOGGER] File download: Success"));
        assert!(text.contains("[LOGGER] MD5 sum: abcdef0123456789abcdef0123456789"));
        assert!(text.contains("[LOGGER] File upload: Failed security controls"));
        assert!(text.contains("[LOGGER] Error: Bad file size"));
    }

    #[test]
    fn payload_hex_escaping() {
        assert_eq!(hex_escape(&[0x00, 0x14, 0xff]), "\\x00\\x14\\xff");
    }
}
