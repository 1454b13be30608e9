//! The per-session relay: owns the inbound session channel from the moment
//! it is accepted, drives target selection, dials the backend and proxies
//! the two sessions until either side hangs up.
//!
//! Channel requests do not arrive here directly — the connection handler
//! feeds them through an mpsc queue (the request pump). The interactive
//! gate is simply the first `pty-req`/`shell`/`subsystem` event read from
//! that queue; nothing ever spins waiting for a flag.

use super::error::RelayError;
use super::repl;
use super::selector::{self, Selection};
use super::terminal::{LineEvent, Terminal};
use crate::audit::AuditChannel;
use crate::auth;
use crate::config::{Config, Remote};
use crate::vfs::{SftpHandler, StagingFs};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::client::{self, AuthResult};
use russh::server::Msg;
use russh::{Channel, ChannelId, ChannelMsg, Pty};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// What the connection handler forwards into the relay task.
pub(crate) enum RelayEvent {
    /// A channel request to relay (or queue until the target exists).
    Request(SessionRequest),
    /// `subsystem sftp` before the interactive gate: serve the staging
    /// area on this channel and end the session afterwards.
    ServeSftp,
}

/// Channel requests the relay knows how to replay against the target.
pub(crate) enum SessionRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
        want_reply: bool,
    },
    Shell {
        want_reply: bool,
    },
    Subsystem {
        name: String,
        want_reply: bool,
    },
    Env {
        name: String,
        value: String,
        want_reply: bool,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    AgentForward {
        want_reply: bool,
    },
}

impl SessionRequest {
    // Requests that open the interactive session when seen first.
    fn flips_gate(&self) -> bool {
        matches!(
            self,
            SessionRequest::Pty { .. } | SessionRequest::Shell { .. } | SessionRequest::Subsystem { .. }
        )
    }
}

/// The escape byte switching a relayed session into the data REPL.
pub(crate) const ESCAPE_BYTE: u8 = 0x14;

enum Gate {
    Interactive,
    Sftp,
    Closed,
}

/// Host-key verification for the outbound leg: trust-on-config against the
/// `host_pubkeys` allow-list of the selected server.
pub(crate) struct TargetHandler {
    allowed: Vec<PublicKey>,
    ignore_host_keys: bool,
    logger: slog::Logger,
    connect_path: String,
    user: String,
    peer: String,
    rejected: Arc<AtomicBool>,
}

impl client::Handler for TargetHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.ignore_host_keys {
            return Ok(true);
        }
        if auth::key_matches(server_public_key, &self.allowed) {
            return Ok(true);
        }
        self.rejected.store(true, Ordering::SeqCst);
        slog::warn!(
            self.logger,
            "Host key validation failed for remote {} by user {} from {}",
            self.connect_path, self.user, self.peer
        );
        Ok(false)
    }
}

/// One inbound session from channel accept to close.
pub(crate) struct SessionRelay {
    pub(crate) config: Arc<Config>,
    pub(crate) logger: slog::Logger,
    pub(crate) audit: Arc<AuditChannel>,
    pub(crate) handle: russh::server::Handle,
    pub(crate) id: ChannelId,
    pub(crate) events: mpsc::Receiver<RelayEvent>,
    pub(crate) username: String,
    pub(crate) peer: String,
    pub(crate) password: Option<String>,
    pub(crate) agent_requested: Arc<AtomicBool>,
    pub(crate) term: Terminal,
    pub(crate) pending: Vec<SessionRequest>,
}

impl SessionRelay {
    /// Drive the session to completion. Every exit path emits the final
    /// audit record and closes the channel exactly once.
    pub(crate) async fn run(mut self, mut channel: Channel<Msg>) {
        match self.wait_for_gate(&mut channel).await {
            Gate::Sftp => {
                self.serve_sftp(channel).await;
                return;
            }
            Gate::Closed => {
                let _ = self.audit.close().await;
            }
            Gate::Interactive => {
                if let Err(e) = self.interactive(&mut channel).await {
                    slog::warn!(self.logger, "relay session ended: {}", e);
                }
                let _ = self.audit.close().await;
            }
        }
        slog::info!(self.logger, "Connection closed by {} (User: {})", self.peer, self.username);
    }

    // INIT state: wait for the request that decides what this session is.
    async fn wait_for_gate(&mut self, channel: &mut Channel<Msg>) -> Gate {
        loop {
            let step = tokio::select! {
                ev = self.events.recv() => Step::Event(ev),
                msg = channel.wait() => Step::Inbound(msg),
            };
            match step {
                Step::Event(Some(RelayEvent::ServeSftp)) => return Gate::Sftp,
                Step::Event(Some(RelayEvent::Request(req))) => {
                    let opens = req.flips_gate();
                    self.pending.push(req);
                    if opens {
                        return Gate::Interactive;
                    }
                }
                Step::Event(None) => return Gate::Closed,
                Step::Inbound(Some(ChannelMsg::Data { data })) => {
                    // Type-ahead before the shell request; keep it for the
                    // selector prompt.
                    self.term.push_input(&data);
                }
                Step::Inbound(Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None) => {
                    return Gate::Closed;
                }
                Step::Inbound(Some(_)) | Step::Target(_) => {}
            }
        }
    }

    async fn serve_sftp(self, channel: Channel<Msg>) {
        slog::info!(self.logger, "serving sftp subsystem against the staging area");
        let staging = match StagingFs::new(self.config.user_staging(&self.username)) {
            Ok(fs) => Arc::new(fs),
            Err(e) => {
                slog::error!(self.logger, "unable to prepare staging directory: {}", e);
                let _ = self.audit.close().await;
                return;
            }
        };
        let handler = SftpHandler::new(staging, self.logger.clone());
        russh_sftp::server::run(channel.into_stream(), handler).await;
        slog::info!(self.logger, "sftp client exited session");
        let _ = self.audit.close().await;
    }

    // INTERACTIVE_SELECT and onwards.
    async fn interactive(&mut self, channel: &mut Channel<Msg>) -> Result<(), RelayError> {
        let motd = self.read_motd();
        self.audit.write_str(&format!("{motd}\r\n")).await?;

        let Some(user) = self.config.users.get(&self.username).cloned() else {
            self.audit.write_str("User has no permitted remote hosts.\r\n").await?;
            return Ok(());
        };
        let Some(acl) = self.config.acls.get(&user.acl).cloned() else {
            self.audit.write_str("Error processing server selection (Invalid ACL).\r\n").await?;
            slog::warn!(self.logger, "Invalid ACL detected for user {}", self.username);
            return Ok(());
        };

        let selection = selector::choose_target(
            &mut self.term,
            channel,
            &self.audit,
            "Please enter the target name (or '?' for help) ",
            &acl.allow_servers,
        )
        .await?;
        let target_name = match selection {
            Selection::Target(name) => name,
            Selection::Cancelled => return Ok(()),
        };
        let Some(remote) = self.config.servers.get(&target_name).cloned() else {
            self.audit.write_str("Incorrectly Configured Server Selected.\r\n").await?;
            return Ok(());
        };

        if let Err(e) = self.audit.relay_start(&target_name).await {
            slog::error!(self.logger, "unable to initialize session audit: {}", e);
            self.audit.write_str("Failed to Initialize Session.\r\n").await?;
            return Ok(());
        }
        slog::info!(
            self.logger,
            "Connecting to remote for relay ({}) by {} from {}",
            remote.connect_path, self.username, self.peer
        );
        self.audit.write_str(&format!("Connecting to {target_name}\r\n")).await?;

        let Some(target) = self.connect_target(channel, &target_name, &remote).await? else {
            return Ok(());
        };

        self.proxy(channel, target, &remote).await
    }

    fn read_motd(&self) -> String {
        let Some(path) = self.config.global.motd_path.as_deref() else {
            return String::new();
        };
        match std::fs::read_to_string(path) {
            Ok(motd) => motd.trim_end().to_string(),
            Err(e) => {
                slog::warn!(self.logger, "unable to read motd file: {}", e);
                String::new()
            }
        }
    }

    // Dial and authenticate the outbound connection. `Ok(None)` means the
    // failure was already reported to the user and the session should end.
    async fn connect_target(
        &mut self,
        channel: &mut Channel<Msg>,
        target_name: &str,
        remote: &Remote,
    ) -> Result<Option<client::Handle<TargetHandler>>, RelayError> {
        let timeout = match self.config.connect_timeout() {
            Ok(t) => t,
            Err(raw) => {
                slog::warn!(self.logger, "Ignored invalid timeout in configuration: {:?}", raw);
                crate::config::DEFAULT_CONNECT_TIMEOUT
            }
        };

        let allowed = remote
            .host_pubkeys
            .iter()
            .filter_map(|line| PublicKey::from_openssh(line.trim()).ok())
            .collect();
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = TargetHandler {
            allowed,
            ignore_host_keys: self.config.global.ignore_hosts_pubkeys,
            logger: self.logger.clone(),
            connect_path: remote.connect_path.clone(),
            user: self.username.clone(),
            peer: self.peer.clone(),
            rejected: rejected.clone(),
        };

        let client_config = Arc::new(client::Config::default());
        let dial = client::connect(client_config, remote.connect_path.as_str(), handler);
        let mut target = match tokio::time::timeout(timeout, dial).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let reason = if rejected.load(Ordering::SeqCst) {
                    "HOST KEY VALIDATION FAILED - POSSIBLE MITM BETWEEN RELAY AND REMOTE".to_string()
                } else {
                    e.to_string()
                };
                self.audit.write_str(&format!("Connect failed: {reason}\r\n")).await?;
                return Ok(None);
            }
            Err(_) => {
                self.audit
                    .write_str(&format!("Connect failed: dial timeout after {timeout:?}\r\n"))
                    .await?;
                return Ok(None);
            }
        };

        let login_user = remote.login_user.clone().unwrap_or_else(|| self.username.clone());
        let cached_password = self.password.take();

        let mut authed = false;
        if self.agent_requested.load(Ordering::SeqCst) && self.config.global.allow_agent_forwarding {
            authed = self.agent_auth(&mut target, &login_user).await;
        }
        if !authed && self.config.global.auth_with_bastion_keys {
            for key in &self.config.host_keys {
                let key = PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None);
                if matches!(target.authenticate_publickey(login_user.clone(), key).await, Ok(AuthResult::Success)) {
                    authed = true;
                    break;
                }
            }
        }
        if !authed {
            let password = match cached_password {
                Some(p) if self.config.global.pass_password => p,
                _ => {
                    let prompt = format!("{login_user}@{target_name} password: ");
                    match self.term.read_password(channel, &self.audit, &prompt).await? {
                        LineEvent::Line(p) => p,
                        LineEvent::Cancelled | LineEvent::Eof => {
                            self.audit.write_str("Connect failed: authentication aborted\r\n").await?;
                            return Ok(None);
                        }
                    }
                }
            };
            authed = matches!(
                target.authenticate_password(login_user.clone(), password).await,
                Ok(AuthResult::Success)
            );
        }
        if !authed {
            self.audit.write_str("Connect failed: authentication failed\r\n").await?;
            return Ok(None);
        }
        Ok(Some(target))
    }

    // Ask the inbound client for its agent over an auth-agent channel and
    // try every identity it offers. Any failure degrades to the next auth
    // method instead of ending the session.
    async fn agent_auth(&self, target: &mut client::Handle<TargetHandler>, login_user: &str) -> bool {
        let agent_channel = match self.handle.channel_open_agent().await {
            Ok(c) => c,
            Err(e) => {
                slog::debug!(self.logger, "agent channel open failed: {:?}", e);
                return false;
            }
        };
        let mut agent = AgentClient::connect(agent_channel.into_stream());
        let identities = match agent.request_identities().await {
            Ok(ids) => ids,
            Err(e) => {
                slog::debug!(self.logger, "agent identity listing failed: {:?}", e);
                return false;
            }
        };
        for identity in identities {
            match target
                .authenticate_publickey_with(
                    login_user,
                    identity.public_key().into_owned(),
                    None,
                    &mut agent,
                )
                .await
            {
                Ok(AuthResult::Success) => return true,
                _ => continue,
            }
        }
        false
    }

    // RELAYING: the proxy loop over both channels and the request pump.
    async fn proxy(
        &mut self,
        channel: &mut Channel<Msg>,
        target: client::Handle<TargetHandler>,
        remote: &Remote,
    ) -> Result<(), RelayError> {
        let mut tchan = match target.channel_open_session().await {
            Ok(c) => c,
            Err(e) => {
                self.audit.write_str(&format!("Remote session setup failed: {e}\r\n")).await?;
                return Ok(());
            }
        };
        slog::info!(
            self.logger,
            "Connected to remote for relay ({}) by {} from {}",
            remote.connect_path, self.username, self.peer
        );

        let mut awaiting_replies: u32 = 0;
        for req in std::mem::take(&mut self.pending) {
            self.forward_request(req, &tchan, &mut awaiting_replies).await?;
        }

        let result = loop {
            let step = tokio::select! {
                ev = self.events.recv() => Step::Event(ev),
                msg = channel.wait() => Step::Inbound(msg),
                msg = tchan.wait() => Step::Target(msg),
            };
            match step {
                Step::Event(Some(RelayEvent::Request(req))) => {
                    self.forward_request(req, &tchan, &mut awaiting_replies).await?;
                }
                Step::Event(Some(RelayEvent::ServeSftp)) => {}
                Step::Event(None) => break Ok(()),
                Step::Inbound(Some(ChannelMsg::Data { data })) => {
                    if let Err(e) = self.inbound_data(channel, &tchan, &target, &data).await {
                        break Err(e);
                    }
                }
                Step::Inbound(Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None) => break Ok(()),
                Step::Inbound(Some(_)) => {}
                Step::Target(Some(ChannelMsg::Data { data })) => {
                    if let Err(e) = self.audit.write(&data).await {
                        break Err(e.into());
                    }
                }
                Step::Target(Some(ChannelMsg::ExtendedData { data, ext })) => {
                    slog::debug!(self.logger, "dropping target extended data"; "ext" => ext, "len" => data.len());
                }
                Step::Target(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    let _ = self.handle.exit_status_request(self.id, exit_status).await;
                }
                Step::Target(Some(ChannelMsg::Success)) => {
                    self.answer_pending(&mut awaiting_replies, true).await;
                }
                Step::Target(Some(ChannelMsg::Failure)) => {
                    self.answer_pending(&mut awaiting_replies, false).await;
                }
                Step::Target(Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None) => break Ok(()),
                Step::Target(Some(_)) => {}
            }
        };

        let _ = tchan.eof().await;
        slog::info!(
            self.logger,
            "Disconnected from remote for relay ({}) by {} from {}",
            remote.connect_path, self.username, self.peer
        );
        result
    }

    // Inbound keystrokes on their way to the target, with escape-byte
    // detection on each byte. Bytes following the escape are REPL input,
    // and whatever the REPL leaves unconsumed goes through the scanner
    // again — an escape typed inside the REPL never re-triggers.
    async fn inbound_data(
        &mut self,
        channel: &mut Channel<Msg>,
        tchan: &Channel<client::Msg>,
        target: &client::Handle<TargetHandler>,
        data: &[u8],
    ) -> Result<(), RelayError> {
        let mut chunk = data.to_vec();
        loop {
            match chunk.iter().position(|b| *b == ESCAPE_BYTE) {
                None => {
                    if !chunk.is_empty() {
                        tchan.data(&chunk[..]).await?;
                    }
                    return Ok(());
                }
                Some(pos) => {
                    if pos > 0 {
                        tchan.data(&chunk[..pos]).await?;
                    }
                    self.term.push_input(&chunk[pos + 1..]);
                    self.audit.write_str("Switching to data transfer mode\r\n").await?;
                    self.data_repl(channel, target).await?;
                    tchan.data(&b"\r\n"[..]).await?;
                    chunk = self.term.drain_input();
                }
            }
        }
    }

    async fn data_repl(
        &mut self,
        channel: &mut Channel<Msg>,
        target: &client::Handle<TargetHandler>,
    ) -> Result<(), RelayError> {
        let staging = match StagingFs::new(self.config.user_staging(&self.username)) {
            Ok(fs) => fs,
            Err(e) => {
                slog::error!(self.logger, "unable to prepare staging directory: {}", e);
                self.audit.write_str("Data transfer unavailable (staging error)\r\n").await?;
                return Ok(());
            }
        };
        repl::run(&mut self.term, channel, &self.audit, target, &staging, &self.logger).await
    }

    async fn forward_request(
        &self,
        req: SessionRequest,
        tchan: &Channel<client::Msg>,
        awaiting_replies: &mut u32,
    ) -> Result<(), RelayError> {
        let want_reply = match req {
            SessionRequest::Pty {
                ref term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                ref modes,
                want_reply,
            } => {
                tchan
                    .request_pty(want_reply, term, col_width, row_height, pix_width, pix_height, modes)
                    .await?;
                want_reply
            }
            SessionRequest::Shell { want_reply } => {
                tchan.request_shell(want_reply).await?;
                want_reply
            }
            SessionRequest::Subsystem { ref name, want_reply } => {
                tchan.request_subsystem(want_reply, name).await?;
                want_reply
            }
            SessionRequest::Env { ref name, ref value, want_reply } => {
                tchan.set_env(want_reply, name, value).await?;
                want_reply
            }
            SessionRequest::WindowChange { col_width, row_height, pix_width, pix_height } => {
                tchan.window_change(col_width, row_height, pix_width, pix_height).await?;
                false
            }
            SessionRequest::AgentForward { want_reply } => {
                tchan.agent_forward(want_reply).await?;
                want_reply
            }
        };
        if want_reply {
            *awaiting_replies += 1;
        }
        Ok(())
    }

    // Relay the target's boolean answer to the oldest unanswered inbound
    // request; SSH guarantees replies arrive in request order.
    async fn answer_pending(&self, awaiting_replies: &mut u32, ok: bool) {
        if *awaiting_replies == 0 {
            return;
        }
        *awaiting_replies -= 1;
        let result = if ok {
            self.handle.channel_success(self.id).await
        } else {
            self.handle.channel_failure(self.id).await
        };
        if result.is_err() {
            slog::debug!(self.logger, "could not relay request reply; channel gone");
        }
    }
}

enum Step {
    Event(Option<RelayEvent>),
    Inbound(Option<ChannelMsg>),
    Target(Option<ChannelMsg>),
}

#[cfg(test)]
mod tests {
    use super::*;

    // The escape scanner itself is exercised through `inbound_data`; the
    // splitting rule it relies on is pinned down here.
    #[test]
    fn escape_position_splits_prefix_and_repl_input() {
        let data = b"ls -l\x14get /etc/hostname\r";
        let pos = data.iter().position(|b| *b == ESCAPE_BYTE).unwrap();
        assert_eq!(&data[..pos], b"ls -l");
        assert_eq!(&data[pos + 1..], b"get /etc/hostname\r");
    }

    #[test]
    fn gate_requests() {
        assert!(SessionRequest::Shell { want_reply: true }.flips_gate());
        assert!(
            SessionRequest::Subsystem { name: "netconf".to_string(), want_reply: true }.flips_gate()
        );
        assert!(!SessionRequest::WindowChange { col_width: 80, row_height: 24, pix_width: 0, pix_height: 0 }.flips_gate());
        assert!(!SessionRequest::AgentForward { want_reply: false }.flips_gate());
    }
}
