//! The inbound face of the bastion: TCP listener, SSH handshake and
//! authentication, and the per-connection handler that accepts exactly one
//! session channel and hands it to the relay.

pub mod error;
pub(crate) mod relay;
pub(crate) mod repl;
pub(crate) mod selector;
pub(crate) mod terminal;

use crate::audit::{AuditChannel, SessionMeta};
use crate::auth::{self, Authenticator, LocalAuthenticator};
use crate::config::Config;
use crate::server::error::{ServerError, ServerErrorKind};
use crate::server::relay::{RelayEvent, SessionRelay, SessionRequest};
use crate::server::terminal::Terminal;
use chrono::Local;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, SshId};
use slog::{Drain, o};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// The SSH identification string the bastion presents.
const SERVER_ID: &str = "SSH-2.0-BASTION";

// Queue depth of the request pump between the connection handler and its
// relay task.
const REQUEST_PUMP_DEPTH: usize = 32;

/// An instance of the bastion relay server. Construct one through
/// [`Server::with_config`], then call [`listen`](Server::listen).
pub struct Server {
    config: Arc<Config>,
    authenticator: Arc<dyn Authenticator>,
    logger: slog::Logger,
    ssh_config: Arc<russh::server::Config>,
}

/// Used to create [`Server`]s.
pub struct ServerBuilder {
    config: Arc<Config>,
    authenticator: Option<Arc<dyn Authenticator>>,
    logger: slog::Logger,
}

impl Server {
    /// Start building a server around a resolved configuration.
    pub fn with_config(config: Arc<Config>) -> ServerBuilder {
        ServerBuilder {
            config,
            authenticator: None,
            logger: slog::Logger::root(slog_stdlog::StdLog {}.fuse(), o!()),
        }
    }

    /// Bind the configured listen endpoint and serve connections until the
    /// process ends. Each connection runs in its own task.
    pub async fn listen(self) -> Result<(), ServerError> {
        let address = self.config.global.listen_path.clone();
        let mut addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(|e| ServerError::with_source(ServerErrorKind::Bind { address: address.clone() }, e))?
            .collect();
        if self.config.global.disable_ipv6_bind {
            addrs.retain(|a| a.is_ipv4());
        }
        let Some(bind_addr) = addrs.first().copied() else {
            return Err(ServerError::new(ServerErrorKind::NoAddress { address }));
        };
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::with_source(ServerErrorKind::Bind { address: address.clone() }, e))?;

        slog::info!(self.logger, "Startup ok, now waiting for connections"; "address" => %bind_addr);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    slog::debug!(self.logger, "Incoming connection from {:?}", peer);
                    let handler = ConnectionHandler::new(
                        self.config.clone(),
                        self.authenticator.clone(),
                        self.logger.new(o!("peer" => peer.to_string())),
                        peer.to_string(),
                    );
                    let ssh_config = self.ssh_config.clone();
                    let logger = self.logger.clone();
                    tokio::spawn(async move {
                        match russh::server::run_stream(ssh_config, stream, handler).await {
                            Ok(session) => {
                                if let Err(e) = session.await {
                                    slog::debug!(logger, "connection from {:?} ended: {:?}", peer, e);
                                }
                            }
                            Err(e) => {
                                slog::debug!(logger, "handshake with {:?} failed: {:?}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    slog::error!(self.logger, "Error accepting incoming connection {:?}", e);
                }
            }
        }
    }
}

impl ServerBuilder {
    /// Set the [`Authenticator`] used for password verification. Defaults
    /// to the [`LocalAuthenticator`] over the configured user table.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the structured logger ([slog](https://crates.io/crates/slog)::Logger) to use.
    pub fn logger<L: Into<Option<slog::Logger>>>(mut self, logger: L) -> Self {
        self.logger = logger
            .into()
            .unwrap_or_else(|| slog::Logger::root(slog_stdlog::StdLog {}.fuse(), o!()));
        self
    }

    /// Finalize the options and build a [`Server`].
    pub fn build(self) -> Result<Server, ServerError> {
        if self.config.host_keys.is_empty() {
            return Err(ServerError::new(ServerErrorKind::NoHostKeys));
        }
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::Password);
        methods.push(MethodKind::PublicKey);
        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(SERVER_ID.to_string().into()),
            keys: self.config.host_keys.clone(),
            methods,
            ..Default::default()
        };
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(LocalAuthenticator::new(&self.config)));
        Ok(Server {
            config: self.config,
            authenticator,
            logger: self.logger,
            ssh_config: Arc::new(ssh_config),
        })
    }
}

struct AuthInfo {
    user: String,
    auth_type: &'static str,
    // Retained solely for optional pass-through towards the target; never
    // logged, taken out of here at target-dial time.
    password: Option<String>,
}

/// Per-connection state: authentication outcome, the single session channel
/// bookkeeping and the request pump towards the relay task.
pub(crate) struct ConnectionHandler {
    config: Arc<Config>,
    authenticator: Arc<dyn Authenticator>,
    logger: slog::Logger,
    peer: String,
    auth: Option<AuthInfo>,
    relay_tx: Option<mpsc::Sender<RelayEvent>>,
    audit: Option<Arc<AuditChannel>>,
    session_channel: Option<ChannelId>,
    interactive_started: bool,
    sftp_served: bool,
    agent_requested: Arc<AtomicBool>,
}

impl ConnectionHandler {
    fn new(
        config: Arc<Config>,
        authenticator: Arc<dyn Authenticator>,
        logger: slog::Logger,
        peer: String,
    ) -> ConnectionHandler {
        ConnectionHandler {
            config,
            authenticator,
            logger,
            peer,
            auth: None,
            relay_tx: None,
            audit: None,
            session_channel: None,
            interactive_started: false,
            sftp_served: false,
            agent_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    fn auth_log(&self, accepted: bool, method: &str, user: &str) {
        if accepted {
            slog::info!(self.logger, "Accepted {} for user {} from {} ssh2", method, user, self.peer);
        } else {
            slog::info!(self.logger, "Failed {} for user {} from {} ssh2", method, user, self.peer);
        }
    }

    // Audit one request in pump order, then hand it to the relay. The pump
    // never blocks this task: a client flooding requests while the relay is
    // busy loses the excess instead of wedging its own keystrokes.
    async fn push_event(&self, req_type: &str, want_reply: bool, payload: &[u8], event: Option<RelayEvent>) -> Result<(), russh::Error> {
        if let Some(audit) = &self.audit {
            audit
                .log_request(req_type, want_reply, payload)
                .await
                .map_err(|e| russh::Error::IO(std::io::Error::other(e)))?;
        }
        if let (Some(tx), Some(event)) = (&self.relay_tx, event) {
            if tx.try_send(event).is_err() {
                slog::debug!(self.logger, "request pump full or relay gone; dropping {} request", req_type);
            }
        }
        Ok(())
    }

    fn offered_key_matches(&self, user: &str, key: &PublicKey) -> bool {
        let Some(entry) = self.config.users.get(user) else {
            return false;
        };
        match auth::authorized_keys(entry) {
            Ok(keys) => auth::key_matches(key, &keys),
            Err(e) => {
                slog::warn!(self.logger, "authorized keys unusable for user {}: {}", user, e);
                false
            }
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authenticator.authenticate(user, password).await {
            Ok(()) => {
                self.auth_log(true, "password", user);
                self.auth = Some(AuthInfo {
                    user: user.to_string(),
                    auth_type: "password",
                    password: Some(password.to_string()),
                });
                Ok(Auth::Accept)
            }
            Err(e) => {
                slog::debug!(self.logger, "password verification failed: {}", e);
                self.auth_log(false, "password", user);
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.offered_key_matches(user, public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.offered_key_matches(user, public_key) {
            self.auth_log(true, "publickey", user);
            self.auth = Some(AuthInfo {
                user: user.to_string(),
                auth_type: "pk",
                password: None,
            });
            Ok(Auth::Accept)
        } else {
            self.auth_log(false, "publickey", user);
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_channel.is_some() {
            slog::warn!(self.logger, "rejecting additional channel; one session channel is served per connection");
            return Ok(false);
        }
        let Some(auth) = self.auth.as_mut() else {
            return Ok(false);
        };
        let user = auth.user.clone();
        let auth_type = auth.auth_type;
        let password = auth.password.take();

        let meta = SessionMeta {
            user: user.clone(),
            ip: self.peer.clone(),
            auth_type: auth_type.to_string(),
            start: Local::now(),
        };
        let logger = self.logger.new(o!("user" => user.clone()));
        let audit = AuditChannel::new(
            session.handle(),
            channel.id(),
            meta,
            self.config.global.audit_collector.as_deref(),
            self.config.global.log_path.clone(),
        )
        .await
        .map_err(|e| russh::Error::IO(std::io::Error::other(e)))?;
        let audit = Arc::new(audit);

        let (tx, rx) = mpsc::channel(REQUEST_PUMP_DEPTH);
        let relay = SessionRelay {
            config: self.config.clone(),
            logger: logger.clone(),
            audit: audit.clone(),
            handle: session.handle(),
            id: channel.id(),
            events: rx,
            username: user,
            peer: self.peer.clone(),
            password,
            agent_requested: self.agent_requested.clone(),
            term: Terminal::new(),
            pending: Vec::new(),
        };

        self.session_channel = Some(channel.id());
        self.relay_tx = Some(tx);
        self.audit = Some(audit);
        tokio::spawn(relay.run(channel));
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = pty_payload(term, col_width, row_height, pix_width, pix_height);
        // Only the request that opens the interactive session reaches the
        // target; repeats are answered here and consumed.
        if self.interactive_started {
            session.channel_success(channel)?;
            return self.push_event("pty-req", false, &payload, None).await;
        }
        self.interactive_started = true;
        let req = SessionRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
            want_reply: true,
        };
        self.push_event("pty-req", true, &payload, Some(RelayEvent::Request(req))).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if self.interactive_started {
            session.channel_success(channel)?;
            return self.push_event("shell", false, &[], None).await;
        }
        self.interactive_started = true;
        self.push_event(
            "shell",
            true,
            &[],
            Some(RelayEvent::Request(SessionRequest::Shell { want_reply: true })),
        )
        .await
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        // The bastion consumes exec outright; its own UI is the only thing
        // that runs before a target is selected.
        session.channel_success(channel)?;
        self.push_event("exec", true, data, None).await
    }

    async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        let payload = string_payload(name);
        if !self.interactive_started && name == "sftp" {
            if self.sftp_served {
                session.channel_failure(channel)?;
                return Ok(());
            }
            self.sftp_served = true;
            session.channel_success(channel)?;
            return self.push_event("subsystem", true, &payload, Some(RelayEvent::ServeSftp)).await;
        }
        let mut want_reply = true;
        if self.interactive_started {
            session.channel_success(channel)?;
            want_reply = false;
        } else {
            self.interactive_started = true;
        }
        let req = SessionRequest::Subsystem {
            name: name.to_string(),
            want_reply,
        };
        self.push_event("subsystem", want_reply, &payload, Some(RelayEvent::Request(req))).await
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = string_payload(variable_name);
        payload.extend_from_slice(&string_payload(variable_value));
        let req = SessionRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
            want_reply: true,
        };
        self.push_event("env", true, &payload, Some(RelayEvent::Request(req))).await
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = Vec::with_capacity(16);
        for v in [col_width, row_height, pix_width, pix_height] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let req = SessionRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        self.push_event("window-change", false, &payload, Some(RelayEvent::Request(req))).await
    }

    async fn agent_request(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        if self.config.global.allow_agent_forwarding {
            self.agent_requested.store(true, Ordering::SeqCst);
            self.push_event("auth-agent-req@openssh.com", true, &[], None).await?;
            Ok(true)
        } else {
            // Policy refuses it here; the target still learns the client
            // wanted an agent, without a reply to wait on.
            let event = RelayEvent::Request(SessionRequest::AgentForward { want_reply: false });
            self.push_event("auth-agent-req@openssh.com", true, &[], Some(event)).await?;
            Ok(false)
        }
    }
}

// SSH wire rendering of the request payloads for the audit trail. The pty
// payload carries the terminal name and geometry; encoded modes are not
// reconstructed.
fn pty_payload(term: &str, col_width: u32, row_height: u32, pix_width: u32, pix_height: u32) -> Vec<u8> {
    let mut payload = string_payload(term);
    for v in [col_width, row_height, pix_width, pix_height] {
        payload.extend_from_slice(&v.to_be_bytes());
    }
    payload.extend_from_slice(&string_payload(""));
    payload
}

fn string_payload(s: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + s.len());
    payload.extend_from_slice(&(s.len() as u32).to_be_bytes());
    payload.extend_from_slice(s.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn string_payload_is_length_prefixed() {
        assert_eq!(string_payload("sftp"), vec![0, 0, 0, 4, b's', b'f', b't', b'p']);
        assert_eq!(string_payload(""), vec![0, 0, 0, 0]);
    }

    #[test]
    fn pty_payload_layout() {
        let payload = pty_payload("xterm", 80, 24, 0, 0);
        // string "xterm", four u32 dimensions, empty modes string.
        assert_eq!(payload.len(), 4 + 5 + 16 + 4);
        assert_eq!(&payload[..9], &[0, 0, 0, 5, b'x', b't', b'e', b'r', b'm']);
        assert_eq!(&payload[9..13], &80u32.to_be_bytes());
        assert_eq!(&payload[13..17], &24u32.to_be_bytes());
    }
}
