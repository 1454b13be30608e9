//! A minimal line editor over the inbound session channel.
//!
//! The bastion owns the user's terminal twice: during target selection and
//! inside the data-transfer prompt. Keystrokes arrive as channel data; the
//! echo travels back through the audit sink like every other byte the user
//! sees, so recordings replay the prompts faithfully.

use super::error::RelayError;
use crate::audit::AuditChannel;
use russh::ChannelMsg;
use russh::server::Msg;
use std::collections::VecDeque;

/// Characters accepted while a confirmation or index prompt is active.
/// Everything else is swallowed, the way the selector's completion callback
/// restricts single-keystroke input.
pub(crate) const CHOICE_KEYS: &str = "0123456789yYoOnN";

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x7f;
const BACKSPACE_ALT: u8 = 0x08;

/// Outcome of one line read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineEvent {
    /// A completed line, without the terminator.
    Line(String),
    /// The user hit Ctrl-C or Ctrl-D at the prompt.
    Cancelled,
    /// The channel reached EOF or closed under us.
    Eof,
}

/// Line reader state. Owns the type-ahead buffer so bytes that arrive in the
/// same packet as a line terminator (or right after the escape byte) are not
/// lost between prompts.
#[derive(Default)]
pub(crate) struct Terminal {
    pending: VecDeque<u8>,
}

impl Terminal {
    pub(crate) fn new() -> Terminal {
        Terminal::default()
    }

    /// Queue bytes to be consumed before any new channel reads.
    pub(crate) fn push_input(&mut self, data: &[u8]) {
        self.pending.extend(data);
    }

    /// Take whatever input is queued but not yet consumed.
    pub(crate) fn drain_input(&mut self) -> Vec<u8> {
        self.pending.drain(..).collect()
    }

    async fn next_byte(&mut self, channel: &mut russh::Channel<Msg>) -> Option<u8> {
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Some(b);
            }
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.pending.extend(data.iter()),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return None,
                Some(_) => {}
            }
        }
    }

    /// Read one line at `prompt`, echoing as the user types. When `keymask`
    /// is set, only those characters are accepted into the line.
    pub(crate) async fn read_line(
        &mut self,
        channel: &mut russh::Channel<Msg>,
        audit: &AuditChannel,
        prompt: &str,
        keymask: Option<&str>,
    ) -> Result<LineEvent, RelayError> {
        audit.write_str(prompt).await?;
        let mut line: Vec<u8> = Vec::new();
        loop {
            let byte = match self.next_byte(channel).await {
                Some(b) => b,
                None => return Ok(LineEvent::Eof),
            };
            match byte {
                b'\r' => {
                    audit.write_str("\r\n").await?;
                    return Ok(LineEvent::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                b'\n' => {}
                CTRL_C | CTRL_D => {
                    audit.write_str("\r\n").await?;
                    return Ok(LineEvent::Cancelled);
                }
                BACKSPACE | BACKSPACE_ALT => {
                    if line.pop().is_some() {
                        audit.write_str("\x08 \x08").await?;
                    }
                }
                b if (0x20..0x7f).contains(&b) => {
                    if keymask.is_none_or(|mask| mask.contains(b as char)) {
                        line.push(b);
                        audit.write(&[b]).await?;
                    }
                }
                _ => {}
            }
        }
    }

    /// Read a line without echo, for the target password prompt.
    pub(crate) async fn read_password(
        &mut self,
        channel: &mut russh::Channel<Msg>,
        audit: &AuditChannel,
        prompt: &str,
    ) -> Result<LineEvent, RelayError> {
        audit.write_str(prompt).await?;
        let mut line: Vec<u8> = Vec::new();
        loop {
            let byte = match self.next_byte(channel).await {
                Some(b) => b,
                None => return Ok(LineEvent::Eof),
            };
            match byte {
                b'\r' => {
                    audit.write_str("\r\n").await?;
                    return Ok(LineEvent::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                CTRL_C | CTRL_D => {
                    audit.write_str("\r\n").await?;
                    return Ok(LineEvent::Cancelled);
                }
                BACKSPACE | BACKSPACE_ALT => {
                    line.pop();
                }
                b if (0x20..0x7f).contains(&b) => line.push(b),
                _ => {}
            }
        }
    }
}
