//! Interactive target selection: a keyword search over the servers the
//! user's ACL allows, with confirmation for single hits and numeric
//! disambiguation for small result sets.

use super::error::RelayError;
use super::terminal::{CHOICE_KEYS, LineEvent, Terminal};
use crate::audit::AuditChannel;
use russh::Channel;
use russh::server::Msg;

const MAX_SUGGESTIONS: usize = 10;

const USAGE: &str = "\r\nUsage:\r\n\
    \tEnter a keyword to locate the server you want to connect to.\r\n\
    \tA list of possible targets will be displayed, enter the full\r\n\
    \tname to start the session.\r\n\
    \r\n\
    Type 'exit' or 'quit' to leave the session\r\n\
    \r\n";

/// Outcome of the selection dialogue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Selection {
    /// The user confirmed this server name.
    Target(String),
    /// The user bailed out (`exit`, `quit`, Ctrl-C) or the channel ended.
    Cancelled,
}

// Substring search over the allowed names. Collects one entry past the
// display limit so the caller can tell "too many" apart from "exactly ten".
fn matches<'a>(choices: &'a [String], keyword: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    for choice in choices {
        if choice.contains(keyword) {
            found.push(choice.as_str());
            if found.len() > MAX_SUGGESTIONS {
                break;
            }
        }
    }
    found
}

/// Run the selection dialogue until the user picks a target or cancels.
pub(crate) async fn choose_target(
    term: &mut Terminal,
    channel: &mut Channel<Msg>,
    audit: &AuditChannel,
    prompt: &str,
    choices: &[String],
) -> Result<Selection, RelayError> {
    audit.write_str(&format!("{prompt}\r\n")).await?;

    loop {
        let line = match term.read_line(channel, audit, "$ ", None).await? {
            LineEvent::Line(line) => line,
            LineEvent::Cancelled | LineEvent::Eof => return Ok(Selection::Cancelled),
        };
        let keyword = line.split(' ').next().unwrap_or("");

        match keyword {
            "" => continue,
            "help" | "?" => {
                audit.write_str(USAGE).await?;
            }
            "exit" | "quit" => {
                audit.write_str("Exiting...\r\n").await?;
                return Ok(Selection::Cancelled);
            }
            keyword => {
                let suggestions = matches(choices, keyword);
                match suggestions.len() {
                    0 => audit.write_str("No server found\r\n").await?,
                    n if n > MAX_SUGGESTIONS => audit.write_str("Too many results\r\n").await?,
                    1 => {
                        audit.write_str(&format!("Connect to {} ? \r\n", suggestions[0])).await?;
                        let answer = match term.read_line(channel, audit, "(y/n) ", Some(CHOICE_KEYS)).await? {
                            LineEvent::Line(line) => line.to_lowercase(),
                            LineEvent::Cancelled => continue,
                            LineEvent::Eof => return Ok(Selection::Cancelled),
                        };
                        if answer == "y" || answer == "o" {
                            return Ok(Selection::Target(suggestions[0].to_string()));
                        }
                    }
                    _ => {
                        audit.write_str("Select a target server :\r\n").await?;
                        for (i, name) in suggestions.iter().enumerate() {
                            audit.write_str(&format!("    [ {:2} ] {}\r\n", i + 1, name)).await?;
                        }
                        let answer = match term.read_line(channel, audit, "(choose target) ", Some(CHOICE_KEYS)).await? {
                            LineEvent::Line(line) => line,
                            LineEvent::Cancelled => continue,
                            LineEvent::Eof => return Ok(Selection::Cancelled),
                        };
                        let index: usize = match answer.parse() {
                            Ok(i) => i,
                            Err(_) => continue,
                        };
                        if index == 0 || index > suggestions.len() {
                            audit.write_str("Invalid target\r\n").await?;
                            continue;
                        }
                        return Ok(Selection::Target(suggestions[index - 1].to_string()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keyword_matches_are_substring_based() {
        let choices = servers(&["web1", "web2", "db1", "edge-web"]);
        assert_eq!(matches(&choices, "web"), vec!["web1", "web2", "edge-web"]);
        assert_eq!(matches(&choices, "db"), vec!["db1"]);
        assert!(matches(&choices, "mail").is_empty());
    }

    #[test]
    fn match_list_stops_just_past_the_display_limit() {
        let names: Vec<String> = (0..25).map(|i| format!("node{i:02}")).collect();
        let found = matches(&names, "node");
        assert_eq!(found.len(), MAX_SUGGESTIONS + 1);
    }
}
