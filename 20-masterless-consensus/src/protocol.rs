//! Console input for the `node` binary: interactive commands and the
//! `--peer` map syntax.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context, Result};

use crate::carry::Carry;
use crate::clock::NodeId;

pub const USAGE: &str =
    "commands: PROPOSE/p <text>, DISCONNECT/d <id>, STATUS/s, HELP/h, EXIT/e";

/// Commands accepted at the node prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Propose { carry: Carry },
    Disconnect { peer: NodeId },
    Status,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input. The command word is case-insensitive and has
    /// a one-letter alias; everything after `PROPOSE` is taken verbatim as the
    /// carry.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("empty command");
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        let cmd = word.to_uppercase();
        let normalized = match cmd.as_str() {
            "P" => "PROPOSE",
            "D" => "DISCONNECT",
            "S" => "STATUS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, rest.is_empty()) {
            ("STATUS", true) => Ok(ConsoleCommand::Status),
            ("HELP", true) => Ok(ConsoleCommand::Help),
            ("EXIT", true) => Ok(ConsoleCommand::Exit),
            ("PROPOSE", false) => Ok(ConsoleCommand::Propose {
                carry: Carry::from(rest),
            }),
            ("PROPOSE", true) => Err(anyhow!("PROPOSE requires a value: PROPOSE <text>")),
            ("DISCONNECT", false) => {
                let id = rest
                    .parse()
                    .with_context(|| format!("invalid node id '{rest}'"))?;
                Ok(ConsoleCommand::Disconnect { peer: NodeId(id) })
            }
            ("DISCONNECT", true) => Err(anyhow!("DISCONNECT requires a node id: DISCONNECT <id>")),
            ("STATUS" | "HELP" | "EXIT", false) => Err(anyhow!("{normalized} takes no arguments")),
            _ => Err(anyhow!("invalid command. Try {USAGE}")),
        }
    }
}

/// Parses `id=addr` entries into a peer map. Duplicate ids are rejected.
pub fn parse_peers(entries: &[String]) -> Result<BTreeMap<NodeId, SocketAddr>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id, addr)) = entry.split_once('=') else {
            bail!("invalid peer entry '{entry}', expected id=addr");
        };
        let id: u32 = id
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        if peers.insert(NodeId(id), addr).is_some() {
            bail!("peer {id} listed twice");
        }
    }
    if peers.is_empty() {
        bail!("at least one --peer entry is required (include self)");
    }
    Ok(peers)
}
