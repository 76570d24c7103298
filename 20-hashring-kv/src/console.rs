//! Operator commands typed at the `kv-node` prompt.
//!
//! Separate from [`crate::protocol::Request`]: the console is
//! case-insensitive, has aliases, and carries meta-commands (STATUS, HELP,
//! EXIT) that never go over the wire.

use anyhow::{Result, anyhow};

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Remove { key: String },
    Status,
    Help,
    Exit,
}

pub const HELP: &[&str] = &[
    "Commands (case-insensitive):",
    "  PUT <key> <value>  (alias: p)  -- write on the owning node",
    "  GET <key>          (alias: g)  -- read from the owning node",
    "  REMOVE <key>       (alias: r)  -- delete on the owning node",
    "  STATUS             (alias: s)  -- show ring and local store",
    "  HELP               (alias: h)  -- show this message",
    "  EXIT               (alias: e)  -- shut down this node",
];

impl ConsoleCommand {
    /// Parses one line of operator input.
    ///
    /// - `PUT <key> <value>` (alias: `p`)
    /// - `GET <key>` (alias: `g`)
    /// - `REMOVE <key>` (aliases: `r`, `del`)
    /// - `STATUS` (alias: `s`)
    /// - `HELP` (alias: `h`)
    /// - `EXIT` (aliases: `e`, `quit`)
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "R" | "DEL" => "REMOVE",
            "S" => "STATUS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", _) => Ok(ConsoleCommand::Exit),
            ("HELP", _) => Ok(ConsoleCommand::Help),
            ("STATUS", _) => Ok(ConsoleCommand::Status),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("REMOVE", 2) => Ok(ConsoleCommand::Remove {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("REMOVE", _) => Err(anyhow!("REMOVE requires exactly one argument: REMOVE <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p <key> <value>, GET/g <key>, REMOVE/r <key>, \
                 STATUS/s, HELP/h, EXIT/e"
            )),
        }
    }
}
