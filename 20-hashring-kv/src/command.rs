//! Mutations: the records written to the log and carried by `PUT`/`REMOVE`.
//!
//! The text form is one line per record, fields separated by single spaces:
//!
//! ```text
//! PUT <key> <value>
//! REMOVE <key>
//! ```
//!
//! Nothing is escaped, so keys and values must be non-empty and free of
//! whitespace. [`validate_token`] enforces that before anything is logged,
//! and [`Mutation::validate`] also keeps each line within
//! [`MAX_LINE_BYTES`] so a peer can read it back whole.

use crate::error::{DecodeError, NodeError};
use crate::protocol::MAX_LINE_BYTES;
use crate::store::ReplayTarget;

pub const PUT: &str = "PUT";
pub const REMOVE: &str = "REMOVE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: String, value: String },
    Remove { key: String },
}

impl Mutation {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Mutation::Remove { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Remove { key } => key,
        }
    }

    /// Renders the record as a newline-terminated line.
    pub fn encode(&self) -> String {
        match self {
            Mutation::Put { key, value } => format!("{PUT} {key} {value}\n"),
            Mutation::Remove { key } => format!("{REMOVE} {key}\n"),
        }
    }

    /// Parses a single line. Surrounding whitespace and the line terminator
    /// are ignored; the field count must match exactly.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Err(DecodeError::Empty);
        };
        Self::from_tokens(command, args)
    }

    pub(crate) fn from_tokens(command: &str, args: &[&str]) -> Result<Self, DecodeError> {
        match command {
            PUT => match args {
                [key, value] => Ok(Mutation::put(*key, *value)),
                _ => Err(DecodeError::Arity {
                    command: PUT,
                    expected: 2,
                    found: args.len(),
                }),
            },
            REMOVE => match args {
                [key] => Ok(Mutation::remove(*key)),
                _ => Err(DecodeError::Arity {
                    command: REMOVE,
                    expected: 1,
                    found: args.len(),
                }),
            },
            other => Err(DecodeError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }

    /// Applies the mutation to `target`.
    pub fn apply<T: ReplayTarget + ?Sized>(self, target: &T) {
        match self {
            Mutation::Put { key, value } => target.put(key, value),
            Mutation::Remove { key } => {
                target.remove(&key);
            }
        }
    }

    /// Length of [`encode`](Mutation::encode), newline included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Mutation::Put { key, value } => PUT.len() + key.len() + value.len() + 3,
            Mutation::Remove { key } => REMOVE.len() + key.len() + 2,
        }
    }

    /// Checks that every field survives a round trip through the line format.
    pub fn validate(&self) -> Result<(), NodeError> {
        match self {
            Mutation::Put { key, value } => {
                validate_token("key", key)?;
                validate_token("value", value)?;
            }
            Mutation::Remove { key } => validate_token("key", key)?,
        }
        let len = self.encoded_len();
        if len as u64 > MAX_LINE_BYTES {
            return Err(NodeError::RecordTooLong {
                key: self.key().to_string(),
                len,
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(())
    }
}

pub fn validate_token(field: &'static str, token: &str) -> Result<(), NodeError> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(NodeError::InvalidToken {
            field,
            token: token.to_string(),
        });
    }
    Ok(())
}
