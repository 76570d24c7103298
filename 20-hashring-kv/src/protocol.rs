//! Wire protocol spoken between nodes.
//!
//! Every connection carries exactly one request line and at most one response
//! line:
//!
//! | request             | response                      |
//! |---------------------|-------------------------------|
//! | `PUT <key> <value>` | none                          |
//! | `REMOVE <key>`      | none                          |
//! | `GET <key>`         | `VALUE <value>` / `NOT_FOUND` |
//!
//! Anything else is dropped without a response.

use std::io::{self, BufRead, Read};

use crate::command::{Mutation, PUT, REMOVE};
use crate::error::DecodeError;

pub const GET: &str = "GET";
pub const VALUE: &str = "VALUE";
pub const NOT_FOUND: &str = "NOT_FOUND";

/// Upper bound on a single protocol line, terminator included.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Mutate(Mutation),
    Get { key: String },
}

impl Request {
    pub fn get(key: impl Into<String>) -> Self {
        Request::Get { key: key.into() }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::Mutate(mutation) => mutation.encode(),
            Request::Get { key } => format!("{GET} {key}\n"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Err(DecodeError::Empty);
        };
        match command {
            GET => match args {
                [key] => Ok(Request::get(*key)),
                _ => Err(DecodeError::Arity {
                    command: GET,
                    expected: 1,
                    found: args.len(),
                }),
            },
            PUT | REMOVE => Mutation::from_tokens(command, args).map(Request::Mutate),
            other => Err(DecodeError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }
}

impl From<Mutation> for Request {
    fn from(mutation: Mutation) -> Self {
        Request::Mutate(mutation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value(String),
    NotFound,
}

impl Response {
    pub fn encode(&self) -> String {
        match self {
            Response::Value(value) => format!("{VALUE} {value}\n"),
            Response::NotFound => format!("{NOT_FOUND}\n"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => Err(DecodeError::Empty),
            [VALUE, value] => Ok(Response::Value((*value).to_string())),
            [VALUE, rest @ ..] => Err(DecodeError::Arity {
                command: VALUE,
                expected: 1,
                found: rest.len(),
            }),
            [NOT_FOUND] => Ok(Response::NotFound),
            [NOT_FOUND, rest @ ..] => Err(DecodeError::Arity {
                command: NOT_FOUND,
                expected: 0,
                found: rest.len(),
            }),
            [other, ..] => Err(DecodeError::UnknownCommand {
                command: (*other).to_string(),
            }),
        }
    }

    pub fn into_value(self) -> Option<String> {
        match self {
            Response::Value(value) => Some(value),
            Response::NotFound => None,
        }
    }
}

impl From<Option<String>> for Response {
    fn from(value: Option<String>) -> Self {
        value.map_or(Response::NotFound, Response::Value)
    }
}

/// Reads one line of at most [`MAX_LINE_BYTES`].
///
/// Returns `Ok(None)` when the peer closed without sending anything. A line
/// cut short by EOF is returned as-is; callers decode it like any other.
///
/// # Errors
///
/// A line that reaches the limit without its newline fails with
/// [`io::ErrorKind::InvalidData`] instead of being returned cut short.
pub fn read_line<R: Read>(reader: R) -> io::Result<Option<String>> {
    let mut limited = io::BufReader::new(reader.take(MAX_LINE_BYTES));
    let mut line = String::new();
    let bytes = limited.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    if bytes as u64 == MAX_LINE_BYTES && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }
    Ok(Some(line))
}
