//! Command Parsing
//!
//! Turns the bulk-string arguments of one request into a typed [`Command`],
//! validating arity and numeric arguments before anything touches the
//! store.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Errors reported to the client as `-` replies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR empty command")]
    Empty,

    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("ERR DB index is out of range")]
    InvalidDb,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR corrupt object at key")]
    Corrupt,

    #[error("ERR store error: {0}")]
    Store(#[from] StoreError),

    #[error("ERR store busy, try again")]
    Busy,
}

impl CommandError {
    pub fn is_retriable(&self) -> bool {
        match self {
            CommandError::Store(err) => err.is_retriable(),
            _ => false,
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Quit,
    Select(u32),
    Time,
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del(Vec<Bytes>),
    Exists(Vec<Bytes>),
    Expire {
        key: Bytes,
        seconds: i64,
    },
    Ttl(Bytes),
    Persist(Bytes),
    Type(Bytes),
    HSet {
        key: Bytes,
        pairs: Vec<(Bytes, Bytes)>,
    },
    HGet {
        key: Bytes,
        field: Bytes,
    },
    HGetAll(Bytes),
}

impl Command {
    /// Parses `args`, where `args[0]` is the command name.
    pub fn parse(args: &[Bytes]) -> Result<Command, CommandError> {
        let (name, args) = args.split_first().ok_or(CommandError::Empty)?;
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        let command = match name.as_str() {
            "PING" => match args {
                [] => Command::Ping(None),
                [message] => Command::Ping(Some(message.clone())),
                _ => return Err(CommandError::WrongArity("ping")),
            },
            "ECHO" => Command::Echo(exactly::<1>(args, "echo")?[0].clone()),
            "QUIT" => Command::Quit,
            "SELECT" => {
                let [index] = exactly::<1>(args, "select")?;
                let index = parse_int(index)?;
                Command::Select(u32::try_from(index).map_err(|_| CommandError::InvalidDb)?)
            }
            "TIME" => {
                exactly::<0>(args, "time")?;
                Command::Time
            }
            "GET" => Command::Get(exactly::<1>(args, "get")?[0].clone()),
            "SET" => parse_set(args)?,
            "DEL" => Command::Del(at_least_one(args, "del")?),
            "EXISTS" => Command::Exists(at_least_one(args, "exists")?),
            "EXPIRE" => {
                let [key, seconds] = exactly::<2>(args, "expire")?;
                Command::Expire {
                    key: key.clone(),
                    seconds: parse_int(seconds)?,
                }
            }
            "TTL" => Command::Ttl(exactly::<1>(args, "ttl")?[0].clone()),
            "PERSIST" => Command::Persist(exactly::<1>(args, "persist")?[0].clone()),
            "TYPE" => Command::Type(exactly::<1>(args, "type")?[0].clone()),
            "HSET" => {
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(CommandError::WrongArity("hset"));
                }
                Command::HSet {
                    key: args[0].clone(),
                    pairs: args[1..]
                        .chunks_exact(2)
                        .map(|pair| (pair[0].clone(), pair[1].clone()))
                        .collect(),
                }
            }
            "HGET" => {
                let [key, field] = exactly::<2>(args, "hget")?;
                Command::HGet {
                    key: key.clone(),
                    field: field.clone(),
                }
            }
            "HGETALL" => Command::HGetAll(exactly::<1>(args, "hgetall")?[0].clone()),
            _ => return Err(CommandError::Unknown(name.to_ascii_lowercase())),
        };
        Ok(command)
    }
}

fn exactly<'a, const N: usize>(args: &'a [Bytes], name: &'static str) -> Result<&'a [Bytes; N], CommandError> {
    args.try_into().map_err(|_| CommandError::WrongArity(name))
}

fn at_least_one(args: &[Bytes], name: &'static str) -> Result<Vec<Bytes>, CommandError> {
    if args.is_empty() {
        return Err(CommandError::WrongArity(name));
    }
    Ok(args.to_vec())
}

fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

/// `SET key value [EX seconds | PX milliseconds]`
fn parse_set(args: &[Bytes]) -> Result<Command, CommandError> {
    let (key, value, options) = match args {
        [key, value, options @ ..] => (key, value, options),
        _ => return Err(CommandError::WrongArity("set")),
    };

    let ttl = match options {
        [] => None,
        [unit, amount] => {
            let amount = parse_int(amount)?;
            if amount <= 0 {
                return Err(CommandError::InvalidExpire("set"));
            }
            match String::from_utf8_lossy(unit).to_ascii_uppercase().as_str() {
                "EX" => Some(Duration::from_secs(amount as u64)),
                "PX" => Some(Duration::from_millis(amount as u64)),
                _ => return Err(CommandError::Syntax),
            }
        }
        _ => return Err(CommandError::Syntax),
    };

    Ok(Command::Set {
        key: key.clone(),
        value: value.clone(),
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_parse_connection_commands() {
        assert_eq!(Command::parse(&args(&["ping"])), Ok(Command::Ping(None)));
        assert_eq!(
            Command::parse(&args(&["PING", "hi"])),
            Ok(Command::Ping(Some(Bytes::from("hi"))))
        );
        assert_eq!(Command::parse(&args(&["Echo", "x"])), Ok(Command::Echo(Bytes::from("x"))));
        assert_eq!(Command::parse(&args(&["select", "3"])), Ok(Command::Select(3)));
        assert_eq!(Command::parse(&args(&["select", "-1"])), Err(CommandError::InvalidDb));
        assert_eq!(Command::parse(&args(&["quit"])), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_set_options() {
        assert_eq!(
            Command::parse(&args(&["SET", "k", "v", "EX", "10"])),
            Ok(Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                ttl: Some(Duration::from_secs(10)),
            })
        );
        assert_eq!(
            Command::parse(&args(&["SET", "k", "v", "px", "1500"])),
            Ok(Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                ttl: Some(Duration::from_millis(1500)),
            })
        );
        assert_eq!(
            Command::parse(&args(&["SET", "k", "v", "EX", "0"])),
            Err(CommandError::InvalidExpire("set"))
        );
        assert_eq!(Command::parse(&args(&["SET", "k", "v", "NX"])), Err(CommandError::Syntax));
        assert_eq!(
            Command::parse(&args(&["SET", "k", "v", "EX", "ten"])),
            Err(CommandError::NotInteger)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse(&[]), Err(CommandError::Empty));
        assert_eq!(Command::parse(&args(&["GET"])), Err(CommandError::WrongArity("get")));
        assert_eq!(Command::parse(&args(&["DEL"])), Err(CommandError::WrongArity("del")));
        assert_eq!(
            Command::parse(&args(&["HSET", "h", "f"])),
            Err(CommandError::WrongArity("hset"))
        );
        assert_eq!(
            Command::parse(&args(&["FLY", "away"])),
            Err(CommandError::Unknown("fly".into()))
        );
    }

    #[test]
    fn test_parse_hset_pairs() {
        let parsed = Command::parse(&args(&["HSET", "h", "a", "1", "b", "2"])).unwrap();
        assert_eq!(
            parsed,
            Command::HSet {
                key: Bytes::from("h"),
                pairs: vec![
                    (Bytes::from("a"), Bytes::from("1")),
                    (Bytes::from("b"), Bytes::from("2"))
                ],
            }
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CommandError::Unknown("fly".into()).to_string(),
            "ERR unknown command 'fly'"
        );
        assert!(CommandError::WrongType.to_string().starts_with("WRONGTYPE"));
        assert!(CommandError::Store(StoreError::Unavailable("x".into())).is_retriable());
        assert!(!CommandError::Syntax.is_retriable());
    }
}
