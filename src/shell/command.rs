use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put { key: String, value: i32 },
    Get { key: String },
    Test { key: String },
    Remove { key: String },
    Dump,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("invalid command: {0}")]
    Unknown(String),

    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{command}: '{value}' is not a 32-bit integer")]
    InvalidValue { command: &'static str, value: String },

    #[error("{command}: unexpected argument '{argument}'")]
    UnexpectedArgument {
        command: &'static str,
        argument: String,
    },
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let word = words.next().ok_or(ParseError::Empty)?;

        let command = match word {
            "put" => {
                let key = required(&mut words, "put", "key")?;
                let raw = required(&mut words, "put", "value")?;
                let value = raw.parse().map_err(|_| ParseError::InvalidValue {
                    command: "put",
                    value: raw,
                })?;
                finish(&mut words, "put")?;
                Command::Put { key, value }
            }
            "get" => {
                let key = required(&mut words, "get", "key")?;
                finish(&mut words, "get")?;
                Command::Get { key }
            }
            "test" => {
                let key = required(&mut words, "test", "key")?;
                finish(&mut words, "test")?;
                Command::Test { key }
            }
            "remove" => {
                let key = required(&mut words, "remove", "key")?;
                finish(&mut words, "remove")?;
                Command::Remove { key }
            }
            "dump" => {
                finish(&mut words, "dump")?;
                Command::Dump
            }
            "quit" => Command::Quit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

fn required<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    argument: &'static str,
) -> Result<String, ParseError> {
    words
        .next()
        .map(str::to_string)
        .ok_or(ParseError::MissingArgument { command, argument })
}

fn finish<'a>(words: &mut impl Iterator<Item = &'a str>, command: &'static str) -> Result<(), ParseError> {
    match words.next() {
        Some(extra) => Err(ParseError::UnexpectedArgument {
            command,
            argument: extra.to_string(),
        }),
        None => Ok(()),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Put { key, value } => write!(f, "put {} {}", key, value),
            Command::Get { key } => write!(f, "get {}", key),
            Command::Test { key } => write!(f, "test {}", key),
            Command::Remove { key } => write!(f, "remove {}", key),
            Command::Dump => f.write_str("dump"),
            Command::Quit => f.write_str("quit"),
        }
    }
}
