//! REPL command parsing.

use serde_json::Value;

/// Printed for `help` and after an unknown command.
pub const USAGE: &str = "\
commands:
  invoke <method> [json-params]   call a method and print the reply
  notice <method> [json-params]   send a notification
  help                            show this text
  exit | quit                     close the connection";

/// One parsed input line.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Correlated call.
    Invoke {
        /// Target method.
        method: String,
        /// Parsed params, if any were given.
        params: Option<Value>,
    },
    /// Fire-and-forget notification.
    Notice {
        /// Target method.
        method: String,
        /// Parsed params, if any were given.
        params: Option<Value>,
    },
    /// Show usage.
    Help,
    /// Leave the REPL.
    Exit,
    /// Blank line.
    Empty,
}

/// Why a line could not be turned into a [`Command`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// First word is not a known command.
    #[error("unknown command: {0}")]
    Unknown(String),
    /// `invoke` or `notice` without a method name.
    #[error("{0} needs a method name")]
    MissingMethod(&'static str),
    /// Params are not valid JSON.
    #[error("invalid params: {0}")]
    BadParams(#[from] serde_json::Error),
}

/// Parse one REPL line.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (word, rest) = split_word(line);
    match word {
        "" => Ok(Command::Empty),
        "help" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        "invoke" => {
            let (method, params) = method_and_params(rest, "invoke")?;
            Ok(Command::Invoke { method, params })
        }
        "notice" => {
            let (method, params) = method_and_params(rest, "notice")?;
            Ok(Command::Notice { method, params })
        }
        other => Err(CommandError::Unknown(other.to_owned())),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn method_and_params(
    rest: &str,
    command: &'static str,
) -> Result<(String, Option<Value>), CommandError> {
    let (method, raw) = split_word(rest);
    if method.is_empty() {
        return Err(CommandError::MissingMethod(command));
    }
    let params = if raw.is_empty() {
        None
    } else {
        Some(serde_json::from_str(raw)?)
    };
    Ok((method.to_owned(), params))
}
