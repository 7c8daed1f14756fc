//! CLI utilities for the lite client.
//!
//! The interactive prompt understands:
//!
//! - `.exit`: close the session and terminate.
//! - `.prepare <sql>`: prepare a parameterized statement.
//! - `.execute <p1> <p2> ...`: execute the prepared statement. Integer
//!   arguments are sent as `INTEGER`, `NULL` as a null and anything else as
//!   `VARCHAR`.
//! - Anything else is run as a plain statement.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::protocol::Value;

/// List of possible errors from reading a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("end of input")]
    EndOfInput,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Prepare a parameterized statement
    Prepare(String),
    /// Execute the prepared statement with these parameters
    Execute(Vec<Value>),
    /// Plain statement run as is
    Statement(String),
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let line = value.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        if !line.starts_with('.') {
            return Ok(Command::Statement(line.to_string()));
        }

        let (command, args) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(c, a)| (c, a.trim()));
        match command {
            ".exit" => Ok(Command::Exit),
            ".prepare" if args.is_empty() => Err(CommandError::InvalidCommandArguments {
                command: command.to_string(),
                reason: "expected a statement to prepare".to_string(),
            }),
            ".prepare" => Ok(Command::Prepare(args.to_string())),
            ".execute" => Ok(Command::Execute(
                args.split_whitespace().map(parameter).collect(),
            )),
            _ => Err(CommandError::UnrecognizedCommand(command.to_string())),
        }
    }
}

fn parameter(token: &str) -> Value {
    if token.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    match token.parse() {
        Ok(n) => Value::Integer(n),
        Err(_) => Value::Varchar(token.to_string()),
    }
}

/// Prompt user for a valid command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Err(CommandError::EndOfInput);
    }

    Command::try_from(s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_statements() {
        let input = b"select * from lt0\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Statement("select * from lt0".to_string()), res);
    }

    #[test]
    fn prompt_reports_end_of_input() {
        let mut output = Vec::new();
        let err = prompt(&b""[..], &mut output).unwrap_err();
        assert!(matches!(err, CommandError::EndOfInput));
    }

    #[test]
    fn prepare_and_execute() {
        assert_eq!(
            Command::try_from(".prepare  select * from t where a = ? and b = ?").unwrap(),
            Command::Prepare("select * from t where a = ? and b = ?".to_string())
        );
        assert_eq!(
            Command::try_from(".execute 42 hello null").unwrap(),
            Command::Execute(vec![
                Value::Integer(42),
                Value::Varchar("hello".to_string()),
                Value::Null
            ])
        );
        assert_eq!(
            Command::try_from(".execute").unwrap(),
            Command::Execute(Vec::new())
        );
    }

    #[test]
    fn invalid_commands() {
        assert!(matches!(
            Command::try_from("   "),
            Err(CommandError::Empty)
        ));
        assert!(matches!(
            Command::try_from(".prepare"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));

        let err = Command::try_from(".something_wrong").unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }
}
