//! Parsing of input lines.

use counsel_conversation::SessionSummary;
use counsel_core::AnalysisId;
use std::fmt;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a new conversation with no context.
    New,
    /// Show the session list.
    List,
    /// Select the session at a 1-based list position.
    Select(usize),
    /// Delete the session at a 1-based list position.
    Delete(usize),
    /// Ground the next messages in a situation analysis.
    Situation { id: AnalysisId, label: Option<String> },
    /// Ground the next messages in a contract analysis.
    Contract { id: AnalysisId, label: Option<String> },
    /// Drop the active context.
    Clear,
    /// Reconcile with the remote store now.
    Sync,
    /// Resend the last failed query.
    Retry,
    /// Show the available commands.
    Help,
    /// Exit.
    Quit,
    /// Send the line as a query.
    Send(String),
}

/// Errors parsing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The line is blank.
    Empty,
    /// No such command.
    Unknown { name: String },
    /// A required argument is missing.
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    /// A list position is not a positive number.
    InvalidPosition { value: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "nothing to send"),
            Self::Unknown { name } => write!(f, "unknown command /{name}, try /help"),
            Self::MissingArgument { command, argument } => {
                write!(f, "/{command} needs {argument}")
            }
            Self::InvalidPosition { value } => {
                write!(f, "{value} is not a list position")
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Usage text for `/help`.
pub const HELP: &str = "\
/new                       start a new conversation
/list                      list conversations
/select <n>                switch to conversation n
/delete <n>                delete conversation n
/situation <id> [label]    ground answers in a situation analysis
/contract <id> [label]     ground answers in a contract analysis
/clear                     drop the active context
/sync                      refresh from the server
/retry                     resend the last failed question
/quit                      exit
anything else is sent as a question";

/// Parses one input line.
///
/// # Errors
///
/// Returns an error for blank lines, unknown commands and bad arguments.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    match name {
        "new" => Ok(Command::New),
        "list" | "ls" => Ok(Command::List),
        "select" => position("select", args).map(Command::Select),
        "delete" | "rm" => position("delete", args).map(Command::Delete),
        "situation" => analysis("situation", args)
            .map(|(id, label)| Command::Situation { id, label }),
        "contract" => {
            analysis("contract", args).map(|(id, label)| Command::Contract { id, label })
        }
        "clear" => Ok(Command::Clear),
        "sync" => Ok(Command::Sync),
        "retry" => Ok(Command::Retry),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(CommandError::Unknown {
            name: other.to_string(),
        }),
    }
}

fn position(command: &'static str, args: &str) -> Result<usize, CommandError> {
    if args.is_empty() {
        return Err(CommandError::MissingArgument {
            command,
            argument: "a list position",
        });
    }
    match args.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CommandError::InvalidPosition {
            value: args.to_string(),
        }),
    }
}

fn analysis(
    command: &'static str,
    args: &str,
) -> Result<(AnalysisId, Option<String>), CommandError> {
    let (id, label) = match args.split_once(char::is_whitespace) {
        Some((id, label)) => (id, Some(label.trim().to_string())),
        None => (args, None),
    };
    let id = id.parse::<AnalysisId>().map_err(|_| CommandError::MissingArgument {
        command,
        argument: "an analysis id",
    })?;
    Ok((id, label.filter(|l| !l.is_empty())))
}

/// The session list as last shown to the user.
///
/// `/select n` and `/delete n` resolve against this, not the live list,
/// which a background sync may have reordered since.
#[derive(Debug, Default)]
pub struct Listing {
    sessions: Vec<SessionSummary>,
}

impl Listing {
    /// Records the list about to be shown and returns it.
    pub fn show(&mut self, sessions: Vec<SessionSummary>) -> &[SessionSummary] {
        self.sessions = sessions;
        &self.sessions
    }

    /// Returns the session shown at a 1-based position.
    pub fn at(&self, position: usize) -> Option<&SessionSummary> {
        self.sessions.get(position.checked_sub(1)?)
    }
}
