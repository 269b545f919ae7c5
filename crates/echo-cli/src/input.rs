//! Terminal line parsing.

use echo_client::Command;
use echo_common::models::Participant;

pub const HELP: &str =
    "Commands: /users, /select <name>, /call, /hangup, /video, /mic, /leave. Anything else is sent as a message.";

/// What one line of input asks for.
#[derive(Debug, PartialEq)]
pub enum Input {
    /// Print the roster.
    Users,
    Help,
    Command(Command),
    /// Plain text: composed, then sent.
    Message(String),
    Empty,
}

/// Parse a line against the current roster. `/select` takes a display name
/// (case-insensitive) or a relay identity.
pub fn parse(line: &str, roster: &[Participant]) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Message(line.to_owned()));
    };

    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };
    let command = match verb {
        "users" => return Ok(Input::Users),
        "help" => return Ok(Input::Help),
        "select" => {
            if arg.is_empty() {
                return Err("usage: /select <name>".into());
            }
            let participant = roster
                .iter()
                .find(|p| p.display_name.eq_ignore_ascii_case(arg) || p.id.as_str() == arg)
                .ok_or_else(|| format!("nobody named {arg} is online"))?;
            Command::SelectPeer(participant.id.clone())
        }
        "call" => Command::Call,
        "hangup" => Command::HangUp,
        "video" => Command::ToggleVideo,
        "mic" => Command::ToggleAudio,
        "leave" | "quit" => Command::Leave,
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Input::Command(command))
}
