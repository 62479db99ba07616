//! Chat line parsing and presence conventions.

/// Published on join; every node that sees it answers with [`IS_HERE`].
pub const ENTER: &str = "* enter";
pub const IS_HERE: &str = "* is here";
/// Published on the way out.
pub const EXIT: &str = "* exit";

pub const HELP: &str = "/whisper target message\n/help: this help";

/// What the user asked for with one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Flood the text to everyone.
    Say(String),
    /// Route the text to one identity.
    Whisper { target: String, text: String },
    Help,
    Quit,
    Nothing,
}

pub fn parse_line(line: &str) -> ChatCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ChatCommand::Nothing;
    }
    if matches!(trimmed.to_lowercase().as_str(), "exit" | "stop" | "quit") {
        return ChatCommand::Quit;
    }

    let Some(command) = trimmed.strip_prefix('/') else {
        return ChatCommand::Say(line.to_string());
    };
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some("whisper"), Some(target)) => {
            let text: Vec<&str> = words.collect();
            if text.is_empty() {
                ChatCommand::Help
            } else {
                ChatCommand::Whisper {
                    target: target.to_string(),
                    text: text.join(" "),
                }
            }
        }
        _ => ChatCommand::Help,
    }
}
