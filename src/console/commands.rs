//! Slash command parsing for the console.
//!
//! | Input | Command |
//! |-------|---------|
//! | `/status` | `Status` |
//! | `/history` | `History` |
//! | `/clear` | `Clear` |
//! | `/endpoints` | `Endpoints` |
//! | `/endpoint <n\|url>` | `SelectEndpoint` |
//! | `/models` | `Models` |
//! | `/model <n\|name>` | `SelectModel` |
//! | `/context [pairs]` | `Context` |
//! | `/mood [name]` | `Mood` |
//! | `/voice [id]` | `Voice` |
//! | `/audio [on\|off]` | `Audio` |
//! | `/temp [value]` | `Temperature` |
//! | `/hush` | `Hush` |
//! | `/save` | `Save` |
//! | `/help` | `Help` |
//! | `/quit`, `/exit` | `Quit` |
//!
//! Anything not starting with `/` is a chat message; so is an unrecognized
//! `/word`, since models are regularly asked about paths like `/etc/hosts`.

use crate::routing::Selection;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    History,
    Clear,
    Endpoints,
    SelectEndpoint(Selection),
    Models,
    SelectModel(Selection),
    /// Show (`None`) or set the context window in pairs.
    Context(Option<usize>),
    /// List (`None`) or switch moods.
    Mood(Option<String>),
    Voice(Option<String>),
    Audio(Option<bool>),
    Temperature(Option<f64>),
    Hush,
    Save,
    Help,
    Quit,
}

/// One line of console input.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Chat(String),
    Command(Command),
    /// A known command with a bad argument; carries the usage hint.
    Invalid(String),
}

/// Classify one input line.
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Chat(line.to_owned());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let arg = (!arg.is_empty()).then_some(arg);

    let command = match name.to_ascii_lowercase().as_str() {
        "status" => Command::Status,
        "history" => Command::History,
        "clear" => Command::Clear,
        "endpoints" => Command::Endpoints,
        "endpoint" => match arg {
            Some(arg) => Command::SelectEndpoint(Selection::parse(arg)),
            None => return Input::Invalid("usage: /endpoint <number|url>".to_owned()),
        },
        "models" => Command::Models,
        "model" => match arg {
            Some(arg) => Command::SelectModel(Selection::parse(arg)),
            None => return Input::Invalid("usage: /model <number|name>".to_owned()),
        },
        "context" => match arg.map(str::parse::<usize>) {
            None => Command::Context(None),
            Some(Ok(pairs)) => Command::Context(Some(pairs)),
            Some(Err(_)) => return Input::Invalid("usage: /context <pairs>".to_owned()),
        },
        "mood" => Command::Mood(arg.map(str::to_owned)),
        "voice" => Command::Voice(arg.map(str::to_owned)),
        "audio" => match arg.map(str::to_ascii_lowercase).as_deref() {
            None => Command::Audio(None),
            Some("on") => Command::Audio(Some(true)),
            Some("off") => Command::Audio(Some(false)),
            Some(_) => return Input::Invalid("usage: /audio on|off".to_owned()),
        },
        "temp" | "temperature" => match arg.map(str::parse::<f64>) {
            None => Command::Temperature(None),
            Some(Ok(t)) if (0.0..=2.0).contains(&t) => Command::Temperature(Some(t)),
            Some(_) => return Input::Invalid("usage: /temp <0.0-2.0>".to_owned()),
        },
        "hush" => Command::Hush,
        "save" => Command::Save,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => return Input::Chat(line.to_owned()),
    };
    Input::Command(command)
}

/// Help text for `/help`.
pub const HELP: &str = "\
Commands:
  /status              route, endpoints and session settings
  /history             stored conversation
  /clear               forget history and queued audio
  /endpoints           list endpoints
  /endpoint <n|url>    route to an endpoint
  /models              list models on the active endpoint
  /model <n|name>      switch model
  /context [pairs]     show or set history pairs sent with each request
  /mood [name]         list moods or switch mood
  /voice [id]          show or set the speech voice
  /audio [on|off]      show or toggle speech
  /temp [value]        show or set temperature (0.0-2.0)
  /hush                stop all audio now
  /save                write current settings to the config file
  /help                this text
  /quit                exit (also Ctrl+D)
Ctrl+C once stops generation; twice stops audio too.";

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(parse_input("  hello  "), Input::Chat("hello".to_owned()));
        assert_eq!(parse_input("   "), Input::Empty);
    }

    #[test]
    fn unknown_slash_word_is_chat() {
        assert_eq!(
            parse_input("/etc/hosts looks odd"),
            Input::Chat("/etc/hosts looks odd".to_owned())
        );
    }

    #[test]
    fn selections() {
        assert_eq!(
            parse_input("/endpoint 2"),
            Input::Command(Command::SelectEndpoint(Selection::Position(2)))
        );
        assert_eq!(
            parse_input("/model qwen3:8b"),
            Input::Command(Command::SelectModel(Selection::Name("qwen3:8b".to_owned())))
        );
        assert!(matches!(parse_input("/endpoint"), Input::Invalid(_)));
    }

    #[test]
    fn arguments_are_validated() {
        assert_eq!(parse_input("/context 3"), Input::Command(Command::Context(Some(3))));
        assert_eq!(parse_input("/context"), Input::Command(Command::Context(None)));
        assert!(matches!(parse_input("/context many"), Input::Invalid(_)));
        assert_eq!(parse_input("/audio OFF"), Input::Command(Command::Audio(Some(false))));
        assert!(matches!(parse_input("/audio maybe"), Input::Invalid(_)));
        assert_eq!(parse_input("/temp 0.2"), Input::Command(Command::Temperature(Some(0.2))));
        assert!(matches!(parse_input("/temp 3"), Input::Invalid(_)));
    }

    #[test]
    fn case_insensitive_names() {
        assert_eq!(parse_input("/HUSH"), Input::Command(Command::Hush));
        assert_eq!(parse_input("/Quit"), Input::Command(Command::Quit));
        assert_eq!(parse_input("/mood coder"), Input::Command(Command::Mood(Some("coder".to_owned()))));
    }
}
