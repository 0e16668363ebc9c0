//! Mood presets: a named system message plus voice and sampling settings.
//!
//! Three moods ship with the binary:
//!
//! - `"assistant"`: general helpful assistant.
//! - `"coder"`: terse programming help.
//! - `"writer"`: creative writing partner.
//!
//! Additional moods can be placed as `.toml` files in `<config dir>/moods/`.
//! A user file with a built-in name replaces the built-in.

use crate::error::{DeckError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A named conversational preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mood {
    /// Lookup name (file stem for user moods).
    #[serde(default)]
    pub name: String,
    /// One-line description shown by `/mood`.
    #[serde(default)]
    pub description: String,
    pub system_message: String,
    /// Voice override; `None` keeps the session voice.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> usize {
    512
}

const ASSISTANT_PROMPT: &str = "\
You are a helpful assistant speaking through a voice console. Answer clearly \
in a few short sentences. Avoid markdown, lists and code blocks unless asked.";

const CODER_PROMPT: &str = "\
You are an expert software engineer. Give precise, correct answers. Prefer short \
explanations followed by a minimal example. Say so when you are unsure.";

const WRITER_PROMPT: &str = "\
You are a creative writing partner with a feel for character, dialogue and pacing. \
Offer vivid ideas, ask one focused question when the request is vague, and keep \
replies conversational.";

/// The moods compiled into the binary.
pub fn builtin_moods() -> Vec<Mood> {
    vec![
        Mood {
            name: "assistant".to_owned(),
            description: "General-purpose helper".to_owned(),
            system_message: ASSISTANT_PROMPT.to_owned(),
            voice: None,
            temperature: 0.7,
            max_tokens: 512,
        },
        Mood {
            name: "coder".to_owned(),
            description: "Programming help, low temperature".to_owned(),
            system_message: CODER_PROMPT.to_owned(),
            voice: None,
            temperature: 0.2,
            max_tokens: 1024,
        },
        Mood {
            name: "writer".to_owned(),
            description: "Creative writing partner".to_owned(),
            system_message: WRITER_PROMPT.to_owned(),
            voice: None,
            temperature: 0.9,
            max_tokens: 800,
        },
    ]
}

/// Directory scanned for user moods.
pub fn moods_dir() -> PathBuf {
    crate::config::DeckConfig::config_dir().join("moods")
}

/// Parse one mood file. The name defaults to the file stem.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid mood.
pub fn load_mood_file(path: &Path) -> Result<Mood> {
    let content = std::fs::read_to_string(path)?;
    let mut mood: Mood = toml::from_str(&content)
        .map_err(|e| DeckError::Config(format!("{}: {e}", path.display())))?;
    if mood.name.trim().is_empty() {
        mood.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
    }
    if !(0.0..=2.0).contains(&mood.temperature) {
        return Err(DeckError::Config(format!(
            "{}: temperature {} outside 0.0..=2.0",
            path.display(),
            mood.temperature
        )));
    }
    Ok(mood)
}

/// Built-in and user moods, looked up by name.
#[derive(Debug, Clone)]
pub struct MoodBook {
    moods: Vec<Mood>,
}

impl Default for MoodBook {
    fn default() -> Self {
        Self {
            moods: builtin_moods(),
        }
    }
}

impl MoodBook {
    /// Built-ins plus every valid `*.toml` in `dir`. Invalid files are skipped with a warning.
    pub fn load(dir: &Path) -> Self {
        let mut book = Self::default();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return book;
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        for path in paths {
            match load_mood_file(&path) {
                Ok(mood) => book.insert(mood),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping mood file"),
            }
        }
        book
    }

    /// Add a mood, replacing any with the same name.
    pub fn insert(&mut self, mood: Mood) {
        match self.moods.iter_mut().find(|m| m.name == mood.name) {
            Some(existing) => *existing = mood,
            None => self.moods.push(mood),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Mood> {
        self.moods.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.moods.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mood> {
        self.moods.iter()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn builtins_are_present() {
        let book = MoodBook::default();
        assert_eq!(book.names(), vec!["assistant", "coder", "writer"]);
        let coder = book.get("coder").unwrap();
        assert!(coder.temperature < 0.5);
        assert!(!coder.system_message.is_empty());
    }

    #[test]
    fn missing_dir_gives_builtins() {
        let book = MoodBook::load(Path::new("/nonexistent/codedeck/moods"));
        assert_eq!(book.iter().count(), 3);
    }

    #[test]
    fn user_moods_are_loaded_and_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pirate.toml"),
            "system_message = \"Talk like a pirate.\"\nvoice = \"glados\"\ntemperature = 1.1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("coder.toml"),
            "description = \"mine\"\nsystem_message = \"Only Rust.\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let book = MoodBook::load(dir.path());
        let pirate = book.get("pirate").unwrap();
        assert_eq!(pirate.voice.as_deref(), Some("glados"));
        assert!((pirate.temperature - 1.1).abs() < f64::EPSILON);
        assert_eq!(pirate.max_tokens, 512);

        let coder = book.get("coder").unwrap();
        assert_eq!(coder.system_message, "Only Rust.");
        assert_eq!(book.iter().count(), 4);
    }

    #[test]
    fn invalid_mood_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "system_message = [").unwrap();
        std::fs::write(
            dir.path().join("hot.toml"),
            "system_message = \"x\"\ntemperature = 9.0\n",
        )
        .unwrap();

        let book = MoodBook::load(dir.path());
        assert!(book.get("broken").is_none());
        assert!(book.get("hot").is_none());
    }

    #[test]
    fn explicit_name_wins_over_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.toml");
        std::fs::write(&path, "name = \"calm\"\nsystem_message = \"Breathe.\"\n").unwrap();
        assert_eq!(load_mood_file(&path).unwrap().name, "calm");
    }
}
