//! User interaction for the two human suspension points: pasting the
//! authorization code and confirming manual endpoint activation.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Presents URLs to the user and reads their answers.
#[async_trait]
pub trait Prompt: Send + Sync {
    /// Show `url` to the user together with `message`.
    async fn present_url(&self, message: &str, url: &str) -> io::Result<()>;

    /// Ask the user for one line of input.
    ///
    /// Returns `None` if the user cancelled.
    async fn read_line(&self, message: &str) -> io::Result<Option<String>>;
}

/// Interactive prompt on the terminal.
///
/// Typing `q` or closing stdin cancels.
#[derive(Debug, Clone, Default)]
pub struct ConsolePrompt {
    open_browser: bool,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also try to open presented URLs in the default browser.
    pub fn with_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }
}

#[async_trait]
impl Prompt for ConsolePrompt {
    async fn present_url(&self, message: &str, url: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}\n\n    {}\n", message, url)?;
        stdout.flush()?;

        if self.open_browser {
            if let Err(e) = open::that(url) {
                warn!("Could not open browser: {}", e);
            }
        }
        Ok(())
    }

    async fn read_line(&self, message: &str) -> io::Result<Option<String>> {
        let message = message.to_string();
        let line = tokio::task::spawn_blocking(move || -> io::Result<Option<String>> {
            let mut stdout = io::stdout().lock();
            write!(stdout, "{}", message)?;
            stdout.flush()?;

            let mut line = String::new();
            let read = io::stdin().lock().read_line(&mut line)?;
            Ok((read > 0).then_some(line))
        })
        .await
        .map_err(io::Error::other)??;

        Ok(line
            .map(|l| l.trim().to_string())
            .filter(|l| !l.eq_ignore_ascii_case("q")))
    }
}

#[derive(Debug, Default)]
struct Script {
    answers: VecDeque<Option<String>>,
    presented: Vec<String>,
    questions: Vec<String>,
}

/// Prompt answering from a script, for tests and non-interactive runs.
///
/// Once the script runs out every question is answered with a cancel.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    script: Mutex<Script>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prompt = Self::default();
        for answer in answers {
            prompt.answer(answer);
        }
        prompt
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an answer.
    pub fn answer(&self, answer: impl Into<String>) {
        self.script().answers.push_back(Some(answer.into()));
    }

    /// Queue a cancellation.
    pub fn cancel(&self) {
        self.script().answers.push_back(None);
    }

    /// URLs presented so far, in order.
    pub fn presented(&self) -> Vec<String> {
        self.script().presented.clone()
    }

    /// Questions asked so far, in order.
    pub fn questions(&self) -> Vec<String> {
        self.script().questions.clone()
    }
}

#[async_trait]
impl Prompt for ScriptedPrompt {
    async fn present_url(&self, _message: &str, url: &str) -> io::Result<()> {
        self.script().presented.push(url.to_string());
        Ok(())
    }

    async fn read_line(&self, message: &str) -> io::Result<Option<String>> {
        let mut script = self.script();
        script.questions.push(message.to_string());
        let answer = script.answers.pop_front().flatten();
        debug!(answered = answer.is_some(), "Scripted prompt");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_prompt_answers_in_order() {
        let prompt = ScriptedPrompt::new(["first", "second"]);

        assert_eq!(prompt.read_line("?").await.unwrap().as_deref(), Some("first"));
        assert_eq!(prompt.read_line("?").await.unwrap().as_deref(), Some("second"));
        assert_eq!(prompt.read_line("?").await.unwrap(), None);
        assert_eq!(prompt.questions().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_prompt_cancel_and_urls() {
        let prompt = ScriptedPrompt::default();
        prompt.cancel();
        prompt.answer("later");

        prompt.present_url("visit", "https://example.org/a").await.unwrap();
        assert_eq!(prompt.read_line("?").await.unwrap(), None);
        assert_eq!(prompt.read_line("?").await.unwrap().as_deref(), Some("later"));
        assert_eq!(prompt.presented(), vec!["https://example.org/a".to_string()]);
    }
}
