//! Generation loop
//!
//! Drives `ingest` followed by repeated `step` calls, applying stop sequences
//! to the accumulated text. Available as a lazy [`TokenStream`] iterator, a
//! callback form, and a batch [`generate`] that returns the whole completion.

use crate::floor_char_boundary;
use crate::inference::runtime::Model;
use crate::inference::session::{FinishReason, Session, SessionError};
use crate::storage::settings::SessionSettings;

/// Per-request generation options
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Generation stops once any of these appears in the output
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for GenerationOptions {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_tokens: settings.max_tokens,
            stop_sequences: settings.stop_sequences.clone(),
        }
    }
}

/// Result of a batch generation
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text, cut before the stop sequence if one matched
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Lazy, single-pass sequence of text fragments.
///
/// Yields `Ok(fragment)` for every non-empty fragment. If generation ended in a
/// failure, the error is yielded exactly once at the end. Dropping the stream
/// stops generation at the current step boundary.
pub struct TokenStream<'s, 'm, M: Model + 'm> {
    session: &'s mut Session<'m, M>,
    stop_sequences: Vec<String>,
    longest_stop: usize,
    transcript: String,
    finished: bool,
}

impl<'s, 'm, M: Model + 'm> TokenStream<'s, 'm, M> {
    fn new(session: &'s mut Session<'m, M>, stop_sequences: &[String]) -> Self {
        let stop_sequences: Vec<String> = stop_sequences
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let longest_stop = stop_sequences.iter().map(String::len).max().unwrap_or(0);
        Self {
            session,
            stop_sequences,
            longest_stop,
            transcript: String::new(),
            finished: false,
        }
    }

    /// Everything emitted so far
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.session.finish_reason()
    }

    /// Looks for a stop sequence that the latest fragment could have completed
    fn matched_stop(&self, fragment_len: usize) -> Option<String> {
        if self.stop_sequences.is_empty() {
            return None;
        }
        let window = fragment_len + self.longest_stop.saturating_sub(1);
        let start = floor_char_boundary(
            &self.transcript,
            self.transcript.len().saturating_sub(window),
        );
        let tail = &self.transcript[start..];
        self.stop_sequences
            .iter()
            .find(|stop| tail.contains(stop.as_str()))
            .cloned()
    }
}

impl<'s, 'm, M: Model + 'm> Iterator for TokenStream<'s, 'm, M> {
    type Item = Result<String, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if self.session.is_done() {
                self.finished = true;
                return self
                    .session
                    .finish_reason()
                    .and_then(FinishReason::error)
                    .map(|e| Err(e.clone()));
            }

            let fragment = match self.session.step() {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            if fragment.is_empty() {
                continue;
            }

            self.transcript.push_str(&fragment);
            if let Some(stop) = self.matched_stop(fragment.len()) {
                tracing::debug!("Stop sequence {:?} matched", stop);
                self.session.mark_done(FinishReason::StopSequence(stop));
            }
            return Some(Ok(fragment));
        }
    }
}

/// Ingests `prompt` and returns a stream over the generated fragments
pub fn stream<'s, 'm, M: Model + 'm>(
    session: &'s mut Session<'m, M>,
    prompt: &str,
    options: &GenerationOptions,
) -> Result<TokenStream<'s, 'm, M>, SessionError> {
    session.set_token_budget(options.max_tokens);
    session.ingest(prompt)?;
    Ok(TokenStream::new(session, &options.stop_sequences))
}

/// Runs a generation to completion and returns the collected text.
///
/// Failures after ingestion do not discard output: they are reported through
/// [`Completion::finish_reason`] alongside the partial text.
pub fn generate<M: Model>(
    session: &mut Session<'_, M>,
    prompt: &str,
    options: &GenerationOptions,
) -> Result<Completion, SessionError> {
    let mut tokens = stream(session, prompt, options)?;
    let mut text = String::new();
    for item in tokens.by_ref() {
        // Errors are recorded as the finish reason
        if let Ok(fragment) = item {
            text.push_str(&fragment);
        }
    }
    drop(tokens);

    let finish_reason = match session.finish_reason() {
        Some(reason) => reason.clone(),
        None => FinishReason::EndOfGeneration,
    };
    if let FinishReason::StopSequence(stop) = &finish_reason {
        if let Some(index) = text.find(stop.as_str()) {
            text.truncate(index);
        }
    }

    Ok(Completion {
        text,
        finish_reason,
        prompt_tokens: session.prompt_len(),
        generated_tokens: session.generated_tokens(),
    })
}

/// Streams fragments into `on_token` and returns how generation ended.
///
/// A failure is returned as `Err` after every fragment produced before it has
/// been delivered.
pub fn for_each_token<M: Model, F: FnMut(&str)>(
    session: &mut Session<'_, M>,
    prompt: &str,
    options: &GenerationOptions,
    mut on_token: F,
) -> Result<FinishReason, SessionError> {
    let mut tokens = stream(session, prompt, options)?;
    for item in tokens.by_ref() {
        on_token(&item?);
    }
    Ok(tokens
        .finish_reason()
        .cloned()
        .unwrap_or(FinishReason::EndOfGeneration))
}
