//! Change event sources
//!
//! A source yields raw change events in stream order and can be positioned
//! after a sequence token on restart. Events carrying a token at or below
//! the resume token are not delivered; events without a token cannot be
//! positioned and are always delivered (they are rejected downstream).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use types::event::{ChangeEvent, RawChangeEvent, SequenceToken};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("undecodable event on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Ordered stream of raw change events.
pub trait ChangeSource: Send {
    /// Skip every event whose token is at or below `after`. `None` replays
    /// from the beginning.
    fn resume_from(&mut self, after: Option<SequenceToken>) -> Result<(), SourceError>;

    /// Next event, `None` at end of stream. A per-event error does not end
    /// the stream.
    fn next_event(&mut self) -> Option<Result<RawChangeEvent, SourceError>>;
}

fn is_covered(raw: &RawChangeEvent, after: Option<SequenceToken>) -> bool {
    match (raw.sequence_token, after) {
        (Some(token), Some(after)) => token <= after,
        _ => false,
    }
}

/// In-memory source over a fixed list of events.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    events: VecDeque<RawChangeEvent>,
    after: Option<SequenceToken>,
}

impl VecSource {
    pub fn new(events: Vec<RawChangeEvent>) -> Self {
        Self {
            events: events.into(),
            after: None,
        }
    }

    pub fn from_events(events: &[ChangeEvent]) -> Self {
        Self::new(events.iter().map(RawChangeEvent::from).collect())
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl ChangeSource for VecSource {
    fn resume_from(&mut self, after: Option<SequenceToken>) -> Result<(), SourceError> {
        self.after = after;
        Ok(())
    }

    fn next_event(&mut self) -> Option<Result<RawChangeEvent, SourceError>> {
        while let Some(raw) = self.events.pop_front() {
            if !is_covered(&raw, self.after) {
                return Some(Ok(raw));
            }
        }
        None
    }
}

/// Source reading one JSON object per line. Blank lines are ignored.
pub struct JsonLinesSource {
    reader: Box<dyn BufRead + Send>,
    line: usize,
    after: Option<SequenceToken>,
}

impl JsonLinesSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            line: 0,
            after: None,
        }
    }

    /// Lines consumed so far.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl ChangeSource for JsonLinesSource {
    fn resume_from(&mut self, after: Option<SequenceToken>) -> Result<(), SourceError> {
        self.after = after;
        Ok(())
    }

    fn next_event(&mut self) -> Option<Result<RawChangeEvent, SourceError>> {
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.reader.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawChangeEvent>(trimmed) {
                Ok(raw) if is_covered(&raw, self.after) => continue,
                Ok(raw) => return Some(Ok(raw)),
                Err(source) => {
                    return Some(Err(SourceError::Decode {
                        line: self.line,
                        source,
                    }))
                }
            }
        }
    }
}
