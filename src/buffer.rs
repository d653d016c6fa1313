//! The buffered reading convenience layer: drives a [`ParseState`] from any
//! [`Read`] implementation in fixed-size chunks.
use std::io::Read;

use crate::parser::{ParseError, ParseEvents, ParseOutcome, ParseState};

/// The error type for [`parse_reader`].
#[derive(Debug, thiserror::Error)]
pub enum StreamParseError {
    /// Reading the input failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The input ended while the parse still needed more of it.
    #[error("the input ended inside an unfinished construct")]
    PrematureEof,
    /// The parse itself failed.
    #[error(transparent)]
    Parse(ParseError),
}

impl From<ParseError> for StreamParseError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::PrematureEof => StreamParseError::PrematureEof,
            other => StreamParseError::Parse(other),
        }
    }
}

/// Pump a reader through `state` until end-of-input, then close the parse
/// with [`ParseState::finish_parse`]. `chunk_size` bounds how much is read
/// (and therefore buffered) at a time; the parse state itself retains only
/// the bytes from [`ParseState::open_terminal_offset`] onward.
///
/// # Errors
///
/// [`StreamParseError::Io`] for reader failures, [`StreamParseError::
/// PrematureEof`] when the input ends mid-construct, and
/// [`StreamParseError::Parse`] for everything the parser rejects.
pub fn parse_reader(
    state: &mut ParseState,
    mut reader: impl Read,
    events: &mut impl ParseEvents,
    chunk_size: usize,
) -> Result<(), StreamParseError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            state.finish_parse(events)?;
            return Ok(());
        }
        match state.parse(&buf[..n], events)? {
            ParseOutcome::Ongoing => {}
            ParseOutcome::Finished => {
                state.finish_parse(events)?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::grammar::Grammar;
    use crate::parser::NullEvents;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn reads_in_small_chunks() {
        let grammar = Arc::new(
            Grammar::compile(r#"s -> "hello" " " "world";"#, &Config::default()).unwrap(),
        );
        let mut state = ParseState::new(grammar);
        let mut events = NullEvents;
        parse_reader(&mut state, Cursor::new(b"hello world"), &mut events, 3).unwrap();
    }

    #[test]
    fn premature_end_is_reported() {
        let grammar =
            Arc::new(Grammar::compile(r#"s -> "ab" "cd";"#, &Config::default()).unwrap());
        let mut state = ParseState::new(grammar);
        let mut events = NullEvents;
        let err = parse_reader(&mut state, Cursor::new(b"ab"), &mut events, 16).unwrap_err();
        assert!(matches!(err, StreamParseError::PrematureEof));
    }
}
