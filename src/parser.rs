//! The streaming parser: a resumable, single-pass pushdown interpreter over
//! a compiled [`Grammar`].
//!
//! A [`ParseState`] owns an explicit stack of tagged frames. The base of the
//! stack is always an RTN frame; a GLA frame sits on top of an RTN frame
//! while a lookahead decision is pending, and an IntFA frame sits on top of
//! either while a terminal is being lexed. Bytes pushed into
//! [`ParseState::parse`] flow through the lexer with maximal munch, through
//! the lookahead automaton when the current state needs more than one
//! terminal to decide, and finally into the RTN, firing the host's
//! [`ParseEvents`] callbacks in strict source order.
//!
//! The state buffers every byte from the start of the open terminal onward,
//! so a pending lookahead decision can rewind and re-lex without any
//! cooperation from the host, and input may be chunked arbitrarily.
use std::ops::ControlFlow;
use std::sync::Arc;

use displaydoc::Display;

use crate::config::Config;
use crate::grammar::{
    GlaDecision, GlaId, Grammar, IntFaId, Lookahead, RtnLabel, RuleId, StateId, TerminalId,
};

/// A position in the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset {
    /// 0-based byte offset.
    pub byte: usize,
    /// 1-based line number. CR, LF and CRLF each end one line.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
}

impl Default for Offset {
    fn default() -> Self {
        Self {
            byte: 0,
            line: 1,
            column: 1,
        }
    }
}

fn bump_offset(offset: &mut Offset, last_was_cr: &mut bool, byte: u8) {
    offset.byte += 1;
    match byte {
        b'\r' => {
            offset.line += 1;
            offset.column = 1;
            *last_was_cr = true;
        }
        b'\n' => {
            if !*last_was_cr {
                offset.line += 1;
            }
            offset.column = 1;
            *last_was_cr = false;
        }
        _ => {
            offset.column += 1;
            *last_was_cr = false;
        }
    }
}

/// A terminal delivered to (or rejected in front of) the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalEvent<'a> {
    /// The terminal id.
    pub terminal: TerminalId,
    /// The terminal's name.
    pub name: &'a str,
    /// Where the terminal's text starts.
    pub offset: Offset,
    /// The terminal's text.
    pub text: &'a [u8],
    /// The slot name of the transition that consumed the terminal.
    pub slot_name: &'a str,
    /// The slot number of the transition that consumed the terminal.
    pub slotnum: u32,
}

/// A rule boundary delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleEvent<'a> {
    /// The rule id.
    pub rule: RuleId,
    /// The rule's name.
    pub name: &'a str,
    /// Where the rule started.
    pub offset: Offset,
    /// The slot name under which this rule hangs off its parent, if any.
    pub slot_name: Option<&'a str>,
    /// The slot number under which this rule hangs off its parent, if any.
    pub slotnum: Option<u32>,
}

/// The host's side of a parse: called back for every grammar event, in
/// strict left-to-right source order. All methods have no-op defaults.
/// Returning [`ControlFlow::Break`] from a callback cancels the parse at
/// the next terminal boundary.
pub trait ParseEvents {
    /// A rule was entered.
    fn start_rule(&mut self, _event: &RuleEvent) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
    /// A rule was completed.
    fn end_rule(&mut self, _event: &RuleEvent) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
    /// A terminal was consumed.
    fn terminal(&mut self, _event: &TerminalEvent) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
    /// No terminal can start with (or continue through) this byte.
    fn error_char(&mut self, _offset: Offset, _byte: u8) {}
    /// A well-formed terminal arrived where the grammar does not allow it.
    fn error_terminal(&mut self, _event: &TerminalEvent) {}
}

/// An event sink that discards every event, for hosts that only want the
/// final status.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl ParseEvents for NullEvents {}

/// The result of a successful [`ParseState::parse`] call.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseOutcome {
    /// The buffer was fully consumed and the parse can accept more input.
    Ongoing,
    /// The start rule is complete; any further input would be an error.
    Finished,
}

/// The error type for [`ParseState::parse`] and
/// [`ParseState::finish_parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// No transition accepts the input; the state is positioned before the
    /// offending byte or terminal and may be resumed with different input.
    #[error("parse error at byte {}, line {}, column {}", .0.byte, .0.line, .0.column)]
    Syntax(Offset),
    /// A callback requested cancellation; the state is no longer usable.
    #[error("the parse was cancelled by a callback")]
    Cancelled,
    /// The parse stack outgrew the configured limit.
    #[error("the parse stack exceeded {0} frames")]
    StackLimitExceeded(usize),
    /// A lookahead decision buffered more terminals than the limit allows.
    #[error("lookahead buffered more than {0} terminals")]
    LookaheadLimitExceeded(usize),
    /// The input ended inside an unfinished terminal, lookahead or rule.
    #[error("the input ended inside an unfinished construct")]
    PrematureEof,
}

#[derive(Debug, Clone, Copy)]
struct RtnFrame {
    rule: RuleId,
    state: StateId,
    /// The decision a popped GLA left behind for the next dispatch.
    pending: Option<GlaDecision>,
    /// Slot attribution of the call transition that created this frame.
    slot: Option<(u32, u32)>,
    start: Offset,
}

#[derive(Debug, Clone, Copy)]
struct GlaFrame {
    gla: GlaId,
    state: StateId,
    /// Window position where lookahead began.
    start_cursor: usize,
    /// Terminals buffered since the GLA was entered.
    buffered: usize,
    /// The first buffered terminal and its window span. When the decision
    /// arrives this terminal is applied as lexed; only the bytes after it
    /// are re-lexed against the post-decision states.
    first_terminal: Option<(TerminalId, usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct IntFaFrame {
    intfa: IntFaId,
    state: StateId,
    /// Window position where the open terminal starts.
    start_cursor: usize,
    /// Last accepting state seen: the terminal and the window position just
    /// past its text (maximal munch rewinds to it).
    last_final: Option<(TerminalId, usize)>,
}

#[derive(Debug, Clone, Copy, strum::Display)]
enum Frame {
    Rtn(RtnFrame),
    Gla(GlaFrame),
    IntFa(IntFaFrame),
}

/// A resumable parse over one input stream.
///
/// Create one per input with [`ParseState::new`], feed bytes with
/// [`ParseState::parse`] and close out with [`ParseState::finish_parse`].
/// A state may be cloned at any point to fork a speculative parse; the
/// grammar is shared, the stack and buffers are duplicated.
#[derive(Debug, Clone)]
pub struct ParseState {
    grammar: Arc<Grammar>,
    config: Config,
    stack: Vec<Frame>,
    /// Unconsumed bytes from the start of the open terminal onward.
    window: Vec<u8>,
    /// Lex position within `window`.
    cursor: usize,
    /// Offset of `window[0]`.
    window_offset: Offset,
    window_offset_cr: bool,
    /// Offset of `window[cursor]`.
    offset: Offset,
    last_was_cr: bool,
    started: bool,
    finished: bool,
    cancelled: bool,
}

impl ParseState {
    /// Create a parse state with the default [`Config`] limits.
    pub fn new(grammar: Arc<Grammar>) -> Self {
        Self::with_config(grammar, Config::default())
    }

    /// Create a parse state with explicit limits.
    pub fn with_config(grammar: Arc<Grammar>, config: Config) -> Self {
        let start = grammar.start_rule();
        Self {
            grammar,
            config,
            stack: vec![Frame::Rtn(RtnFrame {
                rule: start,
                state: StateId(0),
                pending: None,
                slot: None,
                start: Offset::default(),
            })],
            window: Vec::new(),
            cursor: 0,
            window_offset: Offset::default(),
            window_offset_cr: false,
            offset: Offset::default(),
            last_was_cr: false,
            started: false,
            finished: false,
            cancelled: false,
        }
    }

    /// The furthest successfully parsed position.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// The position of the open terminal's first byte. Bytes from here on
    /// are retained inside the state because a pending lookahead decision
    /// may need to re-lex them.
    pub fn open_terminal_offset(&self) -> Offset {
        self.window_offset
    }

    /// The grammar this state parses against.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Feed a chunk of input.
    ///
    /// On [`ParseOutcome::Ongoing`] the whole buffer was consumed and the
    /// state is ready for more input (or for [`ParseState::finish_parse`]).
    /// On [`ParseOutcome::Finished`] the start rule is complete and the
    /// remaining input was rejected without being consumed.
    ///
    /// # Errors
    ///
    /// See [`ParseError`]. After a [`ParseError::Syntax`] error the state is
    /// positioned before the offending input and can be fed different bytes.
    pub fn parse(
        &mut self,
        buf: &[u8],
        events: &mut impl ParseEvents,
    ) -> Result<ParseOutcome, ParseError> {
        if self.cancelled {
            return Err(ParseError::Cancelled);
        }
        if self.finished {
            return Ok(ParseOutcome::Finished);
        }
        self.window.extend_from_slice(buf);
        self.run(events, false).map(|outcome| {
            if let ParseOutcome::Finished = outcome {
                // The tail was reported unconsumed; drop it so a subsequent
                // finish sees a clean stream.
                self.window.truncate(self.cursor);
            }
            outcome
        })
    }

    /// Close out the parse: resolves pending lookahead with end-of-input,
    /// unwinds the stack firing the remaining [`ParseEvents::end_rule`]
    /// callbacks, and verifies the start rule ended in a final state.
    ///
    /// # Errors
    ///
    /// [`ParseError::PrematureEof`] when input ended inside an unfinished
    /// terminal, lookahead or rule; other variants as for
    /// [`ParseState::parse`].
    pub fn finish_parse(&mut self, events: &mut impl ParseEvents) -> Result<(), ParseError> {
        if self.cancelled {
            return Err(ParseError::Cancelled);
        }
        if self.finished {
            return Ok(());
        }
        self.run(events, true)?;
        self.finished = true;
        Ok(())
    }

    fn recompute_offset(&mut self) {
        let mut offset = self.window_offset;
        let mut cr = self.window_offset_cr;
        for &b in &self.window[..self.cursor] {
            bump_offset(&mut offset, &mut cr, b);
        }
        self.offset = offset;
        self.last_was_cr = cr;
    }

    fn rewind_to(&mut self, cursor: usize) {
        debug_assert!(cursor <= self.cursor);
        if cursor != self.cursor {
            self.cursor = cursor;
            self.recompute_offset();
        }
    }

    /// Drop committed bytes once nothing on the stack can ask to re-lex
    /// them.
    fn compact(&mut self) {
        let replay_needed = self
            .stack
            .iter()
            .any(|f| matches!(f, Frame::Gla(_)) || matches!(f, Frame::Rtn(r) if r.pending.is_some()));
        if !replay_needed && self.cursor > 0 {
            self.window.drain(..self.cursor);
            self.cursor = 0;
            self.window_offset = self.offset;
            self.window_offset_cr = self.last_was_cr;
        }
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), ParseError> {
        if self.stack.len() >= self.config.max_stack_depth {
            return Err(ParseError::StackLimitExceeded(self.config.max_stack_depth));
        }
        self.stack.push(frame);
        Ok(())
    }

    /// The rule whose ignore set is in effect: the topmost RTN frame.
    fn top_rule(&self) -> RuleId {
        self.stack
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Rtn(frame) => Some(frame.rule),
                _ => None,
            })
            .expect("the stack base is always an RTN frame")
    }

    fn check(&mut self, flow: ControlFlow<()>) -> Result<(), ParseError> {
        match flow {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => {
                self.cancelled = true;
                Err(ParseError::Cancelled)
            }
        }
    }

    fn fire_start_rule(
        &mut self,
        events: &mut impl ParseEvents,
        frame: &RtnFrame,
    ) -> Result<(), ParseError> {
        let grammar = Arc::clone(&self.grammar);
        let event = RuleEvent {
            rule: frame.rule,
            name: grammar.rule_str(frame.rule).unwrap_or("<unknown>"),
            offset: frame.start,
            slot_name: frame
                .slot
                .map(|(name, _)| grammar.str(sym(name)).unwrap_or("<unknown>")),
            slotnum: frame.slot.map(|(_, num)| num),
        };
        let flow = events.start_rule(&event);
        self.check(flow)
    }

    fn fire_end_rule(
        &mut self,
        events: &mut impl ParseEvents,
        frame: &RtnFrame,
    ) -> Result<(), ParseError> {
        let grammar = Arc::clone(&self.grammar);
        let event = RuleEvent {
            rule: frame.rule,
            name: grammar.rule_str(frame.rule).unwrap_or("<unknown>"),
            offset: frame.start,
            slot_name: frame
                .slot
                .map(|(name, _)| grammar.str(sym(name)).unwrap_or("<unknown>")),
            slotnum: frame.slot.map(|(_, num)| num),
        };
        let flow = events.end_rule(&event);
        self.check(flow)
    }

    fn run(
        &mut self,
        events: &mut impl ParseEvents,
        at_eof: bool,
    ) -> Result<ParseOutcome, ParseError> {
        let grammar = Arc::clone(&self.grammar);
        if !self.started {
            self.started = true;
            if let Frame::Rtn(frame) = self.stack[0] {
                self.fire_start_rule(events, &frame)?;
            }
        }
        loop {
            let top = match self.stack.last() {
                Some(&top) => top,
                None => {
                    // Only finish_parse unwinds the base frame.
                    return Ok(ParseOutcome::Finished);
                }
            };
            match top {
                Frame::IntFa(frame) => {
                    if let Some(step) = self.lex_step(events, &grammar, frame, at_eof)? {
                        return Ok(step);
                    }
                }
                Frame::Gla(frame) => {
                    let gla = grammar.gla(frame.gla);
                    let state = gla.state(frame.state);
                    if let Some(decision) = state.decision {
                        self.stack.pop();
                        self.resolve_gla_decision(events, &grammar, frame, decision)?;
                        continue;
                    }
                    if self.cursor < self.window.len() {
                        match state.intfa() {
                            Some(intfa) => {
                                self.push_frame(Frame::IntFa(IntFaFrame {
                                    intfa,
                                    state: StateId(0),
                                    start_cursor: self.cursor,
                                    last_final: None,
                                }))?;
                            }
                            None => {
                                // Only end-of-input can advance this state.
                                let byte = self.window[self.cursor];
                                events.error_char(self.offset, byte);
                                self.window.truncate(self.cursor);
                                return Err(ParseError::Syntax(self.offset));
                            }
                        }
                    } else if at_eof {
                        match gla.step(frame.state, Lookahead::Eof) {
                            Some(next) if gla.state(next).decision.is_some() => {
                                match self.stack.last_mut() {
                                    Some(Frame::Gla(f)) => f.state = next,
                                    _ => unreachable!(),
                                }
                            }
                            _ => return Err(ParseError::PrematureEof),
                        }
                    } else {
                        return Ok(ParseOutcome::Ongoing);
                    }
                }
                Frame::Rtn(frame) => {
                    if let Some(step) = self.rtn_step(events, &grammar, frame, at_eof)? {
                        return Ok(step);
                    }
                }
            }
        }
    }

    /// One decision point for the RTN frame on top of the stack. Returns
    /// `Some(outcome)` when the parse must suspend.
    fn rtn_step(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        frame: RtnFrame,
        at_eof: bool,
    ) -> Result<Option<ParseOutcome>, ParseError> {
        let rtn = grammar.rtn(frame.rule);
        let state = rtn.state(frame.state);
        let transitions = rtn.transitions_of(frame.state);

        if let Some(decision) = frame.pending {
            match self.stack.last_mut() {
                Some(Frame::Rtn(f)) => f.pending = None,
                _ => unreachable!(),
            }
            match decision {
                GlaDecision::Return => {
                    self.pop_rule(events)?;
                    return Ok(None);
                }
                GlaDecision::Take(k) => {
                    let transition = transitions[k as usize];
                    match transition.label {
                        RtnLabel::Rule(_) => {
                            self.enter_rule(events, frame.rule, k)?;
                            return Ok(None);
                        }
                        RtnLabel::Terminal(_) => {
                            // The terminal still has to be lexed; the state
                            // carries a lexer for its own terminal labels,
                            // and the restored pending decision claims the
                            // result.
                            match self.stack.last_mut() {
                                Some(Frame::Rtn(f)) => f.pending = Some(decision),
                                _ => unreachable!(),
                            }
                            match state.intfa() {
                                Some(intfa) => {
                                    if self.cursor >= self.window.len() && at_eof {
                                        return Err(ParseError::PrematureEof);
                                    }
                                    if self.cursor >= self.window.len() {
                                        return Ok(Some(ParseOutcome::Ongoing));
                                    }
                                    self.push_frame(Frame::IntFa(IntFaFrame {
                                        intfa,
                                        state: StateId(0),
                                        start_cursor: self.cursor,
                                        last_final: None,
                                    }))?;
                                    return Ok(None);
                                }
                                None => {
                                    // Only a corrupt image lacks the lexer.
                                    return Err(ParseError::Syntax(self.offset));
                                }
                            }
                        }
                    }
                }
            }
        }

        // Dead final state: the rule (or the whole parse) can only end here.
        if state.is_final && transitions.is_empty() {
            if self.stack.len() == 1 {
                if self.cursor < self.window.len() {
                    if state.intfa().is_some() {
                        // Trailing ignorable input may still be discarded.
                    } else {
                        return Ok(Some(ParseOutcome::Finished));
                    }
                } else if at_eof {
                    self.pop_rule(events)?;
                    return Ok(None);
                } else {
                    return Ok(Some(ParseOutcome::Ongoing));
                }
            } else {
                self.pop_rule(events)?;
                return Ok(None);
            }
        }

        if let Some(gla) = state.gla() {
            self.push_frame(Frame::Gla(GlaFrame {
                gla,
                state: StateId(0),
                start_cursor: self.cursor,
                buffered: 0,
                first_terminal: None,
            }))?;
            return Ok(None);
        }

        if let Some(intfa) = state.intfa() {
            if self.cursor >= self.window.len() {
                if at_eof {
                    return self.rtn_step_at_eof(events, frame);
                }
                return Ok(Some(ParseOutcome::Ongoing));
            }
            self.push_frame(Frame::IntFa(IntFaFrame {
                intfa,
                state: StateId(0),
                start_cursor: self.cursor,
                last_final: None,
            }))?;
            return Ok(None);
        }

        // No lexer and not a dead end: the single remaining possibility in a
        // well-formed grammar is an unconditional rule call.
        if transitions.len() == 1 {
            if let RtnLabel::Rule(_) = transitions[0].label {
                self.enter_rule(events, frame.rule, 0)?;
                return Ok(None);
            }
        }
        if at_eof {
            return self.rtn_step_at_eof(events, frame);
        }
        if self.cursor < self.window.len() {
            let byte = self.window[self.cursor];
            events.error_char(self.offset, byte);
            self.window.truncate(self.cursor);
            return Err(ParseError::Syntax(self.offset));
        }
        Ok(Some(ParseOutcome::Ongoing))
    }

    /// End-of-input handling for an RTN frame with no bytes left.
    fn rtn_step_at_eof(
        &mut self,
        events: &mut impl ParseEvents,
        frame: RtnFrame,
    ) -> Result<Option<ParseOutcome>, ParseError> {
        let grammar = Arc::clone(&self.grammar);
        let rtn = grammar.rtn(frame.rule);
        if rtn.state(frame.state).is_final {
            self.pop_rule(events)?;
            return Ok(None);
        }
        // A lone rule call may still complete through a nullable callee.
        let transitions = rtn.transitions_of(frame.state);
        if transitions.len() == 1 && rtn.state(frame.state).intfa().is_none() {
            if let RtnLabel::Rule(_) = transitions[0].label {
                self.enter_rule(events, frame.rule, 0)?;
                return Ok(None);
            }
        }
        Err(ParseError::PrematureEof)
    }

    /// Follow a rule-call transition: advance the caller past the call and
    /// push the callee's frame.
    fn enter_rule(
        &mut self,
        events: &mut impl ParseEvents,
        rule: RuleId,
        transition_index: u32,
    ) -> Result<(), ParseError> {
        let grammar = Arc::clone(&self.grammar);
        let transition = grammar.rtn(rule).transitions_of(match self.stack.last() {
            Some(Frame::Rtn(f)) => f.state,
            _ => unreachable!(),
        })[transition_index as usize];
        let callee = match transition.label {
            RtnLabel::Rule(callee) => callee,
            RtnLabel::Terminal(_) => unreachable!("enter_rule is only called for rule labels"),
        };
        match self.stack.last_mut() {
            Some(Frame::Rtn(f)) => f.state = transition.target,
            _ => unreachable!(),
        }
        let frame = RtnFrame {
            rule: callee,
            state: StateId(0),
            pending: None,
            slot: Some((sym_index(transition.slot_name), transition.slotnum)),
            start: self.offset,
        };
        self.push_frame(Frame::Rtn(frame))?;
        self.fire_start_rule(events, &frame)
    }

    fn pop_rule(&mut self, events: &mut impl ParseEvents) -> Result<(), ParseError> {
        let frame = match self.stack.pop() {
            Some(Frame::Rtn(frame)) => frame,
            _ => unreachable!("pop_rule pops an RTN frame"),
        };
        self.fire_end_rule(events, &frame)
    }

    /// One byte of lexing for the IntFA frame on top of the stack. Returns
    /// `Some(outcome)` when the parse must suspend.
    fn lex_step(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        frame: IntFaFrame,
        at_eof: bool,
    ) -> Result<Option<ParseOutcome>, ParseError> {
        let intfa = grammar.intfa(frame.intfa);
        if self.cursor >= self.window.len() {
            if !at_eof {
                return Ok(Some(ParseOutcome::Ongoing));
            }
            // End of input closes the open terminal.
            if self.cursor == frame.start_cursor {
                self.stack.pop();
                return Ok(None);
            }
            return match frame.last_final {
                Some((terminal, end)) => {
                    self.stack.pop();
                    self.rewind_to(end);
                    self.dispatch_terminal(events, terminal, frame.start_cursor, end)?;
                    Ok(None)
                }
                None => Err(ParseError::PrematureEof),
            };
        }
        let byte = self.window[self.cursor];
        match intfa.step(frame.state, byte) {
            Some(next) => {
                bump_offset(&mut self.offset, &mut self.last_was_cr, byte);
                self.cursor += 1;
                let accept = intfa.state(next).accept;
                match self.stack.last_mut() {
                    Some(Frame::IntFa(f)) => {
                        f.state = next;
                        if let Some(terminal) = accept {
                            f.last_final = Some((terminal, self.cursor));
                        }
                    }
                    _ => unreachable!(),
                }
                Ok(None)
            }
            None => match frame.last_final {
                Some((terminal, end)) => {
                    self.stack.pop();
                    self.rewind_to(end);
                    self.dispatch_terminal(events, terminal, frame.start_cursor, end)?;
                    Ok(None)
                }
                None => {
                    // Report the byte no terminal could get past; the state
                    // stays positioned right before it.
                    events.error_char(self.offset, byte);
                    self.window.truncate(self.cursor);
                    self.stack.pop();
                    Err(ParseError::Syntax(self.offset))
                }
            },
        }
    }

    /// Route a freshly lexed terminal: discard it if ignored, advance a
    /// pending lookahead, or apply it to the RTN.
    fn dispatch_terminal(
        &mut self,
        events: &mut impl ParseEvents,
        terminal: TerminalId,
        start: usize,
        end: usize,
    ) -> Result<(), ParseError> {
        let grammar = Arc::clone(&self.grammar);
        let top_rule = self.top_rule();
        if grammar.rtn(top_rule).is_ignored(terminal) {
            self.compact();
            return Ok(());
        }
        match self.stack.last().copied() {
            Some(Frame::Gla(_)) => self.feed_gla(events, &grammar, terminal, start, end),
            Some(Frame::Rtn(_)) => self.apply_terminal(events, &grammar, terminal, start, end),
            _ => unreachable!("an IntFA frame sits on a GLA or RTN frame"),
        }
    }

    /// Apply a decided lookahead: the first buffered terminal takes the
    /// decided transition and the bytes after it are re-lexed.
    fn resolve_gla_decision(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        frame: GlaFrame,
        decision: GlaDecision,
    ) -> Result<(), ParseError> {
        let rtn_frame = match self.stack.last().copied() {
            Some(Frame::Rtn(f)) => f,
            _ => unreachable!("a GLA frame always sits on an RTN frame"),
        };
        match frame.first_terminal {
            None => {
                // Decided before any terminal was buffered; the next lex
                // settles it through the pending-decision path.
                self.rewind_to(frame.start_cursor);
                match self.stack.last_mut() {
                    Some(Frame::Rtn(f)) => f.pending = Some(decision),
                    _ => unreachable!(),
                }
                Ok(())
            }
            Some((terminal, start, end)) => {
                self.rewind_to(end);
                match decision {
                    GlaDecision::Return => {
                        self.pop_rule(events)?;
                        self.apply_terminal(events, grammar, terminal, start, end)
                    }
                    GlaDecision::Take(k) => {
                        let transition =
                            grammar.rtn(rtn_frame.rule).transitions_of(rtn_frame.state)
                                [k as usize];
                        match transition.label {
                            RtnLabel::Rule(_) => {
                                self.enter_rule(events, rtn_frame.rule, k)?;
                                self.apply_terminal(events, grammar, terminal, start, end)
                            }
                            RtnLabel::Terminal(_) => self.consume_terminal(
                                events,
                                grammar,
                                terminal,
                                start,
                                end,
                                rtn_frame.rule,
                                k,
                                transition.target,
                            ),
                        }
                    }
                }
            }
        }
    }

    /// Apply a terminal to the topmost RTN frame, popping finished rules on
    /// the way up the stack.
    fn apply_terminal(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        terminal: TerminalId,
        start: usize,
        end: usize,
    ) -> Result<(), ParseError> {
        loop {
            let frame = match self.stack.last().copied() {
                Some(Frame::Rtn(frame)) => frame,
                _ => unreachable!("terminals apply to RTN frames"),
            };
            let rtn = grammar.rtn(frame.rule);
            let state = rtn.state(frame.state);
            let transitions = rtn.transitions_of(frame.state);

            if let Some(GlaDecision::Take(k)) = frame.pending {
                match self.stack.last_mut() {
                    Some(Frame::Rtn(f)) => f.pending = None,
                    _ => unreachable!(),
                }
                let transition = transitions[k as usize];
                return self.consume_terminal(events, grammar, terminal, start, end, frame.rule, k, transition.target);
            }

            // Fresh dispatch against this state.
            if let Some(gla) = state.gla() {
                self.push_frame(Frame::Gla(GlaFrame {
                    gla,
                    state: StateId(0),
                    start_cursor: start,
                    buffered: 0,
                    first_terminal: None,
                }))?;
                return self.feed_gla(events, grammar, terminal, start, end);
            }
            if let Some(index) = transitions
                .iter()
                .position(|t| t.label == RtnLabel::Terminal(terminal))
            {
                let target = transitions[index].target;
                return self.consume_terminal(
                    events,
                    grammar,
                    terminal,
                    start,
                    end,
                    frame.rule,
                    index as u32,
                    target,
                );
            }
            if transitions.len() == 1 && state.intfa().is_none() && !state.is_final {
                if let RtnLabel::Rule(_) = transitions[0].label {
                    self.enter_rule(events, frame.rule, 0)?;
                    continue;
                }
            }
            if state.is_final && self.stack.len() > 1 {
                self.pop_rule(events)?;
                continue;
            }
            self.rewind_to(start);
            return self.reject_terminal(events, grammar, terminal, start, end);
        }
    }

    /// Advance the GLA frame on top of the stack with an in-hand terminal.
    fn feed_gla(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        terminal: TerminalId,
        start: usize,
        end: usize,
    ) -> Result<(), ParseError> {
        let frame = match self.stack.last().copied() {
            Some(Frame::Gla(frame)) => frame,
            _ => unreachable!(),
        };
        let gla = grammar.gla(frame.gla);
        match gla.step(frame.state, Lookahead::Terminal(terminal)) {
            Some(next) => {
                let buffered = frame.buffered + 1;
                if buffered > self.config.max_lookahead {
                    return Err(ParseError::LookaheadLimitExceeded(self.config.max_lookahead));
                }
                match self.stack.last_mut() {
                    Some(Frame::Gla(f)) => {
                        f.state = next;
                        f.buffered = buffered;
                        if f.first_terminal.is_none() {
                            f.first_terminal = Some((terminal, start, end));
                        }
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            None => {
                self.rewind_to(start);
                self.reject_terminal(events, grammar, terminal, start, end)
            }
        }
    }

    /// Fire the terminal callback and advance the RTN past it.
    #[allow(clippy::too_many_arguments)]
    fn consume_terminal(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        terminal: TerminalId,
        start: usize,
        end: usize,
        rule: RuleId,
        transition_index: u32,
        target: StateId,
    ) -> Result<(), ParseError> {
        let transition =
            grammar.rtn(rule).transitions_of(match self.stack.last() {
                Some(Frame::Rtn(f)) => f.state,
                _ => unreachable!(),
            })[transition_index as usize];
        debug_assert_eq!(transition.label, RtnLabel::Terminal(terminal));
        let (start_offset, _) = self.offset_at(start);
        {
            let event = TerminalEvent {
                terminal,
                name: grammar.terminal_str(terminal).unwrap_or("<unknown>"),
                offset: start_offset,
                text: &self.window[start..end],
                slot_name: grammar
                    .str(transition.slot_name)
                    .unwrap_or("<unknown>"),
                slotnum: transition.slotnum,
            };
            let flow = events.terminal(&event);
            self.check(flow)?;
        }
        match self.stack.last_mut() {
            Some(Frame::Rtn(f)) => f.state = target,
            _ => unreachable!(),
        }
        self.compact();
        Ok(())
    }

    fn offset_at(&self, pos: usize) -> (Offset, bool) {
        let mut offset = self.window_offset;
        let mut cr = self.window_offset_cr;
        for &b in &self.window[..pos] {
            bump_offset(&mut offset, &mut cr, b);
        }
        (offset, cr)
    }

    /// A well-formed terminal the grammar cannot accept here: report it and
    /// leave the state positioned before its text.
    fn reject_terminal(
        &mut self,
        events: &mut impl ParseEvents,
        grammar: &Grammar,
        terminal: TerminalId,
        start: usize,
        end: usize,
    ) -> Result<(), ParseError> {
        let (offset, _) = self.offset_at(start);
        {
            let event = TerminalEvent {
                terminal,
                name: grammar.terminal_str(terminal).unwrap_or("<unknown>"),
                offset,
                text: &self.window[start..end],
                slot_name: "",
                slotnum: 0,
            };
            events.error_terminal(&event);
        }
        self.window.truncate(start);
        Err(ParseError::Syntax(offset))
    }
}

fn sym_index(sym: crate::grammar::Sym) -> u32 {
    use string_interner::Symbol;
    sym.to_usize() as u32
}

fn sym(index: u32) -> crate::grammar::Sym {
    use string_interner::Symbol;
    crate::grammar::Sym::try_from_usize(index as usize).unwrap()
}
