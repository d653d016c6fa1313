//! The grammar bytecode image: serialization of a compiled [`Grammar`] into
//! the `GH` container and the validating loader that rebuilds one.
//!
//! The container holds four top-level blocks: STRINGS (the deduplicated
//! string table, in index order), INTFAS (one INTFA subblock per lexical
//! automaton), RTNS (one RTN subblock per rule, the start rule first) and
//! GLAS (one GLA subblock per lookahead automaton). Every machine's state 0
//! is emitted first. Terminals are referenced by their name's string index.
//! Readers skip unknown blocks and records, so the reserved RTN_DECISION and
//! RTN_LOOKAHEAD codes are tolerated but never written.
use ahash::AHashMap;
use string_interner::Symbol;

use crate::bitstream::{AbbrevOp, BitstreamError, BitstreamReader, BitstreamWriter, Entry};
use crate::grammar::{
    pack_optional_index, Gla, GlaDecision, GlaState, GlaTransition, Grammar, IntFa, IntFaState,
    IntFaTransition, Interner, Lookahead, Rtn, RtnLabel, RtnState, RtnTransition, RuleId, StateId,
    Sym, TerminalId,
};

const MAGIC: &[u8; 2] = b"GH";

const BLOCK_INTFAS: u64 = 8;
const BLOCK_INTFA: u64 = 9;
const BLOCK_STRINGS: u64 = 10;
const BLOCK_RTNS: u64 = 11;
const BLOCK_RTN: u64 = 12;
const BLOCK_GLAS: u64 = 13;
const BLOCK_GLA: u64 = 14;

const REC_INTFA_STATE: u64 = 0;
const REC_INTFA_FINAL_STATE: u64 = 1;
const REC_INTFA_TRANSITION: u64 = 2;
const REC_INTFA_TRANSITION_RANGE: u64 = 3;

const REC_STRING: u64 = 0;

const REC_RTN_INFO: u64 = 0;
const REC_RTN_STATE: u64 = 1;
const REC_RTN_TRANSITION_TERMINAL: u64 = 2;
const REC_RTN_TRANSITION_NONTERM: u64 = 3;
const REC_RTN_DECISION: u64 = 4;
const REC_RTN_IGNORE: u64 = 5;
const REC_RTN_LOOKAHEAD: u64 = 6;

const REC_GLA_STATE: u64 = 0;
const REC_GLA_FINAL_STATE: u64 = 1;
const REC_GLA_TRANSITION: u64 = 2;

/// The error type for loading a grammar image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadGrammarError {
    /// The container structure itself is unreadable.
    #[error("corrupt grammar: {0}")]
    Container(String),
    /// A record referenced a string that is not in the table.
    #[error("corrupt grammar: string index {index} out of range in {record}")]
    BadStringIndex {
        /// The record kind carrying the reference.
        record: &'static str,
        /// The offending index.
        index: u64,
    },
    /// A transition targeted a state its machine does not have.
    #[error("corrupt grammar: state index {index} out of range in {record}")]
    BadStateIndex {
        /// The record kind carrying the reference.
        record: &'static str,
        /// The offending index.
        index: u64,
    },
    /// A record had fewer fields than its shape requires.
    #[error("corrupt grammar: {record} record is too short")]
    ShortRecord {
        /// The offending record kind.
        record: &'static str,
    },
    /// A record appeared before the record that must precede it.
    #[error("corrupt grammar: {record} record has nothing to attach to")]
    Misplaced {
        /// The offending record kind.
        record: &'static str,
    },
    /// The string table repeats an entry, breaking index assignment.
    #[error("corrupt grammar: duplicated string table entry {0:?}")]
    DuplicateString(String),
    /// A state referenced a lexical automaton that is not in the image.
    #[error("corrupt grammar: lexical automaton index {0} out of range")]
    BadIntFaIndex(u64),
    /// A state referenced a lookahead automaton that is not in the image.
    #[error("corrupt grammar: lookahead automaton index {0} out of range")]
    BadGlaIndex(u64),
    /// A call transition referenced a rule that is not in the image.
    #[error("corrupt grammar: rule index {0} out of range")]
    BadRtnIndex(u64),
    /// Declared transition counts disagree with the transitions present.
    #[error("corrupt grammar: transition counts do not add up in a {0} block")]
    TransitionMismatch(&'static str),
    /// A lookahead decision points at a transition the state does not have.
    #[error("corrupt grammar: lookahead decision {0} out of range")]
    BadDecision(u64),
    /// The image contains no rules at all.
    #[error("corrupt grammar: the image contains no rules")]
    NoRules,
    /// A machine block closed without declaring any state.
    #[error("corrupt grammar: a {0} block has no states")]
    EmptyMachine(&'static str),
}

impl From<BitstreamError> for LoadGrammarError {
    fn from(e: BitstreamError) -> Self {
        LoadGrammarError::Container(e.to_string())
    }
}

fn optional_index(plus_one: u64) -> Result<Option<u32>, LoadGrammarError> {
    if plus_one == 0 {
        Ok(None)
    } else {
        Ok(Some((plus_one - 1) as u32))
    }
}

impl Grammar {
    /// Serialize this grammar into its bytecode image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BitstreamWriter::new(MAGIC);

        writer.enter_subblock(BLOCK_STRINGS, 4);
        let string_abbrev =
            writer.define_abbrev(&[AbbrevOp::Literal(REC_STRING), AbbrevOp::Array, AbbrevOp::Fixed(8)]);
        for index in 0..self.strings.len() {
            let sym = Sym::try_from_usize(index).unwrap();
            let text = self.strings.resolve(sym).unwrap();
            let bytes: Vec<u64> = text.bytes().map(|b| b as u64).collect();
            writer.emit_record(string_abbrev, &bytes);
        }
        writer.end_block();

        writer.enter_subblock(BLOCK_INTFAS, 3);
        for intfa in &self.intfas {
            writer.enter_subblock(BLOCK_INTFA, 4);
            let state_abbrev =
                writer.define_abbrev(&[AbbrevOp::Literal(REC_INTFA_STATE), AbbrevOp::Vbr(6)]);
            let final_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_INTFA_FINAL_STATE),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
            ]);
            let trans_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_INTFA_TRANSITION),
                AbbrevOp::Fixed(8),
                AbbrevOp::Vbr(6),
            ]);
            let range_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_INTFA_TRANSITION_RANGE),
                AbbrevOp::Fixed(8),
                AbbrevOp::Fixed(8),
                AbbrevOp::Vbr(6),
            ]);
            for (index, state) in intfa.states.iter().enumerate() {
                let count = state.trans_count as u64;
                match state.accept {
                    None => writer.emit_record(state_abbrev, &[count]),
                    Some(terminal) => writer.emit_record(
                        final_abbrev,
                        &[count, self.terminals[terminal.0 as usize].to_usize() as u64],
                    ),
                }
                for transition in intfa.transitions_of(StateId(index as u32)) {
                    if transition.lo == transition.hi {
                        writer.emit_record(
                            trans_abbrev,
                            &[transition.lo as u64, transition.target.0 as u64],
                        );
                    } else {
                        writer.emit_record(
                            range_abbrev,
                            &[
                                transition.lo as u64,
                                transition.hi as u64,
                                transition.target.0 as u64,
                            ],
                        );
                    }
                }
            }
            writer.end_block();
        }
        writer.end_block();

        writer.enter_subblock(BLOCK_RTNS, 3);
        for rtn in &self.rtns {
            writer.enter_subblock(BLOCK_RTN, 4);
            let info_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_RTN_INFO),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
            ]);
            let ignore_abbrev =
                writer.define_abbrev(&[AbbrevOp::Literal(REC_RTN_IGNORE), AbbrevOp::Vbr(6)]);
            let state_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_RTN_STATE),
                AbbrevOp::Vbr(6),
                AbbrevOp::Fixed(1),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
            ]);
            let terminal_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_RTN_TRANSITION_TERMINAL),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
            ]);
            let nonterm_abbrev = writer.define_abbrev(&[
                AbbrevOp::Literal(REC_RTN_TRANSITION_NONTERM),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
                AbbrevOp::Vbr(6),
            ]);
            writer.emit_record(
                info_abbrev,
                &[rtn.name.to_usize() as u64, rtn.num_slots as u64],
            );
            for &terminal in &rtn.ignore {
                writer.emit_record(
                    ignore_abbrev,
                    &[self.terminals[terminal.0 as usize].to_usize() as u64],
                );
            }
            for (index, state) in rtn.states.iter().enumerate() {
                writer.emit_record(
                    state_abbrev,
                    &[
                        state.trans_count as u64,
                        state.is_final as u64,
                        state.intfa.map(|x| x.get() as u64 + 1).unwrap_or(0),
                        state.gla.map(|x| x.get() as u64 + 1).unwrap_or(0),
                    ],
                );
                for transition in rtn.transitions_of(StateId(index as u32)) {
                    let (abbrev, symbol) = match transition.label {
                        RtnLabel::Terminal(t) => (
                            terminal_abbrev,
                            self.terminals[t.0 as usize].to_usize() as u64,
                        ),
                        RtnLabel::Rule(r) => (nonterm_abbrev, r.0 as u64),
                    };
                    writer.emit_record(
                        abbrev,
                        &[
                            symbol,
                            transition.target.0 as u64,
                            transition.slot_name.to_usize() as u64,
                            transition.slotnum as u64,
                        ],
                    );
                }
            }
            writer.end_block();
        }
        writer.end_block();

        if !self.glas.is_empty() {
            writer.enter_subblock(BLOCK_GLAS, 3);
            for gla in &self.glas {
                writer.enter_subblock(BLOCK_GLA, 4);
                let state_abbrev = writer.define_abbrev(&[
                    AbbrevOp::Literal(REC_GLA_STATE),
                    AbbrevOp::Vbr(6),
                    AbbrevOp::Vbr(6),
                ]);
                let final_abbrev = writer.define_abbrev(&[
                    AbbrevOp::Literal(REC_GLA_FINAL_STATE),
                    AbbrevOp::Vbr(6),
                    AbbrevOp::Vbr(6),
                ]);
                let trans_abbrev = writer.define_abbrev(&[
                    AbbrevOp::Literal(REC_GLA_TRANSITION),
                    AbbrevOp::Vbr(6),
                    AbbrevOp::Vbr(6),
                ]);
                for (index, state) in gla.states.iter().enumerate() {
                    match state.decision {
                        None => writer.emit_record(
                            state_abbrev,
                            &[
                                state.trans_count as u64,
                                state.intfa.map(|x| x.get() as u64 + 1).unwrap_or(0),
                            ],
                        ),
                        Some(decision) => {
                            let code = match decision {
                                GlaDecision::Return => 0,
                                GlaDecision::Take(k) => k as u64 + 1,
                            };
                            writer.emit_record(final_abbrev, &[state.trans_count as u64, code]);
                        }
                    }
                    for transition in gla.transitions_of(StateId(index as u32)) {
                        let on = match transition.on {
                            Lookahead::Eof => 0,
                            Lookahead::Terminal(t) => {
                                self.terminals[t.0 as usize].to_usize() as u64 + 1
                            }
                        };
                        writer.emit_record(trans_abbrev, &[on, transition.target.0 as u64]);
                    }
                }
                writer.end_block();
            }
            writer.end_block();
        }

        writer.finish()
    }

    /// Load a grammar from its bytecode image.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadGrammarError`] naming the offending structure when the
    /// image is truncated or internally inconsistent. Unknown blocks and
    /// record codes are skipped (with a warning), not rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Grammar, LoadGrammarError> {
        let mut reader = BitstreamReader::new(data, MAGIC)?;
        let mut loader = Loader::default();
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EnterBlock(BLOCK_STRINGS) => loader.read_strings(&mut reader)?,
                Entry::EnterBlock(BLOCK_INTFAS) => loader.read_intfas(&mut reader)?,
                Entry::EnterBlock(BLOCK_RTNS) => loader.read_rtns(&mut reader)?,
                Entry::EnterBlock(BLOCK_GLAS) => loader.read_glas(&mut reader)?,
                Entry::EnterBlock(other) => {
                    log::warn!("skipping unknown top-level block {}", other);
                    reader.skip_block()?;
                }
                Entry::Record { code, .. } => {
                    log::warn!("ignoring stray top-level record {}", code);
                }
                Entry::EndBlock => {
                    return Err(LoadGrammarError::Container(
                        "unexpected top-level END_BLOCK".to_string(),
                    ))
                }
            }
        }
        loader.finish()
    }
}

#[derive(Default)]
struct Loader {
    strings: Interner,
    terminals: Vec<Sym>,
    terminal_by_str: AHashMap<usize, TerminalId>,
    intfas: Vec<IntFa>,
    rtns: Vec<Rtn>,
    glas: Vec<Gla>,
}

impl Loader {
    fn string_sym(&self, record: &'static str, index: u64) -> Result<Sym, LoadGrammarError> {
        if (index as usize) < self.strings.len() {
            Ok(Sym::try_from_usize(index as usize).unwrap())
        } else {
            Err(LoadGrammarError::BadStringIndex { record, index })
        }
    }

    fn terminal(
        &mut self,
        record: &'static str,
        str_index: u64,
    ) -> Result<TerminalId, LoadGrammarError> {
        let sym = self.string_sym(record, str_index)?;
        if let Some(&id) = self.terminal_by_str.get(&(str_index as usize)) {
            return Ok(id);
        }
        let id = TerminalId(self.terminals.len() as u32);
        self.terminals.push(sym);
        self.terminal_by_str.insert(str_index as usize, id);
        Ok(id)
    }

    fn read_strings(&mut self, reader: &mut BitstreamReader) -> Result<(), LoadGrammarError> {
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => return Ok(()),
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside STRINGS", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, fields } if code == REC_STRING => {
                    let bytes: Vec<u8> = fields.iter().map(|&b| b as u8).collect();
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    let expected = self.strings.len();
                    let sym = self.strings.get_or_intern(&text);
                    if sym.to_usize() != expected {
                        return Err(LoadGrammarError::DuplicateString(text));
                    }
                }
                Entry::Record { code, .. } => {
                    log::warn!("skipping unknown STRINGS record {}", code);
                }
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_intfas(&mut self, reader: &mut BitstreamReader) -> Result<(), LoadGrammarError> {
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => return Ok(()),
                Entry::EnterBlock(id) if id == BLOCK_INTFA => {
                    let intfa = self.read_intfa(reader)?;
                    self.intfas.push(intfa);
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside INTFAS", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, .. } => {
                    log::warn!("skipping unknown INTFAS record {}", code);
                }
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_intfa(&mut self, reader: &mut BitstreamReader) -> Result<IntFa, LoadGrammarError> {
        let mut states: Vec<IntFaState> = Vec::new();
        let mut transitions: Vec<IntFaTransition> = Vec::new();
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => {
                    if states.is_empty() {
                        return Err(LoadGrammarError::EmptyMachine("INTFA"));
                    }
                    check_transition_layout(&states.iter().map(|s| (s.trans_start, s.trans_count)).collect::<Vec<_>>(), transitions.len(), "INTFA")?;
                    for transition in &transitions {
                        if transition.target.0 as usize >= states.len() {
                            return Err(LoadGrammarError::BadStateIndex {
                                record: "INTFA_TRANSITION",
                                index: transition.target.0 as u64,
                            });
                        }
                    }
                    return Ok(IntFa {
                        states,
                        transitions,
                    });
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside INTFA", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, fields } => match code {
                    REC_INTFA_STATE => {
                        let count = *fields.first().ok_or(LoadGrammarError::ShortRecord {
                            record: "INTFA_STATE",
                        })?;
                        states.push(IntFaState {
                            trans_start: transitions.len() as u32,
                            trans_count: count as u32,
                            accept: None,
                        });
                    }
                    REC_INTFA_FINAL_STATE => {
                        if fields.len() < 2 {
                            return Err(LoadGrammarError::ShortRecord {
                                record: "INTFA_FINAL_STATE",
                            });
                        }
                        let terminal = self.terminal("INTFA_FINAL_STATE", fields[1])?;
                        states.push(IntFaState {
                            trans_start: transitions.len() as u32,
                            trans_count: fields[0] as u32,
                            accept: Some(terminal),
                        });
                    }
                    REC_INTFA_TRANSITION | REC_INTFA_TRANSITION_RANGE => {
                        if states.is_empty() {
                            return Err(LoadGrammarError::Misplaced {
                                record: "INTFA_TRANSITION",
                            });
                        }
                        let (lo, hi, target) = if code == REC_INTFA_TRANSITION {
                            if fields.len() < 2 {
                                return Err(LoadGrammarError::ShortRecord {
                                    record: "INTFA_TRANSITION",
                                });
                            }
                            (fields[0] as u8, fields[0] as u8, fields[1])
                        } else {
                            if fields.len() < 3 {
                                return Err(LoadGrammarError::ShortRecord {
                                    record: "INTFA_TRANSITION_RANGE",
                                });
                            }
                            (fields[0] as u8, fields[1] as u8, fields[2])
                        };
                        transitions.push(IntFaTransition {
                            lo,
                            hi,
                            target: StateId(target as u32),
                        });
                    }
                    other => log::warn!("skipping unknown INTFA record {}", other),
                },
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_rtns(&mut self, reader: &mut BitstreamReader) -> Result<(), LoadGrammarError> {
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => return Ok(()),
                Entry::EnterBlock(id) if id == BLOCK_RTN => {
                    let rtn = self.read_rtn(reader)?;
                    self.rtns.push(rtn);
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside RTNS", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, .. } => {
                    log::warn!("skipping unknown RTNS record {}", code);
                }
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_rtn(&mut self, reader: &mut BitstreamReader) -> Result<Rtn, LoadGrammarError> {
        let mut name: Option<Sym> = None;
        let mut num_slots = 0u32;
        let mut ignore: Vec<TerminalId> = Vec::new();
        let mut states: Vec<RtnState> = Vec::new();
        let mut transitions: Vec<RtnTransition> = Vec::new();
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => {
                    if states.is_empty() {
                        return Err(LoadGrammarError::EmptyMachine("RTN"));
                    }
                    check_transition_layout(&states.iter().map(|s| (s.trans_start, s.trans_count)).collect::<Vec<_>>(), transitions.len(), "RTN")?;
                    for transition in &transitions {
                        if transition.target.0 as usize >= states.len() {
                            return Err(LoadGrammarError::BadStateIndex {
                                record: "RTN_TRANSITION",
                                index: transition.target.0 as u64,
                            });
                        }
                    }
                    return Ok(Rtn {
                        name: name.ok_or(LoadGrammarError::Misplaced { record: "RTN_INFO" })?,
                        num_slots,
                        ignore,
                        states,
                        transitions,
                    });
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside RTN", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, fields } => match code {
                    REC_RTN_INFO => {
                        if fields.len() < 2 {
                            return Err(LoadGrammarError::ShortRecord { record: "RTN_INFO" });
                        }
                        name = Some(self.string_sym("RTN_INFO", fields[0])?);
                        num_slots = fields[1] as u32;
                    }
                    REC_RTN_IGNORE => {
                        let index = *fields.first().ok_or(LoadGrammarError::ShortRecord {
                            record: "RTN_IGNORE",
                        })?;
                        let terminal = self.terminal("RTN_IGNORE", index)?;
                        if !ignore.contains(&terminal) {
                            ignore.push(terminal);
                        }
                    }
                    REC_RTN_STATE => {
                        if fields.len() < 4 {
                            return Err(LoadGrammarError::ShortRecord { record: "RTN_STATE" });
                        }
                        states.push(RtnState {
                            trans_start: transitions.len() as u32,
                            trans_count: fields[0] as u32,
                            is_final: fields[1] != 0,
                            intfa: pack_optional_index(optional_index(fields[2])?),
                            gla: pack_optional_index(optional_index(fields[3])?),
                        });
                    }
                    REC_RTN_TRANSITION_TERMINAL | REC_RTN_TRANSITION_NONTERM => {
                        if states.is_empty() {
                            return Err(LoadGrammarError::Misplaced {
                                record: "RTN_TRANSITION",
                            });
                        }
                        if fields.len() < 4 {
                            return Err(LoadGrammarError::ShortRecord {
                                record: "RTN_TRANSITION",
                            });
                        }
                        let label = if code == REC_RTN_TRANSITION_TERMINAL {
                            RtnLabel::Terminal(self.terminal("RTN_TRANSITION_TERMINAL", fields[0])?)
                        } else {
                            RtnLabel::Rule(RuleId(fields[0] as u32))
                        };
                        transitions.push(RtnTransition {
                            label,
                            target: StateId(fields[1] as u32),
                            slot_name: self.string_sym("RTN_TRANSITION", fields[2])?,
                            slotnum: fields[3] as u32,
                        });
                    }
                    REC_RTN_DECISION | REC_RTN_LOOKAHEAD => {
                        // Reserved by the format; the interpreter derives
                        // decisions from GLAs instead.
                    }
                    other => log::warn!("skipping unknown RTN record {}", other),
                },
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_glas(&mut self, reader: &mut BitstreamReader) -> Result<(), LoadGrammarError> {
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => return Ok(()),
                Entry::EnterBlock(id) if id == BLOCK_GLA => {
                    let gla = self.read_gla(reader)?;
                    self.glas.push(gla);
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside GLAS", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, .. } => {
                    log::warn!("skipping unknown GLAS record {}", code);
                }
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn read_gla(&mut self, reader: &mut BitstreamReader) -> Result<Gla, LoadGrammarError> {
        let mut states: Vec<GlaState> = Vec::new();
        let mut transitions: Vec<GlaTransition> = Vec::new();
        while let Some(entry) = reader.advance()? {
            match entry {
                Entry::EndBlock => {
                    if states.is_empty() {
                        return Err(LoadGrammarError::EmptyMachine("GLA"));
                    }
                    check_transition_layout(&states.iter().map(|s| (s.trans_start, s.trans_count)).collect::<Vec<_>>(), transitions.len(), "GLA")?;
                    for transition in &transitions {
                        if transition.target.0 as usize >= states.len() {
                            return Err(LoadGrammarError::BadStateIndex {
                                record: "GLA_TRANSITION",
                                index: transition.target.0 as u64,
                            });
                        }
                    }
                    return Ok(Gla {
                        states,
                        transitions,
                    });
                }
                Entry::EnterBlock(id) => {
                    log::warn!("skipping unknown block {} inside GLA", id);
                    reader.skip_block()?;
                }
                Entry::Record { code, fields } => match code {
                    REC_GLA_STATE => {
                        if fields.len() < 2 {
                            return Err(LoadGrammarError::ShortRecord { record: "GLA_STATE" });
                        }
                        states.push(GlaState {
                            trans_start: transitions.len() as u32,
                            trans_count: fields[0] as u32,
                            intfa: pack_optional_index(optional_index(fields[1])?),
                            decision: None,
                        });
                    }
                    REC_GLA_FINAL_STATE => {
                        if fields.len() < 2 {
                            return Err(LoadGrammarError::ShortRecord {
                                record: "GLA_FINAL_STATE",
                            });
                        }
                        let decision = match fields[1] {
                            0 => GlaDecision::Return,
                            k => GlaDecision::Take((k - 1) as u32),
                        };
                        states.push(GlaState {
                            trans_start: transitions.len() as u32,
                            trans_count: fields[0] as u32,
                            intfa: None,
                            decision: Some(decision),
                        });
                    }
                    REC_GLA_TRANSITION => {
                        if states.is_empty() {
                            return Err(LoadGrammarError::Misplaced {
                                record: "GLA_TRANSITION",
                            });
                        }
                        if fields.len() < 2 {
                            return Err(LoadGrammarError::ShortRecord {
                                record: "GLA_TRANSITION",
                            });
                        }
                        let on = if fields[0] == 0 {
                            Lookahead::Eof
                        } else {
                            Lookahead::Terminal(self.terminal("GLA_TRANSITION", fields[0] - 1)?)
                        };
                        transitions.push(GlaTransition {
                            on,
                            target: StateId(fields[1] as u32),
                        });
                    }
                    other => log::warn!("skipping unknown GLA record {}", other),
                },
            }
        }
        Err(BitstreamError::UnbalancedBlock.into())
    }

    fn finish(self) -> Result<Grammar, LoadGrammarError> {
        if self.rtns.is_empty() {
            return Err(LoadGrammarError::NoRules);
        }
        // Cross-machine references can only be validated once every block
        // has been read.
        for rtn in &self.rtns {
            for transition in &rtn.transitions {
                if let RtnLabel::Rule(rule) = transition.label {
                    if rule.0 as usize >= self.rtns.len() {
                        return Err(LoadGrammarError::BadRtnIndex(rule.0 as u64));
                    }
                }
            }
            for state in &rtn.states {
                if let Some(id) = state.intfa() {
                    if id.0 as usize >= self.intfas.len() {
                        return Err(LoadGrammarError::BadIntFaIndex(id.0 as u64));
                    }
                }
                if let Some(id) = state.gla() {
                    if id.0 as usize >= self.glas.len() {
                        return Err(LoadGrammarError::BadGlaIndex(id.0 as u64));
                    }
                }
            }
        }
        for gla in &self.glas {
            for state in &gla.states {
                if let Some(id) = state.intfa() {
                    if id.0 as usize >= self.intfas.len() {
                        return Err(LoadGrammarError::BadIntFaIndex(id.0 as u64));
                    }
                }
            }
        }
        // Every decision has to name a transition its owning state has.
        for rtn in &self.rtns {
            for state in &rtn.states {
                if let Some(gla_id) = state.gla() {
                    let gla = &self.glas[gla_id.0 as usize];
                    for gla_state in &gla.states {
                        if let Some(GlaDecision::Take(k)) = gla_state.decision {
                            if k >= state.trans_count {
                                return Err(LoadGrammarError::BadDecision(k as u64));
                            }
                        }
                    }
                }
            }
        }
        Ok(Grammar {
            strings: self.strings,
            start_rule: RuleId(0),
            terminals: self.terminals,
            rtns: self.rtns,
            intfas: self.intfas,
            glas: self.glas,
        })
    }
}

fn check_transition_layout(
    states: &[(u32, u32)],
    total: usize,
    machine: &'static str,
) -> Result<(), LoadGrammarError> {
    let mut expected = 0u32;
    for &(start, count) in states {
        if start != expected {
            return Err(LoadGrammarError::TransitionMismatch(machine));
        }
        expected += count;
    }
    if expected as usize != total {
        return Err(LoadGrammarError::TransitionMismatch(machine));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn compile(src: &str) -> Grammar {
        Grammar::compile(src, &Config::default()).unwrap()
    }

    #[test]
    fn image_starts_with_magic() {
        let grammar = compile(r#"s -> "X" "Y";"#);
        let bytes = grammar.to_bytes();
        assert_eq!(&bytes[..2], b"GH");
    }

    #[test]
    fn roundtrip_preserves_shape() {
        let grammar = compile(r#"s -> "A" | "A" "B";"#);
        let bytes = grammar.to_bytes();
        let loaded = Grammar::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.num_rules(), grammar.num_rules());
        assert_eq!(loaded.num_terminals(), grammar.num_terminals());
        assert_eq!(loaded.intfas().len(), grammar.intfas().len());
        assert_eq!(loaded.glas().len(), grammar.glas().len());
        assert_eq!(loaded.rule_str(loaded.start_rule()), Some("s"));
        for (a, b) in grammar.rtns.iter().zip(loaded.rtns.iter()) {
            assert_eq!(a.num_states(), b.num_states());
            assert_eq!(a.transitions.len(), b.transitions.len());
        }
    }

    #[test]
    fn truncated_image_is_rejected() {
        let grammar = compile(r#"s -> "X" "Y";"#);
        let bytes = grammar.to_bytes();
        assert!(Grammar::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let grammar = compile(r#"s -> "X";"#);
        let mut bytes = grammar.to_bytes();
        bytes[0] = b'Z';
        assert!(matches!(
            Grammar::from_bytes(&bytes),
            Err(LoadGrammarError::Container(_))
        ));
    }

    #[test]
    fn empty_image_has_no_rules() {
        let writer = crate::bitstream::BitstreamWriter::new(b"GH");
        let bytes = writer.finish();
        assert!(matches!(
            Grammar::from_bytes(&bytes),
            Err(LoadGrammarError::NoRules)
        ));
    }
}
