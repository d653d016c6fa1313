//! The compiled grammar model shared by the compiler, the bytecode image and
//! the streaming parser: recursive transition networks, lexical automata and
//! lookahead automata as index-linked state/transition arenas.
use std::fmt::Debug;

use nonmax::NonMaxU32;
use string_interner::backend::StringBackend;
use string_interner::symbol::SymbolU32;
use string_interner::StringInterner;

pub(crate) type Interner = StringInterner<StringBackend<SymbolU32>>;
pub(crate) type Sym = SymbolU32;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents a terminal id in the grammar.
pub struct TerminalId(pub u32);
impl TerminalId {
    /// Get the display form of the terminal id.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!(
            "\"{}\"[{}]",
            grammar.terminal_str(*self).unwrap_or("<unknown>"),
            self.0
        )
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents a rule (nonterminal) id in the grammar.
pub struct RuleId(pub u32);
impl RuleId {
    /// Get the display form of the rule id.
    pub fn to_display_form(&self, grammar: &Grammar) -> String {
        format!(
            "{}[{}]",
            grammar.rule_str(*self).unwrap_or("<unknown>"),
            self.0
        )
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Default)]
#[repr(transparent)]
/// The wrapper struct that represents a state index inside one machine.
/// State `0` is always the start state of its machine.
pub struct StateId(pub u32);

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents a lexical automaton id in the grammar.
pub struct IntFaId(pub u32);

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents a lookahead automaton id in the grammar.
pub struct GlaId(pub u32);

/// The symbol labeling one RTN transition: a terminal to consume or a rule to
/// call into.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum RtnLabel {
    /// Consume one terminal.
    Terminal(TerminalId),
    /// Call the named rule and continue at the target state on return.
    Rule(RuleId),
}

/// One transition of a recursive transition network. The slot descriptor
/// tells the host which child of the current rule the consumed symbol
/// occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtnTransition {
    /// The consumed terminal or called rule.
    pub label: RtnLabel,
    /// The state the machine moves to after the symbol.
    pub target: StateId,
    /// The slot name, interned in the grammar's string table.
    pub(crate) slot_name: Sym,
    /// The slot number, unique per symbol occurrence within the rule.
    pub slotnum: u32,
}

/// One state of a recursive transition network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtnState {
    pub(crate) trans_start: u32,
    pub(crate) trans_count: u32,
    /// Whether the rule may end in this state.
    pub is_final: bool,
    pub(crate) intfa: Option<NonMaxU32>,
    pub(crate) gla: Option<NonMaxU32>,
}

impl RtnState {
    /// The lexical automaton used to produce the next terminal in this
    /// state, if the state consumes input directly.
    pub fn intfa(&self) -> Option<IntFaId> {
        self.intfa.map(|x| IntFaId(x.get()))
    }
    /// The lookahead automaton attached to this state, if one terminal of
    /// lookahead does not disambiguate its transitions.
    pub fn gla(&self) -> Option<GlaId> {
        self.gla.map(|x| GlaId(x.get()))
    }
}

/// The recursive transition network of one rule.
#[derive(Debug, Clone)]
pub struct Rtn {
    pub(crate) name: Sym,
    /// The number of distinct slot numbers in the rule.
    pub num_slots: u32,
    /// Terminals silently discarded while this rule is on top of the stack.
    pub(crate) ignore: Vec<TerminalId>,
    pub(crate) states: Vec<RtnState>,
    pub(crate) transitions: Vec<RtnTransition>,
}

impl Rtn {
    #[inline]
    pub(crate) fn state(&self, id: StateId) -> &RtnState {
        &self.states[id.0 as usize]
    }
    /// The outgoing transitions of one state, in emission order.
    #[inline]
    pub fn transitions_of(&self, id: StateId) -> &[RtnTransition] {
        let s = self.state(id);
        &self.transitions[s.trans_start as usize..(s.trans_start + s.trans_count) as usize]
    }
    #[inline]
    pub(crate) fn is_ignored(&self, terminal: TerminalId) -> bool {
        self.ignore.contains(&terminal)
    }
    /// The number of states in this machine.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }
}

/// One byte-range transition of a lexical automaton.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntFaTransition {
    /// The inclusive low end of the byte range.
    pub lo: u8,
    /// The inclusive high end of the byte range.
    pub hi: u8,
    /// The state entered when the next byte falls in `[lo, hi]`.
    pub target: StateId,
}

impl Debug for IntFaTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.lo == self.hi {
            write!(f, "'{}' -> {}", crate::utils::display_byte(self.lo), self.target.0)
        } else {
            write!(
                f,
                "'{}'-'{}' -> {}",
                crate::utils::display_byte(self.lo),
                crate::utils::display_byte(self.hi),
                self.target.0
            )
        }
    }
}

/// One state of a lexical automaton. Final states carry the terminal they
/// accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntFaState {
    pub(crate) trans_start: u32,
    pub(crate) trans_count: u32,
    /// The terminal recognized when lexing stops in this state.
    pub accept: Option<TerminalId>,
}

/// A deterministic lexical automaton over disjoint byte ranges.
#[derive(Debug, Clone, Default)]
pub struct IntFa {
    pub(crate) states: Vec<IntFaState>,
    pub(crate) transitions: Vec<IntFaTransition>,
}

impl IntFa {
    #[inline]
    pub(crate) fn state(&self, id: StateId) -> &IntFaState {
        &self.states[id.0 as usize]
    }
    /// The outgoing transitions of one state.
    #[inline]
    pub fn transitions_of(&self, id: StateId) -> &[IntFaTransition] {
        let s = self.state(id);
        &self.transitions[s.trans_start as usize..(s.trans_start + s.trans_count) as usize]
    }
    /// Advance one step on `byte`, or `None` when no range contains it.
    #[inline]
    pub fn step(&self, id: StateId, byte: u8) -> Option<StateId> {
        self.transitions_of(id)
            .iter()
            .find(|t| t.lo <= byte && byte <= t.hi)
            .map(|t| t.target)
    }
    /// The terminal accepted in a state, or `None` for non-final states.
    #[inline]
    pub fn accept_of(&self, id: StateId) -> Option<TerminalId> {
        self.state(id).accept
    }
    /// The number of states in this machine.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }
}

/// The terminal consumed by one lookahead transition. End-of-input is a
/// distinguished symbol that only appears past the end of the start rule.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum Lookahead {
    /// End of input.
    Eof,
    /// A real terminal.
    Terminal(TerminalId),
}

/// The verdict stored in a final lookahead state.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum GlaDecision {
    /// Take the outgoing RTN transition with this index.
    Take(u32),
    /// Return from the current rule.
    Return,
}

/// One transition of a lookahead automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlaTransition {
    /// The terminal that advances the lookahead.
    pub on: Lookahead,
    /// The lookahead state entered after the terminal.
    pub target: StateId,
}

/// One state of a lookahead automaton. Non-final states reference the
/// lexical automaton that produces their next terminal; final states carry
/// the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlaState {
    pub(crate) trans_start: u32,
    pub(crate) trans_count: u32,
    pub(crate) intfa: Option<NonMaxU32>,
    /// The decision, present exactly on final states.
    pub decision: Option<GlaDecision>,
}

impl GlaState {
    /// The lexical automaton producing this state's next terminal.
    pub fn intfa(&self) -> Option<IntFaId> {
        self.intfa.map(|x| IntFaId(x.get()))
    }
}

/// A deterministic lookahead automaton over terminals.
#[derive(Debug, Clone, Default)]
pub struct Gla {
    pub(crate) states: Vec<GlaState>,
    pub(crate) transitions: Vec<GlaTransition>,
}

impl Gla {
    #[inline]
    pub(crate) fn state(&self, id: StateId) -> &GlaState {
        &self.states[id.0 as usize]
    }
    /// The outgoing transitions of one state.
    #[inline]
    pub fn transitions_of(&self, id: StateId) -> &[GlaTransition] {
        let s = self.state(id);
        &self.transitions[s.trans_start as usize..(s.trans_start + s.trans_count) as usize]
    }
    /// Advance one step on `on`, or `None` when the lookahead rejects it.
    #[inline]
    pub fn step(&self, id: StateId, on: Lookahead) -> Option<StateId> {
        self.transitions_of(id)
            .iter()
            .find(|t| t.on == on)
            .map(|t| t.target)
    }
    /// The number of states in this machine.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }
}

/// The compiled grammar: an immutable bundle of string table, terminals,
/// RTNs, lexical automata and lookahead automata. Built once by the
/// compiler or the bytecode loader, then shared read-only (typically behind
/// an [`Arc`](std::sync::Arc)) by any number of parse states.
#[derive(Clone)]
pub struct Grammar {
    pub(crate) strings: Interner,
    pub(crate) start_rule: RuleId,
    /// Terminal id -> interned name.
    pub(crate) terminals: Vec<Sym>,
    pub(crate) rtns: Vec<Rtn>,
    pub(crate) intfas: Vec<IntFa>,
    pub(crate) glas: Vec<Gla>,
}

impl Grammar {
    /// The rule the parse starts from.
    #[inline]
    pub fn start_rule(&self) -> RuleId {
        self.start_rule
    }
    /// Resolve an interned string.
    #[inline]
    pub(crate) fn str(&self, sym: Sym) -> Option<&str> {
        self.strings.resolve(sym)
    }
    /// Get the terminal name from the grammar.
    #[inline]
    pub fn terminal_str(&self, terminal_id: TerminalId) -> Option<&str> {
        self.terminals
            .get(terminal_id.0 as usize)
            .and_then(|&sym| self.strings.resolve(sym))
    }
    /// Get the rule name from the grammar.
    #[inline]
    pub fn rule_str(&self, rule_id: RuleId) -> Option<&str> {
        self.rtns
            .get(rule_id.0 as usize)
            .and_then(|rtn| self.strings.resolve(rtn.name))
    }
    /// Look up a rule by name.
    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        let sym = self.strings.get(name)?;
        self.rtns
            .iter()
            .position(|rtn| rtn.name == sym)
            .map(|i| RuleId(i as u32))
    }
    /// Look up a terminal by name.
    pub fn terminal_id(&self, name: &str) -> Option<TerminalId> {
        let sym = self.strings.get(name)?;
        self.terminals
            .iter()
            .position(|&t| t == sym)
            .map(|i| TerminalId(i as u32))
    }
    /// The number of terminals in the grammar.
    #[inline]
    pub fn num_terminals(&self) -> usize {
        self.terminals.len()
    }
    /// The number of rules in the grammar.
    #[inline]
    pub fn num_rules(&self) -> usize {
        self.rtns.len()
    }
    #[inline]
    pub(crate) fn rtn(&self, id: RuleId) -> &Rtn {
        &self.rtns[id.0 as usize]
    }
    #[inline]
    pub(crate) fn intfa(&self, id: IntFaId) -> &IntFa {
        &self.intfas[id.0 as usize]
    }
    #[inline]
    pub(crate) fn gla(&self, id: GlaId) -> &Gla {
        &self.glas[id.0 as usize]
    }
    /// The lexical automata of the grammar.
    #[inline]
    pub fn intfas(&self) -> &[IntFa] {
        &self.intfas
    }
    /// The lookahead automata of the grammar.
    #[inline]
    pub fn glas(&self) -> &[Gla] {
        &self.glas
    }
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("start_rule", &self.start_rule.to_display_form(self))
            .field(
                "terminals",
                &(0..self.terminals.len())
                    .map(|i| TerminalId(i as u32).to_display_form(self))
                    .collect::<Vec<_>>(),
            )
            .field(
                "rules",
                &self
                    .rtns
                    .iter()
                    .enumerate()
                    .map(|(i, rtn)| {
                        format!(
                            "{} ({} states, {} transitions, {} slots)",
                            RuleId(i as u32).to_display_form(self),
                            rtn.states.len(),
                            rtn.transitions.len(),
                            rtn.num_slots,
                        )
                    })
                    .collect::<Vec<_>>(),
            )
            .field(
                "intfas",
                &self
                    .intfas
                    .iter()
                    .map(|fa| format!("{} states", fa.states.len()))
                    .collect::<Vec<_>>(),
            )
            .field(
                "glas",
                &self
                    .glas
                    .iter()
                    .map(|gla| format!("{} states", gla.states.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub(crate) fn pack_optional_index(index: Option<u32>) -> Option<NonMaxU32> {
    index.map(|x| NonMaxU32::new(x).expect("index out of range"))
}
