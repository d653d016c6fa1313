//! The grammar compiler: turns grammar source text into a compiled
//! [`Grammar`].
//!
//! The pipeline is: parse the surface syntax, intern terminals, desugar each
//! rule into an epsilon-NFA over slot-labeled symbols, determinize and
//! minimize it into an RTN, analyze the grammar graph (nullability, first
//! and follow sets, left recursion), attach lookahead automata where one
//! terminal does not disambiguate, detect lexical conflicts with an
//! uber-DFA over every terminal, and allocate shared lexical automata per
//! state.
use std::collections::BTreeSet;

use ahash::{AHashMap, AHashSet};
use fixedbitset_stack::FixedBitSet;
use jaggedarray::jagged_array::JaggedArray;
use jaggedarray::jagged_array::JaggedArrayViewTrait;
use string_interner::Symbol;

use crate::config::Config;
use crate::fa::{atomize_ranges, coalesce_ranges, ByteRange, Dfa, Nfa};
use crate::grammar::{
    pack_optional_index, Gla, Grammar, IntFa, IntFaState, IntFaTransition, Interner, Lookahead,
    Rtn, RtnLabel, RtnState, RtnTransition, RuleId, StateId, Sym, TerminalId,
};
use crate::lookahead::GlaBuilder;
use crate::regex::{parse_regex, RegexAst, RegexSyntaxError};
use crate::syntax::{parse_grammar, Expr, GrammarSyntaxError, Statement, SymbolRef};

/// The error type for grammar compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The grammar text is not syntactically valid.
    #[error(transparent)]
    Syntax(#[from] GrammarSyntaxError),
    /// An embedded regex is not syntactically valid.
    #[error(transparent)]
    Regex(#[from] RegexSyntaxError),
    /// The grammar defines no rules at all.
    #[error("the grammar defines no rules")]
    EmptyGrammar,
    /// The `start` directive names a rule that does not exist.
    #[error("start rule `{0}` is not defined")]
    UndefinedStart(String),
    /// A referenced name is neither a rule nor a named terminal.
    #[error("`{0}` is not defined as a rule or terminal")]
    Undefined(String),
    /// The same name is used for a rule and for a terminal.
    #[error("`{0}` is defined both as a rule and as a terminal")]
    RuleTerminalClash(String),
    /// A terminal name is given two different definitions.
    #[error("terminal `{0}` has conflicting definitions")]
    DuplicateTerminal(String),
    /// The rule can derive itself without consuming a terminal first.
    #[error("rule `{0}` is left-recursive, which LL(*) parsing cannot handle")]
    LeftRecursion(String),
    /// No bounded amount of lookahead separates the state's transitions.
    #[error(
        "rule `{rule}` cannot be disambiguated within {max_lookahead} terminals \
         of lookahead (state {state}); the grammar is ambiguous or not LL(*)"
    )]
    AmbiguousLookahead {
        /// The rule whose state is ambiguous.
        rule: String,
        /// The RTN state index inside the rule.
        state: u32,
        /// The configured lookahead bound.
        max_lookahead: usize,
    },
    /// Two terminals that match the same input are expected at one point.
    #[error(
        "terminals {first} and {second} match the same input and are both \
         expected in rule `{rule}`"
    )]
    TerminalConflict {
        /// One display form of the colliding pair.
        first: String,
        /// The other display form of the colliding pair.
        second: String,
        /// The rule whose state expects both.
        rule: String,
    },
    /// An `allow` directive names something that is not a terminal.
    #[error("`{0}` does not name a terminal; `allow` requires one")]
    IgnoredNotTerminal(String),
    /// An `allow` directive lists a name that is not a rule.
    #[error("`{0}` does not name a rule; `allow ... in` requires rules")]
    AllowTargetNotRule(String),
}

/// Call sites per rule: every `(caller, return state)` whose transition
/// invokes the rule.
pub(crate) type CallSites = AHashMap<RuleId, Vec<(RuleId, StateId)>>;

#[derive(Debug, Clone)]
enum TerminalDef {
    /// The terminal's bytes are its name; stored in the byte table.
    Literal,
    /// A regex with its original pattern text.
    Regex(String, RegexAst),
}

impl PartialEq for TerminalDef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TerminalDef::Literal, TerminalDef::Literal) => true,
            (TerminalDef::Regex(a, _), TerminalDef::Regex(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TerminalDef {}

/// The terminal side table used during compilation. The byte table keeps
/// literal text addressable by terminal id; regex rows are left empty.
struct TerminalTable {
    names: Vec<Sym>,
    defs: Vec<TerminalDef>,
    bytes: JaggedArray<u8, Vec<usize>, 2>,
    by_name: AHashMap<Sym, TerminalId>,
}

impl TerminalTable {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            defs: Vec::new(),
            bytes: JaggedArray::new(),
            by_name: AHashMap::default(),
        }
    }

    fn intern(
        &mut self,
        strings: &mut Interner,
        name: &str,
        def: TerminalDef,
        literal_bytes: Option<&[u8]>,
    ) -> Result<TerminalId, CompileError> {
        let sym = strings.get_or_intern(name);
        if let Some(&id) = self.by_name.get(&sym) {
            if self.defs[id.0 as usize] != def {
                return Err(CompileError::DuplicateTerminal(name.to_string()));
            }
            return Ok(id);
        }
        let id = TerminalId(self.names.len() as u32);
        self.names.push(sym);
        self.defs.push(def);
        self.bytes.new_row::<0>();
        if let Some(bytes) = literal_bytes {
            self.bytes.extend_last_row_from_slice(bytes);
        }
        self.by_name.insert(sym, id);
        Ok(id)
    }

    fn literal(&mut self, strings: &mut Interner, text: &str) -> Result<TerminalId, CompileError> {
        self.intern(strings, text, TerminalDef::Literal, Some(text.as_bytes()))
    }

    fn regex(
        &mut self,
        strings: &mut Interner,
        name: &str,
        pattern: &str,
    ) -> Result<TerminalId, CompileError> {
        let ast = parse_regex(pattern)?;
        self.intern(
            strings,
            name,
            TerminalDef::Regex(pattern.to_string(), ast),
            None,
        )
    }

    fn lookup(&self, strings: &Interner, name: &str) -> Option<TerminalId> {
        let sym = strings.get(name)?;
        self.by_name.get(&sym).copied()
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    /// Append terminal `id`'s language to `nfa`, accepting with tag `id`.
    fn add_to_nfa(&self, id: TerminalId, nfa: &mut Nfa<ByteRange>) {
        match &self.defs[id.0 as usize] {
            TerminalDef::Literal => {
                let mut at = 0;
                for &b in self.bytes.view([id.0 as usize]).as_slice() {
                    let next = nfa.add_state();
                    nfa.add_transition(at, ByteRange { lo: b, hi: b }, next);
                    at = next;
                }
                nfa.set_accept(at, id.0);
            }
            TerminalDef::Regex(_, ast) => {
                let end = ast.build(nfa, 0);
                nfa.set_accept(end, id.0);
            }
        }
    }
}

/// An RTN edge before it becomes a [`RtnTransition`]: the symbol plus the
/// slot descriptor. Transitions that differ only in their slot descriptor
/// stay distinct through determinization and minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EdgeLabel {
    label: RtnLabel,
    slot_name: u32,
    slotnum: u32,
}

/// A resolved, slot-annotated rule body.
#[derive(Debug, Clone)]
enum SExpr {
    Alt(Vec<SExpr>),
    Seq(Vec<SExpr>),
    Opt(Box<SExpr>),
    Star(Box<SExpr>),
    Plus(Box<SExpr>),
    SepStar(Box<SExpr>, Box<SExpr>),
    SepPlus(Box<SExpr>, Box<SExpr>),
    Sym(EdgeLabel),
    Empty,
}

impl SExpr {
    fn build(&self, nfa: &mut Nfa<EdgeLabel>, from: usize) -> usize {
        match self {
            SExpr::Empty => from,
            SExpr::Sym(edge) => {
                let to = nfa.add_state();
                nfa.add_transition(from, *edge, to);
                to
            }
            SExpr::Seq(items) => items.iter().fold(from, |at, item| item.build(nfa, at)),
            SExpr::Alt(alts) => {
                let to = nfa.add_state();
                for alt in alts {
                    let end = alt.build(nfa, from);
                    nfa.add_eps(end, to);
                }
                to
            }
            SExpr::Opt(inner) => {
                let end = inner.build(nfa, from);
                let to = nfa.add_state();
                nfa.add_eps(end, to);
                nfa.add_eps(from, to);
                to
            }
            SExpr::Star(inner) => {
                let hub = nfa.add_state();
                nfa.add_eps(from, hub);
                let end = inner.build(nfa, hub);
                nfa.add_eps(end, hub);
                hub
            }
            SExpr::Plus(inner) => {
                let end = inner.build(nfa, from);
                let hub = nfa.add_state();
                nfa.add_eps(end, hub);
                let again = inner.build(nfa, hub);
                nfa.add_eps(again, hub);
                hub
            }
            // x *(sep)  ==  (x (sep x)*)?
            SExpr::SepStar(x, sep) => {
                let end = SExpr::SepPlus(x.clone(), sep.clone()).build(nfa, from);
                let to = nfa.add_state();
                nfa.add_eps(end, to);
                nfa.add_eps(from, to);
                to
            }
            // x +(sep)  ==  x (sep x)*
            SExpr::SepPlus(x, sep) => {
                let first = x.build(nfa, from);
                let hub = nfa.add_state();
                nfa.add_eps(first, hub);
                let after_sep = sep.build(nfa, hub);
                let again = x.build(nfa, after_sep);
                nfa.add_eps(again, hub);
                hub
            }
        }
    }
}

struct Compilation {
    strings: Interner,
    terminals: TerminalTable,
    rule_ids: AHashMap<String, RuleId>,
}

impl Compilation {
    fn resolve(
        &mut self,
        expr: &Expr,
        slot_counter: &mut u32,
    ) -> Result<SExpr, CompileError> {
        Ok(match expr {
            Expr::Alt(alts) => SExpr::Alt(
                alts.iter()
                    .map(|a| self.resolve(a, slot_counter))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Seq(items) => SExpr::Seq(
                items
                    .iter()
                    .map(|i| self.resolve(i, slot_counter))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Opt(inner) => SExpr::Opt(Box::new(self.resolve(inner, slot_counter)?)),
            Expr::Star(inner) => SExpr::Star(Box::new(self.resolve(inner, slot_counter)?)),
            Expr::Plus(inner) => SExpr::Plus(Box::new(self.resolve(inner, slot_counter)?)),
            Expr::SepStar(inner, sep) => SExpr::SepStar(
                Box::new(self.resolve(inner, slot_counter)?),
                Box::new(self.resolve(sep, slot_counter)?),
            ),
            Expr::SepPlus(inner, sep) => SExpr::SepPlus(
                Box::new(self.resolve(inner, slot_counter)?),
                Box::new(self.resolve(sep, slot_counter)?),
            ),
            Expr::Empty => SExpr::Empty,
            Expr::Sym { sym, slot } => {
                let (label, default_name) = match sym {
                    SymbolRef::Name(name) => {
                        if let Some(&rule) = self.rule_ids.get(name.as_str()) {
                            (RtnLabel::Rule(rule), name.clone())
                        } else if let Some(id) = self.terminals.lookup(&self.strings, name) {
                            (RtnLabel::Terminal(id), name.clone())
                        } else {
                            return Err(CompileError::Undefined(name.clone()));
                        }
                    }
                    SymbolRef::Literal(text) => {
                        let id = self.terminals.literal(&mut self.strings, text)?;
                        (RtnLabel::Terminal(id), text.clone())
                    }
                    SymbolRef::Regex(pattern) => {
                        let name = format!("/{}/", pattern);
                        let id = self.terminals.regex(&mut self.strings, &name, pattern)?;
                        (RtnLabel::Terminal(id), name)
                    }
                };
                let slot_name = slot.clone().unwrap_or(default_name);
                let slot_sym = self.strings.get_or_intern(&slot_name);
                let slotnum = *slot_counter;
                *slot_counter += 1;
                SExpr::Sym(EdgeLabel {
                    label,
                    slot_name: slot_sym.to_usize() as u32,
                    slotnum,
                })
            }
        })
    }
}

fn rtn_from_dfa(name: Sym, num_slots: u32, dfa: &Dfa<EdgeLabel>) -> Rtn {
    let mut states = Vec::with_capacity(dfa.states.len());
    let mut transitions = Vec::new();
    for state in &dfa.states {
        let trans_start = transitions.len() as u32;
        for &(edge, to) in &state.trans {
            transitions.push(RtnTransition {
                label: edge.label,
                target: StateId(to as u32),
                slot_name: Sym::try_from_usize(edge.slot_name as usize).unwrap(),
                slotnum: edge.slotnum,
            });
        }
        states.push(RtnState {
            trans_start,
            trans_count: transitions.len() as u32 - trans_start,
            is_final: !state.accepts.is_empty(),
            intfa: None,
            gla: None,
        });
    }
    Rtn {
        name,
        num_slots,
        ignore: Vec::new(),
        states,
        transitions,
    }
}

/// Grammar-graph facts shared by lookahead synthesis and lexer allocation.
pub(crate) struct Analysis {
    pub(crate) nullable: Vec<bool>,
    pub(crate) first: Vec<BTreeSet<TerminalId>>,
    pub(crate) follow: Vec<BTreeSet<Lookahead>>,
    pub(crate) call_sites: CallSites,
}

impl Analysis {
    /// The terminals of a rule's follow set, without end-of-input.
    pub(crate) fn follow_terminals(&self, rule: RuleId) -> BTreeSet<TerminalId> {
        self.follow[rule.0 as usize]
            .iter()
            .filter_map(|la| match la {
                Lookahead::Terminal(t) => Some(*t),
                Lookahead::Eof => None,
            })
            .collect()
    }
}

fn analyze(
    rtns: &[Rtn],
    start: RuleId,
    strings: &Interner,
) -> Result<Analysis, CompileError> {
    let nullable: Vec<bool> = rtns.iter().map(|rtn| rtn.states[0].is_final).collect();

    // First sets, detecting left recursion on the way: a rule whose first
    // set needs itself can derive itself without consuming anything.
    let mut first: Vec<Option<BTreeSet<TerminalId>>> = vec![None; rtns.len()];
    let mut visiting = vec![false; rtns.len()];
    for r in 0..rtns.len() {
        compute_first(r, rtns, &nullable, &mut first, &mut visiting, strings)?;
    }
    let first: Vec<BTreeSet<TerminalId>> = first.into_iter().map(Option::unwrap).collect();

    let mut call_sites: CallSites = AHashMap::default();
    for (r, rtn) in rtns.iter().enumerate() {
        for transition in &rtn.transitions {
            if let RtnLabel::Rule(callee) = transition.label {
                call_sites
                    .entry(callee)
                    .or_default()
                    .push((RuleId(r as u32), transition.target));
            }
        }
    }

    // Follow sets by fixpoint over every call site.
    let mut follow: Vec<BTreeSet<Lookahead>> = vec![BTreeSet::new(); rtns.len()];
    follow[start.0 as usize].insert(Lookahead::Eof);
    loop {
        let mut changed = false;
        for (r, rtn) in rtns.iter().enumerate() {
            for transition in &rtn.transitions {
                let callee = match transition.label {
                    RtnLabel::Rule(callee) => callee,
                    RtnLabel::Terminal(_) => continue,
                };
                let after = first_of_state(rtns, &nullable, &first, r, transition.target);
                for t in after {
                    changed |= follow[callee.0 as usize].insert(Lookahead::Terminal(t));
                }
                if can_finish(rtns, &nullable, r, transition.target) {
                    let inherited: Vec<Lookahead> = follow[r].iter().copied().collect();
                    for la in inherited {
                        changed |= follow[callee.0 as usize].insert(la);
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    Ok(Analysis {
        nullable,
        first,
        follow,
        call_sites,
    })
}

fn compute_first(
    r: usize,
    rtns: &[Rtn],
    nullable: &[bool],
    memo: &mut Vec<Option<BTreeSet<TerminalId>>>,
    visiting: &mut Vec<bool>,
    strings: &Interner,
) -> Result<BTreeSet<TerminalId>, CompileError> {
    if let Some(set) = &memo[r] {
        return Ok(set.clone());
    }
    if visiting[r] {
        let name = strings.resolve(rtns[r].name).unwrap_or("<unknown>");
        return Err(CompileError::LeftRecursion(name.to_string()));
    }
    visiting[r] = true;
    let rtn = &rtns[r];
    let mut result = BTreeSet::new();
    let mut seen = FixedBitSet::with_capacity(rtn.states.len());
    let mut stack = vec![0usize];
    seen.insert(0);
    while let Some(s) = stack.pop() {
        for transition in rtn.transitions_of(StateId(s as u32)) {
            match transition.label {
                RtnLabel::Terminal(t) => {
                    result.insert(t);
                }
                RtnLabel::Rule(callee) => {
                    let sub =
                        compute_first(callee.0 as usize, rtns, nullable, memo, visiting, strings)?;
                    result.extend(sub);
                    if nullable[callee.0 as usize] {
                        let target = transition.target.0 as usize;
                        if !seen.contains(target) {
                            seen.insert(target);
                            stack.push(target);
                        }
                    }
                }
            }
        }
    }
    visiting[r] = false;
    memo[r] = Some(result.clone());
    Ok(result)
}

/// The terminals that can appear next from `state` of rule `r`, staying
/// inside the rule (callee first sets are folded in, nullable callees are
/// stepped over).
fn first_of_state(
    rtns: &[Rtn],
    nullable: &[bool],
    first: &[BTreeSet<TerminalId>],
    r: usize,
    state: StateId,
) -> BTreeSet<TerminalId> {
    let rtn = &rtns[r];
    let mut result = BTreeSet::new();
    let mut seen = FixedBitSet::with_capacity(rtn.states.len());
    let mut stack = vec![state.0 as usize];
    seen.insert(state.0 as usize);
    while let Some(s) = stack.pop() {
        for transition in rtn.transitions_of(StateId(s as u32)) {
            match transition.label {
                RtnLabel::Terminal(t) => {
                    result.insert(t);
                }
                RtnLabel::Rule(callee) => {
                    result.extend(first[callee.0 as usize].iter().copied());
                    if nullable[callee.0 as usize] {
                        let target = transition.target.0 as usize;
                        if !seen.contains(target) {
                            seen.insert(target);
                            stack.push(target);
                        }
                    }
                }
            }
        }
    }
    result
}

/// Whether the rule can reach a final state from `state` without consuming
/// a terminal.
fn can_finish(rtns: &[Rtn], nullable: &[bool], r: usize, state: StateId) -> bool {
    let rtn = &rtns[r];
    let mut seen = FixedBitSet::with_capacity(rtn.states.len());
    let mut stack = vec![state.0 as usize];
    seen.insert(state.0 as usize);
    while let Some(s) = stack.pop() {
        if rtn.states[s].is_final {
            return true;
        }
        for transition in rtn.transitions_of(StateId(s as u32)) {
            if let RtnLabel::Rule(callee) = transition.label {
                if nullable[callee.0 as usize] {
                    let target = transition.target.0 as usize;
                    if !seen.contains(target) {
                        seen.insert(target);
                        stack.push(target);
                    }
                }
            }
        }
    }
    false
}

/// How the parser resolves one RTN state at run time.
enum StateMode {
    /// Final with no transitions, or no way to consume: nothing to lex.
    Inert,
    /// A single rule call and not final: enter the callee without lexing.
    EagerCall,
    /// Distinct terminal transitions (plus return-if-final): lex one
    /// terminal and dispatch on it.
    Simple,
    /// Anything else needs a lookahead automaton.
    NeedsGla,
}

fn classify(rtn: &Rtn, state: StateId, analysis: &Analysis, rule: RuleId) -> StateMode {
    let data = rtn.state(state);
    let transitions = rtn.transitions_of(state);
    if transitions.is_empty() {
        return StateMode::Inert;
    }
    if transitions.len() == 1 && !data.is_final {
        if let RtnLabel::Rule(_) = transitions[0].label {
            return StateMode::EagerCall;
        }
    }
    let mut labels: BTreeSet<TerminalId> = BTreeSet::new();
    for transition in transitions {
        match transition.label {
            RtnLabel::Terminal(t) => {
                if !labels.insert(t) {
                    return StateMode::NeedsGla;
                }
            }
            RtnLabel::Rule(_) => return StateMode::NeedsGla,
        }
    }
    if data.is_final {
        let follow = analysis.follow_terminals(rule);
        if labels.intersection(&follow).next().is_some() {
            return StateMode::NeedsGla;
        }
    }
    StateMode::Simple
}

/// Compile grammar source text into a [`Grammar`].
pub(crate) fn compile(source: &str, config: &Config) -> Result<Grammar, CompileError> {
    let statements = parse_grammar(source)?;

    // Partition statements. A definition whose whole body is one regex is a
    // named terminal; everything else is a rule. Repeated definitions of a
    // rule accumulate as additional alternatives.
    let mut rule_names: Vec<String> = Vec::new();
    let mut rule_bodies: AHashMap<String, Vec<Expr>> = AHashMap::default();
    let mut terminal_defs: Vec<(String, String)> = Vec::new();
    let mut start_name: Option<String> = None;
    let mut allows: Vec<(String, Vec<String>)> = Vec::new();
    for statement in statements {
        match statement {
            Statement::Definition { name, expr } => match expr {
                Expr::Sym {
                    sym: SymbolRef::Regex(pattern),
                    slot: None,
                } => terminal_defs.push((name, pattern)),
                expr => {
                    if !rule_bodies.contains_key(&name) {
                        rule_names.push(name.clone());
                    }
                    rule_bodies.entry(name).or_default().push(expr);
                }
            },
            Statement::Start { name } => start_name = Some(name),
            Statement::Allow { ignored, rules } => allows.push((ignored, rules)),
        }
    }
    if rule_names.is_empty() {
        return Err(CompileError::EmptyGrammar);
    }

    // The start rule gets id 0 so the bytecode writer can emit it first.
    let start_name = match start_name {
        Some(name) => {
            if !rule_bodies.contains_key(&name) {
                return Err(CompileError::UndefinedStart(name));
            }
            name
        }
        None if rule_bodies.contains_key(&config.start_rule) => config.start_rule.clone(),
        None => rule_names[0].clone(),
    };
    let mut ordered_rules = vec![start_name.clone()];
    ordered_rules.extend(rule_names.iter().filter(|n| **n != start_name).cloned());

    let mut compilation = Compilation {
        strings: Interner::new(),
        terminals: TerminalTable::new(),
        rule_ids: AHashMap::default(),
    };
    let mut rule_syms = Vec::with_capacity(ordered_rules.len());
    for (i, name) in ordered_rules.iter().enumerate() {
        compilation.rule_ids.insert(name.clone(), RuleId(i as u32));
        rule_syms.push(compilation.strings.get_or_intern(name));
    }
    for (name, pattern) in &terminal_defs {
        if compilation.rule_ids.contains_key(name.as_str()) {
            return Err(CompileError::RuleTerminalClash(name.clone()));
        }
        compilation
            .terminals
            .regex(&mut compilation.strings, name, pattern)?;
    }

    // Desugar and determinize each rule into its RTN.
    let mut rtns: Vec<Rtn> = Vec::with_capacity(ordered_rules.len());
    for (i, name) in ordered_rules.iter().enumerate() {
        let bodies = &rule_bodies[name.as_str()];
        let mut slot_counter = 0u32;
        let mut resolved = Vec::with_capacity(bodies.len());
        for body in bodies {
            resolved.push(compilation.resolve(body, &mut slot_counter)?);
        }
        let sexpr = if resolved.len() == 1 {
            resolved.pop().unwrap()
        } else {
            SExpr::Alt(resolved)
        };
        let mut nfa = Nfa::new();
        let end = sexpr.build(&mut nfa, 0);
        nfa.set_accept(end, 0);
        let dfa = nfa.determinize().minimize();
        rtns.push(rtn_from_dfa(rule_syms[i], slot_counter, &dfa));
    }

    // Ignore sets have to be in place before lexer allocation: an ignored
    // terminal must be lexable everywhere inside its rules.
    for (ignored, rules) in &allows {
        let terminal = compilation
            .terminals
            .lookup(&compilation.strings, ignored)
            .ok_or_else(|| {
                if compilation.rule_ids.contains_key(ignored.as_str()) {
                    CompileError::IgnoredNotTerminal(ignored.clone())
                } else {
                    CompileError::Undefined(ignored.clone())
                }
            })?;
        for rule in rules {
            let &id = compilation
                .rule_ids
                .get(rule.as_str())
                .ok_or_else(|| CompileError::AllowTargetNotRule(rule.clone()))?;
            let ignore = &mut rtns[id.0 as usize].ignore;
            if !ignore.contains(&terminal) {
                ignore.push(terminal);
            }
        }
    }

    let start = RuleId(0);
    let analysis = analyze(&rtns, start, &compilation.strings)?;

    // Lookahead automata wherever a single terminal cannot decide.
    let mut glas: Vec<Gla> = Vec::new();
    let mut gla_rules: Vec<RuleId> = Vec::new();
    let mut state_modes: Vec<Vec<StateMode>> = Vec::with_capacity(rtns.len());
    {
        let builder = GlaBuilder::new(
            &rtns,
            start,
            &analysis.call_sites,
            config.max_lookahead,
            &compilation.strings,
        );
        let mut attach: Vec<(usize, usize, u32)> = Vec::new();
        for (r, rtn) in rtns.iter().enumerate() {
            let mut modes = Vec::with_capacity(rtn.states.len());
            for s in 0..rtn.states.len() {
                let state = StateId(s as u32);
                let mode = classify(rtn, state, &analysis, RuleId(r as u32));
                if let StateMode::NeedsGla = mode {
                    let gla = builder.build(RuleId(r as u32), state)?;
                    attach.push((r, s, glas.len() as u32));
                    glas.push(gla);
                    gla_rules.push(RuleId(r as u32));
                }
                modes.push(mode);
            }
            state_modes.push(modes);
        }
        for (r, s, gla) in attach {
            rtns[r].states[s].gla = pack_optional_index(Some(gla));
        }
    }

    // Lexical conflict analysis: an uber-DFA over every terminal tags each
    // final state with the terminals ending there; two terminals sharing a
    // final state recognize a common string and must not share an IntFA.
    let conflicts = terminal_conflicts(&compilation.terminals);

    // The per-state candidate terminal sets, in a deterministic order.
    enum SetTarget {
        Rtn(usize, usize),
        Gla(usize, usize),
    }
    let mut needed: Vec<(BTreeSet<TerminalId>, SetTarget, RuleId)> = Vec::new();
    for (r, rtn) in rtns.iter().enumerate() {
        let rule = RuleId(r as u32);
        let ignored: BTreeSet<TerminalId> = rtn.ignore.iter().copied().collect();
        for s in 0..rtn.states.len() {
            let labels = || -> BTreeSet<TerminalId> {
                rtn.transitions_of(StateId(s as u32))
                    .iter()
                    .filter_map(|t| match t.label {
                        RtnLabel::Terminal(t) => Some(t),
                        RtnLabel::Rule(_) => None,
                    })
                    .collect()
            };
            match state_modes[r][s] {
                StateMode::EagerCall => {}
                StateMode::Inert => {
                    // A rule can end in this state with nothing left to
                    // consume, but its ignored terminals must still lex so
                    // trailing ignorable input is discarded.
                    if rtn.states[s].is_final && !ignored.is_empty() {
                        needed.push((ignored.clone(), SetTarget::Rtn(r, s), rule));
                    }
                }
                StateMode::NeedsGla => {
                    // After the lookahead decides, the chosen terminal is
                    // re-lexed against this state's own labels.
                    let mut set = labels();
                    if !set.is_empty() {
                        set.extend(ignored.iter().copied());
                        needed.push((set, SetTarget::Rtn(r, s), rule));
                    }
                }
                StateMode::Simple => {
                    let mut set = labels();
                    if rtn.states[s].is_final {
                        set.extend(analysis.follow_terminals(rule));
                    }
                    set.extend(ignored.iter().copied());
                    needed.push((set, SetTarget::Rtn(r, s), rule));
                }
            }
        }
    }
    for (g, gla) in glas.iter().enumerate() {
        let rule = gla_rules[g];
        let ignored: BTreeSet<TerminalId> =
            rtns[rule.0 as usize].ignore.iter().copied().collect();
        for s in 0..gla.states.len() {
            if gla.states[s].decision.is_some() {
                continue;
            }
            let mut set: BTreeSet<TerminalId> = gla
                .transitions_of(StateId(s as u32))
                .iter()
                .filter_map(|t| match t.on {
                    Lookahead::Terminal(t) => Some(t),
                    Lookahead::Eof => None,
                })
                .collect();
            set.extend(ignored.iter().copied());
            needed.push((set, SetTarget::Gla(g, s), rule));
        }
    }

    // Greedy bucket allocation: reuse an existing IntFA whenever no member
    // conflicts with the incoming set.
    let mut buckets: Vec<BTreeSet<TerminalId>> = Vec::new();
    let mut assignments: Vec<(SetTarget, Option<u32>)> = Vec::new();
    for (set, target, rule) in needed {
        if set.is_empty() {
            assignments.push((target, None));
            continue;
        }
        if let Some((a, b)) = internal_conflict(&set, &conflicts) {
            let strings = &compilation.strings;
            let name = |id: TerminalId| {
                strings
                    .resolve(compilation.terminals.names[id.0 as usize])
                    .unwrap_or("<unknown>")
                    .to_string()
            };
            return Err(CompileError::TerminalConflict {
                first: name(a),
                second: name(b),
                rule: strings
                    .resolve(rtns[rule.0 as usize].name)
                    .unwrap_or("<unknown>")
                    .to_string(),
            });
        }
        let slot = buckets.iter().position(|bucket| {
            set.iter().all(|&t| {
                bucket
                    .iter()
                    .all(|&member| !conflicts.contains(&ordered_pair(t, member)))
            })
        });
        let index = match slot {
            Some(i) => {
                buckets[i].extend(set.iter().copied());
                i as u32
            }
            None => {
                buckets.push(set);
                (buckets.len() - 1) as u32
            }
        };
        assignments.push((target, Some(index)));
    }

    let intfas: Vec<IntFa> = buckets
        .iter()
        .map(|bucket| build_intfa(&compilation.terminals, bucket))
        .collect();
    for (target, index) in assignments {
        match target {
            SetTarget::Rtn(r, s) => rtns[r].states[s].intfa = pack_optional_index(index),
            SetTarget::Gla(g, s) => glas[g].states[s].intfa = pack_optional_index(index),
        }
    }

    Ok(Grammar {
        strings: compilation.strings,
        start_rule: start,
        terminals: compilation.terminals.names,
        rtns,
        intfas,
        glas,
    })
}

fn ordered_pair(a: TerminalId, b: TerminalId) -> (u32, u32) {
    if a.0 <= b.0 {
        (a.0, b.0)
    } else {
        (b.0, a.0)
    }
}

fn internal_conflict(
    set: &BTreeSet<TerminalId>,
    conflicts: &AHashSet<(u32, u32)>,
) -> Option<(TerminalId, TerminalId)> {
    let members: Vec<TerminalId> = set.iter().copied().collect();
    for (i, &a) in members.iter().enumerate() {
        for &b in &members[i + 1..] {
            if conflicts.contains(&ordered_pair(a, b)) {
                return Some((a, b));
            }
        }
    }
    None
}

fn terminal_conflicts(terminals: &TerminalTable) -> AHashSet<(u32, u32)> {
    let mut nfa: Nfa<ByteRange> = Nfa::new();
    for id in 0..terminals.len() {
        terminals.add_to_nfa(TerminalId(id as u32), &mut nfa);
    }
    atomize_ranges(&mut nfa);
    let dfa = nfa.determinize();
    let mut conflicts = AHashSet::default();
    for state in &dfa.states {
        for (i, &a) in state.accepts.iter().enumerate() {
            for &b in &state.accepts[i + 1..] {
                conflicts.insert((a, b));
            }
        }
    }
    conflicts
}

fn build_intfa(terminals: &TerminalTable, bucket: &BTreeSet<TerminalId>) -> IntFa {
    let mut nfa: Nfa<ByteRange> = Nfa::new();
    for &id in bucket {
        terminals.add_to_nfa(id, &mut nfa);
    }
    atomize_ranges(&mut nfa);
    let dfa = nfa.determinize().minimize();
    let mut states = Vec::with_capacity(dfa.states.len());
    let mut transitions = Vec::new();
    for state in &dfa.states {
        debug_assert!(
            state.accepts.len() <= 1,
            "conflict-free bucket produced a multi-terminal accept state"
        );
        let mut trans: Vec<(ByteRange, usize)> = state.trans.clone();
        coalesce_ranges(&mut trans);
        let trans_start = transitions.len() as u32;
        for (range, to) in trans {
            transitions.push(IntFaTransition {
                lo: range.lo,
                hi: range.hi,
                target: StateId(to as u32),
            });
        }
        states.push(IntFaState {
            trans_start,
            trans_count: transitions.len() as u32 - trans_start,
            accept: state.accepts.first().map(|&t| TerminalId(t)),
        });
    }
    IntFa {
        states,
        transitions,
    }
}

impl Grammar {
    /// Compile grammar source text with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] when the text is not a valid grammar or
    /// the grammar is not LL(*). See the variant docs for the taxonomy.
    pub fn compile(source: &str, config: &Config) -> Result<Grammar, CompileError> {
        compile(source, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_default(src: &str) -> Result<Grammar, CompileError> {
        Grammar::compile(src, &Config::default())
    }

    #[test]
    fn single_rule_grammar_compiles() {
        let grammar = compile_default(r#"s -> "X" "Y";"#).unwrap();
        assert_eq!(grammar.num_rules(), 1);
        assert_eq!(grammar.num_terminals(), 2);
        assert_eq!(grammar.rule_str(grammar.start_rule()), Some("s"));
        assert!(grammar.glas().is_empty());
    }

    #[test]
    fn start_directive_selects_the_rule() {
        let grammar = compile_default(r#"a -> "A"; b -> "B"; start b;"#).unwrap();
        assert_eq!(grammar.rule_str(grammar.start_rule()), Some("b"));
    }

    #[test]
    fn first_rule_is_the_default_start() {
        let grammar = compile_default(r#"a -> "A"; b -> "B";"#).unwrap();
        assert_eq!(grammar.rule_str(grammar.start_rule()), Some("a"));
    }

    #[test]
    fn unknown_start_is_rejected() {
        assert!(matches!(
            compile_default(r#"a -> "A"; start q;"#),
            Err(CompileError::UndefinedStart(name)) if name == "q"
        ));
    }

    #[test]
    fn undefined_reference_is_rejected() {
        assert!(matches!(
            compile_default(r#"s -> missing "X";"#),
            Err(CompileError::Undefined(name)) if name == "missing"
        ));
    }

    #[test]
    fn single_regex_body_defines_a_terminal() {
        let grammar = compile_default(r#"s -> num; num -> /[0-9]+/;"#).unwrap();
        assert_eq!(grammar.num_rules(), 1);
        assert!(grammar.terminal_id("num").is_some());
    }

    #[test]
    fn conflicting_terminal_definitions_are_rejected() {
        assert!(matches!(
            compile_default(r#"num -> /[0-9]+/; num -> /[a-f]+/; s -> num;"#),
            Err(CompileError::DuplicateTerminal(name)) if name == "num"
        ));
    }

    #[test]
    fn rule_and_terminal_may_not_share_a_name() {
        assert!(matches!(
            compile_default(r#"x -> "A" "B"; x -> /[0-9]/;"#),
            Err(CompileError::RuleTerminalClash(name)) if name == "x"
        ));
    }

    #[test]
    fn repeated_rule_definitions_accumulate_alternatives() {
        let grammar = compile_default(r#"s -> "A"; s -> "B";"#).unwrap();
        assert_eq!(grammar.num_rules(), 1);
        assert_eq!(grammar.num_terminals(), 2);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(compile_default(""), Err(CompileError::EmptyGrammar)));
        assert!(matches!(
            compile_default("num -> /[0-9]+/;"),
            Err(CompileError::EmptyGrammar)
        ));
    }

    #[test]
    fn allow_requires_a_terminal_and_rules() {
        assert!(matches!(
            compile_default(r#"s -> "A"; t -> "B"; allow t in s;"#),
            Err(CompileError::IgnoredNotTerminal(name)) if name == "t"
        ));
        assert!(matches!(
            compile_default(r#"s -> "A"; WS -> /[ ]+/; allow WS in nope;"#),
            Err(CompileError::AllowTargetNotRule(name)) if name == "nope"
        ));
    }

    #[test]
    fn indirect_left_recursion_is_detected() {
        assert!(matches!(
            compile_default(r#"s -> a "X"; a -> b; b -> s;"#),
            Err(CompileError::LeftRecursion(_))
        ));
    }

    #[test]
    fn nullable_prefix_left_recursion_is_detected() {
        assert!(matches!(
            compile_default(r#"s -> a s "X"; a -> "Z" | e;"#),
            Err(CompileError::LeftRecursion(_))
        ));
    }

    #[test]
    fn shared_lexers_are_allocated_greedily() {
        // Three states want {num}, {plus} and {num}; nothing conflicts, so
        // one shared IntFA suffices.
        let grammar = compile_default(
            r#"start expr; expr -> num ("+" num)*; num -> /[0-9]+/;"#,
        )
        .unwrap();
        assert_eq!(grammar.intfas().len(), 1);
    }

    #[test]
    fn lookahead_automata_only_where_needed() {
        let grammar = compile_default(r#"s -> "A" "B" | "C" "D";"#).unwrap();
        assert!(grammar.glas().is_empty());
        let grammar = compile_default(r#"s -> "A" "B" | "A" "C";"#).unwrap();
        assert_eq!(grammar.glas().len(), 1);
    }

    #[test]
    fn slot_numbers_increment_per_rule() {
        let grammar = compile_default(r#"s -> "A" "B" | "C";"#).unwrap();
        let rtn = &grammar.rtns[0];
        assert_eq!(rtn.num_slots, 3);
        let mut slots: Vec<u32> = rtn.transitions.iter().map(|t| t.slotnum).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots, vec![0, 1, 2]);
    }
}
