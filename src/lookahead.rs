//! The LL(*) lookahead analyzer.
//!
//! For an RTN state whose outgoing transitions are not told apart by one
//! terminal, this module synthesizes a GLA: a DFA over terminals whose final
//! states decide which RTN transition to take (or that the rule returns).
//!
//! The construction explores the grammar graph simultaneously from every
//! candidate action. Each exploration tuple remembers its action, its
//! current grammar position and the call stack needed to rejoin that
//! position; a GLA node is a canonical set of tuples, so equal frontiers
//! converge onto the same node and cyclic lookahead (as in `a -> "Z"* ...`)
//! stays finite. When a tuple pops an empty stack at the end of a rule it
//! continues at every call site of that rule; popping out of the start rule
//! contributes the distinguished end-of-input terminal.
use std::collections::{BTreeMap, BTreeSet};

use ahash::{AHashMap, AHashSet};
use tinyvec::TinyVec;

use crate::compiler::{CallSites, CompileError};
use crate::grammar::{
    Gla, GlaDecision, GlaState, GlaTransition, Interner, Lookahead, Rtn, RtnLabel, RuleId, StateId,
};

/// A return site remembered while exploration is inside a called rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct CallFrame {
    pub(crate) rule: RuleId,
    pub(crate) state: StateId,
}

impl Default for CallFrame {
    fn default() -> Self {
        Self {
            rule: RuleId(0),
            state: StateId(0),
        }
    }
}

type Stack = TinyVec<[CallFrame; 4]>;

/// Where one exploration tuple currently sits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Pos {
    /// About to leave `state` of `rule`, rejoining `stack` on returns.
    At {
        rule: RuleId,
        state: StateId,
        stack: Stack,
    },
    /// Past the end of the input; nothing follows.
    Done,
}

/// One exploration tuple: a candidate action plus the position reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PathPos {
    decision: GlaDecision,
    pos: Pos,
}

/// A GLA node in construction form: the canonical frontier of tuples.
type Node = BTreeSet<PathPos>;

pub(crate) struct GlaBuilder<'a> {
    rtns: &'a [Rtn],
    start_rule: RuleId,
    call_sites: &'a CallSites,
    max_lookahead: usize,
    strings: &'a Interner,
}

impl<'a> GlaBuilder<'a> {
    pub(crate) fn new(
        rtns: &'a [Rtn],
        start_rule: RuleId,
        call_sites: &'a CallSites,
        max_lookahead: usize,
        strings: &'a Interner,
    ) -> Self {
        Self {
            rtns,
            start_rule,
            call_sites,
            max_lookahead,
            strings,
        }
    }

    /// Build the GLA for `state` of `rule`.
    pub(crate) fn build(&self, rule: RuleId, state: StateId) -> Result<Gla, CompileError> {
        let rtn = &self.rtns[rule.0 as usize];
        let mut initial: Node = Node::new();
        for index in 0..rtn.transitions_of(state).len() {
            // Tuples park on the pre-transition position; the decision
            // restricts which transition their first step may follow.
            initial.insert(PathPos {
                decision: GlaDecision::Take(index as u32),
                pos: Pos::At {
                    rule,
                    state,
                    stack: Stack::new(),
                },
            });
        }
        if rtn.state(state).is_final {
            // Returning from the rule is a candidate action too; it
            // continues at every call site.
            initial.insert(PathPos {
                decision: GlaDecision::Return,
                pos: Pos::At {
                    rule,
                    state,
                    stack: Stack::new(),
                },
            });
        }

        let mut states: Vec<GlaState> = Vec::new();
        let mut transitions: Vec<GlaTransition> = Vec::new();
        let mut edges: Vec<Vec<(Lookahead, u32)>> = Vec::new();
        let mut ids: AHashMap<Node, u32> = AHashMap::default();
        let mut depths: Vec<usize> = Vec::new();
        ids.insert(initial.clone(), 0);
        depths.push(0);
        edges.push(Vec::new());
        states.push(GlaState {
            trans_start: 0,
            trans_count: 0,
            intfa: None,
            decision: None,
        });
        let mut worklist: Vec<(Node, u32)> = vec![(initial, 0)];

        while let Some((node, id)) = worklist.pop() {
            // In the initial node every tuple still sits on the same
            // pre-commitment position, so sharing positions proves nothing
            // there; the tie-break only applies once a terminal has been
            // consumed.
            if let Some(decision) = self.settled_decision(&node, id != 0) {
                states[id as usize].decision = Some(decision);
                continue;
            }
            let depth = depths[id as usize];
            if depth >= self.max_lookahead {
                return Err(CompileError::AmbiguousLookahead {
                    rule: self
                        .strings
                        .resolve(rtn.name)
                        .unwrap_or("<unknown>")
                        .to_string(),
                    state: state.0,
                    max_lookahead: self.max_lookahead,
                });
            }
            // Only the initial node's tuples are still pre-commitment; once
            // a path has consumed a terminal its exploration is free.
            let restrict = id == 0;
            let mut by_terminal: BTreeMap<Lookahead, Node> = BTreeMap::new();
            for tuple in &node {
                for (on, next) in self.successors(rule, state, tuple, restrict) {
                    by_terminal.entry(on).or_default().insert(next);
                }
            }
            if by_terminal.is_empty() {
                // Nothing can follow from any live path; fall back to the
                // stable tie-break.
                states[id as usize].decision = Some(self.minimum_decision(&node));
                continue;
            }
            for (on, next) in by_terminal {
                let target = match ids.get(&next) {
                    Some(&t) => t,
                    None => {
                        let t = states.len() as u32;
                        ids.insert(next.clone(), t);
                        depths.push(depth + 1);
                        edges.push(Vec::new());
                        states.push(GlaState {
                            trans_start: 0,
                            trans_count: 0,
                            intfa: None,
                            decision: None,
                        });
                        worklist.push((next, t));
                        t
                    }
                };
                edges[id as usize].push((on, target));
            }
        }

        for (id, state_edges) in edges.iter().enumerate() {
            states[id].trans_start = transitions.len() as u32;
            states[id].trans_count = state_edges.len() as u32;
            for &(on, target) in state_edges {
                transitions.push(GlaTransition {
                    on,
                    target: StateId(target),
                });
            }
        }
        Ok(Gla {
            states,
            transitions,
        })
    }

    /// A node is settled when one decision remains, or (with `allow_tie`)
    /// when every remaining decision sees exactly the same positions, in
    /// which case no further terminal can separate them and the
    /// lowest-numbered transition wins.
    fn settled_decision(&self, node: &Node, allow_tie: bool) -> Option<GlaDecision> {
        let mut per_decision: BTreeMap<GlaDecision, BTreeSet<&Pos>> = BTreeMap::new();
        for tuple in node {
            per_decision
                .entry(tuple.decision)
                .or_default()
                .insert(&tuple.pos);
        }
        let mut iter = per_decision.iter();
        let (&first_decision, first_positions) = iter.next()?;
        if per_decision.len() == 1 {
            return Some(first_decision);
        }
        if !allow_tie {
            return None;
        }
        for (_, positions) in iter {
            if positions != first_positions {
                return None;
            }
        }
        Some(first_decision)
    }

    fn minimum_decision(&self, node: &Node) -> GlaDecision {
        node.iter()
            .map(|tuple| tuple.decision)
            .min()
            .expect("a GLA node is never empty")
    }

    /// The terminals a tuple can consume next, with the positions reached
    /// after each. Epsilon structure (rule calls and returns) is followed
    /// transparently.
    fn successors(
        &self,
        gla_rule: RuleId,
        gla_state: StateId,
        tuple: &PathPos,
        restrict: bool,
    ) -> Vec<(Lookahead, PathPos)> {
        let mut out = Vec::new();
        let (rule, state, stack) = match &tuple.pos {
            Pos::Done => return out,
            Pos::At { rule, state, stack } => (*rule, *state, stack.clone()),
        };
        let mut visited: AHashSet<(RuleId, StateId, Stack)> = AHashSet::default();
        let mut frontier: Vec<(RuleId, StateId, Stack)> = vec![(rule, state, stack)];
        let mut first = true;
        while let Some((rule, state, stack)) = frontier.pop() {
            if !visited.insert((rule, state, stack.clone())) {
                continue;
            }
            let rtn = &self.rtns[rule.0 as usize];
            let transitions = rtn.transitions_of(state);
            for (index, transition) in transitions.iter().enumerate() {
                // The very first step out of the GLA's own state must follow
                // the tuple's decision; everywhere else all transitions are
                // live.
                if restrict && first && rule == gla_rule && state == gla_state {
                    match tuple.decision {
                        GlaDecision::Take(k) if k as usize == index => {}
                        GlaDecision::Take(_) => continue,
                        GlaDecision::Return => continue,
                    }
                }
                match transition.label {
                    RtnLabel::Terminal(t) => {
                        out.push((
                            Lookahead::Terminal(t),
                            PathPos {
                                decision: tuple.decision,
                                pos: Pos::At {
                                    rule,
                                    state: transition.target,
                                    stack: stack.clone(),
                                },
                            },
                        ));
                    }
                    RtnLabel::Rule(callee) => {
                        let frame = CallFrame {
                            rule,
                            state: transition.target,
                        };
                        let mut next_stack = stack.clone();
                        // Tail-recursive return-site merging: a frame that
                        // is already on the stack is not pushed again, so
                        // self-similar recursion keeps the frontier finite.
                        if !next_stack.contains(&frame) {
                            next_stack.push(frame);
                        }
                        frontier.push((callee, StateId(0), next_stack));
                    }
                }
            }
            let leaving_gla_state = restrict && first && rule == gla_rule && state == gla_state;
            let may_return = if leaving_gla_state {
                tuple.decision == GlaDecision::Return
            } else {
                rtn.state(state).is_final
            };
            if may_return {
                let mut stack = stack.clone();
                if let Some(frame) = stack.pop() {
                    frontier.push((frame.rule, frame.state, stack));
                } else {
                    if rule == self.start_rule {
                        out.push((
                            Lookahead::Eof,
                            PathPos {
                                decision: tuple.decision,
                                pos: Pos::Done,
                            },
                        ));
                    }
                    if let Some(sites) = self.call_sites.get(&rule) {
                        for &(caller, return_site) in sites {
                            frontier.push((caller, return_site, Stack::new()));
                        }
                    }
                }
            }
            first = false;
        }
        out
    }
}
