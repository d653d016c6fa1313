//! Shared finite-automaton algorithms: epsilon-NFA construction, subset
//! construction and Hopcroft minimization over an arbitrary discrete label
//! alphabet.
//!
//! Machines are arenas of states addressed by index; cross-references are
//! indices, never pointers, so the results map directly onto the compiled
//! grammar's serialized form. The label type is generic: the RTN builder
//! instantiates it with symbol+slot edges, the lexical pipeline with
//! atomized byte ranges.
use std::hash::Hash;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;

use crate::utils::ByteSet;

/// One state of an epsilon-NFA under construction.
#[derive(Debug, Clone)]
struct NfaState<L> {
    eps: Vec<usize>,
    trans: Vec<(L, usize)>,
    /// Accept tag; multiple NFA states may carry different tags and the
    /// subset construction unions them.
    accept: Option<u32>,
}

/// An epsilon-NFA over labels of type `L`. State 0 is the start state.
#[derive(Debug, Clone)]
pub(crate) struct Nfa<L> {
    states: Vec<NfaState<L>>,
}

impl<L: Copy + Eq + Hash + Ord> Nfa<L> {
    pub(crate) fn new() -> Self {
        Self {
            states: vec![NfaState {
                eps: Vec::new(),
                trans: Vec::new(),
                accept: None,
            }],
        }
    }

    pub(crate) fn add_state(&mut self) -> usize {
        self.states.push(NfaState {
            eps: Vec::new(),
            trans: Vec::new(),
            accept: None,
        });
        self.states.len() - 1
    }

    pub(crate) fn add_eps(&mut self, from: usize, to: usize) {
        self.states[from].eps.push(to);
    }

    pub(crate) fn add_transition(&mut self, from: usize, label: L, to: usize) {
        self.states[from].trans.push((label, to));
    }

    pub(crate) fn set_accept(&mut self, state: usize, tag: u32) {
        self.states[state].accept = Some(tag);
    }

    fn eps_closure(&self, seed: &[usize]) -> Vec<usize> {
        let mut seen = FixedBitSet::with_capacity(self.states.len());
        let mut stack: Vec<usize> = Vec::new();
        for &s in seed {
            if !seen.contains(s) {
                seen.insert(s);
                stack.push(s);
            }
        }
        let mut closure = stack.clone();
        while let Some(s) = stack.pop() {
            for &t in &self.states[s].eps {
                if !seen.contains(t) {
                    seen.insert(t);
                    closure.push(t);
                    stack.push(t);
                }
            }
        }
        closure.sort_unstable();
        closure
    }

    /// Subset construction. The result is deterministic: labels are explored
    /// in `Ord` order, so equal inputs build bit-identical automata.
    pub(crate) fn determinize(&self) -> Dfa<L> {
        let mut dfa = Dfa { states: Vec::new() };
        let mut subset_ids: AHashMap<Vec<usize>, usize> = AHashMap::default();
        let start = self.eps_closure(&[0]);
        subset_ids.insert(start.clone(), 0);
        dfa.states.push(self.subset_state(&start));
        let mut worklist = vec![start];
        while let Some(subset) = worklist.pop() {
            let from = subset_ids[&subset];
            // Group the member states' transitions by label.
            let mut by_label: AHashMap<L, Vec<usize>> = AHashMap::default();
            for &s in &subset {
                for &(label, to) in &self.states[s].trans {
                    by_label.entry(label).or_default().push(to);
                }
            }
            let mut labels: Vec<L> = by_label.keys().copied().collect();
            labels.sort_unstable();
            for label in labels {
                let next = self.eps_closure(&by_label[&label]);
                let to = match subset_ids.get(&next) {
                    Some(&id) => id,
                    None => {
                        let id = dfa.states.len();
                        subset_ids.insert(next.clone(), id);
                        dfa.states.push(self.subset_state(&next));
                        worklist.push(next);
                        id
                    }
                };
                dfa.states[from].trans.push((label, to));
            }
        }
        dfa
    }

    fn subset_state(&self, subset: &[usize]) -> DfaState<L> {
        let mut accepts: Vec<u32> = subset
            .iter()
            .filter_map(|&s| self.states[s].accept)
            .collect();
        accepts.sort_unstable();
        accepts.dedup();
        DfaState {
            trans: Vec::new(),
            accepts,
        }
    }
}

/// One state of a deterministic automaton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DfaState<L> {
    pub(crate) trans: Vec<(L, usize)>,
    /// The accept tags of the underlying NFA states, sorted and deduplicated.
    pub(crate) accepts: Vec<u32>,
}

/// A deterministic automaton over labels of type `L`. State 0 is the start
/// state.
#[derive(Debug, Clone)]
pub(crate) struct Dfa<L> {
    pub(crate) states: Vec<DfaState<L>>,
}

impl<L: Copy + Eq + Hash + Ord> Dfa<L> {
    /// Hopcroft minimization. States are distinguished by their accept tags
    /// and, transitively, by where their labels lead; a partial transition
    /// function is completed with an implicit dead state that is dropped
    /// again on rebuild. The minimized machine is renumbered so the start
    /// state is index 0 and the remaining states follow in breadth-first
    /// order.
    pub(crate) fn minimize(&self) -> Dfa<L> {
        let n = self.states.len();
        let sink = n;
        let mut labels: Vec<L> = self
            .states
            .iter()
            .flat_map(|s| s.trans.iter().map(|&(l, _)| l))
            .collect();
        labels.sort_unstable();
        labels.dedup();

        // Inverse transition function, per label, including the sink.
        let mut preimage: AHashMap<L, Vec<Vec<usize>>> = AHashMap::default();
        for &label in &labels {
            preimage.insert(label, vec![Vec::new(); n + 1]);
        }
        for (from, state) in self.states.iter().enumerate() {
            let mut seen: Vec<L> = Vec::with_capacity(state.trans.len());
            for &(label, to) in &state.trans {
                preimage.get_mut(&label).unwrap()[to].push(from);
                seen.push(label);
            }
            for &label in &labels {
                if !seen.contains(&label) {
                    preimage.get_mut(&label).unwrap()[sink].push(from);
                }
            }
        }
        for &label in &labels {
            // The sink loops to itself on every label.
            preimage.get_mut(&label).unwrap()[sink].push(sink);
        }

        // Initial partition: one block per accept signature, plus the sink's
        // own block.
        let mut block_of: Vec<usize> = vec![0; n + 1];
        let mut blocks: Vec<Vec<usize>> = Vec::new();
        {
            let mut by_signature: AHashMap<Vec<u32>, usize> = AHashMap::default();
            for (state, data) in self.states.iter().enumerate() {
                let block = *by_signature.entry(data.accepts.clone()).or_insert_with(|| {
                    blocks.push(Vec::new());
                    blocks.len() - 1
                });
                block_of[state] = block;
                blocks[block].push(state);
            }
            blocks.push(vec![sink]);
            block_of[sink] = blocks.len() - 1;
        }

        let mut worklist: Vec<usize> = (0..blocks.len()).collect();
        while let Some(splitter) = worklist.pop() {
            let splitter_states = blocks[splitter].clone();
            for &label in &labels {
                let inverse = &preimage[&label];
                let mut touched: Vec<usize> = splitter_states
                    .iter()
                    .flat_map(|&s| inverse[s].iter().copied())
                    .collect();
                touched.sort_unstable();
                touched.dedup();
                if touched.is_empty() {
                    continue;
                }
                // Which blocks does the preimage cut in two?
                let mut affected: Vec<usize> = touched.iter().map(|&s| block_of[s]).collect();
                affected.sort_unstable();
                affected.dedup();
                for block in affected {
                    let (inside, outside): (Vec<usize>, Vec<usize>) = blocks[block]
                        .iter()
                        .copied()
                        .partition(|s| touched.binary_search(s).is_ok());
                    if inside.is_empty() || outside.is_empty() {
                        continue;
                    }
                    let new_block = blocks.len();
                    for &s in &inside {
                        block_of[s] = new_block;
                    }
                    blocks[block] = outside;
                    blocks.push(inside);
                    if worklist.contains(&block) {
                        worklist.push(new_block);
                    } else if blocks[block].len() < blocks[new_block].len() {
                        worklist.push(block);
                    } else {
                        worklist.push(new_block);
                    }
                }
            }
        }

        // Rebuild, breadth-first from the start block, skipping the sink.
        let sink_block = block_of[sink];
        let mut new_ids: Vec<Option<usize>> = vec![None; blocks.len()];
        let start_block = block_of[0];
        new_ids[start_block] = Some(0);
        let mut order = vec![start_block];
        let mut head = 0;
        while head < order.len() {
            let block = order[head];
            head += 1;
            let representative = blocks[block][0];
            for &(_, to) in &self.states[representative].trans {
                let to_block = block_of[to];
                if to_block != sink_block && new_ids[to_block].is_none() {
                    new_ids[to_block] = Some(order.len());
                    order.push(to_block);
                }
            }
        }
        let mut result = Dfa {
            states: Vec::with_capacity(order.len()),
        };
        for &block in &order {
            let representative = blocks[block][0];
            let old = &self.states[representative];
            let mut trans: Vec<(L, usize)> = old
                .trans
                .iter()
                .filter(|&&(_, to)| block_of[to] != sink_block)
                .map(|&(label, to)| (label, new_ids[block_of[to]].unwrap()))
                .collect();
            trans.sort_unstable();
            result.states.push(DfaState {
                trans,
                accepts: old.accepts.clone(),
            });
        }
        result
    }
}

/// An inclusive byte range used as a lexical NFA label after atomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ByteRange {
    pub(crate) lo: u8,
    pub(crate) hi: u8,
}

/// Split every transition of a byte-range NFA so that any two labels in the
/// machine are either identical or disjoint. Subset construction can then
/// treat ranges as discrete symbols.
pub(crate) fn atomize_ranges(nfa: &mut Nfa<ByteRange>) {
    // A boundary opens at every range start and right past every range end.
    let mut boundaries = ByteSet::with_capacity(256);
    boundaries.insert(0);
    for state in &nfa.states {
        for &(range, _) in &state.trans {
            boundaries.insert(range.lo as usize);
            if range.hi < u8::MAX {
                boundaries.insert(range.hi as usize + 1);
            }
        }
    }
    let starts: Vec<u8> = boundaries.ones().map(|b| b as u8).collect();
    for state in &mut nfa.states {
        let old = std::mem::take(&mut state.trans);
        for (range, to) in old {
            let from_idx = starts.partition_point(|&s| s <= range.lo) - 1;
            for (i, &lo) in starts.iter().enumerate().skip(from_idx) {
                if lo > range.hi {
                    break;
                }
                let hi = if i + 1 < starts.len() {
                    starts[i + 1] - 1
                } else {
                    u8::MAX
                };
                state.trans.push((ByteRange { lo, hi }, to));
            }
        }
    }
}

/// Merge adjacent ranges with equal targets back together after
/// minimization, so serialized transitions stay compact.
pub(crate) fn coalesce_ranges(trans: &mut Vec<(ByteRange, usize)>) {
    trans.sort_unstable_by_key(|&(r, _)| r.lo);
    let mut merged: Vec<(ByteRange, usize)> = Vec::with_capacity(trans.len());
    for &(range, to) in trans.iter() {
        match merged.last_mut() {
            Some((prev, prev_to))
                if *prev_to == to && prev.hi != u8::MAX && prev.hi + 1 == range.lo =>
            {
                prev.hi = range.hi;
            }
            _ => merged.push((range, to)),
        }
    }
    *trans = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_nfa(words: &[(&str, u32)]) -> Nfa<ByteRange> {
        let mut nfa = Nfa::new();
        for &(word, tag) in words {
            let mut at = 0;
            for &b in word.as_bytes() {
                let next = nfa.add_state();
                nfa.add_transition(at, ByteRange { lo: b, hi: b }, next);
                at = next;
            }
            nfa.set_accept(at, tag);
        }
        nfa
    }

    fn run(dfa: &Dfa<ByteRange>, input: &str) -> Option<Vec<u32>> {
        let mut state = 0;
        for &b in input.as_bytes() {
            state = dfa.states[state]
                .trans
                .iter()
                .find(|&&(r, _)| r.lo <= b && b <= r.hi)
                .map(|&(_, to)| to)?;
        }
        Some(dfa.states[state].accepts.clone())
    }

    #[test]
    fn determinize_merges_prefixes() {
        let mut nfa = literal_nfa(&[("ab", 0), ("ac", 1)]);
        atomize_ranges(&mut nfa);
        let dfa = nfa.determinize();
        assert_eq!(run(&dfa, "ab"), Some(vec![0]));
        assert_eq!(run(&dfa, "ac"), Some(vec![1]));
        assert_eq!(run(&dfa, "a"), Some(vec![]));
        assert_eq!(run(&dfa, "ad"), None);
    }

    #[test]
    fn minimize_collapses_equivalent_tails() {
        // "ax" and "bx" share an equivalent one-byte tail.
        let mut nfa = literal_nfa(&[("ax", 0), ("bx", 0)]);
        atomize_ranges(&mut nfa);
        let dfa = nfa.determinize();
        let min = dfa.minimize();
        // start, the merged middle, the merged accept.
        assert_eq!(min.states.len(), 3);
        assert_eq!(run(&min, "ax"), Some(vec![0]));
        assert_eq!(run(&min, "bx"), Some(vec![0]));
        assert_eq!(run(&min, "xx"), None);
    }

    #[test]
    fn minimize_keeps_distinct_tags_apart() {
        let mut nfa = literal_nfa(&[("ax", 0), ("bx", 1)]);
        atomize_ranges(&mut nfa);
        let min = nfa.determinize().minimize();
        // The accept states carry different tags and must not merge.
        assert_eq!(run(&min, "ax"), Some(vec![0]));
        assert_eq!(run(&min, "bx"), Some(vec![1]));
        assert_eq!(min.states.len(), 5);
    }

    #[test]
    fn minimize_is_idempotent() {
        let mut nfa = literal_nfa(&[("aaa", 0), ("aab", 0), ("aba", 0)]);
        atomize_ranges(&mut nfa);
        let min = nfa.determinize().minimize();
        let again = min.minimize();
        assert_eq!(min.states.len(), again.states.len());
    }

    #[test]
    fn no_two_minimized_states_equivalent() {
        let mut nfa = literal_nfa(&[("if", 0), ("in", 1), ("int", 2)]);
        atomize_ranges(&mut nfa);
        let min = nfa.determinize().minimize();
        // Pairwise distinguishability: some string separates every pair.
        for a in 0..min.states.len() {
            for b in (a + 1)..min.states.len() {
                assert!(
                    distinguishable(&min, a, b),
                    "states {} and {} are equivalent",
                    a,
                    b
                );
            }
        }
    }

    fn distinguishable(dfa: &Dfa<ByteRange>, a: usize, b: usize) -> bool {
        let mut seen = ahash::AHashSet::default();
        let mut stack = vec![(a, b)];
        while let Some((x, y)) = stack.pop() {
            if !seen.insert((x, y)) {
                continue;
            }
            if dfa.states[x].accepts != dfa.states[y].accepts {
                return true;
            }
            for byte in 0..=u8::MAX {
                let step = |s: usize| {
                    dfa.states[s]
                        .trans
                        .iter()
                        .find(|&&(r, _)| r.lo <= byte && byte <= r.hi)
                        .map(|&(_, to)| to)
                };
                match (step(x), step(y)) {
                    (Some(nx), Some(ny)) => {
                        if nx != ny {
                            stack.push((nx, ny));
                        }
                    }
                    (None, None) => {}
                    _ => return true,
                }
            }
        }
        false
    }

    #[test]
    fn atomize_splits_overlaps() {
        let mut nfa = Nfa::new();
        let a = nfa.add_state();
        let b = nfa.add_state();
        nfa.add_transition(0, ByteRange { lo: b'0', hi: b'9' }, a);
        nfa.add_transition(0, ByteRange { lo: b'5', hi: b'z' }, b);
        atomize_ranges(&mut nfa);
        let dfa = nfa.determinize();
        // '7' belongs to both ranges; the subset state must exist.
        let hits = dfa.states[0]
            .trans
            .iter()
            .filter(|&&(r, _)| r.lo <= b'7' && b'7' <= r.hi)
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn coalesce_restores_wide_ranges() {
        let mut trans = vec![
            (ByteRange { lo: b'a', hi: b'f' }, 1),
            (ByteRange { lo: b'g', hi: b'z' }, 1),
            (ByteRange { lo: b'0', hi: b'9' }, 2),
        ];
        coalesce_ranges(&mut trans);
        assert_eq!(
            trans,
            vec![
                (ByteRange { lo: b'0', hi: b'9' }, 2),
                (ByteRange { lo: b'a', hi: b'z' }, 1),
            ]
        );
    }
}
