/*!
# Gazelle

This crate compiles LL(*) grammars into a compact bytecode image and executes
that image as a streaming, incremental, pushdown parser. A compiled
[`Grammar`] bundles three kinds of machines: one recursive transition
network (RTN) per rule, shared lexical automata (IntFAs) over byte ranges,
and grammar lookahead automata (GLAs) attached to the RTN states that need
more than one terminal of lookahead. The [`ParseState`] interpreter feeds
bytes through all three, calling the host back for every terminal and rule
boundary.

Here is a quick example of how this crate works:

```rust
use std::ops::ControlFlow;
use std::sync::Arc;
use gazelle::{Config, Grammar, ParseEvents, ParseState, RuleEvent, TerminalEvent};

let grammar_str = r##"
start expr;
expr -> num +("+");
num -> /[0-9]+/;
WS -> /[ \t]+/;
allow WS in expr;
"##;
let grammar = Grammar::compile(grammar_str, &Config::default()).unwrap();

// The compiled grammar round-trips through its bytecode image.
let image = grammar.to_bytes();
let grammar = Arc::new(Grammar::from_bytes(&image).unwrap());

#[derive(Default)]
struct Collector(Vec<String>);
impl ParseEvents for Collector {
    fn start_rule(&mut self, event: &RuleEvent) -> ControlFlow<()> {
        self.0.push(format!("start({})", event.name));
        ControlFlow::Continue(())
    }
    fn end_rule(&mut self, event: &RuleEvent) -> ControlFlow<()> {
        self.0.push(format!("end({})", event.name));
        ControlFlow::Continue(())
    }
    fn terminal(&mut self, event: &TerminalEvent) -> ControlFlow<()> {
        self.0
            .push(format!("{}:{}", event.name, String::from_utf8_lossy(event.text)));
        ControlFlow::Continue(())
    }
}

let mut events = Collector::default();
let mut state = ParseState::new(grammar);
// Input can be fed in arbitrary chunks; whitespace is ignored inside `expr`
// because of the `allow` directive.
state.parse(b"12 + ", &mut events).unwrap();
state.parse(b"34", &mut events).unwrap();
state.finish_parse(&mut events).unwrap();
assert_eq!(
    events.0,
    ["start(expr)", "num:12", "+:+", "num:34", "end(expr)"]
);
```

# Overview

The pipeline has a persisted artifact in the middle:

- [`Grammar::compile`] parses the grammar text, desugars every rule into an
  epsilon-NFA over slot-labeled symbols, determinizes and minimizes each one
  into an RTN, synthesizes GLAs for the states a single terminal cannot
  disambiguate, and allocates shared lexical automata after checking the
  terminals for lexical conflicts.
- [`Grammar::to_bytes`] / [`Grammar::from_bytes`] serialize and load the
  bytecode image: an LLVM-bitcode-style bitstream starting with the ASCII
  magic `GH`, holding the string table, the IntFAs, the RTNs (start rule
  first) and the GLAs. Loaders skip blocks and records they do not know.
- [`ParseState::parse`] consumes input byte by byte, resumably: it returns
  when the buffer is exhausted and picks up exactly where it left off on the
  next call. [`ParseState::finish_parse`] closes the parse at end-of-input.

A grammar is immutable after loading and can be shared by any number of
parse states across threads (behind an [`std::sync::Arc`]); each parse state
itself is single-threaded and can be [`Clone`]d to fork speculative parses.

# Grammar language

A grammar is a list of `;`-terminated statements:

```text
s -> "X" ys?;             (* rule: sequences, alternation with |, groups *)
ys -> y +(",");           (* modifiers: ? * + and separated *(s) +(s)    *)
y -> "Y" | e;             (* a bare e is the empty derivation            *)
num -> /[0-9]+/;          (* a lone regex body defines a named terminal  *)
start s;                  (* chooses the top rule                        *)
allow WS in s, ys;        (* terminals to skip while a rule is parsing   *)
```

Terminals are written as single- or double-quoted literals (the quoted text
is also the terminal's name) or as `/regex/`. Every symbol occurrence in a
rule carries a slot: a name (overridable with `name=sym`) and a number,
which the parser hands back with each terminal so the host knows which
child of the current rule it just received.

# Errors

Compilation fails with a [`CompileError`] that points at the offending
source position (syntax errors), names the offending rule (left recursion,
ambiguous lookahead) or the colliding terminals (lexical conflicts).
Loading fails with a [`LoadGrammarError`] naming the corrupt structure.
Parsing fails with a [`ParseError`]; the state is then positioned before
the offending input, which [`ParseEvents::error_char`] or
[`ParseEvents::error_terminal`] has already reported.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod bitstream;
pub mod buffer;
pub mod bytecode;
pub mod compiler;
pub mod config;
mod fa;
pub mod grammar;
mod lookahead;
pub mod parser;
mod regex;
mod syntax;
mod utils;

pub use buffer::{parse_reader, StreamParseError};
pub use bytecode::LoadGrammarError;
pub use compiler::CompileError;
pub use config::Config;
pub use grammar::{Grammar, RuleId, TerminalId};
pub use parser::{
    NullEvents, Offset, ParseError, ParseEvents, ParseOutcome, ParseState, RuleEvent,
    TerminalEvent,
};
pub use regex::RegexSyntaxError;
pub use syntax::GrammarSyntaxError;
