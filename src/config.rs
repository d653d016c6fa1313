//! The configuration module of the Gazelle toolchain.
use serde::{Deserialize, Serialize};

/// The configuration shared by the compiler and the streaming parser.
/// This should suffice most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Config {
    /// The rule the parse starts from when the grammar text does not carry a
    /// `start RULE;` directive. A `start` directive always wins.
    /// The default is `start`.
    pub start_rule: String,
    /// The maximum number of terminals a lookahead automaton may examine.
    /// The compiler rejects grammars whose states cannot be disambiguated
    /// within this many tokens, and the parser refuses to buffer more than
    /// this many tokens while a lookahead decision is pending.
    /// The default is `16`.
    pub max_lookahead: usize,
    /// The maximum depth of the parse stack, counting every rule, lookahead
    /// and lexer frame. The default is `1024`.
    pub max_stack_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_rule: "start".to_string(),
            max_lookahead: 16,
            max_stack_depth: 1024,
        }
    }
}
