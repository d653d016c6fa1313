//! The embedded regular-expression dialect of `/.../` terminals.
//!
//! Supported syntax: alternation `|`, grouping `(...)`, the quantifiers
//! `?`, `*`, `+` and `{n}`/`{n,}`/`{n,m}`, character classes `[...]` with
//! ranges and `^` negation, `.` (any byte but a newline) and the usual
//! escapes (`\n`, `\t`, `\r`, `\0`, `\xHH`, `\d`, `\w`, `\s` and their
//! uppercase complements, plus `\c` for any punctuation `c`). The alphabet
//! is octets: multi-byte UTF-8 characters are matched byte for byte and are
//! not allowed inside classes.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{anychar, char, none_of, satisfy};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded};
use nom::{Finish, IResult};

use crate::fa::{ByteRange, Nfa};
use crate::utils::ByteSet;

type Input<'a> = &'a str;
type PResult<'a, T> = IResult<Input<'a>, T, nom::error::Error<Input<'a>>>;

/// A parsed regular expression over bytes.
#[derive(Debug, Clone)]
pub(crate) enum RegexAst {
    /// One byte out of a set.
    Class(ByteSet),
    Concat(Vec<RegexAst>),
    Alt(Vec<RegexAst>),
    Opt(Box<RegexAst>),
    Star(Box<RegexAst>),
    Plus(Box<RegexAst>),
    Repeat(Box<RegexAst>, u32, Option<u32>),
    /// The empty string.
    Empty,
}

/// A syntax error inside a `/regex/` terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid regex /{pattern}/: {message}")]
pub struct RegexSyntaxError {
    /// The regex body as written in the grammar.
    pub pattern: String,
    /// What was rejected.
    pub message: String,
}

fn err(pattern: &str, message: impl Into<String>) -> RegexSyntaxError {
    RegexSyntaxError {
        pattern: pattern.to_string(),
        message: message.into(),
    }
}

/// Parse a regex body (the text between the slashes).
pub(crate) fn parse_regex(pattern: &str) -> Result<RegexAst, RegexSyntaxError> {
    match all_consuming(alternation)(pattern).finish() {
        Ok((_, ast)) => Ok(ast),
        Err(e) => {
            let offset = pattern.len() - e.input.len();
            Err(err(
                pattern,
                format!("unrecognized syntax at byte offset {}", offset),
            ))
        }
    }
}

fn alternation(input: Input) -> PResult<RegexAst> {
    map(separated_list1(char('|'), concat), |mut alts| {
        if alts.len() == 1 {
            alts.pop().unwrap()
        } else {
            RegexAst::Alt(alts)
        }
    })(input)
}

fn concat(input: Input) -> PResult<RegexAst> {
    map(many0(repeat), |items| match items.len() {
        0 => RegexAst::Empty,
        1 => items.into_iter().next().unwrap(),
        _ => RegexAst::Concat(items),
    })(input)
}

fn repeat(input: Input) -> PResult<RegexAst> {
    let (mut rest, mut node) = atom(input)?;
    loop {
        let (r, quantifier) = opt(alt((
            map(char('?'), |_| (0u32, Some(1u32), false)),
            map(char('*'), |_| (0, None, false)),
            map(char('+'), |_| (1, None, false)),
            map(counted, |(min, max)| (min, max, true)),
        )))(rest)?;
        match quantifier {
            None => return Ok((rest, node)),
            Some((0, Some(1), false)) => node = RegexAst::Opt(Box::new(node)),
            Some((0, None, false)) => node = RegexAst::Star(Box::new(node)),
            Some((1, None, false)) => node = RegexAst::Plus(Box::new(node)),
            Some((min, max, _)) => node = RegexAst::Repeat(Box::new(node), min, max),
        }
        rest = r;
    }
}

fn counted(input: Input) -> PResult<(u32, Option<u32>)> {
    let number = |i| {
        map(
            nom::bytes::complete::take_while1(|c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<u32>().unwrap_or(u32::MAX),
        )(i)
    };
    delimited(
        char('{'),
        alt((
            pair(number, preceded(char(','), opt(number))),
            map(number, |n| (n, Some(n))),
        )),
        char('}'),
    )(input)
}

fn hex_byte(input: Input) -> PResult<u8> {
    preceded(
        tag("\\x"),
        map_res(
            take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
            |s: &str| u8::from_str_radix(s, 16),
        ),
    )(input)
}

fn atom(input: Input) -> PResult<RegexAst> {
    alt((
        delimited(char('('), alternation, char(')')),
        map(char('.'), |_| RegexAst::Class(any_byte_but_newline())),
        class,
        map(hex_byte, |b| RegexAst::Class(single_byte(b))),
        map(preceded(char('\\'), anychar), escape_to_ast),
        map(none_of("|*+?()[]{}\\."), plain_char_to_ast),
    ))(input)
}

fn plain_char_to_ast(c: char) -> RegexAst {
    let mut buf = [0u8; 4];
    let bytes = c.encode_utf8(&mut buf).as_bytes().to_vec();
    if bytes.len() == 1 {
        RegexAst::Class(single_byte(bytes[0]))
    } else {
        RegexAst::Concat(
            bytes
                .into_iter()
                .map(|b| RegexAst::Class(single_byte(b)))
                .collect(),
        )
    }
}

fn escape_to_ast(c: char) -> RegexAst {
    match c {
        'd' | 'w' | 's' | 'D' | 'W' | 'S' => RegexAst::Class(perl_class(c)),
        _ => match escape_to_byte(c) {
            Some(b) => RegexAst::Class(single_byte(b)),
            None => plain_char_to_ast(c),
        },
    }
}

fn escape_to_byte(c: char) -> Option<u8> {
    match c {
        'n' => Some(b'\n'),
        't' => Some(b'\t'),
        'r' => Some(b'\r'),
        '0' => Some(0),
        _ => None,
    }
}

fn perl_class(c: char) -> ByteSet {
    let mut set = ByteSet::with_capacity(256);
    let insert_ranges = |set: &mut ByteSet, ranges: &[(u8, u8)]| {
        for &(lo, hi) in ranges {
            for b in lo..=hi {
                set.insert(b as usize);
            }
        }
    };
    match c {
        'd' | 'D' => insert_ranges(&mut set, &[(b'0', b'9')]),
        'w' | 'W' => insert_ranges(
            &mut set,
            &[(b'0', b'9'), (b'A', b'Z'), (b'a', b'z'), (b'_', b'_')],
        ),
        's' | 'S' => insert_ranges(
            &mut set,
            &[(b' ', b' '), (b'\t', b'\t'), (b'\n', b'\n'), (b'\r', b'\r'), (0x0b, 0x0c)],
        ),
        _ => unreachable!(),
    }
    if c.is_ascii_uppercase() {
        negate(&set)
    } else {
        set
    }
}

fn single_byte(b: u8) -> ByteSet {
    let mut set = ByteSet::with_capacity(256);
    set.insert(b as usize);
    set
}

fn any_byte_but_newline() -> ByteSet {
    negate(&single_byte(b'\n'))
}

fn negate(set: &ByteSet) -> ByteSet {
    let mut out = ByteSet::with_capacity(256);
    for b in 0..=u8::MAX as usize {
        if !set.contains(b) {
            out.insert(b);
        }
    }
    out
}

fn class_byte(input: Input) -> PResult<u8> {
    alt((
        hex_byte,
        map(preceded(char('\\'), anychar), |c| {
            escape_to_byte(c).unwrap_or(c as u8)
        }),
        map(satisfy(|c| c != ']' && c as u32 <= 0x7f), |c| c as u8),
    ))(input)
}

fn class(input: Input) -> PResult<RegexAst> {
    let (rest, _) = char('[')(input)?;
    let (rest, negated) = opt(char('^'))(rest)?;
    let mut set = ByteSet::with_capacity(256);
    let mut rest = rest;
    loop {
        if rest.starts_with(']') {
            break;
        }
        let (r, perl) = opt(preceded(
            char('\\'),
            satisfy(|c| matches!(c, 'd' | 'w' | 's' | 'D' | 'W' | 'S')),
        ))(rest)?;
        if let Some(c) = perl {
            for b in perl_class(c).ones() {
                set.insert(b);
            }
            rest = r;
            continue;
        }
        let (r, lo) = class_byte(rest)?;
        // A trailing `-` right before `]` is a literal dash.
        if r.starts_with('-') && !r[1..].starts_with(']') {
            let (r2, _) = char('-')(r)?;
            let (r2, hi) = class_byte(r2)?;
            for b in lo..=hi {
                set.insert(b as usize);
            }
            rest = r2;
        } else {
            set.insert(lo as usize);
            rest = r;
        }
    }
    let (rest, _) = char(']')(rest)?;
    let set = if negated.is_some() { negate(&set) } else { set };
    Ok((rest, RegexAst::Class(set)))
}

/// Convert a byte set into maximal inclusive ranges.
pub(crate) fn class_ranges(set: &ByteSet) -> Vec<(u8, u8)> {
    let mut ranges: Vec<(u8, u8)> = Vec::new();
    for b in set.ones() {
        let b = b as u8;
        match ranges.last_mut() {
            Some((_, hi)) if *hi != u8::MAX && *hi + 1 == b => *hi = b,
            _ => ranges.push((b, b)),
        }
    }
    ranges
}

impl RegexAst {
    /// Append this expression to `nfa` as a fragment starting in `from`;
    /// returns the fragment's end state.
    pub(crate) fn build(&self, nfa: &mut Nfa<ByteRange>, from: usize) -> usize {
        match self {
            RegexAst::Empty => from,
            RegexAst::Class(set) => {
                let to = nfa.add_state();
                for (lo, hi) in class_ranges(set) {
                    nfa.add_transition(from, ByteRange { lo, hi }, to);
                }
                to
            }
            RegexAst::Concat(items) => items.iter().fold(from, |at, item| item.build(nfa, at)),
            RegexAst::Alt(alts) => {
                let to = nfa.add_state();
                for alt in alts {
                    let end = alt.build(nfa, from);
                    nfa.add_eps(end, to);
                }
                to
            }
            RegexAst::Opt(inner) => {
                let end = inner.build(nfa, from);
                let to = nfa.add_state();
                nfa.add_eps(end, to);
                nfa.add_eps(from, to);
                to
            }
            RegexAst::Star(inner) => {
                let hub = nfa.add_state();
                nfa.add_eps(from, hub);
                let end = inner.build(nfa, hub);
                nfa.add_eps(end, hub);
                hub
            }
            RegexAst::Plus(inner) => {
                let end = inner.build(nfa, from);
                let hub = nfa.add_state();
                nfa.add_eps(end, hub);
                let again = inner.build(nfa, hub);
                nfa.add_eps(again, hub);
                hub
            }
            RegexAst::Repeat(inner, min, max) => {
                let mut at = from;
                for _ in 0..*min {
                    at = inner.build(nfa, at);
                }
                match max {
                    None => RegexAst::Star(inner.clone()).build(nfa, at),
                    Some(max) => {
                        let to = nfa.add_state();
                        nfa.add_eps(at, to);
                        for _ in *min..*max {
                            at = inner.build(nfa, at);
                            nfa.add_eps(at, to);
                        }
                        to
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fa::atomize_ranges;

    fn matches(pattern: &str, input: &str) -> bool {
        let ast = parse_regex(pattern).unwrap();
        let mut nfa = Nfa::new();
        let end = ast.build(&mut nfa, 0);
        nfa.set_accept(end, 0);
        atomize_ranges(&mut nfa);
        let dfa = nfa.determinize();
        let mut state = 0;
        for &b in input.as_bytes() {
            match dfa.states[state]
                .trans
                .iter()
                .find(|&&(r, _)| r.lo <= b && b <= r.hi)
            {
                Some(&(_, to)) => state = to,
                None => return false,
            }
        }
        !dfa.states[state].accepts.is_empty()
    }

    #[test]
    fn digits() {
        assert!(matches("[0-9]+", "123"));
        assert!(!matches("[0-9]+", ""));
        assert!(!matches("[0-9]+", "12a"));
    }

    #[test]
    fn whitespace_class() {
        assert!(matches("[ \\t]+", " \t "));
        assert!(!matches("[ \\t]+", "\n"));
    }

    #[test]
    fn alternation_and_groups() {
        assert!(matches("ab|cd", "ab"));
        assert!(matches("ab|cd", "cd"));
        assert!(matches("(a|b)*c", "abbac"));
        assert!(matches("(a|b)*c", "c"));
        assert!(!matches("(a|b)*c", "abd"));
    }

    #[test]
    fn quantifiers() {
        assert!(matches("a?b", "b"));
        assert!(matches("a?b", "ab"));
        assert!(matches("a{2,3}", "aa"));
        assert!(matches("a{2,3}", "aaa"));
        assert!(!matches("a{2,3}", "a"));
        assert!(!matches("a{2,3}", "aaaa"));
        assert!(matches("a{2,}", "aaaaa"));
        assert!(matches("a{3}", "aaa"));
        assert!(!matches("a{3}", "aa"));
    }

    #[test]
    fn dot_and_negated_class() {
        assert!(matches(".", "x"));
        assert!(!matches(".", "\n"));
        assert!(matches("[^a]", "b"));
        assert!(!matches("[^a]", "a"));
    }

    #[test]
    fn perl_classes() {
        assert!(matches("\\d+", "42"));
        assert!(matches("\\w+", "id_9"));
        assert!(matches("\\s", " "));
        assert!(!matches("\\S", " "));
    }

    #[test]
    fn escaped_metacharacters() {
        assert!(matches("\\.", "."));
        assert!(!matches("\\.", "x"));
        assert!(matches("a\\+b", "a+b"));
    }

    #[test]
    fn trailing_dash_is_literal() {
        assert!(matches("[a-]", "-"));
        assert!(matches("[a-]", "a"));
        assert!(!matches("[a-]", "b"));
    }

    #[test]
    fn hex_escapes() {
        assert!(matches("\\x41+", "AAA"));
        assert!(matches("[\\x30-\\x39]", "7"));
    }

    #[test]
    fn bad_regex_is_rejected() {
        assert!(parse_regex("(a").is_err());
        assert!(parse_regex("a)").is_err());
        assert!(parse_regex("[a").is_err());
    }
}
