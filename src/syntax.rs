//! The grammar surface syntax.
//!
//! A grammar is a sequence of statements terminated by `;`. Whitespace is
//! insignificant everywhere. The statement forms are:
//!
//! ```text
//! name -> derivation | derivation | ... ;     (* rule definition *)
//! name -> /regex/;                            (* named terminal definition *)
//! start name;                                 (* select the top rule *)
//! allow IGN in r1, r2, ...;                   (* runtime ignore sets *)
//! ```
//!
//! A derivation is a sequence of items. An item is a string literal
//! (`"..."` or `'...'`, `\` escaping the next character), an embedded
//! `/regex/`, a name reference, or a parenthesized alternation, optionally
//! prefixed by `slot=` to override the slot name and optionally suffixed by
//! one of the modifiers `?`, `*`, `+`, `*(sep)`, `+(sep)`. A bare `e`
//! denotes the empty derivation.
use nom::branch::alt;
use nom::character::complete::{anychar, char, multispace0, none_of, satisfy};
use nom::combinator::{all_consuming, cut, map, opt, recognize};
use nom::error::{ContextError, ErrorKind, ParseError, VerboseError, VerboseErrorKind};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::{Finish, IResult};

type Input<'a> = &'a str;
type PResult<'a, T> = IResult<Input<'a>, T, VerboseError<Input<'a>>>;

/// A source reference to a terminal or a rule, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SymbolRef {
    /// A bare identifier, resolved to a rule or a named terminal later.
    Name(String),
    /// A quoted literal; the text is the decoded byte content.
    Literal(String),
    /// An embedded regex; the text is the raw body between the slashes.
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expr {
    Alt(Vec<Expr>),
    Seq(Vec<Expr>),
    Opt(Box<Expr>),
    Star(Box<Expr>),
    Plus(Box<Expr>),
    /// `x *(sep)`: zero or more `x` separated by `sep`.
    SepStar(Box<Expr>, Box<Expr>),
    /// `x +(sep)`: one or more `x` separated by `sep`.
    SepPlus(Box<Expr>, Box<Expr>),
    Sym {
        sym: SymbolRef,
        slot: Option<String>,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Definition { name: String, expr: Expr },
    Start { name: String },
    Allow { ignored: String, rules: Vec<String> },
}

/// A syntax error in the grammar text, pointing at the offending position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("grammar syntax error at line {line}, column {column}: {message}")]
pub struct GrammarSyntaxError {
    /// 0-based byte offset of the error.
    pub offset: usize,
    /// 1-based line of the error.
    pub line: usize,
    /// 1-based column of the error.
    pub column: usize,
    /// What the parser expected or rejected.
    pub message: String,
}

fn ws<'a, O>(
    mut inner: impl FnMut(Input<'a>) -> PResult<'a, O>,
) -> impl FnMut(Input<'a>) -> PResult<'a, O> {
    move |input| preceded(multispace0, |i| inner(i))(input)
}

fn ident(input: Input) -> PResult<&str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        nom::bytes::complete::take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn quoted(delim: char) -> impl FnMut(Input) -> PResult<String> {
    move |input| {
        let escaped_char = preceded(char('\\'), anychar);
        let plain = none_of(if delim == '"' { "\"\\" } else { "'\\" });
        delimited(
            char(delim),
            map(many0(alt((escaped_char, plain))), |chars| {
                chars.into_iter().collect()
            }),
            char(delim),
        )(input)
    }
}

fn string_literal(input: Input) -> PResult<String> {
    alt((quoted('"'), quoted('\'')))(input)
}

/// The raw body of a `/regex/`. `\/` collapses to `/`; every other escape is
/// kept verbatim for the regex parser.
fn regex_literal(input: Input) -> PResult<String> {
    let escaped = map(preceded(char('\\'), anychar), |c| {
        if c == '/' {
            "/".to_string()
        } else {
            format!("\\{}", c)
        }
    });
    let plain = map(none_of("/\\"), |c: char| c.to_string());
    delimited(
        char('/'),
        map(many0(alt((escaped, plain))), |parts| parts.concat()),
        char('/'),
    )(input)
}

fn symbol_ref(input: Input) -> PResult<SymbolRef> {
    alt((
        map(string_literal, SymbolRef::Literal),
        map(regex_literal, SymbolRef::Regex),
        map(ident, |s| SymbolRef::Name(s.to_string())),
    ))(input)
}

fn primary(input: Input) -> PResult<Expr> {
    alt((
        map(string_literal, |s| Expr::Sym {
            sym: SymbolRef::Literal(s),
            slot: None,
        }),
        map(regex_literal, |s| Expr::Sym {
            sym: SymbolRef::Regex(s),
            slot: None,
        }),
        delimited(ws(char('(')), alternation, ws(char(')'))),
        map(ident, |s| {
            if s == "e" {
                Expr::Empty
            } else {
                Expr::Sym {
                    sym: SymbolRef::Name(s.to_string()),
                    slot: None,
                }
            }
        }),
    ))(input)
}

fn separator(input: Input) -> PResult<Expr> {
    map(
        delimited(ws(char('(')), ws(symbol_ref), ws(char(')'))),
        |sym| Expr::Sym { sym, slot: None },
    )(input)
}

fn apply_modifier(input: Input, expr: Expr) -> PResult<Expr> {
    let (rest, modifier) = opt(ws(alt((char('?'), char('*'), char('+')))))(input)?;
    match modifier {
        None => Ok((rest, expr)),
        Some('?') => {
            if separator(rest).is_ok() {
                let err = VerboseError::from_error_kind(rest, ErrorKind::Verify);
                return Err(nom::Err::Failure(VerboseError::add_context(
                    rest,
                    "`?` cannot take a separator; use `*(sep)` or `+(sep)`",
                    err,
                )));
            }
            Ok((rest, Expr::Opt(Box::new(expr))))
        }
        Some(kind) => {
            let (rest, sep) = opt(separator)(rest)?;
            let expr = match (kind, sep) {
                ('*', None) => Expr::Star(Box::new(expr)),
                ('*', Some(sep)) => Expr::SepStar(Box::new(expr), Box::new(sep)),
                ('+', None) => Expr::Plus(Box::new(expr)),
                ('+', Some(sep)) => Expr::SepPlus(Box::new(expr), Box::new(sep)),
                _ => unreachable!(),
            };
            Ok((rest, expr))
        }
    }
}

fn item(input: Input) -> PResult<Expr> {
    let (rest, slot) = opt(terminated(ws(ident), ws(char('='))))(input)?;
    let (rest, expr) = ws(primary)(rest)?;
    let expr = match (slot, expr) {
        (Some(name), Expr::Sym { sym, .. }) => Expr::Sym {
            sym,
            slot: Some(name.to_string()),
        },
        (Some(_), _) => {
            let err = VerboseError::from_error_kind(input, ErrorKind::Verify);
            return Err(nom::Err::Failure(VerboseError::add_context(
                input,
                "a slot name can only be given to a terminal or rule reference",
                err,
            )));
        }
        (None, other) => other,
    };
    apply_modifier(rest, expr)
}

fn sequence(input: Input) -> PResult<Expr> {
    let (rest, first) = item(input)?;
    let (rest, mut more) = many0(item)(rest)?;
    if more.is_empty() {
        Ok((rest, first))
    } else {
        more.insert(0, first);
        Ok((rest, Expr::Seq(more)))
    }
}

fn alternation(input: Input) -> PResult<Expr> {
    let (rest, alts) = separated_list1(ws(char('|')), sequence)(input)?;
    if alts.len() == 1 {
        Ok((rest, alts.into_iter().next().unwrap()))
    } else {
        Ok((rest, Expr::Alt(alts)))
    }
}

fn keyword(word: &'static str) -> impl FnMut(Input) -> PResult<()> {
    move |input| {
        let (rest, id) = ident(input)?;
        if id == word {
            Ok((rest, ()))
        } else {
            Err(nom::Err::Error(VerboseError::from_error_kind(
                input,
                ErrorKind::Tag,
            )))
        }
    }
}

fn definition(input: Input) -> PResult<Statement> {
    let (rest, name) = ident(input)?;
    let (rest, _) = ws(nom::bytes::complete::tag("->"))(rest)?;
    let (rest, (expr, _)) = cut(pair(alternation, ws(char(';'))))(rest)?;
    Ok((
        rest,
        Statement::Definition {
            name: name.to_string(),
            expr,
        },
    ))
}

fn start_directive(input: Input) -> PResult<Statement> {
    let (rest, _) = keyword("start")(input)?;
    let (rest, name) = cut(ws(ident))(rest)?;
    let (rest, _) = cut(ws(char(';')))(rest)?;
    Ok((
        rest,
        Statement::Start {
            name: name.to_string(),
        },
    ))
}

fn allow_directive(input: Input) -> PResult<Statement> {
    let (rest, _) = keyword("allow")(input)?;
    let (rest, ignored) = cut(ws(ident))(rest)?;
    let (rest, _) = cut(ws(keyword("in")))(rest)?;
    let (rest, rules) = cut(separated_list1(ws(char(',')), ws(ident)))(rest)?;
    let (rest, _) = cut(ws(char(';')))(rest)?;
    Ok((
        rest,
        Statement::Allow {
            ignored: ignored.to_string(),
            rules: rules.into_iter().map(|s| s.to_string()).collect(),
        },
    ))
}

fn statement(input: Input) -> PResult<Statement> {
    alt((definition, start_directive, allow_directive))(input)
}

/// Parse a whole grammar source text into statements.
pub(crate) fn parse_grammar(input: &str) -> Result<Vec<Statement>, GrammarSyntaxError> {
    let result = all_consuming(terminated(many0(ws(statement)), multispace0))(input).finish();
    match result {
        Ok((_, statements)) => Ok(statements),
        Err(e) => Err(convert_error(input, e)),
    }
}

/// Translate a byte offset into 1-based line and column, counting CR, LF and
/// CRLF as one line break each.
pub(crate) fn line_column(input: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    let mut last_was_cr = false;
    for &byte in input.as_bytes()[..offset.min(input.len())].iter() {
        match byte {
            b'\r' => {
                line += 1;
                column = 1;
                last_was_cr = true;
            }
            b'\n' => {
                if !last_was_cr {
                    line += 1;
                    column = 1;
                }
                last_was_cr = false;
            }
            _ => {
                column += 1;
                last_was_cr = false;
            }
        }
    }
    (line, column)
}

fn convert_error(input: &str, e: VerboseError<&str>) -> GrammarSyntaxError {
    let (remainder, message) = match e.errors.first() {
        Some((remainder, kind)) => {
            let context = e.errors.iter().find_map(|(_, k)| match k {
                VerboseErrorKind::Context(c) => Some((*c).to_string()),
                _ => None,
            });
            let message = context.unwrap_or_else(|| match kind {
                VerboseErrorKind::Char(c) => format!("expected `{}`", c),
                _ => "unrecognized input".to_string(),
            });
            (*remainder, message)
        }
        None => (input, "unrecognized input".to_string()),
    };
    let offset = input.len() - remainder.len();
    let (line, column) = line_column(input, offset);
    GrammarSyntaxError {
        offset,
        line,
        column,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(src: &str) -> Statement {
        let mut statements = parse_grammar(src).unwrap();
        assert_eq!(statements.len(), 1);
        statements.pop().unwrap()
    }

    #[test]
    fn plain_sequence() {
        let stmt = parse_one(r#"s -> "X" "Y";"#);
        match stmt {
            Statement::Definition { name, expr } => {
                assert_eq!(name, "s");
                assert_eq!(
                    expr,
                    Expr::Seq(vec![
                        Expr::Sym {
                            sym: SymbolRef::Literal("X".to_string()),
                            slot: None
                        },
                        Expr::Sym {
                            sym: SymbolRef::Literal("Y".to_string()),
                            slot: None
                        },
                    ])
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn alternation_and_group() {
        let stmt = parse_one(r#"s -> ("A" | b) "C";"#);
        match stmt {
            Statement::Definition { expr, .. } => match expr {
                Expr::Seq(items) => {
                    assert!(matches!(items[0], Expr::Alt(_)));
                    assert!(matches!(items[1], Expr::Sym { .. }));
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn modifiers_and_separators() {
        let stmt = parse_one(r#"s -> num +("+") tail? rest*;"#);
        match stmt {
            Statement::Definition { expr, .. } => match expr {
                Expr::Seq(items) => {
                    assert!(matches!(items[0], Expr::SepPlus(_, _)));
                    assert!(matches!(items[1], Expr::Opt(_)));
                    assert!(matches!(items[2], Expr::Star(_)));
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn optional_separator_is_an_error() {
        let err = parse_grammar(r#"s -> "X" ?(",");"#).unwrap_err();
        assert!(err.message.contains("separator"), "{:?}", err);
    }

    #[test]
    fn slot_override() {
        let stmt = parse_one(r#"s -> lhs=expr op="+" rhs=expr;"#);
        match stmt {
            Statement::Definition { expr, .. } => match expr {
                Expr::Seq(items) => {
                    assert_eq!(
                        items[0],
                        Expr::Sym {
                            sym: SymbolRef::Name("expr".to_string()),
                            slot: Some("lhs".to_string()),
                        }
                    );
                    assert_eq!(
                        items[1],
                        Expr::Sym {
                            sym: SymbolRef::Literal("+".to_string()),
                            slot: Some("op".to_string()),
                        }
                    );
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn directives() {
        let statements = parse_grammar("start s;\nallow WS in expr, s;").unwrap();
        assert_eq!(
            statements,
            vec![
                Statement::Start {
                    name: "s".to_string()
                },
                Statement::Allow {
                    ignored: "WS".to_string(),
                    rules: vec!["expr".to_string(), "s".to_string()],
                },
            ]
        );
    }

    #[test]
    fn empty_derivation_and_escapes() {
        let stmt = parse_one(r#"s -> "a\"b" | e;"#);
        match stmt {
            Statement::Definition { expr, .. } => match expr {
                Expr::Alt(alts) => {
                    assert_eq!(
                        alts[0],
                        Expr::Sym {
                            sym: SymbolRef::Literal("a\"b".to_string()),
                            slot: None
                        }
                    );
                    assert_eq!(alts[1], Expr::Empty);
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn regex_bodies_keep_escapes() {
        let stmt = parse_one(r#"num -> /[0-9]+\/\d/;"#);
        match stmt {
            Statement::Definition { expr, .. } => {
                assert_eq!(
                    expr,
                    Expr::Sym {
                        sym: SymbolRef::Regex("[0-9]+/\\d".to_string()),
                        slot: None
                    }
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn error_position_points_at_offender() {
        let err = parse_grammar("s -> \"X\" \"Y\"\nq -> ;").unwrap_err();
        assert_eq!(err.line, 2, "{:?}", err);
    }

    #[test]
    fn rule_named_start_is_a_definition() {
        let stmt = parse_one(r#"start -> "X";"#);
        assert!(matches!(stmt, Statement::Definition { .. }));
    }
}
