#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;
    use std::sync::Arc;

    use gazelle::{
        CompileError, Config, Grammar, Offset, ParseError, ParseEvents, ParseOutcome, ParseState,
        RuleEvent, TerminalEvent,
    };

    /// Records every callback as a printable line so whole parses can be
    /// compared with a single assertion.
    #[derive(Debug, Default, Clone)]
    struct Recorder {
        events: Vec<String>,
        terminals: Vec<(String, String, usize, usize, usize, u32)>,
        errors: Vec<String>,
        cancel_on_terminal: Option<String>,
    }

    impl ParseEvents for Recorder {
        fn start_rule(&mut self, event: &RuleEvent) -> ControlFlow<()> {
            self.events.push(format!("start({})", event.name));
            ControlFlow::Continue(())
        }
        fn end_rule(&mut self, event: &RuleEvent) -> ControlFlow<()> {
            self.events.push(format!("end({})", event.name));
            ControlFlow::Continue(())
        }
        fn terminal(&mut self, event: &TerminalEvent) -> ControlFlow<()> {
            let text = String::from_utf8_lossy(event.text).into_owned();
            self.events.push(format!("{}:{}", event.name, text));
            self.terminals.push((
                event.name.to_string(),
                text,
                event.offset.byte,
                event.offset.line,
                event.offset.column,
                event.slotnum,
            ));
            if self.cancel_on_terminal.as_deref() == Some(event.name) {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        fn error_char(&mut self, offset: Offset, byte: u8) {
            self.errors
                .push(format!("char:{}@{}", byte as char, offset.byte));
        }
        fn error_terminal(&mut self, event: &TerminalEvent) {
            self.errors.push(format!("terminal:{}", event.name));
        }
    }

    fn compile(src: &str) -> Arc<Grammar> {
        Arc::new(Grammar::compile(src, &Config::default()).unwrap())
    }

    fn parse_all(grammar: &Arc<Grammar>, input: &[u8]) -> Recorder {
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(grammar));
        state.parse(input, &mut recorder).unwrap();
        state.finish_parse(&mut recorder).unwrap();
        recorder
    }

    #[test]
    fn sequence_of_two_terminals() {
        let grammar = compile(r#"s -> "X" "Y";"#);
        let recorder = parse_all(&grammar, b"XY");
        assert_eq!(recorder.events, ["start(s)", "X:X", "Y:Y", "end(s)"]);
        assert!(recorder.errors.is_empty());
    }

    #[test]
    fn two_terminals_of_lookahead() {
        let grammar = compile(r#"s -> "A" | "A" "B";"#);
        // One state cannot be decided with a single terminal.
        assert_eq!(grammar.glas().len(), 1);
        let short = parse_all(&grammar, b"A");
        assert_eq!(short.events, ["start(s)", "A:A", "end(s)"]);
        let long = parse_all(&grammar, b"AB");
        assert_eq!(long.events, ["start(s)", "A:A", "B:B", "end(s)"]);
        // The two A-transitions carry different slot numbers, so the parses
        // are distinguishable through slots as well.
        assert_ne!(short.terminals[0].5, long.terminals[0].5);
    }

    #[test]
    fn unbounded_lookahead_resolves_after_the_tail() {
        let grammar = compile(r#"s -> a "X" | a "Y"; a -> "Z"*;"#);
        let recorder = parse_all(&grammar, b"ZZZX");
        assert_eq!(
            recorder.events,
            ["start(s)", "start(a)", "Z:Z", "Z:Z", "Z:Z", "end(a)", "X:X", "end(s)"]
        );
        let recorder = parse_all(&grammar, b"ZY");
        assert_eq!(
            recorder.events,
            ["start(s)", "start(a)", "Z:Z", "end(a)", "Y:Y", "end(s)"]
        );
        let recorder = parse_all(&grammar, b"Y");
        assert_eq!(
            recorder.events,
            ["start(s)", "start(a)", "end(a)", "Y:Y", "end(s)"]
        );
    }

    #[test]
    fn left_recursion_is_rejected() {
        let err = Grammar::compile(r#"s -> s? "X";"#, &Config::default()).unwrap_err();
        match err {
            CompileError::LeftRecursion(rule) => assert_eq!(rule, "s"),
            other => panic!("expected a left recursion error, got {other}"),
        }
    }

    #[test]
    fn ignored_terminals_are_discarded() {
        let grammar = compile(
            r#"
            start expr;
            expr -> num ("+" num)*;
            num -> /[0-9]+/;
            WS -> /[ \t]+/;
            allow WS in expr;
            "#,
        );
        let recorder = parse_all(&grammar, b"12 + 34");
        assert_eq!(
            recorder.events,
            ["start(expr)", "num:12", "+:+", "num:34", "end(expr)"]
        );
        // Offsets point past the discarded whitespace.
        assert_eq!(recorder.terminals[0].2, 0);
        assert_eq!(recorder.terminals[1].2, 3);
        assert_eq!(recorder.terminals[2].2, 5);
    }

    #[test]
    fn lexical_error_reports_the_offending_byte() {
        let grammar = compile(r#"s -> "AB";"#);
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(&grammar));
        let err = state.parse(b"AC", &mut recorder).unwrap_err();
        assert!(matches!(err, ParseError::Syntax(_)));
        assert_eq!(recorder.errors, ["char:C@1"]);
        assert_eq!(state.offset().byte, 1);
    }

    #[test]
    fn unexpected_terminal_reports_before_returning() {
        let grammar = compile(r#"s -> "A" "B";"#);
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(&grammar));
        let err = state.parse(b"AA", &mut recorder).unwrap_err();
        assert!(matches!(err, ParseError::Syntax(_)));
        assert_eq!(recorder.errors, ["terminal:A"]);
        // The first A was consumed; the state sits before the second.
        assert_eq!(state.offset().byte, 1);
    }

    #[test]
    fn parsing_is_deterministic() {
        let grammar = compile(r#"s -> a "X" | a "Y"; a -> "Z"*;"#);
        let first = parse_all(&grammar, b"ZZZX");
        let second = parse_all(&grammar, b"ZZZX");
        assert_eq!(first.events, second.events);
        assert_eq!(first.terminals, second.terminals);
    }

    #[test]
    fn chunking_does_not_change_the_parse() {
        let cases: [(&str, &[u8]); 3] = [
            (r#"s -> a "X" | a "Y"; a -> "Z"*;"#, b"ZZZZX"),
            (
                r#"
                start expr;
                expr -> num ("+" num)*;
                num -> /[0-9]+/;
                WS -> /[ \t]+/;
                allow WS in expr;
                "#,
                b"1 + 23 + 456",
            ),
            (r#"s -> "A" | "A" "B";"#, b"AB"),
        ];
        for (src, input) in cases {
            let grammar = compile(src);
            let whole = parse_all(&grammar, input);
            for split in 0..=input.len() {
                let mut recorder = Recorder::default();
                let mut state = ParseState::new(Arc::clone(&grammar));
                state.parse(&input[..split], &mut recorder).unwrap();
                state.parse(&input[split..], &mut recorder).unwrap();
                state.finish_parse(&mut recorder).unwrap();
                assert_eq!(
                    recorder.events, whole.events,
                    "split at {split} diverged for {src:?}"
                );
                assert_eq!(recorder.terminals, whole.terminals);
            }
        }
    }

    #[test]
    fn bytecode_roundtrip_preserves_the_language() {
        let src = r#"
            start expr;
            expr -> num ("+" num)*;
            num -> /[0-9]+/;
            WS -> /[ \t]+/;
            allow WS in expr;
        "#;
        let compiled = compile(src);
        let loaded = Arc::new(Grammar::from_bytes(&compiled.to_bytes()).unwrap());
        for input in [&b"7"[..], b"1 + 2", b"12 +34+ 5"] {
            let a = parse_all(&compiled, input);
            let b = parse_all(&loaded, input);
            assert_eq!(a.events, b.events);
            assert_eq!(a.terminals, b.terminals);
        }
        // Both reject the same inputs too.
        for input in [&b"+"[..], b"1 +", b"a"] {
            let mut state = ParseState::new(Arc::clone(&compiled));
            let mut recorder = Recorder::default();
            let compiled_result = state
                .parse(input, &mut recorder)
                .and_then(|_| state.finish_parse(&mut recorder));
            let mut state = ParseState::new(Arc::clone(&loaded));
            let mut recorder = Recorder::default();
            let loaded_result = state
                .parse(input, &mut recorder)
                .and_then(|_| state.finish_parse(&mut recorder));
            assert_eq!(compiled_result.is_err(), loaded_result.is_err());
        }
    }

    #[test]
    fn lexical_automata_are_minimal() {
        let grammar = compile(
            r#"
            start s;
            s -> kw | id;
            kw -> /if|in|int/;
            id -> /[a-hj-z][a-z]*/;
            "#,
        );
        for intfa in grammar.intfas() {
            let n = intfa.num_states();
            for a in 0..n {
                for b in (a + 1)..n {
                    assert!(
                        distinguishable(intfa, a as u32, b as u32),
                        "states {a} and {b} are equivalent"
                    );
                }
            }
        }
    }

    fn distinguishable(intfa: &gazelle::grammar::IntFa, a: u32, b: u32) -> bool {
        use gazelle::grammar::StateId;
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![(a, b)];
        while let Some((x, y)) = stack.pop() {
            if !seen.insert((x, y)) {
                continue;
            }
            if intfa.accept_of(StateId(x)) != intfa.accept_of(StateId(y)) {
                return true;
            }
            for byte in 0..=u8::MAX {
                let nx = intfa.step(StateId(x), byte);
                let ny = intfa.step(StateId(y), byte);
                match (nx, ny) {
                    (Some(nx), Some(ny)) => {
                        if nx != ny {
                            stack.push((nx.0, ny.0));
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
    fn nested_rules_fire_callbacks_in_order() {
        let grammar = compile(r#"s -> a "X"; a -> b; b -> "Z";"#);
        let recorder = parse_all(&grammar, b"ZX");
        assert_eq!(
            recorder.events,
            [
                "start(s)",
                "start(a)",
                "start(b)",
                "Z:Z",
                "end(b)",
                "end(a)",
                "X:X",
                "end(s)"
            ]
        );
    }

    #[test]
    fn callbacks_can_cancel() {
        let grammar = compile(r#"s -> "A" "B" "C";"#);
        let mut recorder = Recorder {
            cancel_on_terminal: Some("B".to_string()),
            ..Recorder::default()
        };
        let mut state = ParseState::new(Arc::clone(&grammar));
        let err = state.parse(b"ABC", &mut recorder).unwrap_err();
        assert_eq!(err, ParseError::Cancelled);
        assert_eq!(recorder.events, ["start(s)", "A:A", "B:B"]);
        // A cancelled state stays cancelled.
        assert_eq!(
            state.parse(b"C", &mut recorder).unwrap_err(),
            ParseError::Cancelled
        );
    }

    #[test]
    fn stack_depth_is_limited() {
        let grammar = compile(r#"s -> "(" s ")" | "x";"#);
        let config = Config {
            max_stack_depth: 8,
            ..Config::default()
        };
        let mut recorder = Recorder::default();
        let mut state = ParseState::with_config(Arc::clone(&grammar), config);
        let input = b"((((((((((((((((x";
        let err = state.parse(input, &mut recorder).unwrap_err();
        assert_eq!(err, ParseError::StackLimitExceeded(8));
    }

    #[test]
    fn lookahead_buffering_is_limited() {
        let grammar = Arc::new(
            Grammar::compile(
                r#"s -> a "X" | a "Y"; a -> "Z"*;"#,
                &Config {
                    max_lookahead: 4,
                    ..Config::default()
                },
            )
            .unwrap(),
        );
        let config = Config {
            max_lookahead: 4,
            ..Config::default()
        };
        let mut recorder = Recorder::default();
        let mut state = ParseState::with_config(Arc::clone(&grammar), config);
        let err = state.parse(b"ZZZZZZZZX", &mut recorder).unwrap_err();
        assert_eq!(err, ParseError::LookaheadLimitExceeded(4));
    }

    #[test]
    fn ambiguity_beyond_the_bound_fails_to_compile() {
        let src = r#"s -> a | b; a -> "Z" "Z" "Z" "Z" "X"; b -> "Z" "Z" "Z" "Z" "Y";"#;
        let err = Grammar::compile(
            src,
            &Config {
                max_lookahead: 3,
                ..Config::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::AmbiguousLookahead { .. }));
        // With enough lookahead the same grammar is fine.
        assert!(Grammar::compile(src, &Config::default()).is_ok());
    }

    #[test]
    fn identical_lookahead_takes_the_lowest_transition() {
        // Both alternatives match the same input; the first one wins.
        let grammar = compile(r#"s -> a "E" | b "E"; a -> "Z"; b -> "Z";"#);
        let recorder = parse_all(&grammar, b"ZE");
        assert_eq!(
            recorder.events,
            ["start(s)", "start(a)", "Z:Z", "end(a)", "E:E", "end(s)"]
        );
    }

    #[test]
    fn conflicting_terminals_in_one_state_are_rejected() {
        let err = Grammar::compile(r#"s -> "a" | /[a-z]/;"#, &Config::default()).unwrap_err();
        assert!(matches!(err, CompileError::TerminalConflict { .. }));
    }

    #[test]
    fn completed_start_rule_rejects_further_input() {
        let grammar = compile(r#"s -> "X";"#);
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(&grammar));
        assert_eq!(
            state.parse(b"XY", &mut recorder).unwrap(),
            ParseOutcome::Finished
        );
        assert_eq!(
            state.parse(b"Z", &mut recorder).unwrap(),
            ParseOutcome::Finished
        );
        state.finish_parse(&mut recorder).unwrap();
        assert_eq!(recorder.events, ["start(s)", "X:X", "end(s)"]);
    }

    #[test]
    fn states_can_be_forked_for_speculation() {
        let grammar = compile(r#"s -> a "X" | a "Y"; a -> "Z"*;"#);
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(&grammar));
        state.parse(b"ZZ", &mut recorder).unwrap();
        let mut fork = state.clone();
        let mut fork_recorder = recorder.clone();

        state.parse(b"X", &mut recorder).unwrap();
        state.finish_parse(&mut recorder).unwrap();
        assert_eq!(
            recorder.events,
            ["start(s)", "start(a)", "Z:Z", "Z:Z", "end(a)", "X:X", "end(s)"]
        );

        fork.parse(b"ZY", &mut fork_recorder).unwrap();
        fork.finish_parse(&mut fork_recorder).unwrap();
        assert_eq!(
            fork_recorder.events,
            ["start(s)", "start(a)", "Z:Z", "Z:Z", "Z:Z", "end(a)", "Y:Y", "end(s)"]
        );
    }

    #[test]
    fn newline_accounting_coalesces_crlf() {
        let grammar = compile(
            r#"
            start s;
            s -> "a" "b" "c";
            NL -> /[\r\n]+/;
            allow NL in s;
            "#,
        );
        let recorder = parse_all(&grammar, b"a\r\nb\nc");
        assert_eq!(recorder.events, ["start(s)", "a:a", "b:b", "c:c", "end(s)"]);
        // (name, text, byte, line, column, slot)
        assert_eq!(recorder.terminals[0].3, 1);
        assert_eq!(recorder.terminals[1].3, 2);
        assert_eq!(recorder.terminals[1].4, 1);
        assert_eq!(recorder.terminals[2].3, 3);
    }

    #[test]
    fn premature_end_of_input_is_an_error() {
        let grammar = compile(r#"s -> "A" "B";"#);
        let mut recorder = Recorder::default();
        let mut state = ParseState::new(Arc::clone(&grammar));
        state.parse(b"A", &mut recorder).unwrap();
        assert_eq!(
            state.finish_parse(&mut recorder).unwrap_err(),
            ParseError::PrematureEof
        );
    }

    #[test]
    fn separators_and_modifiers_desugar() {
        let grammar = compile(r#"s -> "a" +(",") "!"?;"#);
        assert_eq!(
            parse_all(&grammar, b"a,a,a!").events,
            ["start(s)", "a:a", ",:,", "a:a", ",:,", "a:a", "!:!", "end(s)"]
        );
        assert_eq!(
            parse_all(&grammar, b"a").events,
            ["start(s)", "a:a", "end(s)"]
        );
    }

    #[test]
    fn empty_derivation_parses_nothing() {
        let grammar = compile(r#"s -> "A" t "B"; t -> "T" | e;"#);
        assert_eq!(
            parse_all(&grammar, b"ATB").events,
            ["start(s)", "A:A", "start(t)", "T:T", "end(t)", "B:B", "end(s)"]
        );
        assert_eq!(
            parse_all(&grammar, b"AB").events,
            ["start(s)", "A:A", "start(t)", "end(t)", "B:B", "end(s)"]
        );
    }
}
