use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{Error, ScopelineResult};
use crate::grammars::{
    BeginWhileRule, END_RULE_ID, IncludeResolver, Injection, LineText, PatternSet, RawGrammar,
    RawRule, Rule, RuleFactoryHelper, RuleId, RuleRegistry, WHILE_RULE_ID, compile_rule,
    compile_selector,
};
use crate::metadata::{Metadata, ScopeMetadataProvider, merge_metadata};
use crate::registry::GrammarRepository;
use crate::scope::ScopeList;
use crate::themes::ThemeProvider;
use crate::tokenizer::{
    AnchorActive, LineTokens, StateStack, TokenizeLineBinaryResult, TokenizeLineResult,
    tokenize_string,
};

/// Options given when creating a [`Grammar`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrammarOptions {
    /// Language id of text that isn't in an embedded language
    pub initial_language: u8,
    /// Scope name prefix → language id, eg `source.css` → 2 for CSS embedded in HTML.
    /// The longest matching prefix wins.
    pub embedded_languages: HashMap<String, u8>,
}

impl GrammarOptions {
    pub fn new(initial_language: u8) -> Self {
        Self {
            initial_language,
            ..Default::default()
        }
    }

    /// Assigns `language_id` to every scope starting with `scope_prefix`
    pub fn embedded_language(mut self, scope_prefix: impl Into<String>, language_id: u8) -> Self {
        self.embedded_languages.insert(scope_prefix.into(), language_id);
        self
    }
}

/// What a compiled scanner is for. The same rule gets different scanners depending
/// on the anchors active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScannerKey {
    rule_id: RuleId,
    anchors: AnchorActive,
    while_only: bool,
}

/// A compiled grammar, ready to tokenize lines.
///
/// Lines are tokenized one at a time: the [`StateStack`] returned for a line is given back
/// when tokenizing the next one. A `Grammar` can be shared between threads, everything it
/// computes lazily is cached.
pub struct Grammar {
    /// The grammar with `$self` and `$base` set
    grammar: Arc<RawGrammar>,
    root_id: RuleId,
    registry: RwLock<RuleRegistry>,
    injections: OnceLock<Vec<Injection>>,
    metadata: ScopeMetadataProvider,
    scanners: papaya::HashMap<ScannerKey, Arc<PatternSet>>,
    /// Scanners whose end or while pattern was filled with captured text.
    /// Only the last one built for a key is kept.
    resolved_scanners: papaya::HashMap<ScannerKey, (String, Arc<PatternSet>)>,
}

impl Grammar {
    pub fn new(raw: &RawGrammar, theme: Arc<dyn ThemeProvider>) -> ScopelineResult<Self> {
        Self::with_options(raw, theme, GrammarOptions::default(), None)
    }

    /// Compiles `raw`. External grammars referenced by includes and the grammars injected in
    /// this one come from `repository`.
    ///
    /// Every include is resolved here: a missing one is an error.
    pub fn with_options(
        raw: &RawGrammar,
        theme: Arc<dyn ThemeProvider>,
        options: GrammarOptions,
        repository: Option<Arc<dyn GrammarRepository>>,
    ) -> ScopelineResult<Self> {
        if raw.scope_name.is_empty() {
            return Err(Error::MissingScopeName);
        }

        let grammar = Arc::new(raw.with_self_and_base(None));
        let mut registry = RuleRegistry::new(Arc::clone(&grammar), repository);
        let root_id = registry.compile_root()?;

        #[cfg(feature = "debug")]
        log::debug!(
            "Compiled grammar {} with {} rules",
            grammar.scope_name,
            registry.len()
        );

        Ok(Self {
            grammar,
            root_id,
            registry: RwLock::new(registry),
            injections: OnceLock::new(),
            metadata: ScopeMetadataProvider::new(
                options.initial_language,
                theme,
                options.embedded_languages,
            ),
            scanners: papaya::HashMap::new(),
            resolved_scanners: papaya::HashMap::new(),
        })
    }

    pub fn scope_name(&self) -> &str {
        &self.grammar.scope_name
    }

    pub fn metadata_provider(&self) -> &ScopeMetadataProvider {
        &self.metadata
    }

    /// Switches to `theme`. States created before the change keep the metadata they were
    /// created with.
    pub fn on_did_change_theme(&self, theme: Arc<dyn ThemeProvider>) {
        self.metadata.on_did_change_theme(theme);
    }

    /// The state of the start of a document
    pub fn initial_state(&self) -> StateStack {
        let default_metadata =
            merge_metadata(Metadata::default(), None, &self.metadata.default_metadata());
        let root_metadata = merge_metadata(
            default_metadata,
            None,
            &self.metadata.metadata_for_scope(self.scope_name()),
        );
        StateStack::root(
            self.root_id,
            ScopeList::root(self.scope_name(), root_metadata),
        )
    }

    /// Tokenizes a single line, without its line terminator.
    ///
    /// `prev_state` is the `rule_stack` of the previous line, or `None` for the first line of a
    /// document.
    pub fn tokenize_line(&self, line: &str, prev_state: Option<&StateStack>) -> TokenizeLineResult {
        let (tokens, rule_stack, line_len) = self.tokenize(line, prev_state, false);
        TokenizeLineResult {
            tokens: tokens.into_tokens(&rule_stack, line_len),
            rule_stack,
        }
    }

    /// Same as [`Grammar::tokenize_line`] but tokens only carry their metadata
    pub fn tokenize_line_binary(
        &self,
        line: &str,
        prev_state: Option<&StateStack>,
    ) -> TokenizeLineBinaryResult {
        let (tokens, rule_stack, line_len) = self.tokenize(line, prev_state, true);
        TokenizeLineBinaryResult {
            tokens: tokens.into_binary_tokens(&rule_stack, line_len),
            rule_stack,
        }
    }

    fn tokenize(
        &self,
        line: &str,
        prev_state: Option<&StateStack>,
        emit_binary: bool,
    ) -> (LineTokens, StateStack, usize) {
        let (is_first_line, stack) = match prev_state {
            Some(state) => (false, state.reset()),
            None => (true, self.initial_state()),
        };

        // Patterns expect a line terminator, eg `$` or `\n` to close line comments
        let mut text = line.to_owned();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let line = LineText::new(text);
        let line_len = line.char_len();

        let mut tokens = LineTokens::new(emit_binary);
        let rule_stack = tokenize_string(self, &line, is_first_line, 0, stack, &mut tokens, true);
        (tokens, rule_stack, line_len)
    }

    pub(crate) fn rule(&self, id: RuleId) -> Option<Arc<Rule>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.rule(id).cloned()
    }

    fn cached_scanner(
        &self,
        key: ScannerKey,
        resolved_pattern: Option<&str>,
        build: impl FnOnce() -> Vec<(RuleId, String)>,
    ) -> Arc<PatternSet> {
        if let Some(resolved_pattern) = resolved_pattern {
            // Every captured value gives a different pattern: keeping them all would grow
            // without limit on ordinary input
            let resolved = self.resolved_scanners.pin();
            if let Some((pattern, scanner)) = resolved.get(&key)
                && pattern == resolved_pattern
            {
                return Arc::clone(scanner);
            }
            let scanner = Arc::new(PatternSet::new(build()));
            resolved.insert(key, (resolved_pattern.to_owned(), Arc::clone(&scanner)));
            return scanner;
        }

        let scanners = self.scanners.pin();
        if let Some(scanner) = scanners.get(&key) {
            return Arc::clone(scanner);
        }

        let scanner = Arc::new(PatternSet::new(build()));
        scanners.insert(key, Arc::clone(&scanner));
        scanner
    }

    #[cfg(test)]
    fn scanner_count(&self) -> usize {
        self.scanners.len() + self.resolved_scanners.len()
    }

    /// The scanner looking for the patterns of `rule`, and for its end if it's a
    /// BeginEnd rule. `end_pattern` replaces the end regex when it had backreferences.
    pub(crate) fn rule_scanner(
        &self,
        rule: &Rule,
        end_pattern: Option<&str>,
        anchors: AnchorActive,
    ) -> Arc<PatternSet> {
        let end_pattern = match rule {
            Rule::BeginEnd(_) => end_pattern,
            _ => None,
        };
        let key = ScannerKey {
            rule_id: rule.id(),
            anchors,
            while_only: false,
        };

        self.cached_scanner(key, end_pattern, || {
            let mut patterns = {
                let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
                registry.collect_patterns(rule.id(), anchors)
            };

            if let Rule::BeginEnd(r) = rule {
                let end = match end_pattern {
                    Some(pattern) => anchors.replace_anchors(pattern).into_owned(),
                    None => r.end.resolve_anchors(anchors).into_owned(),
                };
                if r.apply_end_pattern_last {
                    patterns.push((END_RULE_ID, end));
                } else {
                    patterns.insert(0, (END_RULE_ID, end));
                }
            }

            #[cfg(feature = "debug")]
            log::debug!("[rule_scanner] rule {} ({anchors:?}): {patterns:?}", *rule.id());
            patterns
        })
    }

    /// The scanner for the `while` condition of `rule`
    pub(crate) fn while_scanner(
        &self,
        rule: &BeginWhileRule,
        while_pattern: Option<&str>,
        anchors: AnchorActive,
    ) -> Arc<PatternSet> {
        let key = ScannerKey {
            rule_id: rule.id,
            anchors,
            while_only: true,
        };

        self.cached_scanner(key, while_pattern, || {
            let pattern = match while_pattern {
                Some(pattern) => anchors.replace_anchors(pattern).into_owned(),
                None => rule.while_.resolve_anchors(anchors).into_owned(),
            };
            vec![(WHILE_RULE_ID, pattern)]
        })
    }

    /// Injections for this grammar, sorted by priority.
    /// Collected the first time they are needed.
    pub(crate) fn injections(&self) -> &[Injection] {
        self.injections.get_or_init(|| self.collect_injections())
    }

    fn collect_injections(&self) -> Vec<Injection> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut injections = Vec::new();

        // Injections written in the grammar itself
        for (selector, rule) in &self.grammar.injections {
            add_injection(&mut injections, &mut registry, selector, rule, &self.grammar);
        }

        // Grammars injecting themselves into this one
        let injectors = registry
            .grammar_repository()
            .and_then(|repository| repository.injections(self.scope_name()))
            .unwrap_or_default();
        for scope_name in injectors {
            let Some(injector) = registry.external_grammar(&scope_name, self.grammar.base_rule())
            else {
                log::warn!(
                    "Grammar {scope_name} injected into {} could not be found",
                    self.scope_name()
                );
                continue;
            };
            let Some(selector) = injector.injection_selector.as_deref() else {
                continue;
            };
            let Some(rule) = injector.self_rule() else {
                continue;
            };
            add_injection(&mut injections, &mut registry, selector, rule, &injector);
        }

        // Stable: injections with the same priority stay in the order they were found
        injections.sort_by_key(|injection| injection.priority);
        injections
    }
}

fn add_injection(
    out: &mut Vec<Injection>,
    registry: &mut RuleRegistry,
    selector: &str,
    rule: &Arc<RawRule>,
    grammar: &RawGrammar,
) {
    let matchers = match compile_selector(selector) {
        Ok(matchers) => matchers,
        Err(err) => {
            log::warn!(
                "Skipping injection in {}: {}",
                grammar.scope_name,
                Error::from(err)
            );
            return;
        }
    };
    if matchers.is_empty() {
        return;
    }

    let rule_id = match compile_rule(rule, registry, &grammar.repository, &grammar.scope_name) {
        Ok(id) => id,
        Err(err) => {
            log::warn!(
                "Skipping injection `{selector}` in {}: {err}",
                grammar.scope_name
            );
            return;
        }
    };

    for matcher in matchers {
        out.push(Injection {
            matcher: matcher.matcher,
            priority: matcher.priority,
            rule_id,
            grammar: grammar.scope_name.clone(),
        });
    }
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("scope_name", &self.grammar.scope_name)
            .field("root_id", &self.root_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::metadata::TokenType;
    use crate::themes::{FontStyle, RawTheme, Theme};
    use crate::tokenizer::Token;

    fn grammar(json: &str) -> Grammar {
        let raw = RawGrammar::from_json(json).unwrap();
        Grammar::new(&raw, Arc::new(Theme::empty())).unwrap()
    }

    fn theme(json: &str) -> Arc<dyn ThemeProvider> {
        Arc::new(RawTheme::from_json(json).unwrap().compile())
    }

    /// (text, scopes after the root one joined by spaces)
    fn format_tokens(line: &str, tokens: &[Token]) -> Vec<(String, String)> {
        let chars: Vec<char> = line.chars().collect();
        tokens
            .iter()
            .map(|token| {
                let text: String = chars[token.span.clone()].iter().collect();
                (text, token.scopes[1..].join(" "))
            })
            .collect()
    }

    fn expected(tokens: &[(&str, &str)]) -> Vec<(String, String)> {
        tokens
            .iter()
            .map(|(text, scopes)| (text.to_string(), scopes.to_string()))
            .collect()
    }

    /// Tokenizes all lines, returning the tokens of each and the final state
    fn tokenize_lines(grammar: &Grammar, lines: &[&str]) -> (Vec<Vec<(String, String)>>, StateStack) {
        let mut state: Option<StateStack> = None;
        let mut out = Vec::new();
        for line in lines {
            let result = grammar.tokenize_line(line, state.as_ref());
            out.push(format_tokens(line, &result.tokens));
            state = Some(result.rule_stack);
        }
        (out, state.unwrap())
    }

    const STRING_GRAMMAR: &str = r#"{
        "scopeName": "source.test",
        "patterns": [{ "begin": "\"", "end": "\"", "name": "string.quoted" }]
    }"#;

    #[test]
    fn can_tokenize_a_string() {
        let grammar = grammar(STRING_GRAMMAR);
        let line = r#"a "bc" d"#;
        let result = grammar.tokenize_line(line, None);

        let mut out = String::new();
        for token in &result.tokens {
            let text: String = line
                .chars()
                .skip(token.span.start)
                .take(token.span.len())
                .collect();
            out.push_str(&format!("{text:?} {}\n", token.scopes.join(" ")));
        }
        insta::assert_snapshot!(out, @r#"
        "a " source.test
        "\"" source.test string.quoted
        "bc" source.test string.quoted
        "\"" source.test string.quoted
        " d" source.test
        "#);

        assert_eq!(result.rule_stack, grammar.initial_state());
        assert_eq!(result.rule_stack.depth(), 1);
    }

    #[test]
    fn tokens_cover_the_line() {
        let grammar = grammar(STRING_GRAMMAR);
        let result = grammar.tokenize_line("héllo \"wörld\"", None);
        assert_eq!(result.tokens.first().unwrap().span.start, 0);
        assert_eq!(result.tokens.last().unwrap().span.end, 13);
        for pair in result.tokens.windows(2) {
            assert_eq!(pair[0].span.end, pair[1].span.start);
        }
    }

    #[test]
    fn empty_line_gives_a_single_empty_token() {
        let grammar = grammar(STRING_GRAMMAR);
        let result = grammar.tokenize_line("", None);
        assert_eq!(
            result.tokens,
            vec![Token {
                span: 0..0,
                scopes: vec!["source.test".to_string()]
            }]
        );
    }

    #[test]
    fn earliest_match_wins_then_first_pattern() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    { "match": "b", "name": "b" },
                    { "match": "ab", "name": "ab" },
                    { "match": "a", "name": "a" }
                ]
            }"#,
        );
        let result = grammar.tokenize_line("ab b", None);
        assert_eq!(
            format_tokens("ab b", &result.tokens),
            expected(&[("ab", "ab"), (" ", ""), ("b", "b")])
        );
    }

    #[test]
    fn begin_end_spans_several_lines() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    {
                        "begin": "/\\*", "end": "\\*/", "name": "comment.block",
                        "beginCaptures": { "0": { "name": "punctuation.begin" } }
                    },
                    { "match": "\\w+", "name": "word" }
                ]
            }"#,
        );
        let (lines, state) = tokenize_lines(&grammar, &["x /* a", "b", "c */ y"]);
        assert_eq!(
            lines,
            vec![
                expected(&[
                    ("x", "word"),
                    (" ", ""),
                    ("/*", "comment.block punctuation.begin"),
                    (" a", "comment.block"),
                ]),
                expected(&[("b", "comment.block")]),
                expected(&[
                    ("c ", "comment.block"),
                    ("*/", "comment.block"),
                    (" ", ""),
                    ("y", "word"),
                ]),
            ]
        );
        assert_eq!(state, grammar.initial_state());
    }

    #[test]
    fn while_rules_continue_until_the_condition_fails() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    {
                        "begin": "^>", "while": "^>", "name": "markup.quote",
                        "patterns": [{ "match": "\\d+", "name": "number" }]
                    }
                ]
            }"#,
        );
        let (lines, state) = tokenize_lines(&grammar, &["> a 1", "> b", "c 2"]);
        assert_eq!(
            lines,
            vec![
                expected(&[
                    (">", "markup.quote"),
                    (" a ", "markup.quote"),
                    ("1", "markup.quote number"),
                ]),
                expected(&[(">", "markup.quote"), (" b", "markup.quote")]),
                expected(&[("c 2", "")]),
            ]
        );
        assert_eq!(state, grammar.initial_state());
    }

    #[test]
    fn end_patterns_can_use_begin_captures() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    { "begin": "<<(\\w+)", "end": "^\\1$", "name": "string.heredoc" }
                ]
            }"#,
        );
        let first = grammar.tokenize_line("<<EOT", None);
        assert_eq!(first.rule_stack.end_pattern(), Some("^EOT$"));

        let (lines, state) = tokenize_lines(&grammar, &["<<EOT", "EOF", "EOT", "after"]);
        assert_eq!(lines[1], expected(&[("EOF", "string.heredoc")]));
        assert_eq!(lines[2], expected(&[("EOT", "string.heredoc")]));
        assert_eq!(lines[3], expected(&[("after", "")]));
        assert_eq!(state, grammar.initial_state());
    }

    #[test]
    fn captured_text_is_escaped_in_end_patterns() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "begin": "(\\S+)\\{", "end": "\\}\\1", "name": "block" }]
            }"#,
        );
        let (lines, state) = tokenize_lines(&grammar, &["a.b{", "}axb", "}a.b c"]);
        assert_eq!(lines[1], expected(&[("}axb", "block")]));
        assert_eq!(lines[2], expected(&[("}a.b", "block"), (" c", "")]));
        assert_eq!(state, grammar.initial_state());
    }

    #[test]
    fn captured_end_patterns_do_not_grow_the_scanner_cache() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "begin": "<(\\w+)>", "end": "</\\1>", "name": "tag" }]
            }"#,
        );
        let lines: Vec<String> = (0..200).map(|i| format!("<t{i}>a</t{i}>")).collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();

        let (first, _) = tokenize_lines(&grammar, &lines[..3]);
        assert_eq!(first[2], expected(&[("<t2>", "tag"), ("a", "tag"), ("</t2>", "tag")]));
        let warmed_up = grammar.scanner_count();
        let (all, state) = tokenize_lines(&grammar, &lines);
        assert_eq!(all[199], expected(&[("<t199>", "tag"), ("a", "tag"), ("</t199>", "tag")]));
        assert_eq!(grammar.scanner_count(), warmed_up);
        assert_eq!(state, grammar.initial_state());
    }

    #[test]
    fn zero_width_matches_still_reach_the_end_of_line() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    { "match": "c", "name": "keyword" },
                    { "match": "x*", "name": "nothing" }
                ]
            }"#,
        );
        let result = grammar.tokenize_line("abc", None);
        assert_eq!(
            format_tokens("abc", &result.tokens),
            expected(&[("ab", ""), ("c", "keyword")])
        );
    }

    #[test]
    fn empty_lookahead_matches_keep_text_in_one_token() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "match": "(?=b)", "name": "mark" }]
            }"#,
        );
        let result = grammar.tokenize_line("abab", None);
        assert_eq!(format_tokens("abab", &result.tokens), expected(&[("abab", "")]));
        assert_eq!(result.rule_stack, grammar.initial_state());
    }

    #[test]
    fn begin_rule_pushing_itself_without_advancing_stops() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    { "begin": "(?=a)", "end": "b", "name": "region", "patterns": [{ "include": "$self" }] }
                ]
            }"#,
        );
        let result = grammar.tokenize_line("aaa", None);
        assert_eq!(
            format_tokens("aaa", &result.tokens),
            expected(&[("aaa", "region")])
        );
        assert_eq!(result.rule_stack.depth(), 2);
    }

    #[test]
    fn end_matching_where_the_rule_began_keeps_the_rule() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "begin": "(?=b)", "end": "(?=b)", "name": "region" }]
            }"#,
        );
        let result = grammar.tokenize_line("bb", None);
        assert_eq!(
            format_tokens("bb", &result.tokens),
            expected(&[("bb", "region")])
        );
        assert_eq!(result.rule_stack.depth(), 2);
    }

    #[test]
    fn retokenizing_a_line_with_its_own_state_is_stable() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [
                    { "begin": "/\\*", "end": "\\*/", "name": "comment.block" },
                    { "match": "\\w+", "name": "word" }
                ]
            }"#,
        );
        let first = grammar.tokenize_line("/* start", None);
        let second = grammar.tokenize_line("middle", Some(&first.rule_stack));
        let third = grammar.tokenize_line("middle", Some(&second.rule_stack));
        assert_eq!(second.tokens, third.tokens);
        assert_eq!(second.rule_stack, third.rule_stack);
    }

    #[test]
    fn apply_end_pattern_last() {
        let json = |last: bool| {
            format!(
                r#"{{
                    "scopeName": "source.test",
                    "patterns": [{{
                        "begin": "\\(", "end": "\\)", "name": "group",
                        "applyEndPatternLast": {last},
                        "patterns": [{{ "match": "\\)\\)", "name": "double" }}]
                    }}]
                }}"#
            )
        };

        let first = grammar(&json(false)).tokenize_line("())", None);
        assert_eq!(
            format_tokens("())", &first.tokens),
            expected(&[("(", "group"), (")", "group"), (")", "")])
        );

        let last = grammar(&json(true)).tokenize_line("())", None);
        assert_eq!(
            format_tokens("())", &last.tokens),
            expected(&[("(", "group"), ("))", "group double")])
        );
        assert_eq!(last.rule_stack.depth(), 2);
    }

    #[test]
    fn first_line_anchor() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "match": "\\Afoo", "name": "start" }]
            }"#,
        );
        let (lines, _) = tokenize_lines(&grammar, &["foo foo", "foo"]);
        assert_eq!(lines[0], expected(&[("foo", "start"), (" foo", "")]));
        assert_eq!(lines[1], expected(&[("foo", "")]));
    }

    #[test]
    fn names_can_use_captures() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "match": "(\\w+)!", "name": "keyword.${1:/upcase}" }]
            }"#,
        );
        let result = grammar.tokenize_line("go!", None);
        assert_eq!(
            format_tokens("go!", &result.tokens),
            expected(&[("go!", "keyword.GO")])
        );
    }

    #[test]
    fn captures_with_patterns_are_retokenized() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{
                    "match": "(\\w+)=(\\w+)",
                    "captures": {
                        "1": { "name": "key" },
                        "2": { "patterns": [{ "match": "\\d", "name": "digit" }] }
                    }
                }]
            }"#,
        );
        let result = grammar.tokenize_line("k=a1", None);
        assert_eq!(
            format_tokens("k=a1", &result.tokens),
            expected(&[("k", "key"), ("=", ""), ("a", ""), ("1", "digit")])
        );
    }

    #[test]
    fn nested_captures() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{
                    "match": "((a)b)c",
                    "name": "all",
                    "captures": {
                        "1": { "name": "outer" },
                        "2": { "name": "inner" }
                    }
                }]
            }"#,
        );
        let result = grammar.tokenize_line("abc", None);
        assert_eq!(
            format_tokens("abc", &result.tokens),
            expected(&[
                ("a", "all outer inner"),
                ("b", "all outer"),
                ("c", "all"),
            ])
        );
    }

    #[test]
    fn retokenized_captures_ignore_enclosing_capture_names() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{
                    "match": "(a(b))",
                    "captures": {
                        "1": { "name": "outer" },
                        "2": { "patterns": [{ "match": "b", "name": "inner" }] }
                    }
                }]
            }"#,
        );
        let result = grammar.tokenize_line("ab", None);
        assert_eq!(
            format_tokens("ab", &result.tokens),
            expected(&[("a", "outer"), ("b", "inner")])
        );
    }

    const INJECTION_GRAMMAR: &str = r#"{
        "scopeName": "source.test",
        "patterns": [{ "match": "abc", "name": "rule" }],
        "injections": {
            "SELECTOR": { "patterns": [{ "match": "ab", "name": "injected" }] }
        }
    }"#;

    #[test]
    fn left_injections_win_ties() {
        let grammar = grammar(&INJECTION_GRAMMAR.replace("SELECTOR", "L:source.test"));
        let result = grammar.tokenize_line("abc", None);
        assert_eq!(
            format_tokens("abc", &result.tokens),
            expected(&[("ab", "injected"), ("c", "")])
        );
    }

    #[test]
    fn rule_patterns_win_ties_against_other_injections() {
        for selector in ["source.test", "R:source.test"] {
            let grammar = grammar(&INJECTION_GRAMMAR.replace("SELECTOR", selector));
            let result = grammar.tokenize_line("abc", None);
            assert_eq!(
                format_tokens("abc", &result.tokens),
                expected(&[("abc", "rule")])
            );
        }
    }

    #[test]
    fn earlier_injection_match_wins_whatever_its_priority() {
        let grammar = grammar(&INJECTION_GRAMMAR.replace("SELECTOR", "R:source.test"));
        let result = grammar.tokenize_line("xab", None);
        assert_eq!(
            format_tokens("xab", &result.tokens),
            expected(&[("x", ""), ("ab", "injected")])
        );
    }

    #[test]
    fn injections_are_tried_by_priority() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [],
                "injections": {
                    "R:source.test": { "patterns": [{ "match": "ab", "name": "right" }] },
                    "L:source.test": { "patterns": [{ "match": "ab", "name": "left" }] },
                    "source.test": { "patterns": [{ "match": "a", "name": "default" }] }
                }
            }"#,
        );
        let priorities: Vec<i8> = grammar.injections().iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![-1, 0, 1]);

        let result = grammar.tokenize_line("ab", None);
        assert_eq!(
            format_tokens("ab", &result.tokens),
            expected(&[("ab", "left")])
        );
    }

    #[test]
    fn injections_only_apply_where_the_selector_matches() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.test",
                "patterns": [{ "begin": "\"", "end": "\"", "name": "string.quoted" }],
                "injections": {
                    "string -comment": { "patterns": [{ "match": "TODO", "name": "keyword.todo" }] },
                    "(((": { "patterns": [{ "match": "x", "name": "never" }] }
                }
            }"#,
        );
        assert_eq!(grammar.injections().len(), 1);
        let line = r#"TODO "TODO""#;
        let result = grammar.tokenize_line(line, None);
        assert_eq!(
            format_tokens(line, &result.tokens),
            expected(&[
                ("TODO ", ""),
                ("\"", "string.quoted"),
                ("TODO", "string.quoted keyword.todo"),
                ("\"", "string.quoted"),
            ])
        );
    }

    const KEYWORD_GRAMMAR: &str = r#"{
        "scopeName": "source.test",
        "patterns": [
            { "match": "\\bif\\b", "name": "keyword.control" },
            { "match": "\\w+", "name": "variable" }
        ]
    }"#;

    const RED_KEYWORDS: &str = r##"{
        "settings": [
            { "scope": "keyword", "settings": { "foreground": "#ff0000", "fontStyle": "bold" } }
        ]
    }"##;

    #[test]
    fn binary_tokens_merge_equal_metadata() {
        let raw = RawGrammar::from_json(KEYWORD_GRAMMAR).unwrap();
        let grammar = Grammar::new(&raw, theme(RED_KEYWORDS)).unwrap();

        let result = grammar.tokenize_line_binary("x if y", None);
        let starts: Vec<usize> = result.tokens.iter().map(|t| t.start).collect();
        assert_eq!(starts, vec![0, 2, 4]);

        let keyword = result.tokens[1].metadata;
        assert_eq!(keyword.foreground(), 3);
        assert_eq!(keyword.font_style(), FontStyle::BOLD);
        assert_eq!(result.tokens[0].metadata, result.tokens[2].metadata);
        assert_eq!(result.tokens[0].metadata.foreground(), 1);
    }

    #[test]
    fn binary_tokens_of_an_empty_line() {
        let raw = RawGrammar::from_json(KEYWORD_GRAMMAR).unwrap();
        let grammar = Grammar::new(&raw, theme(RED_KEYWORDS)).unwrap();
        let result = grammar.tokenize_line_binary("", None);
        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.tokens[0].start, 0);
    }

    #[test]
    fn theme_changes_apply_to_new_lines() {
        let raw = RawGrammar::from_json(KEYWORD_GRAMMAR).unwrap();
        let grammar = Grammar::new(&raw, Arc::new(Theme::empty())).unwrap();

        let before = grammar.tokenize_line_binary("if", None);
        assert_eq!(before.tokens.len(), 1);

        grammar.on_did_change_theme(theme(RED_KEYWORDS));
        let after = grammar.tokenize_line_binary("if x", None);
        assert_eq!(after.tokens.len(), 2);
        assert_eq!(after.tokens[0].metadata.foreground(), 3);
    }

    #[test]
    fn embedded_languages_and_token_types() {
        let raw = RawGrammar::from_json(
            r#"{
                "scopeName": "text.test",
                "patterns": [
                    { "begin": "<script>", "end": "</script>", "contentName": "source.js.embedded" },
                    { "match": "'[^']*'", "name": "string.quoted.single" }
                ]
            }"#,
        )
        .unwrap();
        let options = GrammarOptions::new(1).embedded_language("source.js", 2);
        let grammar = Grammar::with_options(&raw, Arc::new(Theme::empty()), options, None).unwrap();

        let result = grammar.tokenize_line_binary("a<script>b</script>'c'", None);
        let tokens: Vec<(usize, u8, TokenType)> = result
            .tokens
            .iter()
            .map(|t| (t.start, t.metadata.language_id(), t.metadata.token_type()))
            .collect();
        assert_eq!(
            tokens,
            vec![
                (0, 1, TokenType::Other),
                (9, 2, TokenType::Other),
                (10, 1, TokenType::Other),
                (19, 1, TokenType::String),
            ]
        );
    }

    #[test]
    fn unresolved_includes_fail_construction() {
        let raw = RawGrammar::from_json(
            r##"{ "scopeName": "source.test", "patterns": [{ "include": "#missing" }] }"##,
        )
        .unwrap();
        let err = Grammar::new(&raw, Arc::new(Theme::empty())).unwrap_err();
        assert!(matches!(err, Error::UnresolvedInclude { .. }));
    }

    #[test]
    fn scope_name_is_required() {
        let raw = RawGrammar::from_json(r#"{ "patterns": [] }"#).unwrap();
        let err = Grammar::new(&raw, Arc::new(Theme::empty())).unwrap_err();
        assert!(matches!(err, Error::MissingScopeName));
    }

    #[test]
    fn grammars_and_states_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Grammar>();
        assert_send_sync::<crate::Registry>();
        assert_send_sync::<StateStack>();
        assert_send_sync::<ScopeList>();
    }
}
