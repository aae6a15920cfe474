//! This file replicates the logic of <https://github.com/microsoft/vscode-textmate>

use std::ops::Range;
use std::sync::Arc;

use crate::grammar::Grammar;
use crate::grammars::{END_RULE_ID, LEFT_PRIORITY, LineText, PatternSetMatch, Rule, RuleId};
use crate::metadata::Metadata;
use crate::scope::ScopeList;

mod anchors;
mod stack;

pub use anchors::AnchorActive;
pub use stack::StateStack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Character span within the line (start inclusive, end exclusive, 0-based)
    pub span: Range<usize>,
    /// Hierarchical scope names, ordered from outermost to innermost
    /// (e.g., source.js -> string.quoted.double -> punctuation.definition.string).
    pub scopes: Vec<String>,
}

/// A token in binary form: it goes from `start` to the start of the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryToken {
    /// Character offset where the token starts
    pub start: usize,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct TokenizeLineResult {
    pub tokens: Vec<Token>,
    /// The state to give when tokenizing the next line
    pub rule_stack: StateStack,
}

#[derive(Debug, Clone)]
pub struct TokenizeLineBinaryResult {
    /// Consecutive tokens with the same metadata are merged
    pub tokens: Vec<BinaryToken>,
    /// The state to give when tokenizing the next line
    pub rule_stack: StateStack,
}

/// Small wrapper so we make we only produce valid tokens.
/// Called in the tokenizer a few times and easier to use a struct than pass
/// mutable vec and usize everywhere
#[derive(Debug, Clone, Default)]
pub(crate) struct LineTokens {
    emit_binary: bool,
    tokens: Vec<Token>,
    binary_tokens: Vec<BinaryToken>,
    /// Position up to which tokens have been generated
    /// (start of next token to be produced)
    last_end_pos: usize,
}

impl LineTokens {
    pub(crate) fn new(emit_binary: bool) -> Self {
        Self {
            emit_binary,
            ..Default::default()
        }
    }

    fn produce(&mut self, stack: &StateStack, end_pos: usize) {
        self.produce_from_scopes(stack.content_scopes(), end_pos);
    }

    fn produce_from_scopes(&mut self, scopes: &ScopeList, end_pos: usize) {
        // Skip empty tokens (can happen with zero-width matches)
        if self.last_end_pos >= end_pos {
            return;
        }

        #[cfg(feature = "debug")]
        log::debug!("[produce]: [{}..{end_pos}] {scopes:?}", self.last_end_pos);

        if self.emit_binary {
            let metadata = scopes.metadata();
            let same_as_last = self
                .binary_tokens
                .last()
                .is_some_and(|t| t.metadata == metadata);
            if !same_as_last {
                self.binary_tokens.push(BinaryToken {
                    start: self.last_end_pos,
                    metadata,
                });
            }
        } else {
            self.tokens.push(Token {
                span: self.last_end_pos..end_pos,
                scopes: scopes.scopes(),
            });
        }

        // Advance to the end of this token
        self.last_end_pos = end_pos;
    }

    /// Similar to LineTokens.getResult in vscode-textmate, `line_len` including the
    /// trailing `\n`. Token spans never include that `\n`.
    pub(crate) fn into_tokens(mut self, stack: &StateStack, line_len: usize) -> Vec<Token> {
        // Pop the token for the added newline if there is one
        if let Some(tok) = self.tokens.last()
            && tok.span.start + 1 == line_len
        {
            self.tokens.pop();
        }

        if self.tokens.is_empty() {
            self.last_end_pos = 0;
            self.produce(stack, line_len);
        }

        // If we have a token that includes the trailing newline,
        // decrement the end to not include it
        if let Some(t) = self.tokens.last_mut()
            && t.span.end == line_len
        {
            t.span.end -= 1;
        }
        self.tokens
    }

    pub(crate) fn into_binary_tokens(mut self, stack: &StateStack, line_len: usize) -> Vec<BinaryToken> {
        if let Some(tok) = self.binary_tokens.last()
            && tok.start + 1 == line_len
        {
            self.binary_tokens.pop();
        }

        if self.binary_tokens.is_empty() {
            self.last_end_pos = 0;
            self.produce(stack, line_len);
        }
        self.binary_tokens
    }
}

/// Tokenizes `line` from `line_pos`, returning the state at the end of it
pub(crate) fn tokenize_string(
    grammar: &Grammar,
    line: &LineText,
    is_first_line: bool,
    line_pos: usize,
    stack: StateStack,
    tokens: &mut LineTokens,
    check_while_conditions: bool,
) -> StateStack {
    let mut tokenizer = LineTokenizer {
        grammar,
        line,
        is_first_line,
        pos: line_pos,
        stack,
        anchor_position: None,
    };

    // 1. We check if the while pattern is still truthy
    if check_while_conditions {
        tokenizer.check_while_conditions(tokens);
    }

    // 2. We check for any matching patterns
    while tokenizer.scan_next(tokens) {}

    tokenizer.stack
}

struct LineTokenizer<'a> {
    grammar: &'a Grammar,
    line: &'a LineText,
    is_first_line: bool,
    /// Character offset of the scan
    pos: usize,
    stack: StateStack,
    /// Where \G matches
    anchor_position: Option<usize>,
}

impl LineTokenizer<'_> {
    fn anchors(&self) -> AnchorActive {
        AnchorActive::new(self.is_first_line, self.anchor_position, self.pos)
    }

    /// Check if there are while conditions active and if they are still true.
    /// The first one failing pops its rule and everything above it.
    fn check_while_conditions(&mut self, tokens: &mut LineTokens) {
        // Initialize anchor position: reset to 0 if previous rule captured EOL
        self.anchor_position = if self.stack.begin_rule_has_captured_eol() {
            Some(0)
        } else {
            None
        };

        let while_frames: Vec<(StateStack, Arc<Rule>)> = self
            .stack
            .frames()
            .into_iter()
            .filter_map(|frame| {
                let rule = self.grammar.rule(frame.rule_id())?;
                matches!(*rule, Rule::BeginWhile(_)).then_some((frame, rule))
            })
            .collect();

        for (frame, rule) in while_frames {
            let Rule::BeginWhile(while_rule) = &*rule else {
                continue;
            };
            let scanner = self
                .grammar
                .while_scanner(while_rule, frame.end_pattern(), self.anchors());

            match scanner.find_at(self.line, self.pos) {
                Some(found) => {
                    tokens.produce(&frame, found.start);
                    self.handle_captures(
                        tokens,
                        &frame,
                        &while_rule.while_captures,
                        &found.capture_pos,
                    );
                    tokens.produce(&frame, found.end);
                    self.anchor_position = Some(found.end);
                    if found.end > self.pos {
                        self.pos = found.end;
                        self.is_first_line = false;
                    }
                }
                None => {
                    #[cfg(feature = "debug")]
                    log::debug!(
                        "[check_while_conditions] No while match found, popping: {:?}",
                        rule.name_source()
                    );
                    self.stack = frame.safe_pop();
                    break;
                }
            }
        }
    }

    fn match_rule(&self) -> Option<PatternSetMatch> {
        let rule = self.grammar.rule(self.stack.rule_id())?;
        let scanner = self
            .grammar
            .rule_scanner(&rule, self.stack.end_pattern(), self.anchors());
        scanner.find_at(self.line, self.pos)
    }

    /// Matches injection patterns at the current position
    /// Returns (priority, PatternSetMatch) for the best match
    fn match_injections(&self) -> Option<(i8, PatternSetMatch)> {
        let injections = self.grammar.injections();
        if injections.is_empty() {
            return None;
        }

        let scopes = self.stack.content_scopes().scopes();
        let anchors = self.anchors();
        let mut best_match: Option<(i8, PatternSetMatch)> = None;

        // Injections are already sorted by priority
        for injection in injections {
            if !injection.matcher.matches(&scopes) {
                continue;
            }
            let Some(rule) = self.grammar.rule(injection.rule_id) else {
                continue;
            };
            let scanner = self.grammar.rule_scanner(&rule, None, anchors);
            let Some(found) = scanner.find_at(self.line, self.pos) else {
                continue;
            };
            if let Some((_, current_best_match)) = &best_match
                && found.start >= current_best_match.start
            {
                continue;
            }

            let is_done = found.start == self.pos;
            best_match = Some((injection.priority, found));
            if is_done {
                break;
            }
        }

        best_match
    }

    /// Matches both regular rule patterns and injections, returning the best match
    /// Follows vscode-textmate's comparison logic for rule vs injection precedence
    fn match_rule_or_injections(&self) -> Option<PatternSetMatch> {
        let regular_match = self.match_rule();
        if let Some(found) = &regular_match
            && found.start == self.pos
            && self.grammar.injections().iter().all(|i| i.priority != LEFT_PRIORITY)
        {
            // nothing can beat it
            return regular_match;
        }

        match (regular_match, self.match_injections()) {
            (None, None) => None,
            (Some(regular), None) => Some(regular),
            (None, Some((_, injection))) => Some(injection),
            (Some(regular), Some((priority, injection))) => {
                if injection.start < regular.start
                    || (injection.start == regular.start && priority == LEFT_PRIORITY)
                {
                    Some(injection)
                } else {
                    Some(regular)
                }
            }
        }
    }

    /// Finds and handles the next match. Returns false when the line is done.
    fn scan_next(&mut self, tokens: &mut LineTokens) -> bool {
        let line_len = self.line.char_len();

        #[cfg(feature = "debug")]
        log::trace!("[scan_next] Scanning {}: |{:?}|", self.pos, self.line.slice(self.pos..line_len));

        let Some(m) = self.match_rule_or_injections() else {
            #[cfg(feature = "debug")]
            log::debug!("[scan_next] no more matches");
            // No more matches - emit final token and stop
            tokens.produce(&self.stack, line_len);
            return false;
        };

        #[cfg(feature = "debug")]
        log::debug!(
            "[scan_next] Matched rule: {:?} from pos {} to {} => {:?}",
            m.rule_id,
            m.start,
            m.end,
            self.line.slice(m.start..m.end)
        );

        // Track whether this match has advanced the position
        let has_advanced = m.end > self.pos;

        if m.rule_id == END_RULE_ID {
            // We matched the `end` for this rule, can only happen for BeginEnd rules
            let rule = self.grammar.rule(self.stack.rule_id());
            let end_captures: &[Option<RuleId>] = match rule.as_deref() {
                Some(Rule::BeginEnd(r)) => &r.end_captures,
                _ => &[],
            };

            tokens.produce(&self.stack, m.start);
            self.stack = self
                .stack
                .with_content_scopes(self.stack.name_scopes().clone());
            self.handle_captures(tokens, &self.stack, end_captures, &m.capture_pos);
            tokens.produce(&self.stack, m.end);

            // Pop to parent state and update anchor position
            let popped = self.stack.clone();
            self.stack = popped.safe_pop();
            self.anchor_position = popped.anchor_position();

            // Grammar pushed & popped a rule without advancing
            if !has_advanced && popped.enter_position() == Some(self.pos) {
                // See https://github.com/Microsoft/vscode-textmate/issues/12
                // Like vscode-textmate, restore the popped frame to keep the rule active
                self.stack = popped;
                tokens.produce(&self.stack, line_len);
                return false;
            }
        } else {
            let Some(rule) = self.grammar.rule(m.rule_id) else {
                tokens.produce(&self.stack, line_len);
                return false;
            };
            if m.start == m.end && matches!(*rule, Rule::Match(_)) {
                // An empty match leaves the stack as it was and has nothing to produce,
                // the text around it stays in one token. When it didn't advance, skip one
                // character so the next scan can't find it again
                self.pos = if has_advanced { m.end } else { self.pos + 1 };
                self.is_first_line = false;
                if self.pos >= line_len {
                    tokens.produce(&self.stack, line_len);
                    return false;
                }
                return true;
            }
            let provider = self.grammar.metadata_provider();

            tokens.produce(&self.stack, m.start);
            let before_push = self.stack.clone();
            let name = rule.name(self.line, &m.capture_pos);
            let name_scopes = self.stack.content_scopes().push(provider, name.as_deref());
            self.stack = self.stack.push(
                m.rule_id,
                Some(self.pos),
                self.anchor_position,
                m.end == line_len,
                None,
                name_scopes.clone(),
                name_scopes.clone(),
            );

            let (begin_captures, resolved_end) = match &*rule {
                Rule::BeginEnd(r) => (
                    &r.begin_captures,
                    r.end.has_backreferences().then(|| {
                        r.end.resolve_backreferences(self.line, &m.capture_pos)
                    }),
                ),
                Rule::BeginWhile(r) => (
                    &r.begin_captures,
                    r.while_.has_backreferences().then(|| {
                        r.while_.resolve_backreferences(self.line, &m.capture_pos)
                    }),
                ),
                Rule::Match(r) => {
                    self.handle_captures(tokens, &self.stack, &r.captures, &m.capture_pos);
                    tokens.produce(&self.stack, m.end);
                    // pop rule immediately since it is a MatchRule
                    self.stack = self.stack.safe_pop();
                    self.pos = m.end;
                    self.is_first_line = false;
                    return true;
                }
                Rule::IncludeOnly(_) | Rule::Capture(_) => {
                    log::warn!("Matched rule {} which has no regex", *m.rule_id);
                    self.stack = self.stack.safe_pop();
                    tokens.produce(&self.stack, line_len);
                    return false;
                }
            };

            self.handle_captures(tokens, &self.stack, begin_captures, &m.capture_pos);
            tokens.produce(&self.stack, m.end);
            self.anchor_position = Some(m.end);

            let content_name = rule.content_name(self.line, &m.capture_pos);
            let content_scopes = name_scopes.push(provider, content_name.as_deref());
            self.stack = self.stack.with_content_scopes(content_scopes);
            if let Some(end_pattern) = resolved_end {
                self.stack = self.stack.with_end_pattern(end_pattern);
            }

            if !has_advanced && before_push.has_same_rule_as(&self.stack) {
                // Grammar pushed the same rule without advancing
                #[cfg(feature = "debug")]
                log::debug!("[scan_next] Rule {:?} pushed without advancing, stopping", m.rule_id);
                self.stack = self.stack.safe_pop();
                tokens.produce(&self.stack, line_len);
                return false;
            }
        }

        if has_advanced {
            self.pos = m.end;
            self.is_first_line = false;
        }
        true
    }

    fn handle_captures(
        &self,
        tokens: &mut LineTokens,
        stack: &StateStack,
        captures: &[Option<RuleId>],
        capture_pos: &[Option<(usize, usize)>],
    ) {
        if captures.is_empty() {
            return;
        }
        let Some(Some((_, max_end))) = capture_pos.first() else {
            return;
        };
        let max_end = *max_end;
        let provider = self.grammar.metadata_provider();

        // (scopes, end_pos)[]
        let mut local_stack: Vec<(ScopeList, usize)> = Vec::with_capacity(2);

        for (capture_id, pos) in captures.iter().zip(capture_pos) {
            let Some(capture_id) = capture_id else {
                continue;
            };
            let Some((cap_start, cap_end)) = *pos else {
                continue;
            };
            // Nothing captured
            if cap_start == cap_end {
                continue;
            }
            // Captures in lookaheads can go past the match
            if cap_start > max_end {
                break;
            }

            // pop captures while needed
            while let Some((scopes, end_pos)) = local_stack.last()
                && *end_pos <= cap_start
            {
                tokens.produce_from_scopes(scopes, *end_pos);
                local_stack.pop();
            }

            match local_stack.last() {
                Some((scopes, _)) => tokens.produce_from_scopes(scopes, cap_start),
                None => tokens.produce(stack, cap_start),
            }

            let Some(rule) = self.grammar.rule(*capture_id) else {
                continue;
            };
            let Rule::Capture(capture) = &*rule else {
                continue;
            };

            let name = rule.name(self.line, capture_pos);
            if let Some(retokenize_with) = capture.retokenize_with {
                // Starts again from the rule's scopes: enclosing named captures don't apply
                let name_scopes = stack.content_scopes().push(provider, name.as_deref());
                let content_name = rule.content_name(self.line, capture_pos);
                let content_scopes = name_scopes.push(provider, content_name.as_deref());
                let retokenization_stack = stack.push(
                    retokenize_with,
                    Some(cap_start),
                    None,
                    false,
                    None,
                    name_scopes,
                    content_scopes,
                );

                #[cfg(feature = "debug")]
                log::debug!(
                    "[handle_captures] Retokenizing capture at [{cap_start}..{cap_end}]: {:?}",
                    self.line.slice(cap_start..cap_end)
                );
                let substring = self.line.truncated(cap_end);
                tokenize_string(
                    self.grammar,
                    &substring,
                    self.is_first_line && cap_start == 0,
                    cap_start,
                    retokenization_stack,
                    tokens,
                    false,
                );
                continue;
            }

            if let Some(name) = name {
                let base = match local_stack.last() {
                    Some((scopes, _)) => scopes,
                    None => stack.content_scopes(),
                };
                let scopes = base.push(provider, Some(&name));
                local_stack.push((scopes, cap_end));
            }
        }

        while let Some((scopes, end_pos)) = local_stack.pop() {
            tokens.produce_from_scopes(&scopes, end_pos);
        }
    }
}
