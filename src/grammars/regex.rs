use std::borrow::Cow;
use std::fmt;

use crate::grammars::LineText;
use crate::tokenizer::AnchorActive;

/// Replacement for `\z`, which oniguruma would otherwise match before our trailing `\n`
const END_OF_STRING: &str = "$(?!\\n)(?<!\\n)";

/// The source of a regex found in a grammar.
///
/// Compilation happens in [`crate::grammars::PatternSet`] since the same source gets compiled
/// with different anchors depending on where the tokenizer is.
#[derive(Clone, PartialEq, Eq)]
pub struct Regex {
    pattern: String,
    has_anchor: bool,
    has_backreferences: bool,
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl Regex {
    pub fn new(source: &str) -> Self {
        let mut pattern = String::with_capacity(source.len());
        let mut has_anchor = false;
        let mut has_backreferences = false;

        let mut chars = source.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                pattern.push(ch);
                continue;
            }
            match chars.next() {
                Some('z') => pattern.push_str(END_OF_STRING),
                Some(next) => {
                    match next {
                        'A' | 'G' => has_anchor = true,
                        '0'..='9' => has_backreferences = true,
                        _ => (),
                    }
                    pattern.push('\\');
                    pattern.push(next);
                }
                None => pattern.push('\\'),
            }
        }

        Self {
            pattern,
            has_anchor,
            has_backreferences,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn has_anchor(&self) -> bool {
        self.has_anchor
    }

    pub fn has_backreferences(&self) -> bool {
        self.has_backreferences
    }

    /// The pattern with `\A`/`\G` disabled when they can't match at the current position
    pub fn resolve_anchors(&self, anchors: AnchorActive) -> Cow<'_, str> {
        if self.has_anchor {
            anchors.replace_anchors(&self.pattern)
        } else {
            Cow::Borrowed(&self.pattern)
        }
    }

    /// Replaces `\1`, `\2`... with the text captured by the `begin` regex, escaped so it is
    /// matched literally. Groups that did not capture anything are replaced by nothing.
    pub fn resolve_backreferences(
        &self,
        line: &LineText,
        captures: &[Option<(usize, usize)>],
    ) -> String {
        let mut out = String::with_capacity(self.pattern.len());
        let mut chars = self.pattern.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.peek() {
                Some(c) if c.is_ascii_digit() => {
                    let mut index = 0usize;
                    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                        index = index.saturating_mul(10).saturating_add(digit as usize);
                        chars.next();
                    }
                    if let Some(Some((start, end))) = captures.get(index) {
                        escape_into(line.slice(*start..*end), &mut out);
                    }
                }
                Some(_) => {
                    out.push('\\');
                    out.extend(chars.next());
                }
                None => out.push('\\'),
            }
        }

        out
    }
}

fn escape_into(text: &str, out: &mut String) {
    for ch in text.chars() {
        if matches!(
            ch,
            '-' | '\\'
                | '{'
                | '}'
                | '*'
                | '+'
                | '?'
                | '|'
                | '^'
                | '$'
                | '.'
                | ','
                | '['
                | ']'
                | '('
                | ')'
                | '#'
        ) || ch.is_whitespace()
        {
            out.push('\\');
        }
        out.push(ch);
    }
}
