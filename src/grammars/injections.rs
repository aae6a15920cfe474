//! Scope selector parsing and matching, used to decide where injections apply.

use std::fmt;
use std::sync::LazyLock;

use onig::Regex;

use crate::grammars::RuleId;

/// Selectors prefixed with `L:` are tried before the rule patterns, `R:` after them.
pub const LEFT_PRIORITY: i8 = -1;
pub const DEFAULT_PRIORITY: i8 = 0;
pub const RIGHT_PRIORITY: i8 = 1;

/// A compiled scope selector that can evaluate against a scope stack (root first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMatcher {
    /// Space separated scopes, they need to be found in that order in the stack but not
    /// necessarily next to each other
    Path(Vec<String>),
    /// All matchers must succeed
    And(Vec<SelectorMatcher>),
    /// Any matcher can succeed (`|` or `,` inside parentheses)
    Or(Vec<SelectorMatcher>),
    /// Matcher must NOT succeed (`-` prefix)
    Not(Box<SelectorMatcher>),
}

impl SelectorMatcher {
    pub fn matches<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        match self {
            SelectorMatcher::Path(identifiers) => path_matches(identifiers, scopes),
            SelectorMatcher::And(matchers) => matchers.iter().all(|m| m.matches(scopes)),
            SelectorMatcher::Or(matchers) => matchers.iter().any(|m| m.matches(scopes)),
            SelectorMatcher::Not(matcher) => !matcher.matches(scopes),
        }
    }
}

/// One comma separated part of a selector with its priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherWithPriority {
    pub matcher: SelectorMatcher,
    /// -1 for `L:`, 1 for `R:`, 0 otherwise
    pub priority: i8,
}

/// An injection ready to be tried by the tokenizer
#[derive(Debug, Clone)]
pub struct Injection {
    pub matcher: SelectorMatcher,
    pub priority: i8,
    pub rule_id: RuleId,
    /// Scope name of the grammar the injected rule comes from
    pub grammar: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// Something that is neither a scope, an operator nor whitespace
    UnexpectedCharacter { selector: String, position: usize },
    /// A `(` without its `)`
    UnclosedParenthesis { selector: String },
    /// `-`, `|` or `,` not followed by anything to apply to, or `()`
    MissingOperand { selector: String },
    /// An operator where it can't be used, eg a `)` without `(`
    UnexpectedToken { selector: String, token: String },
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::UnexpectedCharacter { selector, position } => {
                write!(f, "unexpected character at {position} in '{selector}'")
            }
            SelectorError::UnclosedParenthesis { selector } => {
                write!(f, "unclosed parenthesis in '{selector}'")
            }
            SelectorError::MissingOperand { selector } => {
                write!(f, "operator without operand in '{selector}'")
            }
            SelectorError::UnexpectedToken { selector, token } => {
                write!(f, "unexpected '{token}' in '{selector}'")
            }
        }
    }
}

impl std::error::Error for SelectorError {}

/// Same tokens as vscode-textmate, with `*` added for things like `meta.tag.*.html`
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([LR]:|[\w.:][\w*.:\-]*|[,|\-()])").expect("Invalid selector regex")
});

/// Whether `scope` is `selector` or a child of it: `string.quoted` matches the selector
/// `string` but `strings` doesn't.
pub(crate) fn scope_matches(scope: &str, selector: &str) -> bool {
    scope == selector
        || (scope.len() > selector.len()
            && scope.starts_with(selector)
            && scope.as_bytes()[selector.len()] == b'.')
}

fn path_matches<S: AsRef<str>>(identifiers: &[String], scopes: &[S]) -> bool {
    if scopes.len() < identifiers.len() {
        return false;
    }
    let mut last_index = 0;
    identifiers.iter().all(|identifier| {
        match scopes[last_index..]
            .iter()
            .position(|scope| scope_matches(scope.as_ref(), identifier))
        {
            Some(i) => {
                last_index += i + 1;
                true
            }
            None => false,
        }
    })
}

fn is_identifier(token: &str) -> bool {
    !matches!(token, "L:" | "R:" | "," | "|" | "-" | "(" | ")")
}

struct Parser<'a> {
    selector: &'a str,
    tokens: Vec<&'a str>,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(selector: &'a str) -> Result<Self, SelectorError> {
        let mut tokens = Vec::new();
        let mut last_end = 0;
        for (start, end) in TOKEN_REGEX.find_iter(selector) {
            Self::check_gap(selector, last_end, start)?;
            tokens.push(&selector[start..end]);
            last_end = end;
        }
        Self::check_gap(selector, last_end, selector.len())?;

        Ok(Self {
            selector,
            tokens,
            position: 0,
        })
    }

    fn check_gap(selector: &str, from: usize, to: usize) -> Result<(), SelectorError> {
        match selector[from..to].char_indices().find(|(_, c)| !c.is_whitespace()) {
            Some((i, _)) => Err(SelectorError::UnexpectedCharacter {
                selector: selector.to_owned(),
                position: from + i,
            }),
            None => Ok(()),
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.position).copied()
    }

    fn missing_operand(&self) -> SelectorError {
        SelectorError::MissingOperand {
            selector: self.selector.to_owned(),
        }
    }

    fn unexpected(&self, token: &str) -> SelectorError {
        SelectorError::UnexpectedToken {
            selector: self.selector.to_owned(),
            token: token.to_owned(),
        }
    }

    fn parse_operand(&mut self) -> Result<Option<SelectorMatcher>, SelectorError> {
        let Some(token) = self.peek() else {
            return Ok(None);
        };

        match token {
            "-" => {
                self.position += 1;
                match self.parse_operand()? {
                    Some(negated) => Ok(Some(SelectorMatcher::Not(Box::new(negated)))),
                    None => Err(self.missing_operand()),
                }
            }
            "(" => {
                self.position += 1;
                let inner = self.parse_inner_expression()?;
                if self.peek() == Some(")") {
                    self.position += 1;
                    Ok(Some(inner))
                } else {
                    Err(SelectorError::UnclosedParenthesis {
                        selector: self.selector.to_owned(),
                    })
                }
            }
            _ if is_identifier(token) => {
                let mut identifiers = Vec::new();
                while let Some(token) = self.peek()
                    && is_identifier(token)
                {
                    // `meta.tag.*.html` is treated as `meta.tag`
                    let identifier = match token.find(".*") {
                        Some(pos) => &token[..pos],
                        None => token,
                    };
                    identifiers.push(identifier.to_owned());
                    self.position += 1;
                }
                Ok(Some(SelectorMatcher::Path(identifiers)))
            }
            _ => Ok(None),
        }
    }

    fn parse_conjunction(&mut self) -> Result<Option<SelectorMatcher>, SelectorError> {
        let mut matchers = Vec::new();
        while let Some(m) = self.parse_operand()? {
            matchers.push(m);
        }

        Ok(match matchers.len() {
            0 => None,
            1 => matchers.pop(),
            _ => Some(SelectorMatcher::And(matchers)),
        })
    }

    /// Conjunctions separated by `separators`
    fn parse_disjunction(
        &mut self,
        separators: &[&str],
    ) -> Result<SelectorMatcher, SelectorError> {
        let mut matchers = Vec::new();
        loop {
            match self.parse_conjunction()? {
                Some(m) => matchers.push(m),
                None => {
                    return Err(match self.peek() {
                        Some(token) if !separators.contains(&token) && token != ")" => {
                            self.unexpected(token)
                        }
                        _ => self.missing_operand(),
                    });
                }
            }
            match self.peek() {
                Some(token) if separators.contains(&token) => self.position += 1,
                _ => break,
            }
        }

        Ok(if matchers.len() == 1 {
            matchers.remove(0)
        } else {
            SelectorMatcher::Or(matchers)
        })
    }

    fn parse_inner_expression(&mut self) -> Result<SelectorMatcher, SelectorError> {
        self.parse_disjunction(&["|", ","])
    }
}

/// Parses a selector such as `L:source.js -comment, text.html string`.
///
/// Each comma separated part becomes its own matcher with its own priority.
/// An empty selector gives no matchers.
pub fn compile_selector(selector: &str) -> Result<Vec<MatcherWithPriority>, SelectorError> {
    let mut parser = Parser::new(selector)?;
    let mut res = Vec::new();

    while let Some(token) = parser.peek() {
        let priority = match token {
            "L:" => LEFT_PRIORITY,
            "R:" => RIGHT_PRIORITY,
            _ => DEFAULT_PRIORITY,
        };
        if priority != DEFAULT_PRIORITY {
            parser.position += 1;
        }

        let matcher = parser.parse_disjunction(&["|"])?;
        res.push(MatcherWithPriority { matcher, priority });

        match parser.peek() {
            None => break,
            Some(",") => parser.position += 1,
            Some(token) => return Err(parser.unexpected(token)),
        }
    }

    Ok(res)
}
