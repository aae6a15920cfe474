use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::ScopelineResult;

/// Repository key under which a grammar's own top-level patterns are stored
pub(crate) const SELF_KEY: &str = "$self";
/// Repository key used to resolve `$base` includes
pub(crate) const BASE_KEY: &str = "$base";

/// Named rules that can be referenced with `#name` includes
pub type RawRepository = HashMap<String, Arc<RawRule>>;

/// Capture group number → rule assigning a scope (and optionally patterns) to it
pub type RawCaptures = BTreeMap<String, Arc<RawRule>>;

/// A single rule node of a TextMate grammar, exactly as written in the grammar.
///
/// The kind of rule is decided by which fields are set:
/// - `include` makes it a reference to another rule
/// - `match` makes it a match-only rule
/// - `begin` + `end` makes it a begin/end region
/// - `begin` + `while` makes it a begin/while region
/// - none of the above makes it a plain container of `patterns`
///
/// # Examples
/// ```json
/// {
///   "name": "string.quoted.double.js",
///   "begin": "\"",
///   "end": "\"",
///   "beginCaptures": {
///     "0": { "name": "punctuation.definition.string.begin.js" }
///   },
///   "patterns": [
///     { "match": "\\\\.", "name": "constant.character.escape.js" }
///   ]
/// }
/// ```
///
/// Rules are shared behind `Arc` and never mutated once loaded: the address of the
/// `Arc` is what identifies a rule when it gets compiled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all(deserialize = "camelCase"))]
pub struct RawRule {
    /// Reference to other patterns:
    /// - `#name`: entry of the current repository
    /// - `$self` / `$base`: the current / base grammar top-level patterns
    /// - `source.js`: another grammar
    /// - `source.js#name`: entry of another grammar repository
    pub include: Option<String>,
    /// Scope name for the whole match or region, can refer to captures with `$1`
    pub name: Option<String>,
    /// Scope name for the content between `begin` and `end`/`while`
    pub content_name: Option<String>,
    #[serde(rename(deserialize = "match"))]
    pub match_: Option<String>,
    #[serde(deserialize_with = "deserialize_captures")]
    pub captures: RawCaptures,
    pub begin: Option<String>,
    #[serde(deserialize_with = "deserialize_captures")]
    pub begin_captures: RawCaptures,
    /// Can use backreferences (`\1`) to the `begin` captures
    pub end: Option<String>,
    #[serde(deserialize_with = "deserialize_captures")]
    pub end_captures: RawCaptures,
    /// Can use backreferences (`\1`) to the `begin` captures
    #[serde(rename(deserialize = "while"))]
    pub while_: Option<String>,
    #[serde(deserialize_with = "deserialize_captures")]
    pub while_captures: RawCaptures,
    pub patterns: Vec<Arc<RawRule>>,
    pub repository: Option<RawRepository>,
    /// Grammars write either `1` or `true`
    #[serde(deserialize_with = "deserialize_bool_or_int")]
    pub apply_end_pattern_last: bool,
}

impl RawRule {
    /// A rule that only assigns a scope name, the shape of most captures
    pub fn scope(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Top-level structure of a TextMate grammar
///
/// # Examples
/// ```json
/// {
///   "name": "JavaScript",
///   "scopeName": "source.js",
///   "fileTypes": ["js", "mjs"],
///   "patterns": [{ "include": "#statements" }],
///   "repository": {
///     "statements": { "patterns": [{ "include": "#keywords" }] },
///     "keywords": { "match": "\\b(if|else)\\b", "name": "keyword.control.js" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all(deserialize = "camelCase"))]
pub struct RawGrammar {
    /// Unique identifier of the grammar, eg `source.js`
    pub scope_name: String,
    /// Human-readable name of the language
    pub name: Option<String>,
    pub file_types: Vec<String>,
    pub first_line_match: Option<String>,
    pub patterns: Vec<Arc<RawRule>>,
    pub repository: RawRepository,
    /// Selector → rule injected in this grammar wherever the selector matches.
    /// Ordered by selector so the injection order is deterministic.
    pub injections: BTreeMap<String, Arc<RawRule>>,
    /// Where this grammar injects itself when it is used as an injector
    /// grammar, eg `L:source.js -comment`
    pub injection_selector: Option<String>,
    /// Scope names of the grammars this grammar should be injected into
    pub inject_to: Vec<String>,
}

impl RawGrammar {
    pub fn from_json(json: &str) -> ScopelineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns a private copy of this grammar with the `$self` and `$base`
    /// repository entries filled in.
    ///
    /// `self` is left untouched: grammars sharing the same raw grammar never see
    /// each other's entries. Rules are `Arc`s so the copy is shallow.
    pub(crate) fn with_self_and_base(&self, base: Option<Arc<RawRule>>) -> RawGrammar {
        let mut grammar = self.clone();
        let self_rule = Arc::new(RawRule {
            name: Some(self.scope_name.clone()),
            patterns: self.patterns.clone(),
            ..Default::default()
        });
        let base = base.unwrap_or_else(|| Arc::clone(&self_rule));
        grammar.repository.insert(SELF_KEY.to_owned(), self_rule);
        grammar.repository.insert(BASE_KEY.to_owned(), base);
        grammar
    }

    /// The synthesized root rule, only present on grammars returned by
    /// [`RawGrammar::with_self_and_base`]
    pub(crate) fn self_rule(&self) -> Option<&Arc<RawRule>> {
        self.repository.get(SELF_KEY)
    }

    pub(crate) fn base_rule(&self) -> Option<&Arc<RawRule>> {
        self.repository.get(BASE_KEY)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCapture {
    Scope(String),
    Rule(RawRule),
}

/// Captures are usually objects but some grammars only give the scope name
fn deserialize_captures<'de, D>(deserializer: D) -> Result<RawCaptures, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, RawCapture> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, capture)| {
            let rule = match capture {
                RawCapture::Scope(name) => RawRule::scope(name),
                RawCapture::Rule(rule) => rule,
            };
            (key, Arc::new(rule))
        })
        .collect())
}

fn deserialize_bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct BoolVisitor;

    impl<'de> Visitor<'de> for BoolVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a boolean or an integer")
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<bool, E> {
            Ok(value != 0)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<bool, E> {
            Ok(value != 0)
        }
    }

    deserializer.deserialize_any(BoolVisitor)
}
