//! A line-based tokenizer for TextMate grammars.
//!
//! Lines are tokenized one at a time: each call returns the tokens of the line and a
//! [`StateStack`] to give when tokenizing the next line. States of consecutive lines share
//! most of their data and compare cheaply, so editors can stop retokenizing once a line
//! ends in the same state as before.
//!
//! ```no_run
//! use std::sync::Arc;
//! use scopeline::{Grammar, RawGrammar, Theme};
//!
//! let raw = RawGrammar::from_json(r#"{ "scopeName": "source.x", "patterns": [] }"#)?;
//! let grammar = Grammar::new(&raw, Arc::new(Theme::empty()))?;
//! let mut state = None;
//! for line in "a\nb".lines() {
//!     let result = grammar.tokenize_line(line, state.as_ref());
//!     println!("{:?}", result.tokens);
//!     state = Some(result.rule_stack);
//! }
//! # Ok::<(), scopeline::Error>(())
//! ```

mod error;
mod grammar;
mod grammars;
mod metadata;
mod registry;
mod scope;
mod themes;
mod tokenizer;

pub use error::Error;
pub use grammar::{Grammar, GrammarOptions};
pub use grammars::{
    DEFAULT_PRIORITY, LEFT_PRIORITY, MatcherWithPriority, RIGHT_PRIORITY, RawGrammar, RawRule,
    RuleId, SelectorError, SelectorMatcher, compile_selector,
};
pub use metadata::{Metadata, ScopeMetadata, ScopeMetadataProvider, TokenType};
pub use registry::{GrammarRepository, Registry};
pub use scope::ScopeList;
pub use themes::{ColorMap, FontStyle, RawTheme, Theme, ThemeProvider, ThemeTrieElementRule};
pub use tokenizer::{
    BinaryToken, StateStack, Token, TokenizeLineBinaryResult, TokenizeLineResult,
};
