mod compiled;
mod injections;
mod pattern_set;
mod raw;
mod regex;

pub use compiled::*;
pub use injections::{
    DEFAULT_PRIORITY, Injection, LEFT_PRIORITY, MatcherWithPriority, RIGHT_PRIORITY,
    SelectorError, SelectorMatcher, compile_selector,
};
pub(crate) use injections::scope_matches;
pub use pattern_set::{LineText, PatternSet, PatternSetMatch};
pub use raw::{RawCaptures, RawGrammar, RawRepository, RawRule};
pub use regex::Regex;
