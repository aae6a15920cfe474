use std::fmt::{Debug, Formatter};
use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use onig::{RegSet, Regex, RegexOptions, SearchOptions};

use crate::grammars::RuleId;

/// A line of text ready to be searched.
///
/// Regexes work on bytes but the tokenizer works on character offsets (Unicode scalar
/// values), this keeps the mapping between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineText {
    text: String,
    /// Byte offset of every char followed by the text length.
    /// Empty when the text is ASCII since both offsets are then the same.
    byte_offsets: Vec<usize>,
}

impl LineText {
    pub fn new(text: String) -> Self {
        let byte_offsets = if text.is_ascii() {
            Vec::new()
        } else {
            text.char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(text.len()))
                .collect()
        };
        Self { text, byte_offsets }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters
    pub fn char_len(&self) -> usize {
        if self.byte_offsets.is_empty() {
            self.text.len()
        } else {
            self.byte_offsets.len() - 1
        }
    }

    /// Offsets past the end are clamped to the text length
    pub fn byte_offset(&self, char_offset: usize) -> usize {
        if self.byte_offsets.is_empty() {
            char_offset.min(self.text.len())
        } else {
            self.byte_offsets[char_offset.min(self.byte_offsets.len() - 1)]
        }
    }

    pub fn char_offset(&self, byte_offset: usize) -> usize {
        if self.byte_offsets.is_empty() {
            byte_offset
        } else {
            match self.byte_offsets.binary_search(&byte_offset) {
                Ok(i) | Err(i) => i,
            }
        }
    }

    /// The text between two character offsets
    pub fn slice(&self, range: Range<usize>) -> &str {
        let start = self.byte_offset(range.start);
        let end = self.byte_offset(range.end).max(start);
        &self.text[start..end]
    }

    /// The first `char_end` characters of the line
    pub fn truncated(&self, char_end: usize) -> LineText {
        LineText::new(self.slice(0..char_end).to_owned())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PatternSetMatch {
    pub rule_id: RuleId,
    /// Index of the winning pattern in the set
    pub index: usize,
    pub start: usize,
    pub end: usize,
    /// Character offsets of every capture group, group 0 being the whole match
    pub capture_pos: Vec<Option<(usize, usize)>>,
}

/// An ordered list of patterns searched together.
///
/// The earliest match in the line wins, ties going to the pattern that comes first.
/// Patterns that oniguruma refuses to compile are logged once and never match.
pub struct PatternSet {
    rule_ids: Vec<RuleId>,
    /// For each pattern of the regset, its index in `rule_ids`.
    /// Only differs from the identity when some patterns were invalid.
    indices: Vec<usize>,
    /// Oniguruma keeps the match regions inside the set, so searches can't overlap.
    regset: Option<Mutex<RegSet>>,
}

impl PatternSet {
    pub fn new(items: Vec<(RuleId, String)>) -> Self {
        let (rule_ids, patterns): (Vec<_>, Vec<_>) = items.into_iter().unzip();
        if patterns.is_empty() {
            return Self {
                rule_ids,
                indices: Vec::new(),
                regset: None,
            };
        }

        let pattern_strs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
        if let Ok(regset) =
            RegSet::with_options(&pattern_strs, RegexOptions::REGEX_OPTION_CAPTURE_GROUP)
        {
            return Self {
                indices: (0..rule_ids.len()).collect(),
                rule_ids,
                regset: Some(Mutex::new(regset)),
            };
        }

        // At least one pattern is invalid: find which ones and leave them out
        let mut indices = Vec::with_capacity(pattern_strs.len());
        for (i, pattern) in pattern_strs.iter().enumerate() {
            match Regex::new(pattern) {
                Ok(_) => indices.push(i),
                Err(err) => log::warn!(
                    "Invalid regex for rule {}, it will never match: {pattern:?}: {err}",
                    *rule_ids[i]
                ),
            }
        }
        let valid: Vec<&str> = indices.iter().map(|i| pattern_strs[*i]).collect();
        let regset = if valid.is_empty() {
            None
        } else {
            match RegSet::with_options(&valid, RegexOptions::REGEX_OPTION_CAPTURE_GROUP) {
                Ok(regset) => Some(Mutex::new(regset)),
                Err(err) => {
                    log::warn!("Failed to compile pattern set of {} patterns: {err}", valid.len());
                    None
                }
            }
        };

        Self {
            rule_ids,
            indices,
            regset,
        }
    }

    pub fn len(&self) -> usize {
        self.rule_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_ids.is_empty()
    }

    pub fn rule_ids(&self) -> &[RuleId] {
        &self.rule_ids
    }

    /// Searches the line from the character offset `pos`.
    ///
    /// Lookbehinds can see the text before `pos`, that's why the full text is given to
    /// oniguruma rather than a slice.
    pub fn find_at(&self, text: &LineText, pos: usize) -> Option<PatternSetMatch> {
        let regset = self
            .regset
            .as_ref()?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let haystack = text.as_str();
        let from = text.byte_offset(pos);

        let (regset_index, captures) = regset.captures_with_options(
            haystack,
            from,
            haystack.len(),
            onig::RegSetLead::Position,
            SearchOptions::SEARCH_OPTION_NONE,
        )?;
        let (match_start, match_end) = captures.pos(0)?;

        let capture_pos: Vec<Option<(usize, usize)>> = (0..captures.len())
            .map(|i| {
                captures
                    .pos(i)
                    .map(|(s, e)| (text.char_offset(s), text.char_offset(e)))
            })
            .collect();
        let index = self.indices[regset_index];

        Some(PatternSetMatch {
            rule_id: self.rule_ids[index],
            index,
            start: text.char_offset(match_start),
            end: text.char_offset(match_end),
            capture_pos,
        })
    }
}

impl Debug for PatternSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PatternSet({} rules)", self.rule_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> PatternSet {
        PatternSet::new(
            patterns
                .iter()
                .enumerate()
                .map(|(i, p)| (RuleId(i as u32 + 1), p.to_string()))
                .collect(),
        )
    }

    fn line(s: &str) -> LineText {
        LineText::new(s.to_string())
    }

    #[test]
    fn earliest_match_wins() {
        let set = set(&["b", "a"]);
        let found = set.find_at(&line("xab\n"), 0).unwrap();
        assert_eq!(found.index, 1);
        assert_eq!(found.rule_id, RuleId(2));
        assert_eq!((found.start, found.end), (1, 2));
    }

    #[test]
    fn ties_go_to_first_pattern() {
        let set = set(&["ab", "a", "abc"]);
        let found = set.find_at(&line("abc\n"), 0).unwrap();
        assert_eq!(found.index, 0);
        assert_eq!(found.end, 2);
    }

    #[test]
    fn searches_from_offset_with_lookbehind() {
        let set = set(&["(?<=a)b"]);
        let found = set.find_at(&line("abab\n"), 2).unwrap();
        assert_eq!((found.start, found.end), (3, 4));
        assert!(set.find_at(&line("bb\n"), 0).is_none());
    }

    #[test]
    fn reports_capture_groups() {
        let set = set(&["(a)(x)?(b)"]);
        let found = set.find_at(&line("ab\n"), 0).unwrap();
        assert_eq!(
            found.capture_pos,
            vec![Some((0, 2)), Some((0, 1)), None, Some((1, 2))]
        );
    }

    #[test]
    fn invalid_patterns_never_match() {
        let set = set(&["(unclosed", "b"]);
        assert_eq!(set.len(), 2);
        let found = set.find_at(&line("ab\n"), 0).unwrap();
        assert_eq!(found.index, 1);
        assert_eq!(found.rule_id, RuleId(2));

        let only_invalid = self::set(&["[z-a]"]);
        assert!(only_invalid.find_at(&line("a\n"), 0).is_none());
    }

    #[test]
    fn empty_set_never_matches() {
        assert!(set(&[]).find_at(&line("a\n"), 0).is_none());
    }

    #[test]
    fn offsets_are_in_characters() {
        let text = line("é→b\n");
        assert_eq!(text.char_len(), 4);
        assert_eq!(text.byte_offset(2), 5);
        assert_eq!(text.char_offset(5), 2);
        assert_eq!(text.slice(1..3), "→b");

        let found = set(&["b"]).find_at(&text, 1).unwrap();
        assert_eq!((found.start, found.end), (2, 3));
        assert_eq!(text.truncated(2).as_str(), "é→");
    }
}
