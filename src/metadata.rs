//! Per-token metadata packed in a `u32`.
//!
//! ```text
//! 3322 2222 2222 1111 1111 1100 0000 0000
//! 1098 7654 3210 9876 5432 1098 7654 3210
//! bbbb bbbb bfff ffff ffFF FTTT LLLL LLLL
//! ```
//! - L: language id
//! - T: token type
//! - F: font style
//! - f: foreground color id
//! - b: background color id

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use onig::Regex;

use crate::scope::ScopeList;
use crate::themes::{FontStyle, ThemeProvider, ThemeTrieElementRule};

const LANGUAGE_ID_MASK: u32 = 0b0000_0000_0000_0000_0000_0000_1111_1111;
const TOKEN_TYPE_MASK: u32 = 0b0000_0000_0000_0000_0000_0111_0000_0000;
const FONT_STYLE_MASK: u32 = 0b0000_0000_0000_0000_0011_1000_0000_0000;
const FOREGROUND_MASK: u32 = 0b0000_0000_0111_1111_1100_0000_0000_0000;
const BACKGROUND_MASK: u32 = 0b1111_1111_1000_0000_0000_0000_0000_0000;

const LANGUAGE_ID_OFFSET: u32 = 0;
const TOKEN_TYPE_OFFSET: u32 = 8;
const FONT_STYLE_OFFSET: u32 = 11;
const FOREGROUND_OFFSET: u32 = 14;
const BACKGROUND_OFFSET: u32 = 23;

/// The kind of text a token is, as far as editors care
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TokenType {
    #[default]
    Other,
    Comment,
    String,
    RegEx,
    /// Only used while computing metadata: resets the type to `Other` instead of inheriting it
    MetaEmbedded,
}

impl TokenType {
    fn bits(self) -> u32 {
        match self {
            TokenType::Other | TokenType::MetaEmbedded => 0,
            TokenType::Comment => 1,
            TokenType::String => 2,
            TokenType::RegEx => 4,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => TokenType::Comment,
            2 => TokenType::String,
            4 => TokenType::RegEx,
            _ => TokenType::Other,
        }
    }
}

static STANDARD_TOKEN_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(comment|string|regex|meta\.embedded)\b").expect("Invalid token type regex")
});

/// The token type implied by a scope name, from its first `comment`, `string`, `regex` or
/// `meta.embedded` segment
pub fn token_type_of_scope(scope: &str) -> TokenType {
    let Some(captures) = STANDARD_TOKEN_TYPE.captures(scope) else {
        return TokenType::Other;
    };
    match captures.at(1) {
        Some("comment") => TokenType::Comment,
        Some("string") => TokenType::String,
        Some("regex") => TokenType::RegEx,
        Some("meta.embedded") => TokenType::MetaEmbedded,
        _ => TokenType::Other,
    }
}

/// Language, token type, font style and colors of a token in a single `u32`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Metadata(u32);

impl Metadata {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn language_id(self) -> u8 {
        ((self.0 & LANGUAGE_ID_MASK) >> LANGUAGE_ID_OFFSET) as u8
    }

    pub fn token_type(self) -> TokenType {
        TokenType::from_bits((self.0 & TOKEN_TYPE_MASK) >> TOKEN_TYPE_OFFSET)
    }

    pub fn font_style(self) -> FontStyle {
        FontStyle::from_bits(((self.0 & FONT_STYLE_MASK) >> FONT_STYLE_OFFSET) as u8)
    }

    /// Color map id of the foreground
    pub fn foreground(self) -> u32 {
        (self.0 & FOREGROUND_MASK) >> FOREGROUND_OFFSET
    }

    /// Color map id of the background
    pub fn background(self) -> u32 {
        (self.0 & BACKGROUND_MASK) >> BACKGROUND_OFFSET
    }

    /// Returns a copy with the given fields replaced.
    ///
    /// Unset values keep the current ones: language 0, `TokenType::Other`, no font style
    /// and color 0.
    pub fn set(
        self,
        language_id: u8,
        token_type: TokenType,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) -> Self {
        let language_id = if language_id == 0 {
            self.language_id()
        } else {
            language_id
        };
        let token_type = match token_type {
            TokenType::Other => self.token_type(),
            other => other,
        };
        let font_style = font_style.unwrap_or_else(|| self.font_style());
        let foreground = if foreground == 0 {
            self.foreground()
        } else {
            foreground
        };
        let background = if background == 0 {
            self.background()
        } else {
            background
        };

        Self(
            ((language_id as u32) << LANGUAGE_ID_OFFSET)
                | ((token_type.bits() << TOKEN_TYPE_OFFSET) & TOKEN_TYPE_MASK)
                | (((font_style.bits() as u32) << FONT_STYLE_OFFSET) & FONT_STYLE_MASK)
                | ((foreground << FOREGROUND_OFFSET) & FOREGROUND_MASK)
                | ((background << BACKGROUND_OFFSET) & BACKGROUND_MASK),
        )
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("language_id", &self.language_id())
            .field("token_type", &self.token_type())
            .field("font_style", &self.font_style())
            .field("foreground", &self.foreground())
            .field("background", &self.background())
            .finish()
    }
}

/// What a single scope name contributes to the metadata of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMetadata {
    pub scope_name: String,
    pub language_id: u8,
    pub token_type: TokenType,
    pub theme_data: Vec<ThemeTrieElementRule>,
}

/// The metadata of a scope on top of `parent`: the first theme rule whose parent scopes are
/// all found in `parent`, from the closest one to the root, gives the style.
pub(crate) fn merge_metadata(
    metadata: Metadata,
    parent: Option<&ScopeList>,
    source: &ScopeMetadata,
) -> Metadata {
    let rule = source
        .theme_data
        .iter()
        .find(|rule| parent_scopes_match(parent, &rule.parent_scopes));

    match rule {
        Some(rule) => metadata.set(
            source.language_id,
            source.token_type,
            rule.font_style,
            rule.foreground,
            rule.background,
        ),
        None => metadata.set(source.language_id, source.token_type, None, 0, 0),
    }
}

fn parent_scopes_match(target: Option<&ScopeList>, parent_scopes: &[String]) -> bool {
    let mut selectors = parent_scopes.iter().peekable();
    let mut target = target;
    while let Some(list) = target {
        let Some(selector) = selectors.peek() else {
            return true;
        };
        if crate::grammars::scope_matches(list.scope(), selector) {
            selectors.next();
        }
        target = list.parent();
    }
    selectors.peek().is_none()
}

/// The theme and the metadata computed from it, replaced as a whole when the theme changes
#[derive(Debug)]
struct ThemeState {
    theme: Arc<dyn ThemeProvider>,
    default_metadata: Arc<ScopeMetadata>,
    cache: papaya::HashMap<String, Arc<ScopeMetadata>>,
}

/// Computes and caches the [`ScopeMetadata`] of scope names for a grammar
#[derive(Debug)]
pub struct ScopeMetadataProvider {
    initial_language: u8,
    /// Scope prefix → language id, for embedded languages
    embedded_languages: HashMap<String, u8>,
    state: RwLock<Arc<ThemeState>>,
}

impl ScopeMetadataProvider {
    pub fn new(
        initial_language: u8,
        theme: Arc<dyn ThemeProvider>,
        embedded_languages: HashMap<String, u8>,
    ) -> Self {
        let state = Self::theme_state(initial_language, theme);
        Self {
            initial_language,
            embedded_languages,
            state: RwLock::new(Arc::new(state)),
        }
    }

    fn theme_state(initial_language: u8, theme: Arc<dyn ThemeProvider>) -> ThemeState {
        let default_metadata = Arc::new(ScopeMetadata {
            scope_name: String::new(),
            language_id: initial_language,
            token_type: TokenType::Other,
            theme_data: vec![theme.defaults()],
        });
        ThemeState {
            theme,
            default_metadata,
            cache: papaya::HashMap::new(),
        }
    }

    fn current(&self) -> Arc<ThemeState> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state)
    }

    /// Switches to another theme, forgetting everything computed with the previous one
    pub fn on_did_change_theme(&self, theme: Arc<dyn ThemeProvider>) {
        let state = Arc::new(Self::theme_state(self.initial_language, theme));
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn theme(&self) -> Arc<dyn ThemeProvider> {
        Arc::clone(&self.current().theme)
    }

    /// Metadata for text outside of any scope
    pub fn default_metadata(&self) -> Arc<ScopeMetadata> {
        Arc::clone(&self.current().default_metadata)
    }

    pub fn metadata_for_scope(&self, scope_name: &str) -> Arc<ScopeMetadata> {
        let state = self.current();
        let cache = state.cache.pin();
        if let Some(found) = cache.get(scope_name) {
            return Arc::clone(found);
        }

        let metadata = Arc::new(ScopeMetadata {
            scope_name: scope_name.to_owned(),
            language_id: self.language_of_scope(scope_name),
            token_type: token_type_of_scope(scope_name),
            theme_data: state.theme.theme_match(scope_name),
        });
        cache.insert(scope_name.to_owned(), Arc::clone(&metadata));
        metadata
    }

    /// The language of the longest embedded language prefix of `scope_name`, 0 if none
    fn language_of_scope(&self, scope_name: &str) -> u8 {
        self.embedded_languages
            .iter()
            .filter(|(prefix, _)| crate::grammars::scope_matches(scope_name, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, language)| *language)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::themes::{RawTheme, Theme};

    #[test]
    fn packs_and_unpacks_fields() {
        let metadata = Metadata::default().set(
            3,
            TokenType::String,
            Some(FontStyle::BOLD),
            101,
            511,
        );
        assert_eq!(metadata.language_id(), 3);
        assert_eq!(metadata.token_type(), TokenType::String);
        assert_eq!(metadata.font_style(), FontStyle::BOLD);
        assert_eq!(metadata.foreground(), 101);
        assert_eq!(metadata.background(), 511);
        assert_eq!(
            metadata.bits(),
            3 | (2 << 8) | (2 << 11) | (101 << 14) | (511 << 23)
        );
    }

    #[test]
    fn unset_fields_are_inherited() {
        let parent = Metadata::default().set(
            2,
            TokenType::Comment,
            Some(FontStyle::ITALIC),
            5,
            6,
        );
        let child = parent.set(0, TokenType::Other, None, 0, 7);
        assert_eq!(child.language_id(), 2);
        assert_eq!(child.token_type(), TokenType::Comment);
        assert_eq!(child.font_style(), FontStyle::ITALIC);
        assert_eq!(child.foreground(), 5);
        assert_eq!(child.background(), 7);

        let embedded = parent.set(0, TokenType::MetaEmbedded, Some(FontStyle::empty()), 0, 0);
        assert_eq!(embedded.token_type(), TokenType::Other);
        assert_eq!(embedded.font_style(), FontStyle::empty());
    }

    #[test]
    fn token_type_comes_from_scope_words() {
        assert_eq!(token_type_of_scope("comment.line.double-slash"), TokenType::Comment);
        assert_eq!(token_type_of_scope("string.quoted.double"), TokenType::String);
        assert_eq!(token_type_of_scope("string.regexp"), TokenType::String);
        assert_eq!(token_type_of_scope("constant.regex.js"), TokenType::RegEx);
        assert_eq!(token_type_of_scope("meta.embedded.block"), TokenType::MetaEmbedded);
        assert_eq!(token_type_of_scope("strings.foo"), TokenType::Other);
        assert_eq!(token_type_of_scope("keyword"), TokenType::Other);
    }

    #[test]
    fn embedded_languages_use_longest_prefix() {
        let provider = ScopeMetadataProvider::new(
            1,
            Arc::new(Theme::empty()),
            HashMap::from([
                ("source.js".to_string(), 2),
                ("source.js.regexp".to_string(), 3),
            ]),
        );
        assert_eq!(provider.metadata_for_scope("source.js").language_id, 2);
        assert_eq!(provider.metadata_for_scope("source.js.jsx").language_id, 2);
        assert_eq!(provider.metadata_for_scope("source.js.regexp.x").language_id, 3);
        assert_eq!(provider.metadata_for_scope("source.jsx").language_id, 0);
        assert_eq!(provider.default_metadata().language_id, 1);
    }

    #[test]
    fn changing_theme_clears_cache() {
        let red = RawTheme::from_json(
            r##"{ "settings": [{ "scope": "keyword", "settings": { "foreground": "#ff0000" } }] }"##,
        )
        .unwrap()
        .compile();
        let provider = ScopeMetadataProvider::new(0, Arc::new(Theme::empty()), HashMap::new());

        let before = provider.metadata_for_scope("keyword");
        assert_eq!(before.theme_data[0].foreground, 0);

        provider.on_did_change_theme(Arc::new(red));
        let after = provider.metadata_for_scope("keyword");
        // #000000 and #ffffff come first
        assert_eq!(after.theme_data[0].foreground, 3);
    }
}
