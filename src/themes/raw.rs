use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::ScopelineResult;
use crate::themes::compiled::Theme;

/// Token color settings from a theme JSON
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TokenColorSettings {
    foreground: Option<String>,
    background: Option<String>,
    #[serde(rename = "fontStyle")]
    pub font_style: Option<String>,
}

impl TokenColorSettings {
    pub fn foreground(&self) -> Option<&str> {
        self.foreground.as_deref().filter(|s| is_valid_hex_color(s))
    }

    pub fn background(&self) -> Option<&str> {
        self.background.as_deref().filter(|s| is_valid_hex_color(s))
    }
}

/// `#rgb`, `#rgba`, `#rrggbb` or `#rrggbbaa`.
/// Anything else, like `inherit`, is treated as if the color wasn't set.
pub(crate) fn is_valid_hex_color(s: &str) -> bool {
    match s.strip_prefix('#') {
        Some(hex) => {
            matches!(hex.len(), 3 | 4 | 6 | 8) && hex.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Custom deserializer for scope field that can be string or array.
/// A string can hold several selectors separated by commas.
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ScopeVisitor;

    impl<'de> Visitor<'de> for ScopeVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or array of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .trim_matches(',')
                .split(',')
                .map(str::to_owned)
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                vec.push(item);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ScopeVisitor).map(Some)
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TokenColorRule {
    /// Missing means the rule applies to everything, which is how themes set their defaults
    #[serde(deserialize_with = "deserialize_string_or_vec", default)]
    pub scope: Option<Vec<String>>,
    /// Rules without settings are skipped
    #[serde(default)]
    pub settings: Option<TokenColorSettings>,
}

/// Raw theme loaded from a JSON theme.
///
/// Both the tmTheme style (`settings`) and the VSCode style (`tokenColors`) are accepted.
///
/// # Examples
/// ```json
/// {
///   "name": "Light",
///   "settings": [
///     { "settings": { "foreground": "#333333", "background": "#fafafa" } },
///     { "scope": "comment, string.quoted", "settings": { "fontStyle": "italic" } },
///     { "scope": "meta.tag entity.name", "settings": { "foreground": "#a0a" } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTheme {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "tokenColors")]
    pub settings: Vec<TokenColorRule>,
}

impl RawTheme {
    pub fn from_json(json: &str) -> ScopelineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn compile(&self) -> Theme {
        Theme::from_raw_theme(self)
    }
}
