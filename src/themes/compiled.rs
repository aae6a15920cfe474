use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::themes::font_style::FontStyle;
use crate::themes::raw::RawTheme;

/// What the tokenizer needs from a theme to compute the metadata of a scope
pub trait ThemeProvider: Send + Sync + fmt::Debug {
    /// Candidate rules for a scope, most specific first. The first one whose parent scopes
    /// match the scope stack wins.
    fn theme_match(&self, scope_name: &str) -> Vec<ThemeTrieElementRule>;

    /// Style of text no rule applies to
    fn defaults(&self) -> ThemeTrieElementRule;
}

/// Assigns a small integer to each distinct color of a theme, starting at 1.
/// 0 means "no color" in token metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorMap {
    ids: HashMap<String, u32>,
    colors: Vec<String>,
}

impl ColorMap {
    pub fn id(&mut self, color: Option<&str>) -> u32 {
        let Some(color) = color else {
            return 0;
        };
        let color = color.to_uppercase();
        if let Some(id) = self.ids.get(&color) {
            return *id;
        }
        self.colors.push(color.clone());
        let id = self.colors.len() as u32;
        self.ids.insert(color, id);
        id
    }

    /// The color of an id, in uppercase
    pub fn color(&self, id: u32) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.colors.get(index).map(String::as_str)
    }

    /// All the colors, the one with id 1 first
    pub fn colors(&self) -> &[String] {
        &self.colors
    }
}

/// A theme rule as stored in the trie: colors are color map ids, 0 meaning unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeTrieElementRule {
    pub scope_depth: usize,
    /// Closest parent first. Empty when the rule applies regardless of parents.
    pub parent_scopes: Vec<String>,
    pub font_style: Option<FontStyle>,
    pub foreground: u32,
    pub background: u32,
}

impl ThemeTrieElementRule {
    fn accept_overwrite(
        &mut self,
        scope_depth: usize,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        if self.scope_depth > scope_depth {
            log::warn!("Theme rule inserted at a shallower depth than an existing one");
        } else {
            self.scope_depth = scope_depth;
        }
        if font_style.is_some() {
            self.font_style = font_style;
        }
        if foreground != 0 {
            self.foreground = foreground;
        }
        if background != 0 {
            self.background = background;
        }
    }
}

/// Most specific first: deeper scopes, then more parents, then longer parents
fn cmp_by_specificity(a: &ThemeTrieElementRule, b: &ThemeTrieElementRule) -> Ordering {
    if a.scope_depth != b.scope_depth {
        return b.scope_depth.cmp(&a.scope_depth);
    }
    if a.parent_scopes.len() == b.parent_scopes.len() {
        for (pa, pb) in a.parent_scopes.iter().zip(&b.parent_scopes) {
            if pa.len() != pb.len() {
                return pb.len().cmp(&pa.len());
            }
        }
    }
    b.parent_scopes.len().cmp(&a.parent_scopes.len())
}

/// One segment of a scope name (`string` in `string.quoted`) in the theme trie
#[derive(Debug, Clone)]
struct ThemeTrieElement {
    main_rule: ThemeTrieElementRule,
    rules_with_parent_scopes: Vec<ThemeTrieElementRule>,
    children: HashMap<String, ThemeTrieElement>,
}

impl ThemeTrieElement {
    fn new(main_rule: ThemeTrieElementRule, rules_with_parent_scopes: Vec<ThemeTrieElementRule>) -> Self {
        Self {
            main_rule,
            rules_with_parent_scopes,
            children: HashMap::new(),
        }
    }

    fn match_scope(&self, scope: &str) -> Vec<ThemeTrieElementRule> {
        if !scope.is_empty() {
            let (head, tail) = scope.split_once('.').unwrap_or((scope, ""));
            if let Some(child) = self.children.get(head) {
                return child.match_scope(tail);
            }
        }

        let mut rules = Vec::with_capacity(self.rules_with_parent_scopes.len() + 1);
        rules.push(self.main_rule.clone());
        rules.extend(self.rules_with_parent_scopes.iter().cloned());
        rules.sort_by(cmp_by_specificity);
        rules
    }

    fn insert(
        &mut self,
        scope_depth: usize,
        scope: &str,
        parent_scopes: &[String],
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        if scope.is_empty() {
            self.insert_here(scope_depth, parent_scopes, font_style, foreground, background);
            return;
        }

        let (head, tail) = scope.split_once('.').unwrap_or((scope, ""));
        let child = self.children.entry(head.to_owned()).or_insert_with(|| {
            ThemeTrieElement::new(self.main_rule.clone(), self.rules_with_parent_scopes.clone())
        });
        child.insert(scope_depth + 1, tail, parent_scopes, font_style, foreground, background);
    }

    fn insert_here(
        &mut self,
        scope_depth: usize,
        parent_scopes: &[String],
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
    ) {
        if parent_scopes.is_empty() {
            self.main_rule
                .accept_overwrite(scope_depth, font_style, foreground, background);
            return;
        }

        if let Some(rule) = self
            .rules_with_parent_scopes
            .iter_mut()
            .find(|r| r.parent_scopes == parent_scopes)
        {
            rule.accept_overwrite(scope_depth, font_style, foreground, background);
            return;
        }

        // unset values are inherited from the rule without parents
        self.rules_with_parent_scopes.push(ThemeTrieElementRule {
            scope_depth,
            parent_scopes: parent_scopes.to_vec(),
            font_style: font_style.or(self.main_rule.font_style),
            foreground: if foreground == 0 {
                self.main_rule.foreground
            } else {
                foreground
            },
            background: if background == 0 {
                self.main_rule.background
            } else {
                background
            },
        });
    }
}

/// A theme rule after splitting its selectors, one per scope
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedThemeRule {
    scope: String,
    parent_scopes: Vec<String>,
    index: usize,
    font_style: Option<FontStyle>,
    foreground: Option<String>,
    background: Option<String>,
}

fn parse_theme(raw: &RawTheme) -> Vec<ParsedThemeRule> {
    let mut out = Vec::new();

    for (index, entry) in raw.settings.iter().enumerate() {
        let Some(settings) = &entry.settings else {
            continue;
        };
        let font_style = settings.font_style.as_deref().map(FontStyle::parse);
        let foreground = settings.foreground().map(str::to_owned);
        let background = settings.background().map(str::to_owned);

        let default_scope = [String::new()];
        let scopes = entry.scope.as_deref().unwrap_or(&default_scope);
        for scope in scopes {
            // `meta.tag entity.name`: `entity.name` with the parent `meta.tag`
            let mut segments: Vec<&str> = scope.split_whitespace().collect();
            let scope = segments.pop().unwrap_or_default();
            segments.reverse();

            out.push(ParsedThemeRule {
                scope: scope.to_owned(),
                parent_scopes: segments.into_iter().map(str::to_owned).collect(),
                index,
                font_style,
                foreground: foreground.clone(),
                background: background.clone(),
            });
        }
    }

    out
}

/// Shorter lists first, same length lists compared element by element
fn cmp_parent_scopes(a: &[String], b: &[String]) -> Ordering {
    if a.len() == b.len() {
        a.cmp(b)
    } else {
        a.len().cmp(&b.len())
    }
}

/// A theme compiled into a trie of scope segments.
///
/// This is the matching model of TextMate/vscode-textmate: the rule that applies to a
/// scope is found by walking its segments, then the first candidate whose parent scopes are
/// found in the scope stack wins.
#[derive(Debug, Clone)]
pub struct Theme {
    pub name: Option<String>,
    color_map: ColorMap,
    defaults: ThemeTrieElementRule,
    root: ThemeTrieElement,
}

impl Theme {
    pub fn from_raw_theme(raw: &RawTheme) -> Self {
        let mut rules = parse_theme(raw);
        rules.sort_by(|a, b| {
            a.scope
                .cmp(&b.scope)
                .then_with(|| cmp_parent_scopes(&a.parent_scopes, &b.parent_scopes))
                .then_with(|| a.index.cmp(&b.index))
        });

        // rules without scope set the defaults
        let mut default_font_style = FontStyle::empty();
        let mut default_foreground = "#000000".to_string();
        let mut default_background = "#ffffff".to_string();
        let mut first_scoped = 0;
        for rule in rules.iter().take_while(|r| r.scope.is_empty()) {
            if let Some(font_style) = rule.font_style {
                default_font_style = font_style;
            }
            if let Some(foreground) = &rule.foreground {
                default_foreground.clone_from(foreground);
            }
            if let Some(background) = &rule.background {
                default_background.clone_from(background);
            }
            first_scoped += 1;
        }

        let mut color_map = ColorMap::default();
        let defaults = ThemeTrieElementRule {
            scope_depth: 0,
            parent_scopes: Vec::new(),
            font_style: Some(default_font_style),
            foreground: color_map.id(Some(&default_foreground)),
            background: color_map.id(Some(&default_background)),
        };

        let mut root = ThemeTrieElement::new(
            ThemeTrieElementRule {
                scope_depth: 0,
                parent_scopes: Vec::new(),
                font_style: None,
                foreground: 0,
                background: 0,
            },
            Vec::new(),
        );
        for rule in &rules[first_scoped..] {
            let foreground = color_map.id(rule.foreground.as_deref());
            let background = color_map.id(rule.background.as_deref());
            root.insert(
                0,
                &rule.scope,
                &rule.parent_scopes,
                rule.font_style,
                foreground,
                background,
            );
        }

        Self {
            name: raw.name.clone(),
            color_map,
            defaults,
            root,
        }
    }

    /// A theme without any rule: black on white
    pub fn empty() -> Self {
        Self::from_raw_theme(&RawTheme::default())
    }

    pub fn color_map(&self) -> &ColorMap {
        &self.color_map
    }

    pub fn match_scope(&self, scope_name: &str) -> Vec<ThemeTrieElementRule> {
        self.root.match_scope(scope_name)
    }
}

impl ThemeProvider for Theme {
    fn theme_match(&self, scope_name: &str) -> Vec<ThemeTrieElementRule> {
        self.match_scope(scope_name)
    }

    fn defaults(&self) -> ThemeTrieElementRule {
        self.defaults.clone()
    }
}
