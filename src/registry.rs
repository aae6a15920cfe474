use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, ScopelineResult};
use crate::grammar::{Grammar, GrammarOptions};
use crate::grammars::RawGrammar;
use crate::themes::ThemeProvider;

/// Where a grammar finds the other grammars it refers to.
pub trait GrammarRepository: Send + Sync {
    /// The raw grammar with that scope name, if any
    fn lookup(&self, scope_name: &str) -> Option<Arc<RawGrammar>>;

    /// Scope names of the grammars to inject into the grammar `scope_name`
    fn injections(&self, scope_name: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Default)]
struct GrammarStore {
    raw_grammars: RwLock<HashMap<String, Arc<RawGrammar>>>,
    // target scope name -> injector scope names, in the order they were added
    injections: RwLock<HashMap<String, Vec<String>>>,
}

impl GrammarStore {
    fn add_injection(&self, target: &str, injector: &str) {
        let mut injections = self.injections.write().unwrap_or_else(PoisonError::into_inner);
        let injectors = injections.entry(target.to_owned()).or_default();
        if !injectors.iter().any(|s| s == injector) {
            injectors.push(injector.to_owned());
        }
    }
}

impl GrammarRepository for GrammarStore {
    fn lookup(&self, scope_name: &str) -> Option<Arc<RawGrammar>> {
        let grammars = self.raw_grammars.read().unwrap_or_else(PoisonError::into_inner);
        grammars.get(scope_name).cloned()
    }

    fn injections(&self, scope_name: &str) -> Option<Vec<String>> {
        let injections = self.injections.read().unwrap_or_else(PoisonError::into_inner);
        injections.get(scope_name).cloned()
    }
}

/// Holds raw grammars and the theme, and loads [`Grammar`]s from them.
///
/// Grammars are loaded on first use and shared afterwards. Changing the theme applies to
/// every loaded grammar.
pub struct Registry {
    store: Arc<GrammarStore>,
    theme: RwLock<Arc<dyn ThemeProvider>>,
    options: RwLock<HashMap<String, GrammarOptions>>,
    grammars: papaya::HashMap<String, Arc<Grammar>>,
}

impl Registry {
    pub fn new(theme: Arc<dyn ThemeProvider>) -> Self {
        Self {
            store: Arc::new(GrammarStore::default()),
            theme: RwLock::new(theme),
            options: RwLock::new(HashMap::new()),
            grammars: papaya::HashMap::new(),
        }
    }

    /// Adds a raw grammar, replacing any grammar with the same scope name.
    ///
    /// Grammars already loaded keep the version they were compiled with.
    pub fn add_grammar(&self, raw: RawGrammar) -> ScopelineResult<()> {
        if raw.scope_name.is_empty() {
            return Err(Error::MissingScopeName);
        }

        for target in &raw.inject_to {
            self.store.add_injection(target, &raw.scope_name);
        }

        #[cfg(feature = "debug")]
        log::debug!("Adding grammar {}", raw.scope_name);
        let mut grammars = self
            .store
            .raw_grammars
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        grammars.insert(raw.scope_name.clone(), Arc::new(raw));
        Ok(())
    }

    /// Reads the file and add it as a grammar.
    pub fn add_grammar_from_path(&self, path: impl AsRef<Path>) -> ScopelineResult<()> {
        let content = fs::read_to_string(path)?;
        self.add_grammar(RawGrammar::from_json(&content)?)
    }

    /// Injects the grammar `injector` into `target`, like `injectTo` does
    pub fn add_injection(&self, target: &str, injector: &str) {
        self.store.add_injection(target, injector);
    }

    /// Options used when the grammar `scope_name` gets loaded
    pub fn set_grammar_options(&self, scope_name: &str, options: GrammarOptions) {
        self.options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope_name.to_owned(), options);
    }

    pub fn contains_grammar(&self, scope_name: &str) -> bool {
        self.store.lookup(scope_name).is_some()
    }

    /// The grammar for `scope_name`, compiling it the first time
    pub fn grammar_for_scope(&self, scope_name: &str) -> ScopelineResult<Arc<Grammar>> {
        let grammars = self.grammars.pin();
        if let Some(grammar) = grammars.get(scope_name) {
            return Ok(Arc::clone(grammar));
        }

        let raw = self
            .store
            .lookup(scope_name)
            .ok_or_else(|| Error::GrammarNotFound(scope_name.to_owned()))?;
        let options = self
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope_name)
            .cloned()
            .unwrap_or_default();
        let repository: Arc<dyn GrammarRepository> = self.store.clone();
        let grammar = Arc::new(Grammar::with_options(
            &raw,
            self.theme(),
            options,
            Some(repository),
        )?);

        // Another thread might have loaded it in the meantime, keep the first one
        Ok(Arc::clone(
            grammars.get_or_insert(scope_name.to_owned(), grammar),
        ))
    }

    /// The grammar whose `fileTypes` contains `file_type`, eg `rs` or `Makefile`
    pub fn grammar_for_file_type(&self, file_type: &str) -> ScopelineResult<Arc<Grammar>> {
        let scope_name = {
            let grammars = self
                .store
                .raw_grammars
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            grammars
                .values()
                .find(|g| g.file_types.iter().any(|t| t == file_type))
                .map(|g| g.scope_name.clone())
        };
        match scope_name {
            Some(scope_name) => self.grammar_for_scope(&scope_name),
            None => Err(Error::GrammarNotFound(file_type.to_owned())),
        }
    }

    pub fn theme(&self) -> Arc<dyn ThemeProvider> {
        Arc::clone(&self.theme.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Switches every loaded grammar, and the ones loaded afterwards, to `theme`
    pub fn set_theme(&self, theme: Arc<dyn ThemeProvider>) {
        *self.theme.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&theme);
        for grammar in self.grammars.pin().values() {
            grammar.on_did_change_theme(Arc::clone(&theme));
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw_grammars = self
            .store
            .raw_grammars
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Registry")
            .field("grammars", &raw_grammars.keys())
            .field("loaded", &self.grammars.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::themes::{RawTheme, Theme};

    fn registry(grammars: &[&str]) -> Registry {
        let registry = Registry::new(Arc::new(Theme::empty()));
        for json in grammars {
            registry
                .add_grammar(RawGrammar::from_json(json).unwrap())
                .unwrap();
        }
        registry
    }

    fn scopes(grammar: &Grammar, line: &str) -> Vec<(String, String)> {
        let chars: Vec<char> = line.chars().collect();
        grammar
            .tokenize_line(line, None)
            .tokens
            .into_iter()
            .map(|t| {
                (
                    chars[t.span].iter().collect(),
                    t.scopes[1..].join(" "),
                )
            })
            .collect()
    }

    const WORDS: &str = r##"{
        "scopeName": "source.words",
        "fileTypes": ["words"],
        "patterns": [{ "include": "#word" }],
        "repository": { "word": { "match": "[a-z]+", "name": "word" } }
    }"##;

    #[test]
    fn unknown_grammars_are_errors() {
        let registry = registry(&[WORDS]);
        assert!(matches!(
            registry.grammar_for_scope("source.nope"),
            Err(Error::GrammarNotFound(_))
        ));
        assert!(registry.grammar_for_file_type("txt").is_err());
        assert!(registry.contains_grammar("source.words"));
    }

    #[test]
    fn grammars_are_loaded_once() {
        let registry = registry(&[WORDS]);
        let a = registry.grammar_for_scope("source.words").unwrap();
        let b = registry.grammar_for_file_type("words").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn can_include_other_grammars() {
        let registry = registry(&[
            WORDS,
            r#"{
                "scopeName": "source.host",
                "patterns": [
                    { "begin": "\\[", "end": "\\]", "name": "meta.all", "patterns": [{ "include": "source.words" }] },
                    { "begin": "\\{", "end": "\\}", "name": "meta.one", "patterns": [{ "include": "source.words#word" }] }
                ]
            }"#,
        ]);
        let host = registry.grammar_for_scope("source.host").unwrap();
        assert_eq!(
            scopes(&host, "[ab]{c}d"),
            vec![
                ("[".to_string(), "meta.all".to_string()),
                ("ab".to_string(), "meta.all word".to_string()),
                ("]".to_string(), "meta.all".to_string()),
                ("{".to_string(), "meta.one".to_string()),
                ("c".to_string(), "meta.one word".to_string()),
                ("}".to_string(), "meta.one".to_string()),
                ("d".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn missing_external_grammar_is_an_error() {
        let registry = registry(&[
            r#"{ "scopeName": "source.host", "patterns": [{ "include": "source.words" }] }"#,
        ]);
        assert!(matches!(
            registry.grammar_for_scope("source.host"),
            Err(Error::UnresolvedInclude { .. })
        ));
    }

    #[test]
    fn base_refers_to_the_including_grammar() {
        let registry = registry(&[
            r#"{
                "scopeName": "source.inner",
                "patterns": [{ "begin": "\\(", "end": "\\)", "name": "group", "patterns": [{ "include": "$base" }] }]
            }"#,
            r#"{
                "scopeName": "source.outer",
                "patterns": [{ "match": "x", "name": "outer.x" }, { "include": "source.inner" }]
            }"#,
        ]);
        let outer = registry.grammar_for_scope("source.outer").unwrap();
        assert_eq!(
            scopes(&outer, "(x)"),
            vec![
                ("(".to_string(), "group".to_string()),
                ("x".to_string(), "group outer.x".to_string()),
                (")".to_string(), "group".to_string()),
            ]
        );
    }

    #[test]
    fn grammars_can_inject_themselves() {
        let registry = registry(&[
            r##"{
                "scopeName": "source.host",
                "patterns": [{ "match": "#.*", "name": "comment.line" }]
            }"##,
            r#"{
                "scopeName": "source.todo",
                "injectionSelector": "L:comment",
                "injectTo": ["source.host"],
                "patterns": [{ "match": "TODO", "name": "keyword.todo" }]
            }"#,
        ]);
        let host = registry.grammar_for_scope("source.host").unwrap();
        assert_eq!(host.injections().len(), 1);
        assert_eq!(
            scopes(&host, "TODO # TODO"),
            vec![
                ("TODO ".to_string(), "".to_string()),
                ("# TODO".to_string(), "comment.line".to_string()),
            ]
        );
    }

    #[test]
    fn injections_can_be_added_by_hand() {
        let registry = registry(&[
            r##"{
                "scopeName": "source.host",
                "patterns": [{ "begin": "#", "end": "$", "name": "comment.line" }]
            }"##,
            r#"{
                "scopeName": "source.todo",
                "injectionSelector": "L:comment",
                "patterns": [{ "match": "TODO", "name": "keyword.todo" }]
            }"#,
        ]);
        registry.add_injection("source.host", "source.todo");
        let host = registry.grammar_for_scope("source.host").unwrap();
        assert_eq!(
            scopes(&host, "TODO # TODO"),
            vec![
                ("TODO ".to_string(), "".to_string()),
                ("#".to_string(), "comment.line".to_string()),
                (" ".to_string(), "comment.line".to_string()),
                ("TODO".to_string(), "comment.line keyword.todo".to_string()),
            ]
        );
    }

    #[test]
    fn theme_changes_reach_loaded_grammars() {
        let registry = registry(&[WORDS]);
        registry.set_grammar_options("source.words", GrammarOptions::new(3));
        let grammar = registry.grammar_for_scope("source.words").unwrap();

        let before = grammar.tokenize_line_binary("ab", None);
        assert_eq!(before.tokens[0].metadata.foreground(), 1);
        assert_eq!(before.tokens[0].metadata.language_id(), 3);

        let theme = RawTheme::from_json(
            r##"{ "settings": [{ "scope": "word", "settings": { "foreground": "#123456" } }] }"##,
        )
        .unwrap()
        .compile();
        registry.set_theme(Arc::new(theme));
        let after = grammar.tokenize_line_binary("ab", None);
        assert_eq!(after.tokens[0].metadata.foreground(), 3);
    }
}
