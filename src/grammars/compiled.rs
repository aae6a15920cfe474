use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, ScopelineResult};
use crate::grammars::pattern_set::LineText;
use crate::grammars::raw::{BASE_KEY, RawCaptures, RawGrammar, RawRepository, RawRule, SELF_KEY};
use crate::grammars::regex::Regex;
use crate::registry::GrammarRepository;
use crate::tokenizer::AnchorActive;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RuleId(pub u32);

impl Deref for RuleId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Id given to the `end` pattern of the current rule in a scanner
pub const END_RULE_ID: RuleId = RuleId(u32::MAX);
/// Id given to the `while` pattern of a rule in a scanner
pub const WHILE_RULE_ID: RuleId = RuleId(u32::MAX - 1);

/// per vscode-textmate:
///  Allowed values:
///  * Scope Name, e.g. `source.ts`
///  * Top level scope reference, e.g. `source.ts#entity.name.class`
///  * Relative scope reference, e.g. `#entity.name.class`
///  * self, e.g. `$self`
///  * base, e.g. `$base`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reference {
    Self_,
    Base,
    Local(String),
    OtherComplete(String),
    OtherSpecific(String, String),
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        match value {
            "$self" => Self::Self_,
            "$base" => Self::Base,
            s if s.starts_with('#') => Self::Local(s[1..].to_string()),
            s => match s.split_once('#') {
                Some((scope, rule)) => Self::OtherSpecific(scope.to_string(), rule.to_string()),
                None => Self::OtherComplete(s.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CaseCommand {
    Downcase,
    Upcase,
}

/// A `name` or `contentName`, which can refer to capture groups:
/// `$1`, `${1:/downcase}` or `${1:/upcase}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeName {
    value: String,
    has_captures: bool,
}

impl ScopeName {
    pub fn new(value: &str) -> Self {
        let has_captures = value
            .match_indices('$')
            .any(|(i, _)| parse_capture_reference(&value[i + 1..]).is_some());
        Self {
            value: value.to_owned(),
            has_captures,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Replaces capture references with the captured text, without its leading dots.
    /// References to groups that did not capture anything are left as they are.
    pub fn resolve(&self, line: &LineText, captures: &[Option<(usize, usize)>]) -> Cow<'_, str> {
        if !self.has_captures {
            return Cow::Borrowed(&self.value);
        }

        let mut out = String::with_capacity(self.value.len());
        let mut rest = self.value.as_str();
        while let Some(idx) = rest.find('$') {
            out.push_str(&rest[..idx]);
            let after = &rest[idx + 1..];
            let Some((index, command, consumed)) = parse_capture_reference(after) else {
                out.push('$');
                rest = after;
                continue;
            };

            match captures.get(index).copied().flatten() {
                Some((start, end)) => {
                    let text = line.slice(start..end).trim_start_matches('.');
                    match command {
                        None => out.push_str(text),
                        Some(CaseCommand::Downcase) => out.push_str(&text.to_lowercase()),
                        Some(CaseCommand::Upcase) => out.push_str(&text.to_uppercase()),
                    }
                }
                None => {
                    out.push('$');
                    out.push_str(&after[..consumed]);
                }
            }
            rest = &after[consumed..];
        }
        out.push_str(rest);

        Cow::Owned(out)
    }
}

/// Parses what follows a `$`: the capture index, an optional case command and how many bytes
/// were used.
fn parse_capture_reference(s: &str) -> Option<(usize, Option<CaseCommand>, usize)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        return Some((s[..digits].parse().ok()?, None, digits));
    }

    let inner = s.strip_prefix('{')?;
    let digits = inner.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let index = inner[..digits].parse().ok()?;
    let after = &inner[digits..];
    for (suffix, command) in [
        (":/downcase}", CaseCommand::Downcase),
        (":/upcase}", CaseCommand::Upcase),
    ] {
        if after.starts_with(suffix) {
            return Some((index, Some(command), 1 + digits + suffix.len()));
        }
    }
    None
}

fn scope_name(name: &Option<String>) -> Option<ScopeName> {
    name.as_deref().map(ScopeName::new)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub regex: Regex,
    pub captures: Vec<Option<RuleId>>,
}

/// A rule only made of other rules, like the root of a grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeOnlyRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginEndRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: Regex,
    pub begin_captures: Vec<Option<RuleId>>,
    pub end: Regex,
    pub end_captures: Vec<Option<RuleId>>,
    pub apply_end_pattern_last: bool,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginWhileRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: Regex,
    pub begin_captures: Vec<Option<RuleId>>,
    pub while_: Regex,
    pub while_captures: Vec<Option<RuleId>>,
    pub patterns: Vec<RuleId>,
    pub has_missing_patterns: bool,
}

/// What to do with the text of a capture group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRule {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    /// Set when the capture has its own patterns: the captured text is then tokenized
    /// again with that rule
    pub retokenize_with: Option<RuleId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Match(MatchRule),
    IncludeOnly(IncludeOnlyRule),
    BeginEnd(BeginEndRule),
    BeginWhile(BeginWhileRule),
    Capture(CaptureRule),
}

impl Rule {
    pub fn id(&self) -> RuleId {
        match self {
            Rule::Match(r) => r.id,
            Rule::IncludeOnly(r) => r.id,
            Rule::BeginEnd(r) => r.id,
            Rule::BeginWhile(r) => r.id,
            Rule::Capture(r) => r.id,
        }
    }

    fn raw_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.name.as_ref(),
            Rule::IncludeOnly(r) => r.name.as_ref(),
            Rule::BeginEnd(r) => r.name.as_ref(),
            Rule::BeginWhile(r) => r.name.as_ref(),
            Rule::Capture(r) => r.name.as_ref(),
        }
    }

    fn raw_content_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(_) => None,
            Rule::IncludeOnly(r) => r.content_name.as_ref(),
            Rule::BeginEnd(r) => r.content_name.as_ref(),
            Rule::BeginWhile(r) => r.content_name.as_ref(),
            Rule::Capture(r) => r.content_name.as_ref(),
        }
    }

    /// The scope name with its capture references resolved
    pub fn name<'a>(
        &'a self,
        line: &LineText,
        captures: &[Option<(usize, usize)>],
    ) -> Option<Cow<'a, str>> {
        self.raw_name().map(|n| n.resolve(line, captures))
    }

    pub fn content_name<'a>(
        &'a self,
        line: &LineText,
        captures: &[Option<(usize, usize)>],
    ) -> Option<Cow<'a, str>> {
        self.raw_content_name().map(|n| n.resolve(line, captures))
    }

    /// The name as written in the grammar
    pub fn name_source(&self) -> Option<&str> {
        self.raw_name().map(ScopeName::as_str)
    }

    pub fn patterns(&self) -> &[RuleId] {
        match self {
            Rule::IncludeOnly(r) => &r.patterns,
            Rule::BeginEnd(r) => &r.patterns,
            Rule::BeginWhile(r) => &r.patterns,
            Rule::Match(_) | Rule::Capture(_) => &[],
        }
    }

    pub fn has_missing_patterns(&self) -> bool {
        match self {
            Rule::IncludeOnly(r) => r.has_missing_patterns,
            Rule::BeginEnd(r) => r.has_missing_patterns,
            Rule::BeginWhile(r) => r.has_missing_patterns,
            Rule::Match(_) | Rule::Capture(_) => false,
        }
    }
}

/// Identity of a raw rule: the address of its `Arc`.
/// Holding the `Arc` keeps the address from being reused while the key exists.
#[derive(Debug, Clone)]
pub struct RawRuleKey(Arc<RawRule>);

impl RawRuleKey {
    pub fn of(rule: &Arc<RawRule>) -> Self {
        Self(Arc::clone(rule))
    }
}

impl PartialEq for RawRuleKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RawRuleKey {}

impl Hash for RawRuleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Where compiled rules are stored while compiling
pub trait RuleFactoryHelper {
    /// Assigns the next id and stores the rule built by `factory`.
    ///
    /// The id is assigned before `factory` runs so recursive rules can refer to themselves.
    /// When `identity` was already registered, its id is returned and `factory` isn't called.
    fn register_rule<F>(&mut self, identity: Option<RawRuleKey>, factory: F) -> ScopelineResult<RuleId>
    where
        F: FnOnce(&mut Self, RuleId) -> ScopelineResult<Rule>,
        Self: Sized;

    fn rule(&self, id: RuleId) -> Option<&Arc<Rule>>;
}

/// Finds grammars referenced by `include`s to other scopes
pub trait IncludeResolver {
    /// The grammar with `$self`/`$base` set, `base` being the `$base` of the includer
    fn external_grammar(
        &mut self,
        scope_name: &str,
        base: Option<&Arc<RawRule>>,
    ) -> Option<Arc<RawGrammar>>;
}

/// Compiles a raw rule, or returns its id if it was already compiled.
pub fn compile_rule<H>(
    raw: &Arc<RawRule>,
    helper: &mut H,
    repository: &RawRepository,
    grammar: &str,
) -> ScopelineResult<RuleId>
where
    H: RuleFactoryHelper + IncludeResolver,
{
    helper.register_rule(Some(RawRuleKey::of(raw)), |helper, id| {
        // https://github.com/microsoft/vscode-textmate/blob/f03a6a8790af81372d0e81facae75554ec5e97ef/src/rule.ts#L389-L447
        if let Some(pattern) = &raw.match_ {
            return Ok(Rule::Match(MatchRule {
                id,
                name: scope_name(&raw.name),
                regex: Regex::new(pattern),
                captures: compile_captures(&raw.captures, helper, repository, grammar)?,
            }));
        }

        let Some(begin) = &raw.begin else {
            let merged;
            let repository = match &raw.repository {
                Some(own) => {
                    let mut all = repository.clone();
                    all.extend(own.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
                    merged = all;
                    &merged
                }
                None => repository,
            };
            let (patterns, has_missing_patterns) = match &raw.include {
                Some(include) if raw.patterns.is_empty() => {
                    let only = [Arc::new(RawRule {
                        include: Some(include.clone()),
                        ..Default::default()
                    })];
                    compile_patterns(&only, helper, repository, grammar)?
                }
                _ => compile_patterns(&raw.patterns, helper, repository, grammar)?,
            };
            return Ok(Rule::IncludeOnly(IncludeOnlyRule {
                id,
                name: scope_name(&raw.name),
                content_name: scope_name(&raw.content_name),
                patterns,
                has_missing_patterns,
            }));
        };

        let begin_captures = if raw.begin_captures.is_empty() {
            &raw.captures
        } else {
            &raw.begin_captures
        };
        let begin_captures = compile_captures(begin_captures, helper, repository, grammar)?;

        if let Some(while_) = &raw.while_ {
            let while_captures = if raw.while_captures.is_empty() {
                &raw.captures
            } else {
                &raw.while_captures
            };
            let while_captures = compile_captures(while_captures, helper, repository, grammar)?;
            let (patterns, has_missing_patterns) =
                compile_patterns(&raw.patterns, helper, repository, grammar)?;
            return Ok(Rule::BeginWhile(BeginWhileRule {
                id,
                name: scope_name(&raw.name),
                content_name: scope_name(&raw.content_name),
                begin: Regex::new(begin),
                begin_captures,
                while_: Regex::new(while_),
                while_captures,
                patterns,
                has_missing_patterns,
            }));
        }

        let end_captures = if raw.end_captures.is_empty() {
            &raw.captures
        } else {
            &raw.end_captures
        };
        let end_captures = compile_captures(end_captures, helper, repository, grammar)?;
        let (patterns, has_missing_patterns) =
            compile_patterns(&raw.patterns, helper, repository, grammar)?;

        Ok(Rule::BeginEnd(BeginEndRule {
            id,
            name: scope_name(&raw.name),
            content_name: scope_name(&raw.content_name),
            begin: Regex::new(begin),
            begin_captures,
            // vscode-textmate uses `￿` for a missing `end`, something that never matches
            end: Regex::new(raw.end.as_deref().unwrap_or("\u{FFFF}")),
            end_captures,
            apply_end_pattern_last: raw.apply_end_pattern_last,
            patterns,
            has_missing_patterns,
        }))
    })
}

/// Oniguruma doesn't allow more capture groups than this
const MAX_CAPTURE_GROUP: usize = 32767;

fn compile_captures<H>(
    captures: &RawCaptures,
    helper: &mut H,
    repository: &RawRepository,
    grammar: &str,
) -> ScopelineResult<Vec<Option<RuleId>>>
where
    H: RuleFactoryHelper + IncludeResolver,
{
    let mut numbered = Vec::with_capacity(captures.len());
    for (key, rule) in captures {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            #[cfg(feature = "debug")]
            log::debug!("Ignoring named capture {key:?} in {grammar}");
            continue;
        }
        match key.parse::<usize>() {
            Ok(index) if index <= MAX_CAPTURE_GROUP => numbered.push((index, rule)),
            _ => {
                return Err(Error::InvalidCapture {
                    capture: key.clone(),
                    grammar: grammar.to_owned(),
                });
            }
        }
    }
    // mdc.json syntax has actually a 912 backref
    let Some(max_capture) = numbered.iter().map(|(i, _)| *i).max() else {
        return Ok(Vec::new());
    };

    let mut out: Vec<Option<RuleId>> = vec![None; max_capture + 1];
    for (index, capture) in numbered {
        let retokenize_with = if capture.patterns.is_empty() {
            None
        } else {
            Some(compile_rule(capture, helper, repository, grammar)?)
        };
        let id = helper.register_rule(None, |_, id| {
            Ok(Rule::Capture(CaptureRule {
                id,
                name: scope_name(&capture.name),
                content_name: scope_name(&capture.content_name),
                retokenize_with,
            }))
        })?;
        out[index] = Some(id);
    }

    Ok(out)
}

fn compile_patterns<H>(
    patterns: &[Arc<RawRule>],
    helper: &mut H,
    repository: &RawRepository,
    grammar: &str,
) -> ScopelineResult<(Vec<RuleId>, bool)>
where
    H: RuleFactoryHelper + IncludeResolver,
{
    let mut out = Vec::with_capacity(patterns.len());

    for pattern in patterns {
        // vscode ignores other rule contents is there's an include
        // https://github.com/microsoft/vscode-textmate/blob/f03a6a8790af81372d0e81facae75554ec5e97ef/src/rule.ts#L495
        let id = match &pattern.include {
            Some(include) => resolve_include(include, helper, repository, grammar)?,
            None => compile_rule(pattern, helper, repository, grammar)?,
        };

        // containers that ended up empty are left out, a rule still being compiled
        // (recursive include) is kept
        let is_empty_container = helper
            .rule(id)
            .is_some_and(|rule| rule.has_missing_patterns() && rule.patterns().is_empty());
        if !is_empty_container {
            out.push(id);
        }
    }

    let has_missing_patterns = out.len() != patterns.len();
    Ok((out, has_missing_patterns))
}

fn resolve_include<H>(
    include: &str,
    helper: &mut H,
    repository: &RawRepository,
    grammar: &str,
) -> ScopelineResult<RuleId>
where
    H: RuleFactoryHelper + IncludeResolver,
{
    let unresolved = || Error::UnresolvedInclude {
        include: include.to_owned(),
        grammar: grammar.to_owned(),
    };

    let local = |key: &str| repository.get(key).cloned().ok_or_else(unresolved);

    match Reference::from(include) {
        Reference::Self_ => compile_rule(&local(SELF_KEY)?, helper, repository, grammar),
        Reference::Base => compile_rule(&local(BASE_KEY)?, helper, repository, grammar),
        Reference::Local(name) => compile_rule(&local(&name)?, helper, repository, grammar),
        Reference::OtherComplete(scope) => {
            let external = helper
                .external_grammar(&scope, repository.get(BASE_KEY))
                .ok_or_else(unresolved)?;
            let rule = external.self_rule().cloned().ok_or_else(unresolved)?;
            compile_rule(&rule, helper, &external.repository, &external.scope_name)
        }
        Reference::OtherSpecific(scope, name) => {
            let external = helper
                .external_grammar(&scope, repository.get(BASE_KEY))
                .ok_or_else(unresolved)?;
            let rule = external.repository.get(&name).cloned().ok_or_else(unresolved)?;
            compile_rule(&rule, helper, &external.repository, &external.scope_name)
        }
    }
}

/// All the compiled rules of a grammar, including the ones coming from the grammars it
/// includes or that are injected into it.
pub struct RuleRegistry {
    rules: Vec<Option<Arc<Rule>>>,
    ids_by_raw: HashMap<RawRuleKey, RuleId>,
    /// The grammar being compiled, with `$self` and `$base` set
    grammar: Arc<RawGrammar>,
    included_grammars: HashMap<String, Arc<RawGrammar>>,
    grammar_repository: Option<Arc<dyn GrammarRepository>>,
}

impl RuleRegistry {
    pub fn new(
        grammar: Arc<RawGrammar>,
        grammar_repository: Option<Arc<dyn GrammarRepository>>,
    ) -> Self {
        Self {
            rules: Vec::new(),
            ids_by_raw: HashMap::new(),
            grammar,
            included_grammars: HashMap::new(),
            grammar_repository,
        }
    }

    /// Compiles the root rule of the grammar
    pub fn compile_root(&mut self) -> ScopelineResult<RuleId> {
        let grammar = Arc::clone(&self.grammar);
        let root = grammar.self_rule().cloned().ok_or(Error::MissingScopeName)?;
        compile_rule(&root, self, &grammar.repository, &grammar.scope_name)
    }

    pub fn len(&self) -> usize {
        self.rules.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn grammar_repository(&self) -> Option<&Arc<dyn GrammarRepository>> {
        self.grammar_repository.as_ref()
    }

    /// The regexes a scanner for `rule_id` has to search, in order.
    ///
    /// Containers are flattened: their patterns are found in place of them.
    /// Begin rules are represented by their `begin` regex except for `rule_id` itself where
    /// its inner patterns are used instead.
    pub fn collect_patterns(&self, rule_id: RuleId, anchors: AnchorActive) -> Vec<(RuleId, String)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(rule_id);
        if let Some(rule) = self.rule(rule_id) {
            match &**rule {
                Rule::Match(m) => {
                    out.push((rule_id, m.regex.resolve_anchors(anchors).into_owned()));
                }
                rule => {
                    for id in rule.patterns() {
                        self.collect_recursive(*id, anchors, &mut out, &mut visited);
                    }
                }
            }
        }
        out
    }

    fn collect_recursive(
        &self,
        rule_id: RuleId,
        anchors: AnchorActive,
        out: &mut Vec<(RuleId, String)>,
        visited: &mut HashSet<RuleId>,
    ) {
        let Some(rule) = self.rule(rule_id) else {
            return;
        };

        match &**rule {
            Rule::Match(m) => out.push((rule_id, m.regex.resolve_anchors(anchors).into_owned())),
            Rule::BeginEnd(r) => out.push((rule_id, r.begin.resolve_anchors(anchors).into_owned())),
            Rule::BeginWhile(r) => {
                out.push((rule_id, r.begin.resolve_anchors(anchors).into_owned()))
            }
            Rule::IncludeOnly(r) => {
                // include cycles, eg `#value` including `#array` including `#value`
                if !visited.insert(rule_id) {
                    return;
                }
                for id in &r.patterns {
                    self.collect_recursive(*id, anchors, out, visited);
                }
            }
            Rule::Capture(_) => (),
        }
    }
}

impl RuleFactoryHelper for RuleRegistry {
    fn register_rule<F>(&mut self, identity: Option<RawRuleKey>, factory: F) -> ScopelineResult<RuleId>
    where
        F: FnOnce(&mut Self, RuleId) -> ScopelineResult<Rule>,
    {
        if let Some(key) = &identity
            && let Some(id) = self.ids_by_raw.get(key)
        {
            return Ok(*id);
        }

        let id = RuleId(self.rules.len() as u32 + 1);
        // push an empty slot to reserve its spot
        self.rules.push(None);
        if let Some(key) = identity {
            self.ids_by_raw.insert(key, id);
        }

        let rule = factory(self, id)?;
        self.rules[*id as usize - 1] = Some(Arc::new(rule));
        Ok(id)
    }

    fn rule(&self, id: RuleId) -> Option<&Arc<Rule>> {
        let index = (*id as usize).checked_sub(1)?;
        self.rules.get(index)?.as_ref()
    }
}

impl IncludeResolver for RuleRegistry {
    fn external_grammar(
        &mut self,
        scope_name: &str,
        base: Option<&Arc<RawRule>>,
    ) -> Option<Arc<RawGrammar>> {
        if let Some(grammar) = self.included_grammars.get(scope_name) {
            return Some(Arc::clone(grammar));
        }
        if scope_name == self.grammar.scope_name {
            return Some(Arc::clone(&self.grammar));
        }

        let raw = self.grammar_repository.as_ref()?.lookup(scope_name)?;
        let grammar = Arc::new(raw.with_self_and_base(base.cloned()));
        self.included_grammars
            .insert(scope_name.to_owned(), Arc::clone(&grammar));
        Some(grammar)
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("grammar", &self.grammar.scope_name)
            .field("rules", &self.rules.len())
            .field("included_grammars", &self.included_grammars.keys())
            .finish()
    }
}
