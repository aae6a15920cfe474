use std::fmt;
use std::sync::Arc;

use crate::grammars::RuleId;
use crate::scope::ScopeList;

#[derive(Clone)]
pub(crate) struct StackFrame {
    parent: Option<StateStack>,
    /// Number of frames including this one
    depth: usize,
    /// Rule that created this stack element
    rule_id: RuleId,
    /// Dynamic end/while pattern resolved with backreferences
    /// For BeginEnd rules: the end pattern with \1, \2, etc. resolved
    /// For BeginWhile rules: the while pattern with backreferences resolved
    end_pattern: Option<String>,
    /// "name" scopes - applied to begin/end delimiters
    /// These scopes are active when matching the rule's boundaries
    name_scopes: ScopeList,
    /// "contentName" scopes - applied to content between delimiters
    /// These scopes are active for the rule's interior content
    content_scopes: ScopeList,
    /// The state has entered and captured \n.
    /// This means that the next line should start with an anchor_position of 0.
    begin_rule_has_captured_eol: bool,
    /// The position where this rule was entered during current line (for infinite loop detection)
    /// None at beginning of a line
    enter_position: Option<usize>,
    /// Where \G can match for this rule, only valid during the current line
    anchor_position: Option<usize>,
}

/// Keeps track of nested context as well as how to exit that context and the captures
/// strings used in backreferences.
///
/// This is what a line gives to the next one. Frames are immutable and shared: the state
/// returned for a line shares everything but its top frames with the state it started from.
#[derive(Clone)]
pub struct StateStack(Arc<StackFrame>);

impl StateStack {
    pub(crate) fn root(rule_id: RuleId, scopes: ScopeList) -> Self {
        Self(Arc::new(StackFrame {
            parent: None,
            depth: 1,
            rule_id,
            end_pattern: None,
            name_scopes: scopes.clone(),
            content_scopes: scopes,
            begin_rule_has_captured_eol: false,
            enter_position: None,
            anchor_position: None,
        }))
    }

    /// Called when entering a nested context: when a BeginEnd or BeginWhile begin pattern matches
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push(
        &self,
        rule_id: RuleId,
        enter_position: Option<usize>,
        anchor_position: Option<usize>,
        begin_rule_has_captured_eol: bool,
        end_pattern: Option<String>,
        name_scopes: ScopeList,
        content_scopes: ScopeList,
    ) -> Self {
        Self(Arc::new(StackFrame {
            parent: Some(self.clone()),
            depth: self.0.depth + 1,
            rule_id,
            end_pattern,
            name_scopes,
            content_scopes,
            begin_rule_has_captured_eol,
            enter_position,
            anchor_position,
        }))
    }

    /// Exits the current context, getting back to the parent
    pub(crate) fn pop(&self) -> Option<StateStack> {
        self.0.parent.clone()
    }

    /// Pop but never go below root state
    pub(crate) fn safe_pop(&self) -> StateStack {
        self.pop().unwrap_or_else(|| self.clone())
    }

    fn with_frame(&self, update: impl FnOnce(&mut StackFrame)) -> Self {
        let mut frame = (*self.0).clone();
        update(&mut frame);
        Self(Arc::new(frame))
    }

    pub(crate) fn with_content_scopes(&self, content_scopes: ScopeList) -> Self {
        if self.0.content_scopes == content_scopes {
            return self.clone();
        }
        self.with_frame(|frame| frame.content_scopes = content_scopes)
    }

    pub(crate) fn with_end_pattern(&self, end_pattern: String) -> Self {
        if self.0.end_pattern.as_deref() == Some(end_pattern.as_str()) {
            return self.clone();
        }
        self.with_frame(|frame| frame.end_pattern = Some(end_pattern))
    }

    /// Clears the positions that only make sense within the line that set them.
    ///
    /// Frames that have nothing to clear are shared with `self`.
    pub(crate) fn reset(&self) -> StateStack {
        let parent = self.0.parent.as_ref().map(StateStack::reset);
        let parent_unchanged = match (&parent, &self.0.parent) {
            (Some(new), Some(old)) => Arc::ptr_eq(&new.0, &old.0),
            _ => true,
        };
        if parent_unchanged && self.0.enter_position.is_none() && self.0.anchor_position.is_none()
        {
            return self.clone();
        }

        self.with_frame(|frame| {
            frame.parent = parent;
            frame.enter_position = None;
            frame.anchor_position = None;
        })
    }

    /// Whether a frame for the same rule was entered at the same position below this one,
    /// which means pushing `other` did not make any progress.
    pub(crate) fn has_same_rule_as(&self, other: &StateStack) -> bool {
        let mut current = Some(self);
        while let Some(frame) = current
            && frame.0.enter_position == other.0.enter_position
        {
            if frame.0.rule_id == other.0.rule_id {
                return true;
            }
            current = frame.0.parent.as_ref();
        }
        false
    }

    /// The frames from the root to this one
    pub(crate) fn frames(&self) -> Vec<StateStack> {
        let mut out = Vec::with_capacity(self.0.depth);
        let mut current = Some(self);
        while let Some(frame) = current {
            out.push(frame.clone());
            current = frame.0.parent.as_ref();
        }
        out.reverse();
        out
    }

    pub fn depth(&self) -> usize {
        self.0.depth
    }

    pub fn rule_id(&self) -> RuleId {
        self.0.rule_id
    }

    pub fn end_pattern(&self) -> Option<&str> {
        self.0.end_pattern.as_deref()
    }

    pub fn name_scopes(&self) -> &ScopeList {
        &self.0.name_scopes
    }

    pub fn content_scopes(&self) -> &ScopeList {
        &self.0.content_scopes
    }

    pub(crate) fn begin_rule_has_captured_eol(&self) -> bool {
        self.0.begin_rule_has_captured_eol
    }

    pub(crate) fn enter_position(&self) -> Option<usize> {
        self.0.enter_position
    }

    pub(crate) fn anchor_position(&self) -> Option<usize> {
        self.0.anchor_position
    }
}

/// Two states are equal when they would tokenize the next line the same way.
/// Positions only valid within a line are not compared.
impl PartialEq for StateStack {
    fn eq(&self, other: &Self) -> bool {
        let mut a = Some(self);
        let mut b = Some(other);
        loop {
            match (a, b) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if Arc::ptr_eq(&x.0, &y.0) {
                        return true;
                    }
                    if x.0.depth != y.0.depth
                        || x.0.rule_id != y.0.rule_id
                        || x.0.end_pattern != y.0.end_pattern
                        || x.0.begin_rule_has_captured_eol != y.0.begin_rule_has_captured_eol
                        || x.0.name_scopes != y.0.name_scopes
                        || x.0.content_scopes != y.0.content_scopes
                    {
                        return false;
                    }
                    a = x.0.parent.as_ref();
                    b = y.0.parent.as_ref();
                }
                _ => return false,
            }
        }
    }
}

impl Eq for StateStack {}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateStack:")?;

        for (depth, frame) in self.frames().iter().enumerate() {
            let frame = &frame.0;
            let indent = "  ".repeat(depth);

            write!(f, "{}rule={}", indent, *frame.rule_id)?;
            write!(f, " name=[{:?}]", frame.name_scopes)?;
            if frame.content_scopes != frame.name_scopes {
                write!(f, ", content=[{:?}]", frame.content_scopes)?;
            }

            if let Some(pattern) = &frame.end_pattern {
                write!(f, ", end_pattern=\"{}\"", pattern)?;
            }

            write!(f, ", anchor_pos={:?}", frame.anchor_position)?;

            // Add enter_position if present and different from anchor_position
            if let Some(enter_pos) = frame.enter_position
                && frame.anchor_position != Some(enter_pos)
            {
                write!(f, ", enter_pos={}", enter_pos)?;
            }

            write!(
                f,
                ", begin_rule_has_captured_eol={}",
                frame.begin_rule_has_captured_eol
            )?;

            writeln!(f)?;
        }

        Ok(())
    }
}
