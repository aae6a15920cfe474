//! Scope stacks shared between tokens and states.
//!
//! Each element knows its parent so pushing a scope is O(1) and lines in the same context
//! share most of their scope stack.

use std::fmt;
use std::sync::Arc;

use crate::metadata::{Metadata, ScopeMetadataProvider, merge_metadata};

struct ScopeListNode {
    parent: Option<ScopeList>,
    scope: Arc<str>,
    metadata: Metadata,
}

/// A stack of scope names, from the grammar root scope to the innermost scope, along with
/// the metadata of the innermost scope.
#[derive(Clone)]
pub struct ScopeList(Arc<ScopeListNode>);

impl ScopeList {
    pub(crate) fn root(scope: &str, metadata: Metadata) -> Self {
        Self(Arc::new(ScopeListNode {
            parent: None,
            scope: Arc::from(scope),
            metadata,
        }))
    }

    fn push_one(&self, provider: &ScopeMetadataProvider, scope: &str) -> Self {
        let source = provider.metadata_for_scope(scope);
        let metadata = merge_metadata(self.metadata(), Some(self), &source);
        Self(Arc::new(ScopeListNode {
            parent: Some(self.clone()),
            scope: Arc::from(scope),
            metadata,
        }))
    }

    /// Pushes a scope name. A name with spaces is several scopes, pushed in order.
    pub(crate) fn push(&self, provider: &ScopeMetadataProvider, scope: Option<&str>) -> Self {
        let Some(scope) = scope else {
            return self.clone();
        };
        scope
            .split_whitespace()
            .fold(self.clone(), |list, part| list.push_one(provider, part))
    }

    /// The innermost scope name
    pub fn scope(&self) -> &str {
        &self.0.scope
    }

    pub fn metadata(&self) -> Metadata {
        self.0.metadata
    }

    pub fn parent(&self) -> Option<&ScopeList> {
        self.0.parent.as_ref()
    }

    pub fn len(&self) -> usize {
        let mut len = 0;
        let mut current = Some(self);
        while let Some(list) = current {
            len += 1;
            current = list.parent();
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The scope names, root first
    pub fn scopes(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        let mut current = Some(self);
        while let Some(list) = current {
            out.push(list.scope().to_owned());
            current = list.parent();
        }
        out.reverse();
        out
    }
}

impl PartialEq for ScopeList {
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
                    if x.0.scope != y.0.scope || x.0.metadata != y.0.metadata {
                        return false;
                    }
                    a = x.parent();
                    b = y.parent();
                }
                _ => return false,
            }
        }
    }
}

impl Eq for ScopeList {}

impl fmt::Debug for ScopeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scopes().join(" "))
    }
}
