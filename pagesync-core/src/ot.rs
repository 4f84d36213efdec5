//! Text operations and their transformation.
//!
//! An operation is a sequence of components walked left to right over the
//! document: `Retain(n)` skips `n` characters, `Insert(s)` inserts `s` at the
//! cursor, `Delete(s)` removes the characters `s` at the cursor. Anything past
//! the last component is implicitly retained. Lengths are counted in chars.
//!
//! Ops are kept normalized: no empty components, adjacent components of one
//! kind merged, an insert always placed before a delete at the same point and
//! no trailing retain. Two ops with the same effect therefore compare equal.
//!
//! Transformation follows the classic position-shifting scheme: `a.transform(b)`
//! rewrites `a` so it can be applied after `b`. Ties between inserts at the same
//! position are broken by [`Side`], and text already deleted by `b` is dropped
//! from `a`.

use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// One step of a [`TextOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Retain(usize),
    Insert(String),
    Delete(String),
}

impl Component {
    /// Length in chars.
    pub fn len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::Insert(s) | Component::Delete(s) => char_len(s),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which operation wins when both insert at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Our inserts go first.
    Left,
    /// Their inserts go first.
    Right,
}

/// A normalized text operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Component>", into = "Vec<Component>")]
pub struct TextOp {
    components: Vec<Component>,
}

/// Result of fitting an operation onto concrete content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The operation that was actually applicable.
    pub op: TextOp,
    /// Content after applying `op`.
    pub content: String,
    /// Whether any part of the original operation had to be dropped.
    pub degraded: bool,
}

impl TextOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// A contiguous edit: at `position`, remove `deleted` and insert `inserted`.
    pub fn edit(position: usize, deleted: &str, inserted: &str) -> Self {
        let mut op = Self::new();
        op.retain(position).delete(deleted).insert(inserted);
        op.chop();
        op
    }

    pub fn insertion(position: usize, text: &str) -> Self {
        Self::edit(position, "", text)
    }

    pub fn deletion(position: usize, text: &str) -> Self {
        Self::edit(position, text, "")
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// True if applying the op changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Minimum document length (in chars) this op needs.
    pub fn base_len(&self) -> usize {
        self.components.iter().fold(0usize, |len, c| match c {
            Component::Retain(n) => len.saturating_add(*n),
            Component::Delete(s) => len.saturating_add(char_len(s)),
            Component::Insert(_) => len,
        })
    }

    // ─── Builder ─────────────────────────────────────────────────────

    /// Retains come from clients and may exceed any document; they saturate
    /// here and are clamped by [`reconcile`](Self::reconcile).
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last = last.saturating_add(n);
            return self;
        }
        self.components.push(Component::Retain(n));
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return self;
        }
        if matches!(self.components.last(), Some(Component::Delete(_))) {
            // Keep inserts ahead of deletes at the same point.
            let at = self.components.len() - 1;
            if at > 0 {
                if let Component::Insert(prev) = &mut self.components[at - 1] {
                    prev.push_str(text);
                    return self;
                }
            }
            self.components.insert(at, Component::Insert(text.to_string()));
            return self;
        }
        self.components.push(Component::Insert(text.to_string()));
        self
    }

    pub fn delete(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            last.push_str(text);
            return self;
        }
        self.components.push(Component::Delete(text.to_string()));
        self
    }

    fn push(&mut self, component: Component) {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(s) => self.insert(&s),
            Component::Delete(s) => self.delete(&s),
        };
    }

    /// Drop the implicit trailing retain.
    fn chop(&mut self) {
        while matches!(self.components.last(), Some(Component::Retain(_))) {
            self.components.pop();
        }
    }

    // ─── Application ─────────────────────────────────────────────────

    /// Apply strictly: every retain must be in bounds and every delete must
    /// match the text under the cursor.
    pub fn apply(&self, content: &str) -> Result<String, MergeError> {
        let mut out = String::with_capacity(content.len());
        let mut rest = content;
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    let (head, tail) = split_chars(rest, *n).ok_or_else(|| {
                        MergeError::Mismatch(format!("retain of {n} runs past the end"))
                    })?;
                    out.push_str(head);
                    rest = tail;
                }
                Component::Insert(s) => out.push_str(s),
                Component::Delete(s) => {
                    rest = rest.strip_prefix(s.as_str()).ok_or_else(|| {
                        MergeError::Mismatch(format!("expected {s:?} under the cursor"))
                    })?;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Fit the op onto `content` so that application cannot fail.
    ///
    /// Retains running past the end are clamped. A delete whose text does not
    /// match the current slice is turned into a retain over that slice, so the
    /// text already there wins. Inserts are always kept.
    pub fn reconcile(&self, content: &str) -> Reconciled {
        let mut op = TextOp::new();
        let mut out = String::with_capacity(content.len());
        let mut rest = content;
        let mut degraded = false;

        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    let (head, tail, taken) = split_chars_clamped(rest, *n);
                    degraded |= taken < *n;
                    op.retain(taken);
                    out.push_str(head);
                    rest = tail;
                }
                Component::Insert(s) => {
                    op.insert(s);
                    out.push_str(s);
                }
                Component::Delete(s) => match rest.strip_prefix(s.as_str()) {
                    Some(tail) => {
                        op.delete(s);
                        rest = tail;
                    }
                    None => {
                        degraded = true;
                        let (head, tail, taken) = split_chars_clamped(rest, char_len(s));
                        op.retain(taken);
                        out.push_str(head);
                        rest = tail;
                    }
                },
            }
        }
        out.push_str(rest);
        op.chop();

        Reconciled {
            op,
            content: out,
            degraded,
        }
    }

    // ─── Transformation ──────────────────────────────────────────────

    /// Rewrite `self` so that it applies after `other`. Both ops must be based
    /// on the same document state.
    pub fn transform(&self, other: &TextOp, side: Side) -> TextOp {
        let mut out = TextOp::new();
        let mut ours = self.components.iter().cloned();
        let mut theirs = other.components.iter().cloned();
        let mut a = ours.next();
        let mut b = theirs.next();

        loop {
            match (a.take(), b.take()) {
                (None, _) => break,

                (Some(Component::Insert(s)), Some(Component::Insert(t))) => match side {
                    Side::Left => {
                        out.insert(&s);
                        a = ours.next();
                        b = Some(Component::Insert(t));
                    }
                    Side::Right => {
                        out.retain(char_len(&t));
                        a = Some(Component::Insert(s));
                        b = theirs.next();
                    }
                },
                (Some(Component::Insert(s)), rest) => {
                    out.insert(&s);
                    a = ours.next();
                    b = rest;
                }
                (current, Some(Component::Insert(t))) => {
                    out.retain(char_len(&t));
                    a = current;
                    b = theirs.next();
                }

                // `other` implicitly retains everything past its end.
                (Some(component), None) => {
                    out.push(component);
                    a = ours.next();
                }

                (Some(Component::Retain(n)), Some(Component::Retain(m))) => {
                    let k = n.min(m);
                    out.retain(k);
                    a = retain_rest(n, k).or_else(|| ours.next());
                    b = retain_rest(m, k).or_else(|| theirs.next());
                }
                (Some(Component::Retain(n)), Some(Component::Delete(t))) => {
                    let k = n.min(char_len(&t));
                    a = retain_rest(n, k).or_else(|| ours.next());
                    b = delete_rest(&t, k).or_else(|| theirs.next());
                }
                (Some(Component::Delete(s)), Some(Component::Retain(m))) => {
                    let k = char_len(&s).min(m);
                    let (head, _) = split_chars(&s, k).unwrap_or((s.as_str(), ""));
                    out.delete(head);
                    a = delete_rest(&s, k).or_else(|| ours.next());
                    b = retain_rest(m, k).or_else(|| theirs.next());
                }
                (Some(Component::Delete(s)), Some(Component::Delete(t))) => {
                    // Already gone on the other side.
                    let k = char_len(&s).min(char_len(&t));
                    a = delete_rest(&s, k).or_else(|| ours.next());
                    b = delete_rest(&t, k).or_else(|| theirs.next());
                }
            }
        }

        out.chop();
        out
    }
}

impl From<Vec<Component>> for TextOp {
    fn from(components: Vec<Component>) -> Self {
        let mut op = TextOp::new();
        for component in components {
            op.push(component);
        }
        op.chop();
        op
    }
}

impl From<TextOp> for Vec<Component> {
    fn from(op: TextOp) -> Self {
        op.components
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split after `n` chars, or `None` if `s` is shorter.
fn split_chars(s: &str, n: usize) -> Option<(&str, &str)> {
    if n == 0 {
        return Some(("", s));
    }
    match s.char_indices().nth(n) {
        Some((idx, _)) => Some(s.split_at(idx)),
        None if char_len(s) == n => Some((s, "")),
        None => None,
    }
}

/// Split after at most `n` chars. Returns how many chars were taken.
fn split_chars_clamped(s: &str, n: usize) -> (&str, &str, usize) {
    match split_chars(s, n) {
        Some((head, tail)) => (head, tail, n),
        None => (s, "", char_len(s)),
    }
}

fn retain_rest(n: usize, k: usize) -> Option<Component> {
    (n > k).then(|| Component::Retain(n - k))
}

fn delete_rest(s: &str, k: usize) -> Option<Component> {
    match split_chars(s, k) {
        Some((_, tail)) if !tail.is_empty() => Some(Component::Delete(tail.to_string())),
        _ => None,
    }
}
