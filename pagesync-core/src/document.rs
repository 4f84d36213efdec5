//! Authoritative per-document state and the merge engine entry points.
//!
//! A [`DocumentState`] holds `(content, version)` plus a bounded history of the
//! operations that produced the most recent versions. Merging is pure:
//! [`DocumentState::merge`] only reads, [`DocumentState::commit`] mutates.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::MergeError;
use crate::ot::{Side, TextOp};

/// Default number of accepted ops kept for transforming late arrivals.
pub const DEFAULT_HISTORY_LIMIT: usize = 512;

/// Full current state, used to fast-forward a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
}

impl Snapshot {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }
}

/// An accepted operation and the version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: u64,
    pub op: TextOp,
}

/// Output of [`DocumentState::merge`], ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    /// Operation applicable to the current content.
    pub op: TextOp,
    /// Content after `op`.
    pub content: String,
    pub base_version: u64,
    /// Part of the incoming op conflicted with current text and was dropped.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct DocumentState {
    content: String,
    version: u64,
    history: VecDeque<Revision>,
    history_limit: usize,
}

impl DocumentState {
    /// Empty document at version 0.
    pub fn new(history_limit: usize) -> Self {
        Self::from_snapshot(Snapshot::default(), history_limit)
    }

    pub fn from_snapshot(snapshot: Snapshot, history_limit: usize) -> Self {
        Self {
            content: snapshot.content,
            version: snapshot.version,
            history: VecDeque::new(),
            history_limit,
        }
    }

    /// Rebuild from a snapshot plus the ops that led up to it.
    ///
    /// `history` must be contiguous and end exactly at the snapshot version;
    /// anything else is discarded and late ops simply become stale.
    pub fn restore(snapshot: Snapshot, history: Vec<Revision>, history_limit: usize) -> Self {
        let mut state = Self::from_snapshot(snapshot, history_limit);
        let contiguous = history
            .windows(2)
            .all(|w| w[1].version == w[0].version + 1);
        let ends_here = history.last().map(|r| r.version) == Some(state.version);
        if contiguous && ends_here {
            let skip = history.len().saturating_sub(history_limit);
            state.history.extend(history.into_iter().skip(skip));
        } else if !history.is_empty() {
            log::warn!(
                "Discarding {} history entries that do not end at version {}",
                history.len(),
                state.version
            );
        }
        state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.content.clone(), self.version)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Oldest base version an incoming op may still be computed against.
    pub fn oldest_base(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Transform `op`, computed against `base_version`, onto the current state.
    pub fn merge(&self, op: &TextOp, base_version: u64) -> Result<Merged, MergeError> {
        if base_version > self.version {
            return Err(MergeError::Validation(format!(
                "base version {base_version} is ahead of current version {}",
                self.version
            )));
        }
        if base_version < self.oldest_base() {
            return Err(MergeError::Stale {
                base_version,
                oldest_available: self.oldest_base(),
            });
        }

        let behind = (self.version - base_version) as usize;
        let skip = self.history.len() - behind;
        let transformed = self
            .history
            .iter()
            .skip(skip)
            .fold(op.clone(), |op, applied| op.transform(&applied.op, Side::Right));

        let reconciled = transformed.reconcile(&self.content);
        if reconciled.degraded {
            log::debug!(
                "Operation based on v{base_version} conflicted with v{} and was degraded",
                self.version
            );
        }

        Ok(Merged {
            op: reconciled.op,
            content: reconciled.content,
            base_version,
            degraded: reconciled.degraded,
        })
    }

    /// Accept a merged op: bump the version and record it in history.
    pub fn commit(&mut self, merged: Merged) -> Revision {
        self.content = merged.content;
        self.version += 1;
        let revision = Revision {
            version: self.version,
            op: merged.op,
        };
        self.history.push_back(revision.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        revision
    }

    /// Merge and commit in one step.
    pub fn apply(&mut self, op: &TextOp, base_version: u64) -> Result<(Revision, bool), MergeError> {
        let merged = self.merge(op, base_version)?;
        let degraded = merged.degraded;
        Ok((self.commit(merged), degraded))
    }

    /// Re-apply a logged revision during recovery.
    pub fn replay(&mut self, revision: &Revision) -> Result<(), MergeError> {
        if revision.version != self.version + 1 {
            return Err(MergeError::Mismatch(format!(
                "cannot replay v{} onto v{}",
                revision.version, self.version
            )));
        }
        let content = revision.op.apply(&self.content)?;
        self.commit(Merged {
            op: revision.op.clone(),
            content,
            base_version: self.version,
            degraded: false,
        });
        Ok(())
    }

    /// Ops a client at `version` is missing, if still retained.
    pub fn revisions_since(&self, version: u64) -> Option<Vec<Revision>> {
        if version > self.version || version < self.oldest_base() {
            return None;
        }
        let skip = self.history.len() - (self.version - version) as usize;
        Some(self.history.iter().skip(skip).cloned().collect())
    }
}
