//! Client-side replica of a synchronized document.
//!
//! Tracks the last server version the client has incorporated, one op in
//! flight (sent, not yet acknowledged) and a queue of local edits waiting for
//! the in-flight op to be acknowledged. Remote ops are transformed against the
//! pending local ops; the server's op wins insert ties, mirroring what the
//! server does when it transforms our op.

use std::collections::VecDeque;

use crate::document::Snapshot;
use crate::error::MergeError;
use crate::ot::{Side, TextOp};

/// An op the client should send now, with the version it is based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub op: TextOp,
    pub base_version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Replica {
    content: String,
    version: u64,
    inflight: Option<TextOp>,
    pending: VecDeque<TextOp>,
}

impl Replica {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            content: snapshot.content,
            version: snapshot.version,
            inflight: None,
            pending: VecDeque::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last server version incorporated.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True when no local edit is waiting for the server.
    pub fn is_settled(&self) -> bool {
        self.inflight.is_none() && self.pending.is_empty()
    }

    /// Apply a local edit. Returns the op to send if nothing is in flight.
    pub fn edit(&mut self, op: TextOp) -> Result<Option<Outgoing>, MergeError> {
        self.content = op.apply(&self.content)?;
        if self.inflight.is_some() {
            self.pending.push_back(op);
            return Ok(None);
        }
        self.inflight = Some(op.clone());
        Ok(Some(Outgoing {
            op,
            base_version: self.version,
        }))
    }

    /// The server accepted our in-flight op as `version`.
    ///
    /// Returns the next op to send, if any.
    pub fn acknowledge(&mut self, version: u64) -> Result<Option<Outgoing>, MergeError> {
        if version <= self.version || self.inflight.is_none() {
            // Superseded by a resync.
            return Ok(None);
        }
        self.expect_next(version)?;
        self.inflight = None;
        self.version = version;

        Ok(self.pending.pop_front().map(|op| {
            self.inflight = Some(op.clone());
            Outgoing {
                op,
                base_version: version,
            }
        }))
    }

    /// Integrate an op another client produced at `version`.
    pub fn receive(&mut self, op: &TextOp, version: u64) -> Result<(), MergeError> {
        if version <= self.version {
            return Ok(());
        }
        self.expect_next(version)?;

        let mut remote = op.clone();
        if let Some(inflight) = self.inflight.take() {
            self.inflight = Some(inflight.transform(&remote, Side::Right));
            remote = remote.transform(&inflight, Side::Left);
        }
        for local in self.pending.iter_mut() {
            let rebased = local.transform(&remote, Side::Right);
            remote = remote.transform(local, Side::Left);
            *local = rebased;
        }

        self.content = remote.apply(&self.content)?;
        self.version = version;
        Ok(())
    }

    /// Replace local state with a server snapshot. Unacknowledged edits are
    /// dropped; the snapshot is the converged truth.
    pub fn resync(&mut self, snapshot: Snapshot) {
        if !self.is_settled() {
            log::debug!(
                "Resync to v{} dropped {} unacknowledged edits",
                snapshot.version,
                self.pending.len() + usize::from(self.inflight.is_some())
            );
        }
        *self = Self::new(snapshot);
    }

    fn expect_next(&self, version: u64) -> Result<(), MergeError> {
        if version == self.version + 1 {
            Ok(())
        } else {
            Err(MergeError::Mismatch(format!(
                "expected v{}, got v{version}",
                self.version + 1
            )))
        }
    }
}
