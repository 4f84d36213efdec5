//! # pagesync-core — Text merge engine for collaborative page editing
//!
//! Pure, synchronous building blocks shared by the server and clients:
//!
//! ```text
//!   Operation (wire)  ──validate──►  TextOp  ──transform──►  TextOp'
//!                                      │                        │
//!                                      ▼                        ▼
//!                               Replica (client)       DocumentState (server)
//!                                                     content + version + history
//! ```
//!
//! ## Modules
//!
//! - [`name`] — `"<session>/<page>[-definition|-details]"` addressing
//! - [`ot`] — retain/insert/delete operations, transform and reconcile
//! - [`operation`] — client-submitted operation descriptors and validation
//! - [`document`] — authoritative state, history and rebasing of late ops
//! - [`replica`] — client-side in-flight/pending bookkeeping
//!
//! Nothing here touches I/O or shared state; one [`DocumentState`] is owned by
//! whoever serializes access to that document.

pub mod document;
pub mod error;
pub mod name;
pub mod operation;
pub mod ot;
pub mod replica;

pub use document::{DocumentState, Merged, Revision, Snapshot, DEFAULT_HISTORY_LIMIT};
pub use error::{MergeError, NameError};
pub use name::{DocumentName, Field, SessionId};
pub use operation::Operation;
pub use ot::{Component, Reconciled, Side, TextOp};
pub use replica::{Outgoing, Replica};
