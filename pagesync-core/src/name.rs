//! Document addressing.
//!
//! Every collaboratively edited document is named `"<sessionId>/<logicalName>"`.
//! The logical name is either a page filename (the whole page is one text
//! document) or `<filename>-definition` / `<filename>-details` for the two
//! independently synchronized fields of a page.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NameError;

const MAX_SESSION_LEN: usize = 128;
const MAX_LOGICAL_LEN: usize = 255;

const DEFINITION_SUFFIX: &str = "-definition";
const DETAILS_SUFFIX: &str = "-details";

/// Identifier of an editing session. Safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, NameError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_SESSION_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(NameError::InvalidSession(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl FromStr for SessionId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which part of a page a document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    /// The whole page body.
    Content,
    Definition,
    Details,
}

impl Field {
    /// Key used in operation paths and in page store records.
    pub fn key(&self) -> &'static str {
        match self {
            Field::Content => "content",
            Field::Definition => "definition",
            Field::Details => "details",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Field::Content => "",
            Field::Definition => DEFINITION_SUFFIX,
            Field::Details => DETAILS_SUFFIX,
        }
    }
}

/// Fully qualified document name: session, page filename and field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentName {
    session: SessionId,
    filename: String,
    field: Field,
}

impl DocumentName {
    pub fn new(session: SessionId, filename: impl Into<String>, field: Field) -> Result<Self, NameError> {
        let filename = filename.into();
        validate_logical(&filename)?;
        Ok(Self {
            session,
            filename,
            field,
        })
    }

    /// Parse `"<sessionId>/<logicalName>"`.
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let (session, logical) = name
            .split_once('/')
            .ok_or_else(|| NameError::MissingSeparator(name.to_string()))?;
        let session = SessionId::new(session)?;
        validate_logical(logical)?;

        for field in [Field::Definition, Field::Details] {
            if let Some(filename) = logical.strip_suffix(field.suffix()) {
                if !filename.is_empty() {
                    return Self::new(session, filename, field);
                }
            }
        }
        Self::new(session, logical, Field::Content)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Page filename the document belongs to.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn field(&self) -> Field {
        self.field
    }

    /// The part after the session separator.
    pub fn logical_name(&self) -> String {
        format!("{}{}", self.filename, self.field.suffix())
    }
}

fn validate_logical(logical: &str) -> Result<(), NameError> {
    let valid = !logical.is_empty()
        && logical.len() <= MAX_LOGICAL_LEN
        && logical != "."
        && logical != ".."
        && !logical.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(NameError::InvalidLogicalName(logical.to_string()))
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.session, self.filename, self.field.suffix())
    }
}

impl FromStr for DocumentName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocumentName> for String {
    fn from(name: DocumentName) -> Self {
        name.to_string()
    }
}
