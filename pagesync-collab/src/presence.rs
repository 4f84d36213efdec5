//! Presence protocol of the `/presence/<sessionId>` channel.
//!
//! JSON text frames, tagged by `type`:
//!
//! ```text
//! client → server   {"type":"user-info","userId":"u1","userName":"Ann","filename":"page.hml",...}
//! client → server   {"type":"cursor-update","userId":"u1","filename":"page.hml","cursorPosition":12}
//! server → clients  {"type":"presence","users":[{ "userId":"u1", ... }, ...]}
//! ```
//!
//! Every change to a document's presence set is answered with the full set,
//! sorted by user id, sent to all presence subscribers of that document
//! (the originator included). Cursor values are stored as given; they are
//! never clamped to the document length.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Registers (or re-registers) the connection's user on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub cursor_position: Option<i64>,
    #[serde(default)]
    pub selection_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: String,
    pub filename: String,
    #[serde(default)]
    pub cursor_position: Option<i64>,
    #[serde(default)]
    pub selection_end: Option<i64>,
}

/// One user's presence on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub filename: String,
    pub cursor_position: Option<i64>,
    pub selection_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceMessage {
    #[serde(rename = "user-info")]
    UserInfo(UserInfo),
    #[serde(rename = "cursor-update")]
    CursorUpdate(CursorUpdate),
    #[serde(rename = "presence")]
    Presence { users: Vec<PresenceRecord> },
}

impl PresenceMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Record updates
// ───────────────────────────────────────────────────────────────────

/// Partial update of a [`PresenceRecord`]; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFields {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub color: Option<String>,
    pub cursor_position: Option<i64>,
    pub selection_end: Option<i64>,
}

impl PresenceFields {
    /// Merge into an existing record.
    pub fn apply_to(&self, record: &mut PresenceRecord) {
        if let Some(user_id) = &self.user_id {
            record.user_id = user_id.clone();
        }
        if let Some(user_name) = &self.user_name {
            record.user_name = user_name.clone();
        }
        if let Some(color) = &self.color {
            record.color = color.clone();
        }
        if self.cursor_position.is_some() {
            record.cursor_position = self.cursor_position;
        }
        if self.selection_end.is_some() {
            record.selection_end = self.selection_end;
        }
    }

    /// Build a fresh record. Needs at least a user id; a missing color is
    /// derived from it.
    pub fn to_record(&self, filename: &str) -> Option<PresenceRecord> {
        let user_id = self.user_id.clone()?;
        let color = self.color.clone().unwrap_or_else(|| user_color(&user_id));
        Some(PresenceRecord {
            user_name: self.user_name.clone().unwrap_or_else(|| user_id.clone()),
            user_id,
            color,
            filename: filename.to_owned(),
            cursor_position: self.cursor_position,
            selection_end: self.selection_end,
        })
    }
}

impl From<&UserInfo> for PresenceFields {
    fn from(info: &UserInfo) -> Self {
        Self {
            user_id: Some(info.user_id.clone()),
            user_name: Some(info.user_name.clone()),
            color: info.color.clone(),
            cursor_position: info.cursor_position,
            selection_end: info.selection_end,
        }
    }
}

impl From<&CursorUpdate> for PresenceFields {
    fn from(update: &CursorUpdate) -> Self {
        Self {
            cursor_position: update.cursor_position,
            selection_end: update.selection_end,
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color derived from a user id.
pub fn user_color(user_id: &str) -> String {
    // FNV-1a
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_user_info() {
        let raw = r##"{"type":"user-info","userId":"u1","userName":"Ann","color":"#ff0000","filename":"page.hml","cursorPosition":3}"##;
        let msg = PresenceMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            PresenceMessage::UserInfo(UserInfo {
                user_id: "u1".into(),
                user_name: "Ann".into(),
                color: Some("#ff0000".into()),
                filename: "page.hml".into(),
                cursor_position: Some(3),
                selection_end: None,
            })
        );
    }

    #[test]
    fn test_encode_presence_shape() {
        let msg = PresenceMessage::Presence {
            users: vec![PresenceRecord {
                user_id: "u1".into(),
                user_name: "Ann".into(),
                color: "#123456".into(),
                filename: "page.hml".into(),
                cursor_position: Some(1000),
                selection_end: None,
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "presence");
        assert_eq!(json["users"][0]["userId"], "u1");
        assert_eq!(json["users"][0]["cursorPosition"], 1000);
        assert!(json["users"][0]["selectionEnd"].is_null());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(PresenceMessage::decode(r#"{"type":"teleport","userId":"u1"}"#).is_err());
        assert!(PresenceMessage::decode("not json").is_err());
    }

    #[test]
    fn test_cursor_update_merges_only_cursor_fields() {
        let info = UserInfo {
            user_id: "u1".into(),
            user_name: "Ann".into(),
            color: None,
            filename: "p".into(),
            cursor_position: Some(1),
            selection_end: Some(4),
        };
        let mut record = PresenceFields::from(&info).to_record("p").unwrap();
        assert_eq!(record.color, user_color("u1"));

        let cursor = CursorUpdate {
            user_id: "u1".into(),
            filename: "p".into(),
            cursor_position: Some(9),
            selection_end: None,
        };
        PresenceFields::from(&cursor).apply_to(&mut record);
        assert_eq!(record.user_name, "Ann");
        assert_eq!(record.cursor_position, Some(9));
        assert_eq!(record.selection_end, Some(4));
    }

    #[test]
    fn test_record_needs_user_id() {
        assert_eq!(PresenceFields::default().to_record("p"), None);
    }

    #[test]
    fn test_user_color_is_stable_hex() {
        let a = user_color("alice");
        assert_eq!(a, user_color("alice"));
        assert_eq!(a.len(), 7);
        assert!(a.starts_with('#'));
        assert!(a[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }
}
