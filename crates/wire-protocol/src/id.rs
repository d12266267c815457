//! Identifiers for peers, transfers and channels

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Format as user-friendly display string (UUID)
    pub fn to_display_string(&self) -> String {
        self.0.to_string().to_uppercase()
    }

    /// Parse from display string
    pub fn from_display_string(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if let Ok(uuid) = Uuid::parse_str(trimmed) {
            return Some(Self(uuid));
        }

        let cleaned: String = trimmed.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() != 32 {
            return None;
        }
        Uuid::parse_str(&cleaned.to_lowercase()).ok().map(Self)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Unique identifier for one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel number within one peer connection.
///
/// Channel 0 carries control messages; 1..=MAX_DATA_CHANNELS carry chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub const CONTROL: ChannelId = ChannelId(0);

    pub fn data(index: u8) -> Self {
        Self(index + 1)
    }

    pub fn is_control(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_control() {
            write!(f, "ctrl")
        } else {
            write!(f, "data-{}", self.0)
        }
    }
}
