use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;

use crate::links::Direction;

/// Most recent panorama frame published by the viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub updated_at: String,
}

/// A navigation command waiting for the viewer to pick it up.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub pano_id: String,
    pub heading: f64,
    pub issued_at: String,
}

/// Single-slot-per-key store bridging the viewer and the guide.
///
/// The image and link slots are last-write-wins snapshots; the command slot
/// is consumed by its reader. Everything here is ephemeral, best-effort
/// session state: an absent image or an unpublished link list is a normal
/// "not yet available" condition. Callers that share a store across threads
/// wrap it in their own lock.
#[derive(Debug, Default)]
pub struct BridgeState {
    image: Option<StoredImage>,
    links: Option<Vec<Direction>>,
    command: Option<PendingCommand>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_image(&mut self, bytes: Vec<u8>, mime_type: impl Into<String>) {
        self.image = Some(StoredImage {
            bytes,
            mime_type: mime_type.into(),
            updated_at: now_utc_iso(),
        });
    }

    pub fn current_image(&self) -> Option<StoredImage> {
        self.image.clone()
    }

    /// Replaces the published link list. Duplicate pano ids collapse to the
    /// first occurrence so ranking sees each destination once.
    pub fn publish_links(&mut self, links: Vec<Direction>) {
        let mut unique: IndexMap<String, Direction> = IndexMap::with_capacity(links.len());
        for link in links {
            unique.entry(link.pano_id.clone()).or_insert(link);
        }
        self.links = Some(unique.into_values().collect());
    }

    /// `None` means the viewer has never published links, which is distinct
    /// from an explicitly published empty list.
    pub fn current_links(&self) -> Option<Vec<Direction>> {
        self.links.clone()
    }

    pub fn push_command(&mut self, pano_id: impl Into<String>, heading: f64) {
        self.command = Some(PendingCommand {
            pano_id: pano_id.into(),
            heading,
            issued_at: now_utc_iso(),
        });
    }

    /// Returns the pending command and clears the slot; the next read sees
    /// nothing until a new command is pushed.
    pub fn take_command(&mut self) -> Option<PendingCommand> {
        self.command.take()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
