pub mod bridge;
pub mod compass;
pub mod decision;
pub mod events;
pub mod links;

pub use bridge::{BridgeState, PendingCommand, StoredImage};
pub use decision::{Extraction, NavigationDecision};
pub use links::{Direction, VisitedSet};

pub fn new_session_id() -> String {
    format!("guide-{}", uuid::Uuid::new_v4())
}
