use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::compass::{angular_distance, normalize_heading};

/// One navigable edge out of the current viewpoint, as reported by the map
/// provider. `pano_id` is opaque and stable per physical location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    #[serde(rename = "panoId")]
    pub pano_id: String,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub description: String,
}

/// Pano ids already visited in this navigation session. Append-only until an
/// explicit reset, which re-seeds the set with the current viewpoint.
#[derive(Debug, Clone, Default)]
pub struct VisitedSet {
    panos: BTreeSet<String>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, pano_id: impl Into<String>) -> bool {
        self.panos.insert(pano_id.into())
    }

    pub fn contains(&self, pano_id: &str) -> bool {
        self.panos.contains(pano_id)
    }

    pub fn len(&self) -> usize {
        self.panos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panos.is_empty()
    }

    pub fn reset(&mut self, current_pano: impl Into<String>) {
        self.panos.clear();
        self.panos.insert(current_pano.into());
    }
}

/// Filters out visited destinations and orders the remainder by angular
/// distance from the current heading, nearest first. The sort is stable, so
/// directions at equal distance keep their input order. Pure and
/// deterministic; an empty result is the caller-visible "fully explored"
/// state when the input was non-empty.
pub fn rank_directions(
    directions: &[Direction],
    current_heading: f64,
    visited: &VisitedSet,
) -> Vec<Direction> {
    let current = normalize_heading(current_heading);
    let mut candidates: Vec<Direction> = directions
        .iter()
        .filter(|direction| !visited.contains(&direction.pano_id))
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
        let da = angular_distance(current, normalize_heading(a.heading));
        let db = angular_distance(current, normalize_heading(b.heading));
        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
    });
    candidates
}

/// Renders the numbered options block appended to the user query before it is
/// forwarded to the conversational backend.
pub fn format_options(directions: &[Direction]) -> String {
    directions
        .iter()
        .enumerate()
        .map(|(idx, direction)| {
            let label = if direction.description.trim().is_empty() {
                "direction"
            } else {
                direction.description.trim()
            };
            format!(
                "{}. {} (id: {}, heading: {}°)",
                idx + 1,
                label,
                direction.pano_id,
                direction.heading
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}
