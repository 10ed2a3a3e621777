use dropwatch_common::frame::Region;
use tracing::debug;

/// Outcome of one [`PersistenceTracker::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Fire,
    Hold,
}

/// Counts consecutive frames with at least one candidate region and fires
/// once the streak is long enough and the cooldown since the last trigger
/// has elapsed.
///
/// A single empty frame resets the streak. Firing also resets it, so a
/// lingering object has to rebuild the full streak after each cooldown.
#[derive(Debug, Clone)]
pub struct PersistenceTracker {
    persistence_frames: u32,
    cooldown_secs: f64,
    consecutive_present: u32,
    /// `None` until the first trigger, so the first one is never held back.
    last_trigger: Option<f64>,
}

impl PersistenceTracker {
    pub fn new(persistence_frames: u32, cooldown_secs: f64) -> Self {
        Self {
            persistence_frames: persistence_frames.max(1),
            cooldown_secs,
            consecutive_present: 0,
            last_trigger: None,
        }
    }

    /// Advance one frame. `now` is Unix seconds.
    pub fn step(&mut self, regions: &[Region], now: f64) -> Decision {
        if regions.is_empty() {
            self.consecutive_present = 0;
        } else {
            self.consecutive_present = self.consecutive_present.saturating_add(1);
        }

        let cooled_down = self
            .last_trigger
            .map_or(true, |last| now - last > self.cooldown_secs);

        if self.consecutive_present >= self.persistence_frames && cooled_down {
            debug!(
                streak = self.consecutive_present,
                now, "persistence satisfied, firing"
            );
            self.consecutive_present = 0;
            self.last_trigger = Some(now);
            return Decision::Fire;
        }
        Decision::Hold
    }

    pub fn consecutive_present(&self) -> u32 {
        self.consecutive_present
    }

    pub fn last_trigger(&self) -> Option<f64> {
        self.last_trigger
    }
}

/// The region with the largest area; the earliest one wins ties.
pub fn select_largest(regions: &[Region]) -> Option<&Region> {
    regions.iter().fold(None, |best, r| match best {
        Some(b) if b.area >= r.area => Some(b),
        _ => Some(r),
    })
}
