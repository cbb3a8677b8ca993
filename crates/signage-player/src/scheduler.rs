//! Playback scheduler.
//!
//! A pure state machine: it never calls the surface or arms timers itself.
//! Every input returns a list of `Directive`s that the core executes in
//! order.  Two counters on the cursor make completion exactly-once:
//!
//! - `display_token` identifies the display request for the item on screen;
//!   surface `Ended` / `Failed` events carrying any other token are stale.
//! - `timer_generation` identifies the armed completion timer; fires from an
//!   older generation are stale.
//!
//! Advancing bumps both, so whichever completion signal arrives second is
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use signage_proto::config::PlaybackConfig;
use signage_proto::protocol::{
    ContentKind, ContentRef, NowShowing, PlaybackState, PlaylistItem, PlaylistSnapshot,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::timer::Tick;

// ── duration policy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationPolicy {
    pub image_default: Duration,
    pub video_default: Duration,
    pub min_window: Duration,
}

impl Default for DurationPolicy {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for DurationPolicy {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            image_default: config.image_default(),
            video_default: config.video_default(),
            min_window: config.min_window(),
        }
    }
}

impl DurationPolicy {
    /// How long `item` stays on screen if nothing ends it early.
    ///
    /// Inside its window the item runs to the end of the window (floored at
    /// `min_window`); outside it gets the default for its kind.
    pub fn item_duration(&self, item: &PlaylistItem, now: DateTime<Utc>) -> Duration {
        if item.starts_at <= now && now <= item.ends_at {
            let remaining = (item.ends_at - now).to_std().unwrap_or(Duration::ZERO);
            return remaining.max(self.min_window);
        }
        match item.content.as_ref().map(|c| c.kind) {
            Some(ContentKind::Video) => self.video_default,
            _ => self.image_default,
        }
    }
}

// ── directives ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Put `content` on screen under display token `token`.
    Show { token: u64, content: ContentRef },
    /// Arm the completion timer; the fire must carry `generation`.
    ArmTimer { generation: u64, after: Duration },
    CancelTimer,
    PauseSurface,
    ResumeSurface,
    /// Freeze the current item (video paused and rewound).
    Halt,
    /// Nothing left to show.
    Blank,
    /// Every item in the snapshot was skipped in a row.
    AllItemsUnplayable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub index: usize,
    /// Id of the item on screen, `None` when nothing is.
    pub item_id: Option<String>,
    pub display_token: u64,
    pub timer_generation: u64,
}

// ── scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler {
    policy: DurationPolicy,
    snapshot: Arc<PlaylistSnapshot>,
    state: PlaybackState,
    cursor: PlaybackCursor,
    /// Content handed to the surface under the current display token.
    on_screen: Option<ContentRef>,
    hidden: bool,
    /// When the armed completion timer is due.
    deadline: Option<Instant>,
    /// Time left on the current item while paused.  `None` while paused means
    /// the item must be shown afresh on resume.
    remaining: Option<Duration>,
    consecutive_skips: usize,
}

impl Scheduler {
    pub fn new(policy: DurationPolicy) -> Self {
        Self {
            policy,
            snapshot: Arc::new(PlaylistSnapshot::default()),
            state: PlaybackState::Idle,
            cursor: PlaybackCursor::default(),
            on_screen: None,
            hidden: false,
            deadline: None,
            remaining: None,
            consecutive_skips: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    pub fn snapshot(&self) -> &Arc<PlaylistSnapshot> {
        &self.snapshot
    }

    pub fn current_item(&self) -> Option<&PlaylistItem> {
        self.snapshot.get(self.cursor.index)
    }

    pub fn now_showing(&self) -> Option<NowShowing> {
        if self.state == PlaybackState::Idle {
            return None;
        }
        let item = self.current_item()?;
        let content = item.content.as_ref()?;
        Some(NowShowing {
            item_id: item.id.clone(),
            display_name: content.display_name.clone(),
            kind: content.kind,
            index: self.cursor.index,
            count: self.snapshot.len(),
            starts_at: item.starts_at,
            ends_at: item.ends_at,
        })
    }

    // ── inputs ────────────────────────────────────────────────────────────────

    /// A new snapshot was published.
    pub fn on_snapshot(&mut self, snapshot: Arc<PlaylistSnapshot>, now: Tick) -> Vec<Directive> {
        debug!(
            "scheduler: snapshot rev {} with {} items in {:?}",
            snapshot.revision,
            snapshot.len(),
            self.state
        );
        self.snapshot = snapshot;
        let len = self.snapshot.len();
        let kept = self.relocate();
        if self.cursor.index >= len {
            self.cursor.index = 0;
        }

        match self.state {
            PlaybackState::Stopped => Vec::new(),
            PlaybackState::Idle => {
                if len == 0 || self.hidden {
                    return Vec::new();
                }
                self.consecutive_skips = 0;
                self.cursor.index = 0;
                self.show_current(now)
            }
            PlaybackState::Playing => {
                if len == 0 {
                    return self.go_idle();
                }
                if kept {
                    return Vec::new();
                }
                info!(
                    "scheduler: item {} changed under the cursor, showing index {}",
                    self.cursor.item_id.as_deref().unwrap_or("?"),
                    self.cursor.index
                );
                self.consecutive_skips = 0;
                self.show_current(now)
            }
            PlaybackState::Paused => {
                if len == 0 {
                    return self.go_idle();
                }
                if !kept {
                    self.remaining = None;
                }
                Vec::new()
            }
        }
    }

    /// The completion timer of `generation` fired.
    pub fn on_completion(&mut self, generation: u64, now: Tick) -> Vec<Directive> {
        if self.state != PlaybackState::Playing || generation != self.cursor.timer_generation {
            debug!("scheduler: stale completion timer gen {}", generation);
            return Vec::new();
        }
        self.advance(now)
    }

    /// The surface reports that the item shown under `token` ended by itself.
    pub fn on_natural_end(&mut self, token: u64, now: Tick) -> Vec<Directive> {
        if self.state != PlaybackState::Playing || token != self.cursor.display_token {
            debug!("scheduler: stale natural end for token {}", token);
            return Vec::new();
        }
        self.advance(now)
    }

    /// The surface could not show the item requested under `token`.
    pub fn on_display_failed(&mut self, token: u64, now: Tick) -> Vec<Directive> {
        if self.state != PlaybackState::Playing || token != self.cursor.display_token {
            return Vec::new();
        }
        warn!(
            "scheduler: display failed for item {}, skipping",
            self.current_item().map(|i| i.id.as_str()).unwrap_or("?")
        );
        self.consecutive_skips += 1;
        self.step_index();
        self.show_current(now)
    }

    /// Host window hidden / shown.
    pub fn on_visibility(&mut self, hidden: bool, now: Tick) -> Vec<Directive> {
        if self.hidden == hidden {
            return Vec::new();
        }
        self.hidden = hidden;
        match (self.state, hidden) {
            (PlaybackState::Playing, true) => {
                let remaining = self
                    .deadline
                    .take()
                    .map(|d| d.saturating_duration_since(now.mono))
                    .unwrap_or(Duration::ZERO);
                info!("scheduler: paused with {:?} left", remaining);
                self.state = PlaybackState::Paused;
                self.remaining = Some(remaining);
                self.cursor.timer_generation += 1;
                vec![Directive::CancelTimer, Directive::PauseSurface]
            }
            (PlaybackState::Paused, false) => self.unpause(now),
            (PlaybackState::Idle, false) if !self.snapshot.is_empty() => {
                self.consecutive_skips = 0;
                self.cursor.index = 0;
                self.show_current(now)
            }
            _ => Vec::new(),
        }
    }

    /// Operator interrupt.  The cursor is kept so `resume` continues from it.
    pub fn force_stop(&mut self) -> Vec<Directive> {
        if self.state == PlaybackState::Stopped {
            return Vec::new();
        }
        info!("scheduler: force-stop at index {}", self.cursor.index);
        self.state = PlaybackState::Stopped;
        self.cursor.timer_generation += 1;
        self.deadline = None;
        self.remaining = None;
        vec![Directive::CancelTimer, Directive::Halt]
    }

    /// Leave `Stopped`.  No-op in any other state.
    pub fn resume(&mut self, now: Tick) -> Vec<Directive> {
        if self.state != PlaybackState::Stopped {
            return Vec::new();
        }
        info!("scheduler: resuming at index {}", self.cursor.index);
        if self.snapshot.is_empty() {
            return self.go_idle();
        }
        self.consecutive_skips = 0;
        if self.hidden {
            self.state = PlaybackState::Paused;
            self.remaining = None;
            return Vec::new();
        }
        self.show_current(now)
    }

    /// Forget the playlist (session reset).
    pub fn reset(&mut self) -> Vec<Directive> {
        self.snapshot = Arc::new(PlaylistSnapshot::default());
        self.cursor.index = 0;
        self.consecutive_skips = 0;
        self.go_idle()
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Point the cursor at the on-screen item in the current snapshot.
    /// False when that item is gone or its content changed.
    fn relocate(&mut self) -> bool {
        let (Some(id), Some(content)) = (self.cursor.item_id.as_deref(), self.on_screen.as_ref())
        else {
            return false;
        };
        let Some(index) = self.snapshot.items.iter().position(|i| i.id == id) else {
            return false;
        };
        if self.snapshot.items[index].content.as_ref() != Some(content) {
            return false;
        }
        self.cursor.index = index;
        true
    }

    fn advance(&mut self, now: Tick) -> Vec<Directive> {
        self.consecutive_skips = 0;
        self.step_index();
        self.show_current(now)
    }

    fn step_index(&mut self) {
        let len = self.snapshot.len();
        self.cursor.index = if len == 0 {
            0
        } else {
            (self.cursor.index + 1) % len
        };
    }

    fn unpause(&mut self, now: Tick) -> Vec<Directive> {
        match self.remaining.take() {
            Some(remaining) => {
                self.state = PlaybackState::Playing;
                self.cursor.timer_generation += 1;
                self.deadline = now.mono.checked_add(remaining);
                vec![
                    Directive::ResumeSurface,
                    Directive::ArmTimer {
                        generation: self.cursor.timer_generation,
                        after: remaining,
                    },
                ]
            }
            None => self.show_current(now),
        }
    }

    fn go_idle(&mut self) -> Vec<Directive> {
        self.state = PlaybackState::Idle;
        self.cursor.timer_generation += 1;
        self.deadline = None;
        self.remaining = None;
        self.cursor.item_id = None;
        self.on_screen = None;
        vec![Directive::CancelTimer, Directive::Blank]
    }

    /// Show the item under the cursor, skipping unplayable ones.
    fn show_current(&mut self, now: Tick) -> Vec<Directive> {
        loop {
            let len = self.snapshot.len();
            if len == 0 {
                return self.go_idle();
            }
            if self.consecutive_skips >= len {
                warn!(
                    "scheduler: all {} items unplayable, idling until the playlist changes",
                    len
                );
                self.consecutive_skips = 0;
                let mut out = self.go_idle();
                out.push(Directive::AllItemsUnplayable);
                return out;
            }

            let snapshot = Arc::clone(&self.snapshot);
            let Some(item) = snapshot.get(self.cursor.index) else {
                self.cursor.index = 0;
                continue;
            };
            let Some(content) = item.content.as_ref() else {
                warn!("scheduler: item {} has no playable content, skipping", item.id);
                self.consecutive_skips += 1;
                self.step_index();
                continue;
            };

            let after = self.policy.item_duration(item, now.wall);
            self.state = PlaybackState::Playing;
            self.cursor.display_token += 1;
            self.cursor.timer_generation += 1;
            self.cursor.item_id = Some(item.id.clone());
            self.on_screen = Some(content.clone());
            self.deadline = now.mono.checked_add(after);
            self.remaining = None;
            info!(
                "scheduler: showing {} ({}/{}) for {:?}",
                content.display_name,
                self.cursor.index + 1,
                len,
                after
            );
            return vec![
                Directive::Show {
                    token: self.cursor.display_token,
                    content: content.clone(),
                },
                Directive::ArmTimer {
                    generation: self.cursor.timer_generation,
                    after,
                },
            ];
        }
    }
}
