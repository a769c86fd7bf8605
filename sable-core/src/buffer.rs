//! # Buffer
//!
//! One layer: an ordered event log, the live bitmap it renders to, and the
//! checkpoint cache bounding replay cost. The buffer resolves playback,
//! undo, redo, insert and remove; everything that spans buffers (merge
//! back-references, stack moves) is routed through [`crate::picture`].
//!
//! The single mechanism underneath undo/redo/remove/insert/hide is bounded
//! replay: restore the nearest checkpoint at or before the changed position
//! and re-apply the surviving events whose bounding boxes intersect the
//! changed region.

use crate::checkpoint::{CheckpointCache, CheckpointPolicy};
use crate::color::Color;
use crate::event::{BufferCreate, Event, Payload};
use crate::id::{BufferId, SessionId};
use crate::raster::{CapacityError, Rasterizer, Surface};
use crate::util::{ClipStack, PixelRect};

/// Read access to other buffers' bitmaps, for applying `BufferMerge` events.
/// The caller (the picture) guarantees every merge source a replay can cross
/// has a live bitmap before handing this in.
pub trait MergeSources<S: Surface> {
    fn bitmap_of(&self, id: BufferId) -> Option<&S>;
}

/// For operations on buffers whose logs contain no merge events.
pub struct NoSources;
impl<S: Surface> MergeSources<S> for NoSources {
    fn bitmap_of(&self, _id: BufferId) -> Option<&S> {
        None
    }
}

pub struct Buffer<S: Surface> {
    id: BufferId,
    events: Vec<Event>,
    insertion_point: usize,
    /// Non-undone `BufferRemove` events touching this buffer. A counter, not
    /// a flag, so concurrent remove/undo from multiple authors stays sane.
    remove_count: u32,
    /// Set while a non-undone `BufferMerge` in another buffer consumes this
    /// one. Lookup only, not ownership.
    merged_to: Option<BufferId>,
    clip: ClipStack,
    cache: CheckpointCache<S>,
    /// `None` while freed under memory pressure.
    bitmap: Option<S>,
    width: u32,
    height: u32,
    clear_color: Color,
    has_alpha: bool,
    visible: bool,
    opacity: f32,
    undoable: bool,
}

impl<S: Surface> Buffer<S> {
    /// Create a buffer from its creation event. The event lands at log
    /// index 0, is never deleted, and only possibly undone - undoing it
    /// makes the whole buffer logically absent.
    pub fn new(
        width: u32,
        height: u32,
        policy: CheckpointPolicy,
        undoable: bool,
        info: BufferCreate,
        event: Event,
    ) -> Result<Self, CapacityError> {
        debug_assert!(
            event.buffer_create().is_some(),
            "buffer seeded with a non-creation event"
        );
        let policy = if undoable {
            policy
        } else {
            CheckpointPolicy { budget: 0, ..policy }
        };
        let mut bitmap = S::new(width, height, info.clear_color, info.has_alpha)?;
        let full = PixelRect::from_size(width, height);
        if !event.undone() {
            bitmap.clear(full, info.clear_color);
        }
        Ok(Self {
            id: info.buffer,
            insertion_point: 1,
            events: vec![event],
            remove_count: 0,
            merged_to: None,
            clip: ClipStack::new(full),
            cache: CheckpointCache::new(policy),
            bitmap: Some(bitmap),
            width,
            height,
            clear_color: info.clear_color,
            has_alpha: info.has_alpha,
            visible: true,
            opacity: 1.0,
            undoable,
        })
    }

    /// Rehydrate a buffer from a parsed log. The bitmap starts freed and is
    /// regenerated lazily; remove and hide counters are recomputed from the
    /// log.
    pub(crate) fn from_parts(
        width: u32,
        height: u32,
        policy: CheckpointPolicy,
        undoable: bool,
        info: BufferCreate,
        events: Vec<Event>,
        insertion_point: usize,
        opacity: f32,
        visible: bool,
    ) -> Self {
        let policy = if undoable {
            policy
        } else {
            CheckpointPolicy { budget: 0, ..policy }
        };
        let mut buffer = Self {
            id: info.buffer,
            insertion_point: insertion_point.clamp(1, events.len().max(1)),
            events,
            remove_count: 0,
            merged_to: None,
            clip: ClipStack::new(PixelRect::from_size(width, height)),
            cache: CheckpointCache::new(policy),
            bitmap: None,
            width,
            height,
            clear_color: info.clear_color,
            has_alpha: info.has_alpha,
            visible,
            opacity,
            undoable,
        };
        // Rebuild derived counters from the log itself.
        for i in 0..buffer.events.len() {
            if buffer.events[i].undone() {
                continue;
            }
            match buffer.events[i].payload {
                Payload::BufferRemove(_) => buffer.remove_count += 1,
                Payload::EventHide(hide) => {
                    if let Some(target) = buffer.find_event(hide.session, hide.seq) {
                        buffer.events[target].add_hide();
                    } else {
                        log::warn!("hide in {} targets a missing event", buffer.id);
                    }
                }
                _ => {}
            }
        }
        buffer
    }

    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }
    #[must_use]
    pub fn rect(&self) -> PixelRect {
        PixelRect::from_size(self.width, self.height)
    }
    #[must_use]
    pub fn clear_color(&self) -> Color {
        self.clear_color
    }
    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }
    #[must_use]
    pub fn undoable(&self) -> bool {
        self.undoable
    }
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }
    #[must_use]
    pub fn event(&self, i: usize) -> Option<&Event> {
        self.events.get(i)
    }
    #[must_use]
    pub fn insertion_point(&self) -> usize {
        self.insertion_point
    }
    #[must_use]
    pub fn remove_count(&self) -> u32 {
        self.remove_count
    }
    #[must_use]
    pub fn merged_to(&self) -> Option<BufferId> {
        self.merged_to
    }
    pub(crate) fn set_merged_to(&mut self, target: Option<BufferId>) {
        self.merged_to = target;
    }
    #[must_use]
    pub fn visible(&self) -> bool {
        self.visible
    }
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }
    #[must_use]
    pub fn opacity(&self) -> f32 {
        self.opacity
    }
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }
    #[must_use]
    pub fn bitmap(&self) -> Option<&S> {
        self.bitmap.as_ref()
    }
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.bitmap.is_none()
    }
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointCache<S> {
        &self.cache
    }
    /// Whether this buffer contributes to the composite: visible, not
    /// removed, its creation not undone, and not merged away.
    #[must_use]
    pub fn is_composited(&self) -> bool {
        self.visible
            && self.remove_count == 0
            && self.merged_to.is_none()
            && self.events.first().is_some_and(|e| !e.undone())
    }

    /// Move the insertion-point cursor. Index 0 (before the creation event)
    /// is out of contract.
    pub fn set_insertion_point(&mut self, p: usize) {
        debug_assert!(
            (1..=self.events.len()).contains(&p),
            "insertion point out of range"
        );
        self.insertion_point = p.clamp(1, self.events.len());
    }

    /// The log position at which inserting `(session, seq)` keeps that
    /// session's events in non-decreasing `seq` order: right after the last
    /// event by the session with a sequence number not exceeding `seq`.
    #[must_use]
    pub fn insertion_index_for(&self, session: SessionId, seq: u32) -> usize {
        let mut first_newer = self.events.len();
        for (i, event) in self.events.iter().enumerate().rev() {
            if event.session() != session {
                continue;
            }
            if event.seq() <= seq {
                return (i + 1).max(1);
            }
            first_newer = i;
        }
        first_newer.max(1)
    }

    /// Highest sequence number of `session` in this log, relying on the
    /// per-session ordering invariant (scan from the back, first hit wins).
    #[must_use]
    pub fn latest_seq_for(&self, session: SessionId) -> Option<u32> {
        self.events
            .iter()
            .rev()
            .find(|e| e.session() == session)
            .map(Event::seq)
    }

    #[must_use]
    pub fn find_event(&self, session: SessionId, seq: u32) -> Option<usize> {
        self.events
            .iter()
            .position(|e| e.session() == session && e.seq() == seq)
    }

    /// Every session's sequence numbers appear in non-decreasing log order.
    #[must_use]
    pub fn session_order_ok(&self) -> bool {
        let mut latest = hashbrown::HashMap::new();
        for event in &self.events {
            let last = latest.entry(event.session()).or_insert(0u32);
            if event.seq() < *last {
                return false;
            }
            *last = event.seq();
        }
        true
    }

    fn base_color(&self) -> Color {
        if self.has_alpha {
            Color::TRANSPARENT
        } else {
            self.clear_color.opaque()
        }
    }

    /// Push clip, run, pop on every exit path.
    fn scoped_clip<T>(&mut self, rect: PixelRect, f: impl FnOnce(&mut Self, PixelRect) -> T) -> T {
        let clip = self.clip.push(rect);
        let out = f(self, clip);
        self.clip.pop();
        out
    }

    /// Append an event; apply it immediately (scoped to its bounding box)
    /// unless it arrives undone, then run checkpoint maintenance.
    pub fn push_event(
        &mut self,
        event: Event,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        if let Some(last) = self.latest_seq_for(event.session()) {
            if event.seq() < last {
                debug_assert!(false, "push breaks the per-session ordering invariant");
                log::warn!(
                    "{}: event {} seq {} pushed after seq {last}",
                    self.id,
                    event.session(),
                    event.seq()
                );
            }
        }
        let idx = self.events.len();
        let cursor_at_end = self.insertion_point == idx;
        let applied = !event.undone();
        self.events.push(event);
        if cursor_at_end {
            self.insertion_point = self.events.len();
        }
        if applied {
            self.apply_appended(idx, raster, sources);
            self.maintain_checkpoints();
        }
    }

    /// Insert at the insertion-point cursor and advance it. The caller must
    /// have chosen a position preserving the per-session ordering invariant
    /// (see [`Buffer::insertion_index_for`]). Inserting below the top
    /// triggers bounded replay rather than incremental apply, since an
    /// earlier event can be occluded by later ones.
    pub fn insert_event(
        &mut self,
        event: Event,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        let p = self.insertion_point.clamp(1, self.events.len());
        let applied = !event.undone();
        let at_top = p == self.events.len();
        self.events.insert(p, event);
        self.insertion_point = p + 1;
        debug_assert!(self.session_order_ok(), "insert broke session ordering");
        let counted = applied && self.cache.newest_index().is_some_and(|newest| p < newest);
        self.cache.note_insert(p, counted);
        if applied {
            if at_top {
                self.apply_appended(p, raster, sources);
            } else if let Some(target) = self.structural_flip(p, true) {
                self.playback_after_change(target, raster, sources);
            } else {
                self.playback_after_change(p, raster, sources);
            }
        }
    }

    /// Flip event `i` to undone and repair the bitmap. Undoing an
    /// already-undone event is a caller bug: loud in debug, no-op in
    /// release.
    pub fn undo_event_index(
        &mut self,
        i: usize,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) -> bool {
        let Some(event) = self.events.get(i) else {
            debug_assert!(false, "undo index out of range");
            return false;
        };
        if event.undone() {
            debug_assert!(false, "undoing an already-undone event");
            log::warn!("{}: undo of already-undone event {i}", self.id);
            return false;
        }
        self.events[i].set_undone(true);
        self.cache.note_undo(i);
        if let Some(target) = self.structural_flip(i, false) {
            self.playback_after_change(target, raster, sources);
        }
        self.playback_after_change(i, raster, sources);
        true
    }

    /// Flip event `i` back to applied and repair the bitmap.
    pub fn redo_event_index(
        &mut self,
        i: usize,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) -> bool {
        let Some(event) = self.events.get(i) else {
            debug_assert!(false, "redo index out of range");
            return false;
        };
        if !event.undone() {
            debug_assert!(false, "redoing an event that is not undone");
            log::warn!("{}: redo of non-undone event {i}", self.id);
            return false;
        }
        self.events[i].set_undone(false);
        self.cache.note_redo(i);
        if let Some(target) = self.structural_flip(i, true) {
            self.playback_after_change(target, raster, sources);
        }
        self.playback_after_change(i, raster, sources);
        self.maintain_checkpoints();
        true
    }

    /// Undo (if needed) then splice out event `i`, shifting later
    /// checkpoint indices down. The creation event is never removable.
    /// Removing a merge is disallowed unless `allow_merge`; when a merge is
    /// undone here the caller owns clearing the source's back-reference.
    pub fn remove_event_index(
        &mut self,
        i: usize,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
        allow_merge: bool,
    ) -> Option<Event> {
        if i == 0 || i >= self.events.len() {
            debug_assert!(false, "remove index out of range");
            return None;
        }
        if !self.events[i].undone() {
            if self.events[i].buffer_merge().is_some() && !allow_merge {
                log::warn!("{}: refusing to remove a live merge event", self.id);
                return None;
            }
            if !self.undo_event_index(i, raster, sources) {
                return None;
            }
        }
        let removed = self.events.remove(i);
        self.cache.note_remove(i);
        if self.insertion_point > i {
            self.insertion_point -= 1;
        }
        Some(removed)
    }

    /// Clear everything after the creation event, then optionally push one
    /// new event. Low-latency preview path: an in-progress stroke can be
    /// re-rendered without touching permanent history.
    pub fn replace_with_event(
        &mut self,
        event: Option<Event>,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        self.events.truncate(1);
        if let Some(first) = self.events.first_mut() {
            first.reset_hides();
        }
        self.remove_count = 0;
        self.cache.truncate_past(1);
        self.insertion_point = self.events.len();
        self.playback_region(0, self.rect(), raster, sources);
        if let Some(event) = event {
            self.push_event(event, raster, sources);
        }
    }

    /// Drop the bitmap and all snapshot data under memory pressure.
    /// Checkpoint bookkeeping is retained; `regenerate` restores everything.
    pub fn free(&mut self) {
        log::debug!("{}: freeing bitmap and snapshots", self.id);
        self.bitmap = None;
        self.cache.invalidate_all();
    }

    /// Restore a freed buffer by full replay, repairing invalidated
    /// checkpoints along the way. No-op when the bitmap is live.
    pub fn regenerate(
        &mut self,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) -> Result<(), CapacityError> {
        if self.bitmap.is_some() {
            return Ok(());
        }
        log::debug!("{}: regenerating by full replay", self.id);
        self.bitmap = Some(S::new(
            self.width,
            self.height,
            self.clear_color,
            self.has_alpha,
        )?);
        self.playback_region(0, self.rect(), raster, sources);
        Ok(())
    }

    /// Bounded replay after event `i` changed state: replay its bounding box
    /// from the nearest restorable checkpoint at or before `i`.
    fn playback_after_change(
        &mut self,
        i: usize,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        let Some(bbox) = self.events[i].bounding_box(self.rect()) else {
            return;
        };
        self.playback_region(i, bbox, raster, sources);
    }

    /// Replay `region` from the nearest restorable checkpoint at or before
    /// `from`. Also the entry point for cross-buffer damage: when a merged
    /// source changes, its consumer replays the damaged region from the
    /// merge event's position.
    pub(crate) fn playback_region(
        &mut self,
        from: usize,
        region: PixelRect,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        if self.bitmap.is_none() {
            // Freed: nothing to repair now, regeneration replays everything.
            return;
        }
        self.scoped_clip(region, |buffer, clip| {
            if clip.is_empty() {
                return;
            }
            buffer.replay_clipped(from, clip, raster, sources);
        });
    }

    fn replay_clipped(
        &mut self,
        from: usize,
        clip: PixelRect,
        raster: &mut S::Mask,
        sources: &dyn MergeSources<S>,
    ) {
        let rect = PixelRect::from_size(self.width, self.height);
        let full = clip == rect;
        let base = self.base_color();
        let bitmap = self.bitmap.as_mut().expect("replay on a freed buffer");
        let start = match self.cache.restore_point(from) {
            Some(cp) => {
                // Restorable implies the snapshot is present.
                bitmap.restore(cp.snapshot.as_ref().unwrap(), clip);
                cp.index
            }
            None => {
                bitmap.clear(clip, base);
                0
            }
        };
        for k in start..=self.events.len() {
            // The live surface now holds the state after [0, k) within the
            // clip; keep any checkpoint parked here exact.
            self.cache.refresh_at(k, bitmap, clip, full);
            if k == self.events.len() {
                break;
            }
            let event = &self.events[k];
            if event.undone() || event.hidden() {
                continue;
            }
            let Some(bbox) = event.bounding_box(rect) else {
                continue;
            };
            let scoped = bbox.intersect(clip);
            if scoped.is_empty() {
                continue;
            }
            apply_pixels(bitmap, raster, sources, event, scoped);
        }
    }

    /// Incremental apply for a freshly appended top event: later z-order
    /// means nothing can occlude it, so no replay is needed.
    fn apply_appended(&mut self, idx: usize, raster: &mut S::Mask, sources: &dyn MergeSources<S>) {
        if let Some(target) = self.structural_flip(idx, true) {
            self.playback_after_change(target, raster, sources);
        }
        let Some(bbox) = self.events[idx].bounding_box(self.rect()) else {
            return;
        };
        self.scoped_clip(bbox, |buffer, clip| {
            if clip.is_empty() {
                return;
            }
            let Some(bitmap) = buffer.bitmap.as_mut() else {
                return;
            };
            apply_pixels(bitmap, raster, sources, &buffer.events[idx], clip);
        });
    }

    /// Bookkeeping outside the bounding-box path, run when event `i` flips
    /// between applied and not. `BufferRemove` adjusts the remove counter;
    /// `EventHide` toggles the target's hide counter. Returns the index of a
    /// hide target whose visibility crossed zero and needs replay. Stack
    /// moves and merge back-references belong to the picture.
    fn structural_flip(&mut self, i: usize, applied: bool) -> Option<usize> {
        match self.events[i].payload {
            Payload::BufferRemove(remove) => {
                debug_assert_eq!(remove.buffer, self.id, "remove routed to wrong buffer");
                if applied {
                    self.remove_count += 1;
                } else {
                    debug_assert!(self.remove_count > 0, "remove count underflow");
                    self.remove_count = self.remove_count.saturating_sub(1);
                }
                None
            }
            Payload::EventHide(hide) => {
                let Some(target) = self.find_event(hide.session, hide.seq) else {
                    log::warn!("{}: hide targets a missing event", self.id);
                    return None;
                };
                let count = if applied {
                    self.events[target].add_hide()
                } else {
                    self.events[target].remove_hide()
                };
                // Only the zero crossing changes pixels.
                let crossed = if applied { count == 1 } else { count == 0 };
                crossed.then_some(target)
            }
            _ => None,
        }
    }

    /// Create a checkpoint once enough non-undone events accumulated past
    /// the newest one, then evict down to budget.
    fn maintain_checkpoints(&mut self) {
        let newest = self.cache.newest_index().unwrap_or(0);
        let since = self.events[newest..]
            .iter()
            .filter(|e| !e.undone())
            .count() as u64;
        if !self.cache.should_checkpoint(since) {
            return;
        }
        let Some(bitmap) = self.bitmap.as_ref() else {
            return;
        };
        match bitmap.snapshot() {
            Ok(snapshot) => {
                let len = self.events.len();
                self.cache.push(len, since, snapshot, len);
            }
            // Capacity failure: skip the optimization, never the history.
            Err(err) => log::warn!("{}: skipping checkpoint: {err}", self.id),
        }
    }
}

/// Apply one event's pixels into `bitmap` within `clip`. The clip is already
/// intersected with the event's bounding box.
fn apply_pixels<S: Surface>(
    bitmap: &mut S,
    raster: &mut S::Mask,
    sources: &dyn MergeSources<S>,
    event: &Event,
    clip: PixelRect,
) {
    match &event.payload {
        Payload::BrushStroke(_) | Payload::ScatterStroke(_) | Payload::Gradient(_) => {
            raster.set_clip(clip);
            event.rasterize(raster);
            // Drawables always carry paint settings.
            let (color, blend) = event.paint().unwrap();
            bitmap.draw_mask(clip, raster, color, blend);
        }
        Payload::ImageImport(import) => {
            bitmap.blit_rgba(clip, &import.image, import.at);
        }
        Payload::BufferCreate(create) => {
            bitmap.clear(clip, create.clear_color);
        }
        Payload::BufferMerge(merge) => match sources.bitmap_of(merge.source) {
            Some(other) => bitmap.draw_surface(clip, other, merge.opacity),
            None => log::warn!("merge source {} has no live bitmap", merge.source),
        },
        Payload::BufferRemove(_) | Payload::BufferMove(_) | Payload::EventHide(_) => {}
    }
}
