//! # Picture
//!
//! The ordered stack of buffers (top of the stack is frontmost) and the
//! orchestration around it: routing events to their target buffer, locating
//! events across the whole picture for undo/redo/remove, cross-buffer merge
//! damage propagation, blame queries, and producing the composited frame.
//!
//! The picture also carries the active authoring session and hands out its
//! monotonically increasing sequence numbers.

use crate::blend::Blend;
use crate::buffer::{Buffer, MergeSources};
use crate::checkpoint::CheckpointPolicy;
use crate::color::Color;
use crate::event::{Event, Payload};
use crate::id::{BufferId, SessionId};
use crate::raster::{CapacityError, Rasterizer, Surface};
use crate::util::PixelRect;

/// One entry of a blame query: an event and its alpha contribution to the
/// queried pixel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Blame {
    pub session: SessionId,
    pub seq: u32,
    pub alpha: f32,
}

/// Read-only view of every buffer except the one being operated on.
struct SourcesView<'a, S: Surface> {
    lo: &'a [Buffer<S>],
    hi: &'a [Buffer<S>],
}
impl<S: Surface> MergeSources<S> for SourcesView<'_, S> {
    fn bitmap_of(&self, id: BufferId) -> Option<&S> {
        self.lo
            .iter()
            .chain(self.hi.iter())
            .find(|b| b.id() == id)
            .and_then(Buffer::bitmap)
    }
}

/// Split out one buffer for mutation plus a shared view of the rest.
fn split_sources<S: Surface>(
    buffers: &mut [Buffer<S>],
    idx: usize,
) -> (&mut Buffer<S>, SourcesView<'_, S>) {
    let (lo, rest) = buffers.split_at_mut(idx);
    // Index validity is the caller's contract.
    let (target, hi) = rest.split_first_mut().unwrap();
    (target, SourcesView { lo, hi })
}

pub struct Picture<S: Surface> {
    width: u32,
    height: u32,
    /// Bottom to top; the last buffer is frontmost.
    buffers: Vec<Buffer<S>>,
    /// Scratch rasterizer shared by every buffer operation.
    raster: S::Mask,
    policy: CheckpointPolicy,
    session: SessionId,
    next_seq: u32,
    /// Ties in cross-buffer event searches resolve toward this buffer.
    last_target: Option<BufferId>,
    /// Preview stroke composited on top of its buffer without ever touching
    /// the log.
    in_progress: Option<(BufferId, Event)>,
}

impl<S: Surface> Picture<S> {
    pub fn new(width: u32, height: u32, session: SessionId) -> Result<Self, CapacityError> {
        Self::with_policy(width, height, session, CheckpointPolicy::default())
    }
    pub fn with_policy(
        width: u32,
        height: u32,
        session: SessionId,
        policy: CheckpointPolicy,
    ) -> Result<Self, CapacityError> {
        Ok(Self {
            width,
            height,
            buffers: Vec::new(),
            raster: S::new_mask(width, height)?,
            policy,
            session,
            next_seq: 0,
            last_target: None,
            in_progress: None,
        })
    }
    pub(crate) fn from_parts(
        width: u32,
        height: u32,
        session: SessionId,
        policy: CheckpointPolicy,
        buffers: Vec<Buffer<S>>,
    ) -> Result<Self, CapacityError> {
        let mut picture = Self {
            width,
            height,
            buffers,
            raster: S::new_mask(width, height)?,
            policy,
            session,
            next_seq: 0,
            last_target: None,
            in_progress: None,
        };
        // Rebuild merge back-references from the logs.
        let mut links = Vec::new();
        for buffer in &picture.buffers {
            for event in buffer.events() {
                if event.undone() {
                    continue;
                }
                if let Some(merge) = event.buffer_merge() {
                    links.push((merge.source, buffer.id()));
                }
            }
        }
        for (source, target) in links {
            if let Some(idx) = picture.buffer_index(source) {
                picture.buffers[idx].set_merged_to(Some(target));
            } else {
                log::warn!("merge references unknown {source}");
            }
        }
        picture.next_seq = picture
            .find_latest_by_session(session)
            .map_or(0, |seq| seq.saturating_add(1));
        Ok(picture)
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
    pub fn session(&self) -> SessionId {
        self.session
    }
    /// Switch the active session, seeding its next sequence number from the
    /// highest one observed anywhere in the picture.
    pub fn set_session(&mut self, session: SessionId) {
        self.session = session;
        self.next_seq = self
            .find_latest_by_session(session)
            .map_or(0, |seq| seq.saturating_add(1));
    }
    /// Wrap a payload in an event stamped with the active session and its
    /// next sequence number.
    pub fn make_event(&mut self, payload: Payload) -> Event {
        let event = Event::new(self.session, self.next_seq, payload);
        self.next_seq = self.next_seq.saturating_add(1);
        event
    }
    #[must_use]
    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        self.policy
    }

    /// Bottom-to-top stack of buffers.
    #[must_use]
    pub fn buffers(&self) -> &[Buffer<S>] {
        &self.buffers
    }
    #[must_use]
    pub fn buffer_index(&self, id: BufferId) -> Option<usize> {
        self.buffers.iter().position(|b| b.id() == id)
    }
    #[must_use]
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer<S>> {
        self.buffers.iter().find(|b| b.id() == id)
    }

    pub fn set_buffer_visible(&mut self, id: BufferId, visible: bool) {
        if let Some(idx) = self.buffer_index(id) {
            self.buffers[idx].set_visible(visible);
        }
    }
    pub fn set_buffer_opacity(&mut self, id: BufferId, opacity: f32) {
        if let Some(idx) = self.buffer_index(id) {
            self.buffers[idx].set_opacity(opacity);
        }
    }
    pub fn set_insertion_point(&mut self, id: BufferId, point: usize) {
        if let Some(idx) = self.buffer_index(id) {
            self.buffers[idx].set_insertion_point(point);
        }
    }

    /// Drop a buffer's bitmap and snapshots under memory pressure. It
    /// regenerates lazily the next time anything needs its pixels.
    pub fn free_buffer(&mut self, id: BufferId) {
        if let Some(idx) = self.buffer_index(id) {
            self.buffers[idx].free();
        }
    }

    /// Physically drop a buffer from the stack, destroying its history.
    /// Back-references into it are cleared; merge events referencing it will
    /// warn on replay.
    pub fn drop_buffer(&mut self, id: BufferId) -> Option<Buffer<S>> {
        let idx = self.buffer_index(id)?;
        let removed = self.buffers.remove(idx);
        for buffer in &mut self.buffers {
            if buffer.merged_to() == Some(id) {
                buffer.set_merged_to(None);
            }
        }
        if self.last_target == Some(id) {
            self.last_target = None;
        }
        Some(removed)
    }

    /// Regenerate every freed buffer, dependency-ordered. Mostly useful
    /// right after parsing, where all bitmaps start freed.
    pub fn regenerate_all(&mut self) -> Result<(), CapacityError> {
        for idx in 0..self.buffers.len() {
            self.ensure_ready(idx)?;
        }
        Ok(())
    }

    /// Route an event to its target buffer's log. `BufferCreate` events
    /// create a new buffer at the top of the stack; everything else is
    /// appended to the addressed buffer and applied.
    pub fn push_event(&mut self, target: BufferId, event: Event) -> Result<(), CapacityError> {
        self.last_target = Some(target);
        if let Payload::BufferCreate(info) = event.payload {
            debug_assert_eq!(info.buffer, target, "creation routed to wrong buffer");
            if self.buffer_index(info.buffer).is_some() {
                debug_assert!(false, "duplicate buffer id");
                log::warn!("ignoring creation of duplicate {}", info.buffer);
                return Ok(());
            }
            let buffer = Buffer::new(self.width, self.height, self.policy, true, info, event)?;
            self.buffers.push(buffer);
            return Ok(());
        }
        let Some(idx) = self.buffer_index(target) else {
            debug_assert!(false, "push to unknown buffer");
            log::warn!("push to unknown {target}");
            return Ok(());
        };
        if !self.prepare_structural(idx, &event)? {
            return Ok(());
        }
        self.ensure_ready(idx)?;
        let applied = !event.undone();
        let bbox = event.bounding_box(self.rect());
        let merge = event.buffer_merge().copied();
        let stack_move = event.buffer_move().copied();
        {
            let (buffer, view) = split_sources(&mut self.buffers, idx);
            buffer.push_event(event, &mut self.raster, &view);
        }
        if applied {
            self.apply_picture_effects(target, merge, stack_move, true);
        }
        self.propagate_damage(target, bbox)
    }

    /// Route an event to the target buffer's insertion-point cursor. The
    /// caller places the cursor (see [`Buffer::insertion_index_for`]) so the
    /// per-session ordering invariant holds.
    pub fn insert_event(&mut self, target: BufferId, event: Event) -> Result<(), CapacityError> {
        self.last_target = Some(target);
        if event.buffer_create().is_some() {
            debug_assert!(false, "buffer creation cannot be inserted mid-log");
            log::warn!("ignoring inserted creation event");
            return Ok(());
        }
        let Some(idx) = self.buffer_index(target) else {
            debug_assert!(false, "insert to unknown buffer");
            log::warn!("insert to unknown {target}");
            return Ok(());
        };
        if !self.prepare_structural(idx, &event)? {
            return Ok(());
        }
        self.ensure_ready(idx)?;
        let applied = !event.undone();
        let bbox = event.bounding_box(self.rect());
        let merge = event.buffer_merge().copied();
        let stack_move = event.buffer_move().copied();
        {
            let (buffer, view) = split_sources(&mut self.buffers, idx);
            buffer.insert_event(event, &mut self.raster, &view);
        }
        if applied {
            self.apply_picture_effects(target, merge, stack_move, true);
        }
        self.propagate_damage(target, bbox)
    }

    /// Locate an event anywhere in the picture. The most recently touched
    /// buffer is searched first, then the rest top to bottom.
    #[must_use]
    pub fn locate(&self, session: SessionId, seq: u32) -> Option<(BufferId, usize)> {
        let preferred = self.last_target.and_then(|id| self.buffer_index(id));
        let search = preferred
            .into_iter()
            .chain((0..self.buffers.len()).rev().filter(|i| Some(*i) != preferred));
        for idx in search {
            if let Some(event_idx) = self.buffers[idx].find_event(session, seq) {
                return Some((self.buffers[idx].id(), event_idx));
            }
        }
        None
    }

    /// Undo the identified event wherever it lives. Returns false when the
    /// event is missing or already undone.
    pub fn undo_by_session_event(
        &mut self,
        session: SessionId,
        seq: u32,
    ) -> Result<bool, CapacityError> {
        let Some((id, event_idx)) = self.locate(session, seq) else {
            return Ok(false);
        };
        let idx = self.buffer_index(id).unwrap();
        if self.buffers[idx].events()[event_idx].undone() {
            debug_assert!(false, "undoing an already-undone event");
            return Ok(false);
        }
        self.ensure_ready(idx)?;
        let event = &self.buffers[idx].events()[event_idx];
        let bbox = event.bounding_box(self.rect());
        let merge = event.buffer_merge().copied();
        let stack_move = event.buffer_move().copied();
        let flipped = {
            let (buffer, view) = split_sources(&mut self.buffers, idx);
            buffer.undo_event_index(event_idx, &mut self.raster, &view)
        };
        if !flipped {
            return Ok(false);
        }
        self.apply_picture_effects(id, merge, stack_move, false);
        self.last_target = Some(id);
        self.propagate_damage(id, bbox)?;
        Ok(true)
    }

    /// Redo the identified event. Returns false when it is missing or not
    /// undone.
    pub fn redo_by_session_event(
        &mut self,
        session: SessionId,
        seq: u32,
    ) -> Result<bool, CapacityError> {
        let Some((id, event_idx)) = self.locate(session, seq) else {
            return Ok(false);
        };
        let idx = self.buffer_index(id).unwrap();
        if !self.buffers[idx].events()[event_idx].undone() {
            debug_assert!(false, "redoing a non-undone event");
            return Ok(false);
        }
        // A redone merge composites its source; make sure it is live first.
        if let Some(merge) = self.buffers[idx].events()[event_idx].buffer_merge().copied() {
            if let Some(source_idx) = self.buffer_index(merge.source) {
                self.ensure_ready(source_idx)?;
            }
        }
        self.ensure_ready(idx)?;
        let event = &self.buffers[idx].events()[event_idx];
        let bbox = event.bounding_box(self.rect());
        let merge = event.buffer_merge().copied();
        let stack_move = event.buffer_move().copied();
        let flipped = {
            let (buffer, view) = split_sources(&mut self.buffers, idx);
            buffer.redo_event_index(event_idx, &mut self.raster, &view)
        };
        if !flipped {
            return Ok(false);
        }
        self.apply_picture_effects(id, merge, stack_move, true);
        self.last_target = Some(id);
        self.propagate_damage(id, bbox)?;
        Ok(true)
    }

    /// Undo (if necessary) then splice out the identified event. Removal of
    /// a live merge is refused unless `allow_merge`.
    pub fn remove_by_session_event(
        &mut self,
        session: SessionId,
        seq: u32,
        allow_merge: bool,
    ) -> Result<bool, CapacityError> {
        let Some((id, event_idx)) = self.locate(session, seq) else {
            return Ok(false);
        };
        let idx = self.buffer_index(id).unwrap();
        let event = &self.buffers[idx].events()[event_idx];
        if !event.undone() {
            if event.buffer_merge().is_some() && !allow_merge {
                log::warn!("refusing to remove a live merge event");
                return Ok(false);
            }
            if !self.undo_by_session_event(session, seq)? {
                return Ok(false);
            }
        }
        let idx = self.buffer_index(id).unwrap();
        self.ensure_ready(idx)?;
        let removed = {
            let (buffer, view) = split_sources(&mut self.buffers, idx);
            buffer
                .remove_event_index(event_idx, &mut self.raster, &view, allow_merge)
                .is_some()
        };
        Ok(removed)
    }

    /// Undo the active session's most recent event that is not already
    /// undone. Ties resolve toward the most recently touched buffer because
    /// it is searched first.
    pub fn undo_latest(&mut self) -> Result<bool, CapacityError> {
        let preferred = self.last_target.and_then(|id| self.buffer_index(id));
        let search = preferred
            .into_iter()
            .chain((0..self.buffers.len()).rev().filter(|i| Some(*i) != preferred));
        let mut best: Option<u32> = None;
        for idx in search {
            let candidate = self.buffers[idx]
                .events()
                .iter()
                .rev()
                .filter(|e| e.session() == self.session && !e.undone())
                .map(Event::seq)
                .next();
            if let Some(seq) = candidate {
                if best.is_none() || best.is_some_and(|b| seq > b) {
                    best = Some(seq);
                }
            }
        }
        match best {
            Some(seq) => self.undo_by_session_event(self.session, seq),
            None => Ok(false),
        }
    }

    /// Highest sequence number of `session` anywhere in the picture, used
    /// to seed the next sequence number when a session (re)joins.
    #[must_use]
    pub fn find_latest_by_session(&self, session: SessionId) -> Option<u32> {
        self.buffers
            .iter()
            .filter_map(|b| b.latest_seq_for(session))
            .max()
    }

    /// Which events contribute to the pixel at `(x, y)`, and with what
    /// alpha: top to bottom over buffers, front to back over events, each
    /// drawable rasterized in isolation.
    pub fn blame_pixel(&mut self, x: u32, y: u32) -> smallvec::SmallVec<[Blame; 8]> {
        let mut out = smallvec::SmallVec::new();
        if x >= self.width || y >= self.height {
            return out;
        }
        let pixel = PixelRect {
            left: x,
            top: y,
            right: x + 1,
            bottom: y + 1,
        };
        for buffer in self.buffers.iter().rev() {
            if !buffer.is_composited() {
                continue;
            }
            for event in buffer.events().iter().rev() {
                if event.undone() || event.hidden() || !event.is_drawable() {
                    continue;
                }
                let Some(bbox) = event.bounding_box(buffer.rect()) else {
                    continue;
                };
                if !bbox.contains(x, y) {
                    continue;
                }
                self.raster.set_clip(pixel);
                event.rasterize(&mut self.raster);
                let coverage = self.raster.coverage(x, y);
                // Drawables always carry paint settings.
                let (_, blend) = event.paint().unwrap();
                let alpha = coverage * blend.opacity.clamp(0.0, 1.0);
                if alpha > 0.0 {
                    out.push(Blame {
                        session: event.session(),
                        seq: event.seq(),
                        alpha,
                    });
                }
            }
        }
        out
    }

    /// Composite the frame bottom to top into `target`, skipping buffers
    /// that are invisible, removed, or merged away. The in-progress preview
    /// event rides directly above its buffer so an active stroke never
    /// commits to the log just to be seen.
    pub fn compose_into(&mut self, target: &mut S) -> Result<(), CapacityError> {
        for idx in 0..self.buffers.len() {
            if self.buffers[idx].is_composited() {
                self.ensure_ready(idx)?;
            }
        }
        let full = self.rect();
        target.clear(full, Color::TRANSPARENT);
        for idx in 0..self.buffers.len() {
            let buffer = &self.buffers[idx];
            if !buffer.is_composited() {
                continue;
            }
            // Ready means live.
            target.draw_surface(full, buffer.bitmap().unwrap(), buffer.opacity());
            if let Some((attached, event)) = &self.in_progress {
                if *attached == buffer.id() && event.is_drawable() {
                    let Some(bbox) = event.bounding_box(full) else {
                        continue;
                    };
                    if bbox.is_empty() {
                        continue;
                    }
                    self.raster.set_clip(bbox);
                    event.rasterize(&mut self.raster);
                    let (color, blend) = event.paint().unwrap();
                    let blend = Blend {
                        mode: blend.mode,
                        opacity: blend.opacity * buffer.opacity(),
                    };
                    target.draw_mask(bbox, &self.raster, color, blend);
                }
            }
        }
        Ok(())
    }

    /// Attach a preview event above `target`. Replaces any previous one.
    pub fn set_in_progress(&mut self, target: BufferId, event: Event) {
        debug_assert!(event.is_drawable(), "only drawables can be previewed");
        debug_assert!(self.buffer_index(target).is_some(), "unknown preview target");
        self.in_progress = Some((target, event));
    }
    #[must_use]
    pub fn in_progress(&self) -> Option<&Event> {
        self.in_progress.as_ref().map(|(_, e)| e)
    }
    /// Mutable access for extending the active stroke; each extension bumps
    /// the event's generation.
    pub fn in_progress_mut(&mut self) -> Option<&mut Event> {
        self.in_progress.as_mut().map(|(_, e)| e)
    }
    pub fn clear_in_progress(&mut self) {
        self.in_progress = None;
    }
    /// Commit the preview event to its buffer's log.
    pub fn commit_in_progress(&mut self) -> Result<bool, CapacityError> {
        match self.in_progress.take() {
            Some((target, event)) => {
                self.push_event(target, event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Structural pre-checks for merge and move payloads. Returns false when
    /// the event must be dropped (contract violation).
    fn prepare_structural(
        &mut self,
        target_idx: usize,
        event: &Event,
    ) -> Result<bool, CapacityError> {
        if let Some(merge) = event.buffer_merge() {
            let target_id = self.buffers[target_idx].id();
            if merge.source == target_id {
                debug_assert!(false, "self-merge");
                log::warn!("{target_id}: ignoring self-merge");
                return Ok(false);
            }
            let Some(source_idx) = self.buffer_index(merge.source) else {
                debug_assert!(false, "merge of unknown buffer");
                log::warn!("ignoring merge of unknown {}", merge.source);
                return Ok(false);
            };
            // The composite reads the source's pixels immediately.
            if !event.undone() {
                self.ensure_ready(source_idx)?;
            }
        }
        if let Some(stack_move) = event.buffer_move() {
            if stack_move.from >= self.buffers.len() || stack_move.to >= self.buffers.len() {
                debug_assert!(false, "stack move out of bounds");
                log::warn!("ignoring out-of-bounds stack move");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Picture-level side effects of structural events flipping state:
    /// merge back-references and stack reordering. Buffer-local counters
    /// (removes, hides) are handled inside the buffer.
    fn apply_picture_effects(
        &mut self,
        target: BufferId,
        merge: Option<crate::event::BufferMerge>,
        stack_move: Option<crate::event::BufferMove>,
        applied: bool,
    ) {
        if let Some(merge) = merge {
            if let Some(source_idx) = self.buffer_index(merge.source) {
                self.buffers[source_idx].set_merged_to(applied.then_some(target));
            }
        }
        if let Some(mv) = stack_move {
            let (from, to) = if applied {
                (mv.from, mv.to)
            } else {
                (mv.to, mv.from)
            };
            if from < self.buffers.len() && to < self.buffers.len() {
                let buffer = self.buffers.remove(from);
                self.buffers.insert(to, buffer);
            } else {
                debug_assert!(false, "stack move out of bounds");
                log::warn!("ignoring out-of-bounds stack move");
            }
        }
    }

    /// Regenerate the buffer at `idx` and every buffer its log merges,
    /// transitively, sources first. A merge cycle is a structural contract
    /// violation and is cut at the repeated buffer.
    fn ensure_ready(&mut self, idx: usize) -> Result<(), CapacityError> {
        let mut order = Vec::new();
        let mut visited = hashbrown::HashSet::new();
        self.collect_dependencies(idx, &mut visited, &mut order);
        for dep in order {
            if !self.buffers[dep].is_freed() {
                continue;
            }
            let (buffer, view) = split_sources(&mut self.buffers, dep);
            buffer.regenerate(&mut self.raster, &view)?;
        }
        Ok(())
    }

    fn collect_dependencies(
        &self,
        idx: usize,
        visited: &mut hashbrown::HashSet<BufferId>,
        order: &mut Vec<usize>,
    ) {
        if !visited.insert(self.buffers[idx].id()) {
            // Either a shared dependency (fine) or a merge cycle (caller
            // bug); both are cut here.
            return;
        }
        for event in self.buffers[idx].events() {
            if event.undone() {
                continue;
            }
            if let Some(merge) = event.buffer_merge() {
                if let Some(source_idx) = self.buffer_index(merge.source) {
                    self.collect_dependencies(source_idx, visited, order);
                }
            }
        }
        order.push(idx);
    }

    /// A mutation with footprint `region` landed in `changed`. Chase the
    /// merge back-reference chain: each consumer replays the damaged region
    /// from its merge event's position.
    fn propagate_damage(
        &mut self,
        changed: BufferId,
        region: Option<PixelRect>,
    ) -> Result<(), CapacityError> {
        let Some(region) = region else {
            return Ok(());
        };
        let mut visited = hashbrown::HashSet::new();
        let mut current = changed;
        while let Some(consumer) = self
            .buffer_index(current)
            .and_then(|idx| self.buffers[idx].merged_to())
        {
            if !visited.insert(consumer) {
                debug_assert!(false, "merge cycle");
                log::warn!("merge cycle through {consumer}");
                break;
            }
            let Some(consumer_idx) = self.buffer_index(consumer) else {
                log::warn!("dangling merge back-reference to {consumer}");
                break;
            };
            let source_id = current;
            let Some(merge_idx) = self.buffers[consumer_idx].events().iter().position(|e| {
                !e.undone() && e.buffer_merge().is_some_and(|m| m.source == source_id)
            }) else {
                log::warn!("{consumer} back-referenced without a live merge event");
                break;
            };
            self.ensure_ready(consumer_idx)?;
            {
                let (buffer, view) = split_sources(&mut self.buffers, consumer_idx);
                buffer.playback_region(merge_idx, region, &mut self.raster, &view);
            }
            current = consumer;
        }
        Ok(())
    }
}
