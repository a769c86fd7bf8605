//! # Events
//!
//! One immutable-after-creation edit record in a buffer's history. Events
//! know their own bounding box and how to rasterize themselves; everything
//! else (ordering, undo state, playback) is the buffer's business.
//!
//! Within one buffer's log, events from the same session appear in
//! non-decreasing `seq` order. That invariant is load-bearing: "latest event
//! by author" and insertion-point placement both depend on it.

use crate::blend::Blend;
use crate::color::Color;
use crate::id::{BufferId, SessionId};
use crate::raster::{ImageData, Rasterizer};
use crate::util::PixelRect;

/// One control point of a stroke. The dab radius is the stroke radius scaled
/// by `pressure`.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct StrokePoint {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
}

/// A freehand stroke of circular dabs. Also the payload of scatter events,
/// which drop one dab per point without interpolating between them.
#[derive(Clone, PartialEq, Debug)]
pub struct BrushStroke {
    pub blend: Blend,
    pub color: Color,
    /// Per-dab alpha. Event-level opacity lives in `blend`.
    pub flow: f32,
    pub radius: f32,
    pub points: Vec<StrokePoint>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Gradient {
    pub blend: Blend,
    pub color: Color,
    pub from: [f32; 2],
    pub to: [f32; 2],
}

#[derive(Clone, PartialEq, Debug)]
pub struct ImageImport {
    pub image: ImageData,
    /// Destination top-left, in buffer pixels.
    pub at: [u32; 2],
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BufferCreate {
    pub buffer: BufferId,
    pub clear_color: Color,
    pub has_alpha: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BufferRemove {
    pub buffer: BufferId,
}

/// Composite `source`'s bitmap into the buffer holding this event, retiring
/// `source` from the stack while the merge stands.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BufferMerge {
    pub source: BufferId,
    pub opacity: f32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BufferMove {
    pub buffer: BufferId,
    pub from: usize,
    pub to: usize,
}

/// Suppress another event (addressed by session and sequence number) in the
/// same buffer. Hides stack: an event is hidden while any non-undone hide
/// targets it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EventHide {
    pub session: SessionId,
    pub seq: u32,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Payload {
    BrushStroke(BrushStroke),
    ScatterStroke(BrushStroke),
    Gradient(Gradient),
    ImageImport(ImageImport),
    BufferCreate(BufferCreate),
    BufferRemove(BufferRemove),
    BufferMerge(BufferMerge),
    BufferMove(BufferMove),
    EventHide(EventHide),
}

#[derive(Clone, Debug)]
pub struct Event {
    session: SessionId,
    seq: u32,
    undone: bool,
    hide_count: u32,
    generation: u64,
    pub payload: Payload,
}
impl Event {
    #[must_use]
    pub fn new(session: SessionId, seq: u32, payload: Payload) -> Self {
        Self {
            session,
            seq,
            undone: false,
            hide_count: 0,
            generation: 0,
            payload,
        }
    }
    #[must_use]
    pub fn new_undone(session: SessionId, seq: u32, payload: Payload) -> Self {
        Self {
            undone: true,
            ..Self::new(session, seq, payload)
        }
    }
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }
    #[must_use]
    pub fn undone(&self) -> bool {
        self.undone
    }
    pub(crate) fn set_undone(&mut self, undone: bool) {
        self.undone = undone;
    }
    /// Hidden while any non-undone `EventHide` targets this event.
    #[must_use]
    pub fn hidden(&self) -> bool {
        self.hide_count > 0
    }
    #[must_use]
    pub fn hide_count(&self) -> u32 {
        self.hide_count
    }
    /// Returns the new count.
    pub(crate) fn add_hide(&mut self) -> u32 {
        self.hide_count += 1;
        self.hide_count
    }
    /// Returns the new count. Removing below zero is a caller bug.
    pub(crate) fn remove_hide(&mut self) -> u32 {
        debug_assert!(self.hide_count > 0, "hide count underflow");
        self.hide_count = self.hide_count.saturating_sub(1);
        self.hide_count
    }
    /// Forget all hides, for log truncation paths where the hiding events
    /// themselves are discarded.
    pub(crate) fn reset_hides(&mut self) {
        self.hide_count = 0;
    }
    /// Bumped whenever rasterizable content changes. Backends that cache a
    /// rasterization of this event key it by `(event, generation)`.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
    /// Extend an in-progress stroke. Returns false (and does nothing) for
    /// non-stroke payloads.
    pub fn push_stroke_point(&mut self, point: StrokePoint) -> bool {
        match &mut self.payload {
            Payload::BrushStroke(stroke) | Payload::ScatterStroke(stroke) => {
                stroke.points.push(point);
                self.generation += 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn brush_stroke(&self) -> Option<&BrushStroke> {
        match &self.payload {
            Payload::BrushStroke(s) | Payload::ScatterStroke(s) => Some(s),
            _ => None,
        }
    }
    #[must_use]
    pub fn buffer_create(&self) -> Option<&BufferCreate> {
        match &self.payload {
            Payload::BufferCreate(c) => Some(c),
            _ => None,
        }
    }
    #[must_use]
    pub fn buffer_merge(&self) -> Option<&BufferMerge> {
        match &self.payload {
            Payload::BufferMerge(m) => Some(m),
            _ => None,
        }
    }
    #[must_use]
    pub fn buffer_move(&self) -> Option<&BufferMove> {
        match &self.payload {
            Payload::BufferMove(m) => Some(m),
            _ => None,
        }
    }
    #[must_use]
    pub fn event_hide(&self) -> Option<&EventHide> {
        match &self.payload {
            Payload::EventHide(h) => Some(h),
            _ => None,
        }
    }

    /// Rasterizer-drawable events: mask plus color plus blend.
    #[must_use]
    pub fn is_drawable(&self) -> bool {
        matches!(
            self.payload,
            Payload::BrushStroke(_) | Payload::ScatterStroke(_) | Payload::Gradient(_)
        )
    }
    /// The color and blend settings a drawable composites with.
    #[must_use]
    pub fn paint(&self) -> Option<(Color, Blend)> {
        match &self.payload {
            Payload::BrushStroke(s) | Payload::ScatterStroke(s) => Some((s.color, s.blend)),
            Payload::Gradient(g) => Some((g.color, g.blend)),
            _ => None,
        }
    }

    /// The pixels this event can touch, intersected with `full` (the buffer
    /// rectangle). `None` means the event has no pixel footprint at all -
    /// stack moves, removals and hides are bookkeeping only.
    #[must_use]
    pub fn bounding_box(&self, full: PixelRect) -> Option<PixelRect> {
        match &self.payload {
            Payload::BrushStroke(s) | Payload::ScatterStroke(s) => {
                let mut out = PixelRect::EMPTY;
                for p in &s.points {
                    let r = (s.radius * p.pressure).max(0.0) + 1.0;
                    out = out.union(PixelRect::from_float_bounds(
                        p.x - r,
                        p.y - r,
                        p.x + r,
                        p.y + r,
                        full,
                    ));
                }
                Some(out)
            }
            Payload::Gradient(_) | Payload::BufferCreate(_) | Payload::BufferMerge(_) => Some(full),
            Payload::ImageImport(import) => {
                let dest = PixelRect {
                    left: import.at[0],
                    top: import.at[1],
                    right: import.at[0].saturating_add(import.image.width),
                    bottom: import.at[1].saturating_add(import.image.height),
                };
                Some(dest.intersect(full))
            }
            Payload::BufferRemove(_) | Payload::BufferMove(_) | Payload::EventHide(_) => None,
        }
    }

    /// Draw this event's coverage into `mask`, which must already be clipped.
    /// Clears the clipped region first. No-op for non-drawable payloads.
    pub fn rasterize<M: Rasterizer>(&self, mask: &mut M) {
        mask.clear();
        match &self.payload {
            Payload::BrushStroke(stroke) => {
                let mut last: Option<StrokePoint> = None;
                for &point in &stroke.points {
                    if let Some(prev) = last {
                        interpolate_dabs(mask, stroke, prev, point);
                    } else {
                        dab(mask, stroke, point);
                    }
                    last = Some(point);
                }
            }
            Payload::ScatterStroke(stroke) => {
                for &point in &stroke.points {
                    dab(mask, stroke, point);
                }
            }
            Payload::Gradient(gradient) => {
                mask.linear_gradient(gradient.from, gradient.to);
            }
            _ => {
                debug_assert!(false, "rasterize called on a non-drawable event");
            }
        }
    }
}

fn dab<M: Rasterizer>(mask: &mut M, stroke: &BrushStroke, point: StrokePoint) {
    mask.fill_circle(
        point.x,
        point.y,
        stroke.radius * point.pressure,
        stroke.flow,
        0.0,
    );
}

/// Step dabs along the segment `(prev, point]` at a radius-relative spacing.
fn interpolate_dabs<M: Rasterizer>(
    mask: &mut M,
    stroke: &BrushStroke,
    prev: StrokePoint,
    point: StrokePoint,
) {
    let dx = point.x - prev.x;
    let dy = point.y - prev.y;
    let dist = (dx * dx + dy * dy).sqrt();
    let spacing = (stroke.radius * 0.4).max(0.5);
    let steps = (dist / spacing).ceil().max(1.0) as u32;
    for step in 1..=steps {
        let t = step as f32 / steps as f32;
        dab(
            mask,
            stroke,
            StrokePoint {
                x: prev.x + dx * t,
                y: prev.y + dy * t,
                pressure: prev.pressure + (point.pressure - prev.pressure) * t,
            },
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raster::{CpuMask, Rasterizer};

    fn stroke_at(x: f32, y: f32, radius: f32, flow: f32) -> Payload {
        Payload::BrushStroke(BrushStroke {
            blend: Blend::default(),
            color: Color::BLACK,
            flow,
            radius,
            points: vec![StrokePoint {
                x,
                y,
                pressure: 1.0,
            }],
        })
    }

    #[test]
    fn stroke_bounding_box_clamped() {
        let full = PixelRect::from_size(32, 32);
        let e = Event::new(SessionId(1), 0, stroke_at(2.0, 2.0, 50.0, 1.0));
        assert_eq!(e.bounding_box(full), Some(full));
        let small = Event::new(SessionId(1), 1, stroke_at(16.0, 16.0, 2.0, 1.0));
        let bb = small.bounding_box(full).unwrap();
        assert!(bb.contains(16, 16));
        assert!(!bb.contains(0, 0));
    }

    #[test]
    fn structural_events_have_no_footprint() {
        let full = PixelRect::from_size(8, 8);
        let hide = Event::new(
            SessionId(1),
            0,
            Payload::EventHide(EventHide {
                session: SessionId(1),
                seq: 0,
            }),
        );
        assert_eq!(hide.bounding_box(full), None);
        let merge = Event::new(
            SessionId(1),
            1,
            Payload::BufferMerge(BufferMerge {
                source: BufferId(2),
                opacity: 1.0,
            }),
        );
        assert_eq!(merge.bounding_box(full), Some(full));
    }

    #[test]
    fn stroke_point_bumps_generation() {
        let mut e = Event::new(SessionId(1), 0, stroke_at(1.0, 1.0, 2.0, 1.0));
        assert_eq!(e.generation(), 0);
        assert!(e.push_stroke_point(StrokePoint {
            x: 2.0,
            y: 2.0,
            pressure: 1.0,
        }));
        assert_eq!(e.generation(), 1);
        let mut hide = Event::new(
            SessionId(1),
            1,
            Payload::EventHide(EventHide {
                session: SessionId(1),
                seq: 0,
            }),
        );
        assert!(!hide.push_stroke_point(StrokePoint {
            x: 0.0,
            y: 0.0,
            pressure: 1.0,
        }));
    }

    #[test]
    fn rasterize_covers_stroke_path() {
        let mut mask = CpuMask::new(32, 8).unwrap();
        mask.set_clip(PixelRect::from_size(32, 8));
        let mut e = Event::new(SessionId(1), 0, stroke_at(4.0, 4.0, 3.0, 1.0));
        e.push_stroke_point(StrokePoint {
            x: 28.0,
            y: 4.0,
            pressure: 1.0,
        });
        e.rasterize(&mut mask);
        // Interpolated dabs cover the middle of the segment too.
        assert!(mask.coverage(16, 4) > 0.5);
    }

    #[test]
    fn hide_counter_saturates() {
        let mut e = Event::new(SessionId(1), 0, stroke_at(0.0, 0.0, 1.0, 1.0));
        assert!(!e.hidden());
        assert_eq!(e.add_hide(), 1);
        assert!(e.hidden());
        assert_eq!(e.remove_hide(), 0);
        assert!(!e.hidden());
    }
}
