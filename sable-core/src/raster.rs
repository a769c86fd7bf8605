//! # Rasterization seams
//!
//! The engine is indifferent to where pixels live. [`Rasterizer`] produces a
//! scalar coverage mask for one event; [`Surface`] owns a buffer's RGBA
//! storage and composites masks, other surfaces, and imported images into it.
//! A GPU-texture backend implements the same pair of traits; the CPU types
//! here are the reference implementation and what the test suite runs on.
//!
//! Calls after [`Rasterizer::set_clip`] affect exactly the clipped region.

use crate::blend::{self, Blend, BlendMode};
use crate::color::Color;
use crate::util::PixelRect;

/// A bitmap or snapshot allocation failed. Applying an event is atomic with
/// respect to this: either the bitmap and the log both update, or neither.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    #[error("cannot allocate {width}x{height} pixel storage")]
    Exhausted { width: u32, height: u32 },
}

fn alloc_f32(len: usize, width: u32, height: u32) -> Result<Vec<f32>, CapacityError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| CapacityError::Exhausted { width, height })?;
    data.resize(len, 0.0);
    Ok(data)
}

/// Converts one drawable event into an alpha mask, one scalar per pixel.
pub trait Rasterizer {
    fn set_clip(&mut self, clip: PixelRect);
    /// Zero the mask within the clip rectangle.
    fn clear(&mut self);
    /// Accumulate one antialiased dab. `alpha` is the dab's flow; dabs
    /// composite over whatever coverage is already present.
    ///
    /// `rotation` exists for textured tips; a circular tip ignores it.
    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, alpha: f32, rotation: f32);
    /// Overwrite the clipped region with a 0..1 ramp from `from` to `to`.
    fn linear_gradient(&mut self, from: [f32; 2], to: [f32; 2]);
    fn coverage(&self, x: u32, y: u32) -> f32;
    /// Release the mask storage. The rasterizer must not be used afterwards.
    fn free(&mut self);
}

/// Raw straight-alpha RGBA8 pixels for an imported image.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes, row-major.
    pub pixels: Vec<u8>,
}
impl ImageData {
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(4))
            == Some(self.pixels.len())
    }
}

/// A buffer's pixel storage: the live bitmap of one layer, or a composite
/// target. Blend modes are the closed set in [`crate::blend`]; `Erase`
/// against an alpha-less surface is redefined to mean "paint with the
/// surface's own clear color".
pub trait Surface: Sized {
    type Mask: Rasterizer;
    /// Whole-bitmap state capture, used by the checkpoint cache.
    type Snapshot;

    fn new(width: u32, height: u32, clear_color: Color, has_alpha: bool)
        -> Result<Self, CapacityError>;
    fn new_mask(width: u32, height: u32) -> Result<Self::Mask, CapacityError>;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn rect(&self) -> PixelRect {
        PixelRect::from_size(self.width(), self.height())
    }
    fn clear_color(&self) -> Color;
    fn has_alpha(&self) -> bool;

    /// Fill the clipped region with `color`.
    fn clear(&mut self, clip: PixelRect, color: Color);
    /// Composite `mask` (at `color`, modulated by `blend`) into the clipped
    /// region.
    fn draw_mask(&mut self, clip: PixelRect, mask: &Self::Mask, color: Color, blend: Blend);
    /// Source-over composite another surface of identical dimensions.
    fn draw_surface(&mut self, clip: PixelRect, other: &Self, opacity: f32);
    /// Source-over composite imported pixels with their top-left at `at`.
    fn blit_rgba(&mut self, clip: PixelRect, image: &ImageData, at: [u32; 2]);
    fn pixel(&self, x: u32, y: u32) -> Color;

    fn snapshot(&self) -> Result<Self::Snapshot, CapacityError>;
    /// Copy the clipped region of `snapshot` onto the live surface.
    fn restore(&mut self, snapshot: &Self::Snapshot, clip: PixelRect);
    /// Refresh the clipped region of `snapshot` from the live surface.
    fn store(&self, snapshot: &mut Self::Snapshot, clip: PixelRect);
}

/// CPU coverage mask.
pub struct CpuMask {
    width: u32,
    height: u32,
    clip: PixelRect,
    data: Vec<f32>,
}
impl CpuMask {
    pub fn new(width: u32, height: u32) -> Result<Self, CapacityError> {
        let len = width as usize * height as usize;
        Ok(Self {
            width,
            height,
            clip: PixelRect::from_size(width, height),
            data: alloc_f32(len, width, height)?,
        })
    }
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}
impl Rasterizer for CpuMask {
    fn set_clip(&mut self, clip: PixelRect) {
        self.clip = clip.intersect(PixelRect::from_size(self.width, self.height));
    }
    fn clear(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let clip = self.clip;
        for y in clip.top..clip.bottom {
            let row = self.index(clip.left, y)..self.index(clip.right, y);
            self.data[row].fill(0.0);
        }
    }
    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, alpha: f32, _rotation: f32) {
        if self.data.is_empty() || radius <= 0.0 || alpha <= 0.0 {
            return;
        }
        // Sub-pixel dabs keep a half-pixel footprint with their lost area
        // folded into alpha, so thin strokes don't alias away entirely.
        let (radius, alpha) = if radius < 0.5 {
            (0.5, alpha * (radius / 0.5) * (radius / 0.5))
        } else {
            (radius, alpha.min(1.0))
        };
        let bounds = PixelRect::from_float_bounds(
            x - radius - 1.0,
            y - radius - 1.0,
            x + radius + 1.0,
            y + radius + 1.0,
            self.clip,
        );
        for py in bounds.top..bounds.bottom {
            for px in bounds.left..bounds.right {
                let dx = px as f32 + 0.5 - x;
                let dy = py as f32 + 0.5 - y;
                let dist = (dx * dx + dy * dy).sqrt();
                // Antialias over a one-pixel band at the rim.
                let cov = (radius - dist + 0.5).clamp(0.0, 1.0);
                if cov <= 0.0 {
                    continue;
                }
                let a = alpha * cov;
                let idx = self.index(px, py);
                let m = self.data[idx];
                self.data[idx] = m + a * (1.0 - m);
            }
        }
    }
    fn linear_gradient(&mut self, from: [f32; 2], to: [f32; 2]) {
        if self.data.is_empty() {
            return;
        }
        let dx = to[0] - from[0];
        let dy = to[1] - from[1];
        let len_sq = dx * dx + dy * dy;
        let clip = self.clip;
        for py in clip.top..clip.bottom {
            for px in clip.left..clip.right {
                let t = if len_sq <= f32::EPSILON {
                    1.0
                } else {
                    let px_c = px as f32 + 0.5 - from[0];
                    let py_c = py as f32 + 0.5 - from[1];
                    ((px_c * dx + py_c * dy) / len_sq).clamp(0.0, 1.0)
                };
                let idx = self.index(px, py);
                self.data[idx] = t;
            }
        }
    }
    fn coverage(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height || self.data.is_empty() {
            return 0.0;
        }
        self.data[self.index(x, y)]
    }
    fn free(&mut self) {
        self.data = Vec::new();
    }
}

/// Snapshot of a [`CpuSurface`]: the full pixel array.
#[derive(Debug, PartialEq)]
pub struct CpuSnapshot {
    data: Vec<f32>,
}

/// CPU surface: straight-alpha RGBA, one `f32` per channel.
pub struct CpuSurface {
    width: u32,
    height: u32,
    clear_color: Color,
    has_alpha: bool,
    data: Vec<f32>,
}
impl CpuSurface {
    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }
    fn base_fill(&self) -> Color {
        if self.has_alpha {
            Color::TRANSPARENT
        } else {
            self.clear_color.opaque()
        }
    }
    fn put(&mut self, x: u32, y: u32, mut value: [f32; 4]) {
        if !self.has_alpha {
            value[3] = 1.0;
        }
        let idx = self.index(x, y);
        self.data[idx..idx + 4].copy_from_slice(&value);
    }
    fn get(&self, x: u32, y: u32) -> [f32; 4] {
        let idx = self.index(x, y);
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }
}
impl Surface for CpuSurface {
    type Mask = CpuMask;
    type Snapshot = CpuSnapshot;

    fn new(
        width: u32,
        height: u32,
        clear_color: Color,
        has_alpha: bool,
    ) -> Result<Self, CapacityError> {
        let len = width as usize * height as usize * 4;
        let mut surface = Self {
            width,
            height,
            clear_color,
            has_alpha,
            data: alloc_f32(len, width, height)?,
        };
        let base = surface.base_fill();
        surface.clear(surface.rect(), base);
        Ok(surface)
    }
    fn new_mask(width: u32, height: u32) -> Result<Self::Mask, CapacityError> {
        CpuMask::new(width, height)
    }
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn clear_color(&self) -> Color {
        self.clear_color
    }
    fn has_alpha(&self) -> bool {
        self.has_alpha
    }
    fn clear(&mut self, clip: PixelRect, color: Color) {
        let clip = clip.intersect(self.rect());
        let mut value = color.as_array();
        if !self.has_alpha {
            value[3] = 1.0;
        }
        for y in clip.top..clip.bottom {
            for x in clip.left..clip.right {
                let idx = self.index(x, y);
                self.data[idx..idx + 4].copy_from_slice(&value);
            }
        }
    }
    fn draw_mask(&mut self, clip: PixelRect, mask: &Self::Mask, color: Color, blend: Blend) {
        let clip = clip.intersect(self.rect());
        // Alpha-less surfaces have no transparency to erase into; erasing
        // paints the clear color instead.
        let (mode, rgb) = if blend.mode == BlendMode::Erase && !self.has_alpha {
            let c = self.clear_color;
            (BlendMode::Normal, [c.r(), c.g(), c.b()])
        } else {
            (blend.mode, [color.r(), color.g(), color.b()])
        };
        let opacity = blend.opacity.clamp(0.0, 1.0);
        for y in clip.top..clip.bottom {
            for x in clip.left..clip.right {
                let cov = mask.coverage(x, y);
                if cov <= 0.0 {
                    continue;
                }
                let out = blend::composite(mode, self.get(x, y), rgb, cov * opacity);
                self.put(x, y, out);
            }
        }
    }
    fn draw_surface(&mut self, clip: PixelRect, other: &Self, opacity: f32) {
        debug_assert_eq!(
            (self.width, self.height),
            (other.width, other.height),
            "composited surfaces must share dimensions"
        );
        let clip = clip.intersect(self.rect()).intersect(other.rect());
        let opacity = opacity.clamp(0.0, 1.0);
        for y in clip.top..clip.bottom {
            for x in clip.left..clip.right {
                let top = other.get(x, y);
                let a = top[3] * opacity;
                if a <= 0.0 {
                    continue;
                }
                let out = blend::composite(
                    BlendMode::Normal,
                    self.get(x, y),
                    [top[0], top[1], top[2]],
                    a,
                );
                self.put(x, y, out);
            }
        }
    }
    fn blit_rgba(&mut self, clip: PixelRect, image: &ImageData, at: [u32; 2]) {
        if !image.is_well_formed() {
            log::warn!("skipping malformed image blit");
            return;
        }
        let dest = PixelRect {
            left: at[0],
            top: at[1],
            right: at[0].saturating_add(image.width),
            bottom: at[1].saturating_add(image.height),
        };
        let clip = clip.intersect(self.rect()).intersect(dest);
        for y in clip.top..clip.bottom {
            for x in clip.left..clip.right {
                let sx = (x - at[0]) as usize;
                let sy = (y - at[1]) as usize;
                let src = (sy * image.width as usize + sx) * 4;
                let px: [u8; 4] = image.pixels[src..src + 4].try_into().unwrap();
                let a = f32::from(px[3]) / 255.0;
                if a <= 0.0 {
                    continue;
                }
                let rgb = [
                    f32::from(px[0]) / 255.0,
                    f32::from(px[1]) / 255.0,
                    f32::from(px[2]) / 255.0,
                ];
                let out = blend::composite(BlendMode::Normal, self.get(x, y), rgb, a);
                self.put(x, y, out);
            }
        }
    }
    fn pixel(&self, x: u32, y: u32) -> Color {
        if x >= self.width || y >= self.height {
            return Color::TRANSPARENT;
        }
        let [r, g, b, a] = self.get(x, y);
        // Channels never leave the finite range by construction.
        Color::new(r, g, b, a).unwrap_or(Color::TRANSPARENT)
    }
    fn snapshot(&self) -> Result<Self::Snapshot, CapacityError> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())
            .map_err(|_| CapacityError::Exhausted {
                width: self.width,
                height: self.height,
            })?;
        data.extend_from_slice(&self.data);
        Ok(CpuSnapshot { data })
    }
    fn restore(&mut self, snapshot: &Self::Snapshot, clip: PixelRect) {
        debug_assert_eq!(snapshot.data.len(), self.data.len());
        let clip = clip.intersect(self.rect());
        for y in clip.top..clip.bottom {
            let range = self.index(clip.left, y)..self.index(clip.right, y);
            self.data[range.clone()].copy_from_slice(&snapshot.data[range]);
        }
    }
    fn store(&self, snapshot: &mut Self::Snapshot, clip: PixelRect) {
        debug_assert_eq!(snapshot.data.len(), self.data.len());
        let clip = clip.intersect(self.rect());
        for y in clip.top..clip.bottom {
            let range = self.index(clip.left, y)..self.index(clip.right, y);
            snapshot.data[range.clone()].copy_from_slice(&self.data[range]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rect(l: u32, t: u32, r: u32, b: u32) -> PixelRect {
        PixelRect {
            left: l,
            top: t,
            right: r,
            bottom: b,
        }
    }

    #[test]
    fn mask_respects_clip() {
        let mut mask = CpuMask::new(16, 16).unwrap();
        mask.set_clip(rect(0, 0, 8, 16));
        mask.fill_circle(8.0, 8.0, 6.0, 1.0, 0.0);
        assert!(mask.coverage(5, 8) > 0.9);
        // Other side of the clip boundary stays untouched.
        assert_eq!(mask.coverage(10, 8), 0.0);
    }

    #[test]
    fn mask_clear_is_clipped() {
        let mut mask = CpuMask::new(8, 8).unwrap();
        mask.set_clip(rect(0, 0, 8, 8));
        mask.fill_circle(4.0, 4.0, 10.0, 1.0, 0.0);
        mask.set_clip(rect(0, 0, 4, 8));
        mask.clear();
        assert_eq!(mask.coverage(1, 4), 0.0);
        assert!(mask.coverage(6, 4) > 0.9);
    }

    #[test]
    fn gradient_ramps() {
        let mut mask = CpuMask::new(10, 1).unwrap();
        mask.set_clip(rect(0, 0, 10, 1));
        mask.linear_gradient([0.0, 0.0], [10.0, 0.0]);
        assert!(mask.coverage(0, 0) < 0.1);
        assert!(mask.coverage(9, 0) > 0.9);
        let mid = mask.coverage(5, 0);
        assert!((mid - 0.55).abs() < 0.1);
    }

    #[test]
    fn surface_new_fills_base() {
        let opaque =
            CpuSurface::new(4, 4, Color::from_rgba8([12, 23, 34, 255]), false).unwrap();
        assert_eq!(opaque.pixel(0, 0).to_rgba8(), [12, 23, 34, 255]);
        let transparent = CpuSurface::new(4, 4, Color::TRANSPARENT, true).unwrap();
        assert_eq!(transparent.pixel(0, 0).to_rgba8()[3], 0);
    }

    #[test]
    fn draw_mask_composites() {
        let mut surface = CpuSurface::new(4, 4, Color::BLACK, false).unwrap();
        surface.clear(surface.rect(), Color::BLACK);
        let mut mask = CpuMask::new(4, 4).unwrap();
        mask.set_clip(rect(0, 0, 4, 4));
        mask.fill_circle(2.0, 2.0, 8.0, 1.0, 0.0);
        surface.draw_mask(
            surface.rect(),
            &mask,
            Color::WHITE,
            Blend {
                mode: BlendMode::Normal,
                opacity: 0.5,
            },
        );
        let px = surface.pixel(2, 2).to_rgba8();
        assert!((i32::from(px[0]) - 128).abs() <= 2);
    }

    #[test]
    fn erase_on_alphaless_paints_clear_color() {
        let clear = Color::from_rgba8([10, 20, 30, 255]);
        let mut surface = CpuSurface::new(4, 4, clear, false).unwrap();
        surface.clear(surface.rect(), Color::WHITE);
        let mut mask = CpuMask::new(4, 4).unwrap();
        mask.set_clip(rect(0, 0, 4, 4));
        mask.fill_circle(2.0, 2.0, 8.0, 1.0, 0.0);
        surface.draw_mask(
            surface.rect(),
            &mask,
            Color::WHITE,
            Blend {
                mode: BlendMode::Erase,
                opacity: 1.0,
            },
        );
        assert_eq!(surface.pixel(2, 2).to_rgba8(), [10, 20, 30, 255]);
    }

    #[test]
    fn snapshot_restore_region() {
        let mut surface = CpuSurface::new(8, 8, Color::TRANSPARENT, true).unwrap();
        let snap = surface.snapshot().unwrap();
        surface.clear(surface.rect(), Color::WHITE);
        surface.restore(&snap, rect(0, 0, 4, 8));
        assert_eq!(surface.pixel(1, 1).a(), 0.0);
        assert_eq!(surface.pixel(6, 1).to_rgba8(), [255, 255, 255, 255]);
    }

    #[test]
    fn blit_composites_alpha() {
        let mut surface = CpuSurface::new(4, 4, Color::BLACK, false).unwrap();
        surface.clear(surface.rect(), Color::BLACK);
        let image = ImageData {
            width: 2,
            height: 2,
            pixels: vec![255, 0, 0, 255, 255, 0, 0, 255, 255, 0, 0, 255, 255, 0, 0, 255],
        };
        surface.blit_rgba(surface.rect(), &image, [1, 1]);
        assert_eq!(surface.pixel(0, 0).to_rgba8(), [0, 0, 0, 255]);
        assert_eq!(surface.pixel(1, 1).to_rgba8(), [255, 0, 0, 255]);
        assert_eq!(surface.pixel(2, 2).to_rgba8(), [255, 0, 0, 255]);
        assert_eq!(surface.pixel(3, 3).to_rgba8(), [0, 0, 0, 255]);
    }
}
