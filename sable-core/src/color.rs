//! Straight-alpha RGBA color. Channels are nominally in `[0, 1]` but HDR
//! values are not rejected - only non-finite ones are.

use crate::util::{FiniteF32, FiniteF32Error};

/// A straight (non-premultiplied) RGBA color.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, bytemuck::Zeroable, Debug)]
pub struct Color([FiniteF32; 4]);
impl Color {
    pub const TRANSPARENT: Self = Self([FiniteF32::ZERO; 4]);
    pub const WHITE: Self = Self([FiniteF32::ONE; 4]);
    pub const BLACK: Self = Self([
        FiniteF32::ZERO,
        FiniteF32::ZERO,
        FiniteF32::ZERO,
        FiniteF32::ONE,
    ]);
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Result<Self, FiniteF32Error> {
        Ok(Self([
            FiniteF32::new(r)?,
            FiniteF32::new(g)?,
            FiniteF32::new(b)?,
            FiniteF32::new(a)?,
        ]))
    }
    pub fn from_array([r, g, b, a]: [f32; 4]) -> Result<Self, FiniteF32Error> {
        Self::new(r, g, b, a)
    }
    /// 0-255 channels, as stored in the wire format.
    #[must_use]
    pub fn from_rgba8([r, g, b, a]: [u8; 4]) -> Self {
        let c = |v: u8| FiniteF32::new(f32::from(v) / 255.0).unwrap();
        Self([c(r), c(g), c(b), c(a)])
    }
    /// Clamped, rounded 0-255 channels for the wire format.
    #[must_use]
    pub fn to_rgba8(self) -> [u8; 4] {
        let c = |v: FiniteF32| (v.get().clamp(0.0, 1.0) * 255.0).round() as u8;
        [c(self.0[0]), c(self.0[1]), c(self.0[2]), c(self.0[3])]
    }
    #[must_use]
    pub fn as_array(self) -> [f32; 4] {
        [
            self.0[0].get(),
            self.0[1].get(),
            self.0[2].get(),
            self.0[3].get(),
        ]
    }
    #[must_use]
    pub fn r(self) -> f32 {
        self.0[0].get()
    }
    #[must_use]
    pub fn g(self) -> f32 {
        self.0[1].get()
    }
    #[must_use]
    pub fn b(self) -> f32 {
        self.0[2].get()
    }
    #[must_use]
    pub fn a(self) -> f32 {
        self.0[3].get()
    }
    /// Same color with alpha forced to one. Alpha-less buffers store these.
    #[must_use]
    pub fn opaque(self) -> Self {
        Self([self.0[0], self.0[1], self.0[2], FiniteF32::ONE])
    }
}
impl Default for Color {
    fn default() -> Self {
        Self::TRANSPARENT
    }
}

#[cfg(test)]
mod test {
    use super::Color;

    #[test]
    fn rgba8_round_trip() {
        let c = Color::from_rgba8([12, 23, 34, 255]);
        assert_eq!(c.to_rgba8(), [12, 23, 34, 255]);
    }

    #[test]
    fn to_rgba8_clamps() {
        let c = Color::new(2.0, -1.0, 0.5, 1.0).unwrap();
        assert_eq!(c.to_rgba8(), [255, 0, 128, 255]);
    }

    #[test]
    fn rejects_nan() {
        assert!(Color::new(f32::NAN, 0.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn opaque_forces_alpha() {
        let c = Color::from_rgba8([60, 120, 180, 150]).opaque();
        assert_eq!(c.to_rgba8()[3], 255);
    }
}
