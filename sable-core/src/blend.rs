//! # Blending
//!
//! The closed set of blend modes an event may carry, plus the per-channel
//! math used by the CPU surface. Each mode is a pure function of
//! `(base, top)` per channel; alpha composites with the usual separable
//! source-over rule. `Erase` is alpha-only and handled in [`composite`]
//! directly. Erasing on an alpha-less surface is redefined by the surface to
//! mean "paint with the surface's own clear color".

#[derive(strum::AsRefStr, strum::EnumIter, PartialEq, Eq, Copy, Clone, Hash, Debug)]
#[repr(u8)]
pub enum BlendMode {
    Normal = 0,
    Erase = 1,
    Multiply = 2,
    Screen = 3,
    Overlay = 4,
    HardLight = 5,
    SoftLight = 6,
    Darken = 7,
    Lighten = 8,
    Difference = 9,
    Exclusion = 10,
    ColorDodge = 11,
    ColorBurn = 12,
    LinearDodge = 13,
    LinearBurn = 14,
}
impl Default for BlendMode {
    fn default() -> Self {
        Self::Normal
    }
}
impl BlendMode {
    /// Wire tag. Stable across versions; see the `io` module.
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|mode| mode.tag() == tag)
    }
    /// The separable per-channel function `B(base, top)`, both in `[0, 1]`.
    ///
    /// `Erase` has no color component and returns the base unchanged.
    #[must_use]
    pub fn channel(self, b: f32, t: f32) -> f32 {
        match self {
            Self::Normal => t,
            Self::Erase => b,
            Self::Multiply => b * t,
            Self::Screen => b + t - b * t,
            // Overlay is HardLight with the operands swapped.
            Self::Overlay => Self::HardLight.channel(t, b),
            Self::HardLight => {
                if t <= 0.5 {
                    2.0 * b * t
                } else {
                    1.0 - 2.0 * (1.0 - b) * (1.0 - t)
                }
            }
            Self::SoftLight => {
                if t <= 0.5 {
                    b - (1.0 - 2.0 * t) * b * (1.0 - b)
                } else {
                    let d = if b <= 0.25 {
                        ((16.0 * b - 12.0) * b + 4.0) * b
                    } else {
                        b.sqrt()
                    };
                    b + (2.0 * t - 1.0) * (d - b)
                }
            }
            Self::Darken => b.min(t),
            Self::Lighten => b.max(t),
            Self::Difference => (b - t).abs(),
            Self::Exclusion => b + t - 2.0 * b * t,
            Self::ColorDodge => {
                if b <= 0.0 {
                    0.0
                } else if t >= 1.0 {
                    1.0
                } else {
                    (b / (1.0 - t)).min(1.0)
                }
            }
            Self::ColorBurn => {
                if b >= 1.0 {
                    1.0
                } else if t <= 0.0 {
                    0.0
                } else {
                    1.0 - ((1.0 - b) / t).min(1.0)
                }
            }
            Self::LinearDodge => (b + t).min(1.0),
            Self::LinearBurn => (b + t - 1.0).max(0.0),
        }
    }
}

/// Blend settings for a drawable event: a mode and an opacity modulate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Blend {
    pub mode: BlendMode,
    pub opacity: f32,
}
impl Default for Blend {
    fn default() -> Self {
        Self {
            mode: BlendMode::default(),
            opacity: 1.0,
        }
    }
}

/// Composite one straight-alpha source sample over a straight-alpha base
/// pixel.
///
/// `base` is `[r, g, b, a]`; the source is `color` (rgb) at coverage-derived
/// alpha `top_alpha`. The per-channel mode mixes toward the plain source
/// color where the base is transparent:
/// `c_mix = (1 - a_b) * c_t + a_b * B(c_b, c_t)`, then source-over:
/// `a_out = a_t + a_b * (1 - a_t)`,
/// `c_out = (a_t * c_mix + a_b * c_b * (1 - a_t)) / a_out`.
#[must_use]
pub fn composite(mode: BlendMode, base: [f32; 4], color: [f32; 3], top_alpha: f32) -> [f32; 4] {
    let at = top_alpha.clamp(0.0, 1.0);
    if at <= 0.0 {
        return base;
    }
    let ab = base[3].clamp(0.0, 1.0);
    if mode == BlendMode::Erase {
        return [base[0], base[1], base[2], ab * (1.0 - at)];
    }
    let a_out = at + ab * (1.0 - at);
    if a_out <= 0.0 {
        return [0.0, 0.0, 0.0, 0.0];
    }
    let mut out = [0.0f32; 4];
    for ch in 0..3 {
        let cb = base[ch].clamp(0.0, 1.0);
        let ct = color[ch].clamp(0.0, 1.0);
        let mixed = (1.0 - ab) * ct + ab * mode.channel(cb, ct);
        out[ch] = (at * mixed + ab * cb * (1.0 - at)) / a_out;
    }
    out[3] = a_out;
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn tags_round_trip() {
        for mode in BlendMode::iter() {
            assert_eq!(BlendMode::from_tag(mode.tag()), Some(mode));
        }
        assert_eq!(BlendMode::from_tag(200), None);
    }

    #[test]
    fn channel_stays_in_unit_range() {
        let samples = [0.0, 0.25, 0.5, 0.75, 1.0];
        for mode in BlendMode::iter() {
            for &b in &samples {
                for &t in &samples {
                    let v = mode.channel(b, t);
                    assert!(
                        (0.0..=1.0).contains(&v),
                        "{} out of range: B({b}, {t}) = {v}",
                        mode.as_ref()
                    );
                }
            }
        }
    }

    #[test]
    fn normal_over_opaque() {
        let out = composite(BlendMode::Normal, [0.2, 0.4, 0.6, 1.0], [1.0, 0.0, 0.0], 0.5);
        assert!((out[0] - 0.6).abs() < 1e-5);
        assert!((out[1] - 0.2).abs() < 1e-5);
        assert!((out[3] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normal_over_transparent_is_source() {
        let out = composite(BlendMode::Normal, [0.0, 0.0, 0.0, 0.0], [0.3, 0.6, 0.9], 0.5);
        assert!((out[0] - 0.3).abs() < 1e-5);
        assert!((out[3] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn erase_reduces_alpha_only() {
        let out = composite(BlendMode::Erase, [0.2, 0.4, 0.6, 0.8], [1.0, 1.0, 1.0], 0.5);
        assert!((out[3] - 0.4).abs() < 1e-5);
        assert!((out[0] - 0.2).abs() < 1e-5);
    }

    #[test]
    fn zero_alpha_source_is_identity() {
        let base = [0.1, 0.2, 0.3, 0.4];
        for mode in BlendMode::iter() {
            assert_eq!(composite(mode, base, [0.9, 0.9, 0.9], 0.0), base);
        }
    }

    #[test]
    fn multiply_darkens() {
        let out = composite(BlendMode::Multiply, [0.5, 0.5, 0.5, 1.0], [0.5, 0.5, 0.5], 1.0);
        assert!((out[0] - 0.25).abs() < 1e-5);
    }
}
