//! Output curves applied to normalized magnitudes
//!
//! Curves operate on a signed value in [-1, 1] and preserve its sign. The custom
//! bezier curve is baked into a 256-entry lookup table when the profile loads so
//! the per-tick path stays a constant-time interpolation.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Newton-Raphson iterations used when solving the bezier for t
const BEZIER_ITERATIONS: usize = 8;
const BEZIER_EPSILON: f64 = 1e-6;

/// Output curve selection as stored in a profile
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputCurve {
    #[default]
    Linear,
    /// Three-segment piecewise-linear curve favouring small deflections
    EnhancedPrecision,
    Quadratic,
    Cubic,
    EaseOutQuad,
    EaseOutCubic,
    /// Cubic bezier from (0,0) to (1,1) through two control points
    Bezier { x1: f64, y1: f64, x2: f64, y2: f64 },
}

/// Cubic bezier with fixed end points (0,0) and (1,1)
#[derive(Debug, Clone, Copy, PartialEq)]
struct BezierCurve {
    p1: (f64, f64),
    p2: (f64, f64),
}

impl BezierCurve {
    fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Option<Self> {
        let valid = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if valid(x1) && valid(y1) && valid(x2) && valid(y2) {
            Some(Self {
                p1: (x1, y1),
                p2: (x2, y2),
            })
        } else {
            None
        }
    }

    fn component(t: f64, c1: f64, c2: f64) -> f64 {
        let mt = 1.0 - t;
        3.0 * mt * mt * t * c1 + 3.0 * mt * t * t * c2 + t * t * t
    }

    fn component_derivative(t: f64, c1: f64, c2: f64) -> f64 {
        let mt = 1.0 - t;
        3.0 * mt * mt * c1 + 6.0 * mt * t * (c2 - c1) + 3.0 * t * t * (1.0 - c2)
    }

    /// Solves x(t) = x, falling back to bisection if the derivative vanishes
    fn find_t_for_x(&self, x: f64) -> f64 {
        let mut t = x;
        for _ in 0..BEZIER_ITERATIONS {
            let error = Self::component(t, self.p1.0, self.p2.0) - x;
            if error.abs() < BEZIER_EPSILON {
                return t;
            }
            let slope = Self::component_derivative(t, self.p1.0, self.p2.0);
            if slope.abs() < BEZIER_EPSILON {
                break;
            }
            t = (t - error / slope).clamp(0.0, 1.0);
        }

        let (mut lo, mut hi) = (0.0, 1.0);
        for _ in 0..32 {
            let mid = (lo + hi) / 2.0;
            if Self::component(mid, self.p1.0, self.p2.0) < x {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        (lo + hi) / 2.0
    }

    fn map(&self, x: f64) -> f64 {
        let t = self.find_t_for_x(x.clamp(0.0, 1.0));
        Self::component(t, self.p1.1, self.p2.1).clamp(0.0, 1.0)
    }
}

/// Pre-computed lookup table for bezier evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct CurveLut {
    table: [f64; CurveLut::SIZE],
}

impl CurveLut {
    pub const SIZE: usize = 256;

    fn from_bezier(curve: &BezierCurve) -> Self {
        let mut table = [0.0; Self::SIZE];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = curve.map(i as f64 / (Self::SIZE - 1) as f64);
        }
        Self { table }
    }

    /// Linear interpolation between the two nearest entries
    pub fn lookup(&self, input: f64) -> f64 {
        let input = input.clamp(0.0, 1.0);
        let scaled = input * (Self::SIZE - 1) as f64;
        let index = scaled.floor() as usize;
        if index >= Self::SIZE - 1 {
            return self.table[Self::SIZE - 1];
        }
        let frac = scaled - index as f64;
        self.table[index] + (self.table[index + 1] - self.table[index]) * frac
    }
}

/// Runtime curve, resolved once from an [`OutputCurve`]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ShapingCurve {
    #[default]
    Linear,
    EnhancedPrecision,
    Quadratic,
    Cubic,
    EaseOutQuad,
    EaseOutCubic,
    Lut(Box<CurveLut>),
}

impl ShapingCurve {
    pub fn resolve(curve: &OutputCurve) -> Self {
        match *curve {
            OutputCurve::Linear => Self::Linear,
            OutputCurve::EnhancedPrecision => Self::EnhancedPrecision,
            OutputCurve::Quadratic => Self::Quadratic,
            OutputCurve::Cubic => Self::Cubic,
            OutputCurve::EaseOutQuad => Self::EaseOutQuad,
            OutputCurve::EaseOutCubic => Self::EaseOutCubic,
            OutputCurve::Bezier { x1, y1, x2, y2 } => match BezierCurve::new(x1, y1, x2, y2) {
                Some(bezier) => Self::Lut(Box::new(CurveLut::from_bezier(&bezier))),
                None => {
                    debug!(
                        "Ignoring malformed bezier curve ({}, {}, {}, {}), using linear",
                        x1, y1, x2, y2
                    );
                    Self::Linear
                }
            },
        }
    }

    /// Applies the curve to a signed normalized value, preserving its sign
    pub fn apply(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let sign = value.signum();
        let x = value.abs().min(1.0);
        let y = match self {
            Self::Linear => x,
            Self::EnhancedPrecision => {
                if x <= 0.4 {
                    0.8 * x
                } else if x <= 0.75 {
                    x - 0.08
                } else {
                    1.32 * x - 0.32
                }
            }
            Self::Quadratic => x * x,
            Self::Cubic => x * x * x,
            Self::EaseOutQuad => -x * (x - 2.0),
            Self::EaseOutCubic => {
                let t = x - 1.0;
                t * t * t + 1.0
            }
            Self::Lut(lut) => lut.lookup(x),
        };
        sign * y.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn presets_hit_end_points() {
        let curves = [
            ShapingCurve::Linear,
            ShapingCurve::EnhancedPrecision,
            ShapingCurve::Quadratic,
            ShapingCurve::Cubic,
            ShapingCurve::EaseOutQuad,
            ShapingCurve::EaseOutCubic,
        ];
        for curve in curves {
            assert!(curve.apply(0.0).abs() < 1e-9, "{:?}", curve);
            assert!((curve.apply(1.0) - 1.0).abs() < 1e-9, "{:?}", curve);
            assert!((curve.apply(-1.0) + 1.0).abs() < 1e-9, "{:?}", curve);
        }
    }

    #[test]
    fn enhanced_precision_segments_are_continuous() {
        let curve = ShapingCurve::EnhancedPrecision;
        assert!((curve.apply(0.4) - 0.32).abs() < 1e-9);
        assert!((curve.apply(0.75) - 0.67).abs() < 1e-9);
        assert!((curve.apply(0.7500001) - 0.67).abs() < 1e-5);
    }

    #[test]
    fn malformed_bezier_falls_back_to_linear() {
        let curve = ShapingCurve::resolve(&OutputCurve::Bezier {
            x1: 1.5,
            y1: 0.0,
            x2: 0.5,
            y2: f64::NAN,
        });
        assert_eq!(curve, ShapingCurve::Linear);
    }

    #[test]
    fn identity_bezier_is_close_to_linear() {
        let curve = ShapingCurve::resolve(&OutputCurve::Bezier {
            x1: 0.25,
            y1: 0.25,
            x2: 0.75,
            y2: 0.75,
        });
        for i in 0..=20 {
            let x = i as f64 / 20.0;
            assert!((curve.apply(x) - x).abs() < 0.01, "x = {}", x);
        }
    }

    proptest! {
        #[test]
        fn quadratic_and_cubic_are_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for curve in [ShapingCurve::Quadratic, ShapingCurve::Cubic] {
                prop_assert!(curve.apply(lo) <= curve.apply(hi));
            }
        }

        #[test]
        fn curves_preserve_sign(v in -1.0f64..=1.0) {
            let curve = ShapingCurve::EaseOutCubic;
            let out = curve.apply(v);
            prop_assert!(out == 0.0 || out.signum() == v.signum());
        }
    }
}
