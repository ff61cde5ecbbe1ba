//! Smoothing kernel capabilities needed by the neighbour search.
//!
//! The search itself never evaluates kernel weights. It only needs the
//! kernel's support extent (to decide which pairs interact) and the
//! gravitational potential kernel at zero separation (the self-potential
//! added before the gravity stages).

/// Smoothing kernel queried by the search stages.
pub trait SmoothingKernel: Send + Sync {
    /// Support extent in units of h (the kernel vanishes for r > kern_range * h).
    fn kern_range(&self) -> f32;

    /// Dimensionless gravitational potential kernel at s = r / h.
    fn wpot(&self, s: f32) -> f32;
}

/// M4 cubic spline kernel (Monaghan & Lattanzio 1985), support radius 2h.
///
/// The potential kernel is the softened 1/r of Price & Monaghan (2007):
///
/// ```text
/// wpot(s) = 7/5 - 2/3 s^2 + 3/10 s^4 - 1/10 s^5                         s < 1
/// wpot(s) = -1/(15 s) + 8/5 - 4/3 s^2 + s^3 - 3/10 s^4 + 1/30 s^5       1 <= s < 2
/// wpot(s) = 1/s                                                          s >= 2
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct M4Kernel;

impl SmoothingKernel for M4Kernel {
    fn kern_range(&self) -> f32 {
        2.0
    }

    fn wpot(&self, s: f32) -> f32 {
        let s2 = s * s;
        let s4 = s2 * s2;
        if s < 1.0 {
            1.4 - (2.0 / 3.0) * s2 + 0.3 * s4 - 0.1 * s4 * s
        } else if s < 2.0 {
            -1.0 / (15.0 * s) + 1.6 - (4.0 / 3.0) * s2 + s2 * s - 0.3 * s4 + s4 * s / 30.0
        } else {
            1.0 / s
        }
    }
}
