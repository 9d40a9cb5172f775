//! Adam family: Adam, AdaMax, Nadam, AMSGrad and AdaBound.
//!
//! All five keep a first-moment estimate in `acc1` and a second-moment (or infinity-norm)
//! estimate in `acc2`, bias-corrected with the time step `t`:
//!
//! ```text
//! m = β1 m + (1 - β1) g
//! v = β2 v + (1 - β2) g²
//! m̂ = m / (1 - β1^t)
//! v̂ = v / (1 - β2^t)
//! ```
//!
//! # Reference
//!
//! Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
//! Luo, L. et al. (2019). Adaptive Gradient Methods with Dynamic Bound of Learning Rate.

/// Hyperparameters shared by the family, plus the bias-correction step.
#[derive(Debug, Clone, Copy)]
pub struct Moments {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub t: i32,
}

impl Moments {
    pub fn new(lr: f64, beta1: f64, beta2: f64, eps: f64, t: i32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            t: t.max(1),
        }
    }

    fn correction1(&self) -> f64 {
        1.0 - self.beta1.powi(self.t)
    }

    fn correction2(&self) -> f64 {
        1.0 - self.beta2.powi(self.t)
    }

    fn update_moments(&self, grad: f64, m: &mut f64, v: &mut f64) {
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
    }
}

pub fn adam(grad: f64, m: &mut f64, v: &mut f64, weight: &mut f64, h: Moments) {
    h.update_moments(grad, m, v);
    let m_hat = *m / h.correction1();
    let v_hat = *v / h.correction2();
    *weight -= h.lr * m_hat / (v_hat.sqrt() + h.eps);
}

/// AdaMax: `u = max(β2 u, |g|)`, `w -= η / (1 - β1^t) * m / (u + ε)`.
pub fn adamax(grad: f64, m: &mut f64, u: &mut f64, weight: &mut f64, h: Moments) {
    *m = h.beta1 * *m + (1.0 - h.beta1) * grad;
    *u = (h.beta2 * *u).max(grad.abs());
    *weight -= h.lr / h.correction1() * *m / (*u + h.eps);
}

/// Nadam: Adam with a Nesterov lookahead on the momentum term.
///
/// ```text
/// w -= η / (√v̂ + ε) * (β1 m̂ + (1 - β1) g / (1 - β1^t))
/// ```
pub fn nadam(grad: f64, m: &mut f64, v: &mut f64, weight: &mut f64, h: Moments) {
    h.update_moments(grad, m, v);
    let c1 = h.correction1();
    let m_hat = *m / c1;
    let v_hat = *v / h.correction2();
    let lookahead = h.beta1 * m_hat + (1.0 - h.beta1) * grad / c1;
    *weight -= h.lr * lookahead / (v_hat.sqrt() + h.eps);
}

/// AMSGrad: Adam normalized by the running maximum of the second moment.
pub fn amsgrad(
    grad: f64,
    m: &mut f64,
    v: &mut f64,
    v_max: &mut f64,
    weight: &mut f64,
    h: Moments,
) {
    h.update_moments(grad, m, v);
    *v_max = v_max.max(*v);
    let m_hat = *m / h.correction1();
    let v_hat = *v_max / h.correction2();
    *weight -= h.lr * m_hat / (v_hat.sqrt() + h.eps);
}

/// AdaBound: the per-weight step `η / (√v̂ + ε)` is clamped into
///
/// ```text
/// [final_lr (1 - 1 / (γ t + 1)), final_lr (1 + 1 / (γ t))]
/// ```
///
/// so the rule moves from Adam-like to SGD-like behaviour as `t` grows.
pub fn adabound(
    grad: f64,
    m: &mut f64,
    v: &mut f64,
    weight: &mut f64,
    h: Moments,
    final_lr: f64,
    gamma: f64,
) {
    h.update_moments(grad, m, v);
    let t = h.t as f64;
    let lower = final_lr * (1.0 - 1.0 / (gamma * t + 1.0));
    let upper = final_lr * (1.0 + 1.0 / (gamma * t));
    let m_hat = *m / h.correction1();
    let v_hat = *v / h.correction2();
    let step = (h.lr / (v_hat.sqrt() + h.eps)).clamp(lower, upper);
    *weight -= step * m_hat;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moments(t: i32) -> Moments {
        Moments::new(0.001, 0.9, 0.999, 1e-8, t)
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        // With bias correction the first step is ~lr * sign(g)
        let (mut m, mut v, mut w) = (0.0, 0.0, 1.0);
        adam(0.3, &mut m, &mut v, &mut w, moments(1));
        assert!((w - (1.0 - 0.001)).abs() < 1e-9);
    }

    #[test]
    fn test_bias_correction_depends_on_step() {
        let (mut m1, mut v1, mut w1) = (0.0, 0.0, 1.0);
        let (mut m2, mut v2, mut w2) = (0.0, 0.0, 1.0);
        adam(0.3, &mut m1, &mut v1, &mut w1, moments(1));
        adam(0.3, &mut m2, &mut v2, &mut w2, moments(50));
        // Same moments, but at a late step the correction no longer inflates them
        assert_eq!(m1, m2);
        assert!((1.0 - w2) < (1.0 - w1));
    }

    #[test]
    fn test_adamax_tracks_infinity_norm() {
        let (mut m, mut u, mut w) = (0.0, 0.0, 0.0);
        adamax(-2.0, &mut m, &mut u, &mut w, moments(1));
        assert_eq!(u, 2.0);
        adamax(0.5, &mut m, &mut u, &mut w, moments(1));
        assert!((u - 0.999 * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_amsgrad_keeps_max_second_moment() {
        let (mut m, mut v, mut vmax, mut w) = (0.0, 0.0, 0.0, 0.0);
        amsgrad(10.0, &mut m, &mut v, &mut vmax, &mut w, moments(1));
        let peak = vmax;
        for _ in 0..5 {
            amsgrad(0.01, &mut m, &mut v, &mut vmax, &mut w, moments(1));
        }
        assert!(v < peak);
        assert_eq!(vmax, peak);
    }

    #[test]
    fn test_nadam_moves_against_gradient() {
        let (mut m, mut v, mut w) = (0.0, 0.0, 0.0);
        nadam(1.0, &mut m, &mut v, &mut w, moments(1));
        assert!(w < 0.0);
    }

    #[test]
    fn test_adabound_clamps_to_upper_bound() {
        // Tiny gradient: the Adam step lr / sqrt(v_hat) would be huge, the bound caps it
        let (mut m, mut v, mut w) = (0.0, 0.0, 0.0);
        let h = Moments::new(1.0, 0.9, 0.999, 1e-8, 1);
        adabound(1e-6, &mut m, &mut v, &mut w, h, 0.1, 0.5);
        let upper = 0.1 * (1.0 + 1.0 / 0.5);
        let m_hat = 1e-6;
        assert!((w + upper * m_hat).abs() < 1e-15);
    }
}
