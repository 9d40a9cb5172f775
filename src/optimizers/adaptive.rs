//! Per-weight adaptive learning rates: Adagrad, RMSprop and Adadelta.

/// Adagrad: `c += g²`, `w -= η g / (√c + ε)`.
pub fn adagrad(grad: f64, cache: &mut f64, weight: &mut f64, lr: f64, eps: f64) {
    *cache += grad * grad;
    *weight -= lr * grad / (cache.sqrt() + eps);
}

/// RMSprop: `c = ρ c + (1 - ρ) g²`, `w -= η g / (√c + ε)`.
pub fn rmsprop(grad: f64, cache: &mut f64, weight: &mut f64, lr: f64, rho: f64, eps: f64) {
    *cache = rho * *cache + (1.0 - rho) * grad * grad;
    *weight -= lr * grad / (cache.sqrt() + eps);
}

/// Adadelta.
///
/// ```text
/// Eg  = ρ Eg + (1 - ρ) g²
/// Δ   = -√(Ex + ε) / √(Eg + ε) * g
/// Ex  = ρ Ex + (1 - ρ) Δ²
/// w  += η Δ
/// ```
///
/// The rule is learning-rate free; `lr` defaults to 1 when selected by name.
pub fn adadelta(
    grad: f64,
    grad_sq: &mut f64,
    update_sq: &mut f64,
    weight: &mut f64,
    lr: f64,
    rho: f64,
    eps: f64,
) {
    *grad_sq = rho * *grad_sq + (1.0 - rho) * grad * grad;
    let delta = -((*update_sq + eps).sqrt() / (*grad_sq + eps).sqrt()) * grad;
    *update_sq = rho * *update_sq + (1.0 - rho) * delta * delta;
    *weight += lr * delta;
}
