//! Gradient descent rules: plain SGD, classical momentum and Nesterov momentum.
//!
//! Each function updates one weight in place; `velocity` is the weight's first accumulator.

/// `w = w - η * g`
pub fn plain(grad: f64, weight: &mut f64, lr: f64) {
    *weight -= lr * grad;
}

/// Classical momentum.
///
/// ```text
/// v = μ v - η g
/// w = w + v
/// ```
pub fn momentum(grad: f64, velocity: &mut f64, weight: &mut f64, lr: f64, mu: f64) {
    *velocity = mu * *velocity - lr * grad;
    *weight += *velocity;
}

/// Nesterov accelerated gradient in the "lookahead folded into the step" form.
///
/// ```text
/// v_prev = v
/// v = μ v - η g
/// w = w - μ v_prev + (1 + μ) v
/// ```
pub fn nesterov(grad: f64, velocity: &mut f64, weight: &mut f64, lr: f64, mu: f64) {
    let v_prev = *velocity;
    *velocity = mu * *velocity - lr * grad;
    *weight += -mu * v_prev + (1.0 + mu) * *velocity;
}
