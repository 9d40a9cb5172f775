//! Per-weight optimizer state machine
//!
//! An [`Optimizer`] is an immutable bundle of hyperparameters (update rule, learning rate,
//! weight decay) plus an epoch counter. It maps one gradient, the three persistent
//! accumulators owned by a weight, and the weight itself to an updated weight:
//!
//! ```text
//! update(grad, &acc1, &acc2, &acc3, &weight)
//! ```
//!
//! Weight decay is applied first (`w -= lr * decay * w`), then the rule selected by
//! [`UpdateRule`] runs. The accumulators belong to the layer that owns the weight
//! ([`ParamState`]); the optimizer itself never stores per-weight state, so one instance
//! serves every layer of a network.
//!
//! # Available Rules
//!
//! | Rule | Accumulators |
//! |---|---|
//! | SGD | none |
//! | Momentum | acc1 = velocity |
//! | Adagrad | acc1 = cumulative squared gradient |
//! | RMSprop | acc1 = EMA of squared gradient |
//! | Adadelta | acc1 = EMA grad², acc2 = EMA update² |
//! | Nesterov | acc1 = velocity |
//! | Adam | acc1 = first moment, acc2 = second moment |
//! | AdaMax | acc1 = first moment, acc2 = running max of abs(grad) |
//! | Nadam | as Adam, with Nesterov lookahead on the momentum term |
//! | AMSGrad | as Adam, acc3 = running max of acc2 |
//! | AdaBound | as Adam, step size clamped to epoch-dependent bounds |
//!
//! Bias correction and the AdaBound bounds use `t = epoch + 1`. The epoch counter is
//! advanced once per training epoch with [`Optimizer::advance_epoch`], never per update.

pub mod adam;
pub mod adaptive;
pub mod sgd;

use crate::config::Params;
use crate::error::{Error, Result};
use std::fmt;

/// Update rule and its rule-specific hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    Sgd,
    Momentum { momentum: f64 },
    Adagrad { eps: f64 },
    RmsProp { rho: f64, eps: f64 },
    Adadelta { rho: f64, eps: f64 },
    Nesterov { momentum: f64 },
    Adam { beta1: f64, beta2: f64, eps: f64 },
    AdaMax { beta1: f64, beta2: f64, eps: f64 },
    Nadam { beta1: f64, beta2: f64, eps: f64 },
    AmsGrad { beta1: f64, beta2: f64, eps: f64 },
    AdaBound { beta1: f64, beta2: f64, final_lr: f64, gamma: f64 },
}

pub const DEFAULT_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_MOMENTUM: f64 = 0.9;
pub const DEFAULT_RHO: f64 = 0.9;
pub const DEFAULT_BETA1: f64 = 0.9;
pub const DEFAULT_BETA2: f64 = 0.999;
pub const DEFAULT_EPS: f64 = 1e-8;
pub const DEFAULT_FINAL_LR: f64 = 0.1;
pub const DEFAULT_GAMMA: f64 = 1e-3;

impl UpdateRule {
    /// Builds a rule from its name, reading rule-specific keys from `params`.
    pub fn from_params(name: &str, params: &Params) -> Result<Self> {
        let beta1 = || params.get_or("beta1", DEFAULT_BETA1);
        let beta2 = || params.get_or("beta2", DEFAULT_BETA2);
        let eps = || params.get_or("eps", DEFAULT_EPS);

        let rule = match name {
            "sgd" => UpdateRule::Sgd,
            "momentum" => UpdateRule::Momentum {
                momentum: params.get_or("momentum", DEFAULT_MOMENTUM)?,
            },
            "adagrad" => UpdateRule::Adagrad { eps: eps()? },
            "rmsprop" => UpdateRule::RmsProp {
                rho: params.get_or("rho", DEFAULT_RHO)?,
                eps: eps()?,
            },
            "adadelta" => UpdateRule::Adadelta {
                rho: params.get_or("rho", 0.95)?,
                eps: params.get_or("eps", 1e-6)?,
            },
            "nesterov" | "nag" => UpdateRule::Nesterov {
                momentum: params.get_or("momentum", DEFAULT_MOMENTUM)?,
            },
            "adam" => UpdateRule::Adam {
                beta1: beta1()?,
                beta2: beta2()?,
                eps: eps()?,
            },
            "adamax" => UpdateRule::AdaMax {
                beta1: beta1()?,
                beta2: beta2()?,
                eps: eps()?,
            },
            "nadam" => UpdateRule::Nadam {
                beta1: beta1()?,
                beta2: beta2()?,
                eps: eps()?,
            },
            "amsgrad" => UpdateRule::AmsGrad {
                beta1: beta1()?,
                beta2: beta2()?,
                eps: eps()?,
            },
            "adabound" => UpdateRule::AdaBound {
                beta1: beta1()?,
                beta2: beta2()?,
                final_lr: params.get_or("final_lr", DEFAULT_FINAL_LR)?,
                gamma: params.get_or("gamma", DEFAULT_GAMMA)?,
            },
            other => return Err(Error::UnknownOptimizer(other.to_string())),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateRule::Sgd => "sgd",
            UpdateRule::Momentum { .. } => "momentum",
            UpdateRule::Adagrad { .. } => "adagrad",
            UpdateRule::RmsProp { .. } => "rmsprop",
            UpdateRule::Adadelta { .. } => "adadelta",
            UpdateRule::Nesterov { .. } => "nesterov",
            UpdateRule::Adam { .. } => "adam",
            UpdateRule::AdaMax { .. } => "adamax",
            UpdateRule::Nadam { .. } => "nadam",
            UpdateRule::AmsGrad { .. } => "amsgrad",
            UpdateRule::AdaBound { .. } => "adabound",
        }
    }

    fn validate(&self) -> Result<()> {
        let unit = |key: &str, v: f64| -> Result<()> {
            if v.is_finite() && (0.0..1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::InvalidParameter {
                    key: key.to_string(),
                    value: v.to_string(),
                })
            }
        };
        let positive = |key: &str, v: f64| -> Result<()> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidParameter {
                    key: key.to_string(),
                    value: v.to_string(),
                })
            }
        };

        match *self {
            UpdateRule::Sgd => Ok(()),
            UpdateRule::Momentum { momentum } | UpdateRule::Nesterov { momentum } => {
                unit("momentum", momentum)
            }
            UpdateRule::Adagrad { eps } => positive("eps", eps),
            UpdateRule::RmsProp { rho, eps } | UpdateRule::Adadelta { rho, eps } => {
                unit("rho", rho)?;
                positive("eps", eps)
            }
            UpdateRule::Adam { beta1, beta2, eps }
            | UpdateRule::AdaMax { beta1, beta2, eps }
            | UpdateRule::Nadam { beta1, beta2, eps }
            | UpdateRule::AmsGrad { beta1, beta2, eps } => {
                unit("beta1", beta1)?;
                unit("beta2", beta2)?;
                positive("eps", eps)
            }
            UpdateRule::AdaBound {
                beta1,
                beta2,
                final_lr,
                gamma,
            } => {
                unit("beta1", beta1)?;
                unit("beta2", beta2)?;
                positive("final_lr", final_lr)?;
                positive("gamma", gamma)
            }
        }
    }
}

/// The three persistent accumulators owned by each weight of a parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamState {
    pub acc1: Vec<f64>,
    pub acc2: Vec<f64>,
    pub acc3: Vec<f64>,
}

impl ParamState {
    pub fn new(len: usize) -> Self {
        Self {
            acc1: vec![0.0; len],
            acc2: vec![0.0; len],
            acc3: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.acc1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acc1.is_empty()
    }

    /// Zeroes every accumulator.
    pub fn reset(&mut self) {
        for acc in [&mut self.acc1, &mut self.acc2, &mut self.acc3] {
            acc.iter_mut().for_each(|a| *a = 0.0);
        }
    }
}

/// Hyperparameter bundle plus epoch counter.
///
/// # Example
///
/// ```
/// use rust_convnet::optimizers::{Optimizer, UpdateRule};
///
/// let opt = Optimizer::new(UpdateRule::Sgd, 0.1);
/// let (mut a1, mut a2, mut a3) = (0.0, 0.0, 0.0);
/// let mut w = 1.0;
/// opt.update(0.5, &mut a1, &mut a2, &mut a3, &mut w);
/// assert!((w - 0.95).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Optimizer {
    rule: UpdateRule,
    learning_rate: f64,
    decay: f64,
    epoch: u64,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(UpdateRule::Sgd, DEFAULT_LEARNING_RATE)
    }
}

impl Optimizer {
    pub fn new(rule: UpdateRule, learning_rate: f64) -> Self {
        Self {
            rule,
            learning_rate,
            decay: 0.0,
            epoch: 0,
        }
    }

    /// Sets the weight-decay coefficient.
    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    /// Builds an optimizer from `optimizer=<rule> lr=<f64> decay=<f64> ...` lookups.
    pub fn from_params(params: &Params) -> Result<Self> {
        let name = params.get_str("optimizer").unwrap_or("sgd");
        let rule = UpdateRule::from_params(name, params)?;
        let default_lr = match rule {
            UpdateRule::Adadelta { .. } => 1.0,
            UpdateRule::Adam { .. }
            | UpdateRule::AdaMax { .. }
            | UpdateRule::Nadam { .. }
            | UpdateRule::AmsGrad { .. }
            | UpdateRule::AdaBound { .. } => 0.001,
            _ => DEFAULT_LEARNING_RATE,
        };
        let learning_rate = params.get_or("lr", default_lr)?;
        let decay: f64 = params.get_or("decay", 0.0)?;
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(Error::InvalidParameter {
                key: "lr".to_string(),
                value: learning_rate.to_string(),
            });
        }
        if !(decay.is_finite() && decay >= 0.0) {
            return Err(Error::InvalidParameter {
                key: "decay".to_string(),
                value: decay.to_string(),
            });
        }
        Ok(Self::new(rule, learning_rate).with_decay(decay))
    }

    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Advance the epoch counter. Call once per training epoch.
    pub fn advance_epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn reset_epoch(&mut self) {
        self.epoch = 0;
    }

    /// Time step used for bias correction.
    fn step(&self) -> i32 {
        (self.epoch + 1).min(i32::MAX as u64) as i32
    }

    /// Update a single weight in place.
    pub fn update(
        &self,
        grad: f64,
        acc1: &mut f64,
        acc2: &mut f64,
        acc3: &mut f64,
        weight: &mut f64,
    ) {
        let lr = self.learning_rate;
        *weight -= lr * self.decay * *weight;

        match self.rule {
            UpdateRule::Sgd => sgd::plain(grad, weight, lr),
            UpdateRule::Momentum { momentum } => sgd::momentum(grad, acc1, weight, lr, momentum),
            UpdateRule::Nesterov { momentum } => sgd::nesterov(grad, acc1, weight, lr, momentum),
            UpdateRule::Adagrad { eps } => adaptive::adagrad(grad, acc1, weight, lr, eps),
            UpdateRule::RmsProp { rho, eps } => adaptive::rmsprop(grad, acc1, weight, lr, rho, eps),
            UpdateRule::Adadelta { rho, eps } => {
                adaptive::adadelta(grad, acc1, acc2, weight, lr, rho, eps)
            }
            UpdateRule::Adam { beta1, beta2, eps } => adam::adam(
                grad,
                acc1,
                acc2,
                weight,
                adam::Moments::new(lr, beta1, beta2, eps, self.step()),
            ),
            UpdateRule::AdaMax { beta1, beta2, eps } => adam::adamax(
                grad,
                acc1,
                acc2,
                weight,
                adam::Moments::new(lr, beta1, beta2, eps, self.step()),
            ),
            UpdateRule::Nadam { beta1, beta2, eps } => adam::nadam(
                grad,
                acc1,
                acc2,
                weight,
                adam::Moments::new(lr, beta1, beta2, eps, self.step()),
            ),
            UpdateRule::AmsGrad { beta1, beta2, eps } => adam::amsgrad(
                grad,
                acc1,
                acc2,
                acc3,
                weight,
                adam::Moments::new(lr, beta1, beta2, eps, self.step()),
            ),
            UpdateRule::AdaBound {
                beta1,
                beta2,
                final_lr,
                gamma,
            } => adam::adabound(
                grad,
                acc1,
                acc2,
                weight,
                adam::Moments::new(lr, beta1, beta2, DEFAULT_EPS, self.step()),
                final_lr,
                gamma,
            ),
        }
    }

    /// Update a parameter group from summed gradients.
    ///
    /// Each gradient is multiplied by `scale` (typically `1 / batch_size`) before the update.
    pub fn update_group(
        &self,
        weights: &mut [f64],
        grad_sums: &[f64],
        scale: f64,
        state: &mut ParamState,
    ) {
        assert_eq!(
            weights.len(),
            grad_sums.len(),
            "Parameters and gradients must have the same length"
        );
        assert_eq!(weights.len(), state.len(), "optimizer state length mismatch");

        let accumulators = state
            .acc1
            .iter_mut()
            .zip(state.acc2.iter_mut())
            .zip(state.acc3.iter_mut());
        for ((w, &g), ((a1, a2), a3)) in weights.iter_mut().zip(grad_sums).zip(accumulators) {
            self.update(g * scale, a1, a2, a3, w);
        }
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (lr={}, decay={}, epoch={})",
            self.rule.name(),
            self.learning_rate,
            self.decay,
            self.epoch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(opt: &Optimizer, grads: &[f64], w0: f64) -> (f64, [f64; 3]) {
        let (mut a1, mut a2, mut a3) = (0.0, 0.0, 0.0);
        let mut w = w0;
        for &g in grads {
            opt.update(g, &mut a1, &mut a2, &mut a3, &mut w);
        }
        (w, [a1, a2, a3])
    }

    #[test]
    fn test_weight_decay_applied_first() {
        let opt = Optimizer::new(UpdateRule::Sgd, 0.1).with_decay(0.5);
        let (w, _) = run(&opt, &[0.0], 2.0);
        // w -= 0.1 * 0.5 * 2.0
        assert!((w - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_every_rule_descends_on_positive_gradient() {
        let names = [
            "sgd", "momentum", "adagrad", "rmsprop", "adadelta", "nesterov", "adam", "adamax",
            "nadam", "amsgrad", "adabound",
        ];
        for name in names {
            let opt = Optimizer::from_params(&Params::from_pairs([("optimizer", name)])).unwrap();
            let (w, _) = run(&opt, &[0.5, 0.5, 0.5], 1.0);
            assert!(w < 1.0, "{} did not descend: {}", name, w);
        }
    }

    #[test]
    fn test_unknown_optimizer() {
        let err = Optimizer::from_params(&Params::from_pairs([("optimizer", "lion")])).unwrap_err();
        assert!(matches!(err, Error::UnknownOptimizer(_)));
    }

    #[test]
    fn test_invalid_hyperparameters_rejected() {
        let params = Params::from_pairs([("optimizer", "adam"), ("beta1", "1.5")]);
        assert!(Optimizer::from_params(&params).is_err());
        let params = Params::from_pairs([("optimizer", "sgd"), ("lr", "-1")]);
        assert!(Optimizer::from_params(&params).is_err());
    }

    #[test]
    fn test_epoch_advances_only_explicitly() {
        let mut opt = Optimizer::from_params(&Params::from_pairs([("optimizer", "adam")])).unwrap();
        let (_, _) = run(&opt, &[1.0; 10], 0.0);
        assert_eq!(opt.epoch(), 0);
        opt.advance_epoch();
        assert_eq!(opt.epoch(), 1);
        opt.reset_epoch();
        assert_eq!(opt.epoch(), 0);
    }

    #[test]
    fn test_update_group_scales_gradients() {
        let opt = Optimizer::new(UpdateRule::Sgd, 1.0);
        let mut weights = vec![1.0, 2.0];
        let mut state = ParamState::new(2);
        opt.update_group(&mut weights, &[4.0, -4.0], 0.25, &mut state);
        assert_eq!(weights, vec![0.0, 3.0]);
    }

    #[test]
    fn test_param_state_reset() {
        let opt = Optimizer::new(UpdateRule::Momentum { momentum: 0.9 }, 0.1);
        let mut weights = vec![1.0];
        let mut state = ParamState::new(1);
        opt.update_group(&mut weights, &[1.0], 1.0, &mut state);
        assert!(state.acc1[0] != 0.0);
        state.reset();
        assert_eq!(state, ParamState::new(1));
    }
}
