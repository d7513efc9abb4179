//! Optimizer wrapper.

use std::sync::{Arc, Mutex, PoisonError};

use tch::{TchError, Tensor};

/// A wrapper around the torch's Adam optimizer with a certain learning rate
/// strategy.
pub struct Optimizer {
    /// Trainable variables.
    variables: Arc<Mutex<tch::nn::Variables>>,

    /// Adam itself. Its moments carry over from epoch to epoch.
    inner: tch::COptimizer,

    /// Optimizer configuration.
    cfg: OptimizerConfiguration,

    /// Current epoch.
    current_epoch: usize,

    /// The amount of steps in the warmup phase.
    warmup_steps: usize,

    /// The amount of steps after the warmup phase.
    normal_steps: usize,

    /// Size of the macro-batch. Defines for how long gradients are accumulated.
    macro_batch: usize,
}

/// Optimizer configuration.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct OptimizerConfiguration {
    /// How learning rate changes within the epoch.
    #[serde(default = "defaults::within_epoch")]
    pub within_epoch: LearningRateScheduler,

    /// How learning rate changes between the epochs.
    #[serde(default = "defaults::inter_epoch")]
    pub inter_epoch: EpochLearningRate,

    /// The minimum learning rate in the warmup phase.
    #[serde(default)]
    pub warmup: f64,

    /// Applies warmup for this proportion of each training data (0.0 to 1.0).
    #[serde(rename = "warmup_period", default)]
    pub warmup_steps: f64,

    /// Adam parameters.
    #[serde(default)]
    pub adam: AdamParameters,
}

impl Default for OptimizerConfiguration {
    fn default() -> Self {
        Self {
            within_epoch: defaults::within_epoch(),
            inter_epoch: defaults::inter_epoch(),
            warmup: 0.,
            warmup_steps: 0.,
            adam: AdamParameters::default(),
        }
    }
}

/// Adam hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct AdamParameters {
    /// Decay of the first moment.
    pub beta1: f64,
    /// Decay of the second moment.
    pub beta2: f64,
    /// Numerical stability constant.
    pub eps: f64,
    /// L2 penalty.
    pub weight_decay: f64,
}

impl Default for AdamParameters {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.,
        }
    }
}

mod defaults {
    use super::{EpochLearningRate, LearningRateScheduler};

    pub fn within_epoch() -> LearningRateScheduler {
        LearningRateScheduler::Constant
    }

    pub fn inter_epoch() -> EpochLearningRate {
        EpochLearningRate::Constant { base: 1e-3 }
    }
}

/// How learning rate changes from epoch to epoch.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochLearningRate {
    /// Do not modify base learning rate from epoch to epoch.
    Constant {
        /// Base learning rate. Can be modified by the learning rate scheduler
        /// within the epoch.
        base: f64,
    },
    /// The learning rate decreases linearly
    LinearDecrease {
        /// Base learning rate.
        base: f64,
        /// The learning rate is decreased by this amount each epoch.
        delta: f64,
        /// The learning rate won't go below this value.
        min: f64,
    },
    /// The learning rate decreases exponentially.
    ExponentDecrease {
        /// Base learning rate.
        base: f64,
        /// Every next epoch will have its base learning rate divided by this
        /// factor.
        factor: f64,
        /// The learning rate won't go below this value.
        min: f64,
    },
}

impl EpochLearningRate {
    /// Base learning rate of the given (zero-based) epoch.
    pub fn at_epoch(&self, epoch: usize) -> f64 {
        match *self {
            EpochLearningRate::Constant { base } => base,
            EpochLearningRate::LinearDecrease { base, delta, min } => {
                (base - delta * epoch as f64).max(min)
            }
            EpochLearningRate::ExponentDecrease { base, factor, min } => {
                (base / factor.powi(epoch as i32)).max(min)
            }
        }
    }
}

/// Learning rate scheduler variants.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateScheduler {
    /// Cosine annealing with warm restarts.
    CosineAnnealing {
        /// The amount of restarts within the epoch. Set to zero for no restarts
        /// at all.
        restarts: usize,
        /// The factor by which the learning rate is decreased during the
        /// training.
        factor: f64,
    },
    /// The learning rate doesn't change within the epoch.
    Constant,
}

/// Unable to initialize the optimizer.
#[derive(Debug, snafu::Snafu)]
#[snafu(context(false))]
pub enum InitError {
    /// The learning rate schedule is invalid.
    #[snafu(display("Invalid learning rate configuration"))]
    Config {
        /// Source error.
        source: ConfigError,
    },
    /// Torch refused to create the optimizer.
    #[snafu(display("Unable to create the optimizer"))]
    Torch {
        /// Source error.
        source: TchError,
    },
}

/// Invalid optimizer configuration.
#[derive(Debug, snafu::Snafu)]
pub enum ConfigError {
    /// Cosine annealing can't increase the learning rate.
    #[snafu(display("Cosine annealing factor must be greater than or equal to 1"))]
    AnnealingFactor,
    /// The decreasing schedules need a base above the floor.
    #[snafu(display("Base learning rate must be greater than the minimal"))]
    BaseBelowMin,
    /// The linear schedule needs a positive step.
    #[snafu(display("Learning rate delta must be greater than zero"))]
    Delta,
    /// The exponential schedule can't increase the learning rate.
    #[snafu(display("Epoch learning rate reduce factor must be greater than or equal to 1"))]
    ReduceFactor,
}

impl OptimizerConfiguration {
    /// Checks the schedules and returns the epoch at which the minimal base
    /// learning rate is reached, if any.
    pub fn validate(&self) -> Result<Option<f64>, ConfigError> {
        if let LearningRateScheduler::CosineAnnealing { factor, .. } = self.within_epoch {
            snafu::ensure!(factor >= 1., AnnealingFactorSnafu);
        }
        match self.inter_epoch {
            EpochLearningRate::Constant { .. } => Ok(None),
            EpochLearningRate::LinearDecrease { base, delta, min } => {
                snafu::ensure!(base > min, BaseBelowMinSnafu);
                snafu::ensure!(delta > 0., DeltaSnafu);
                Ok(Some(((base - min) / delta).ceil()))
            }
            EpochLearningRate::ExponentDecrease { base, factor, min } => {
                snafu::ensure!(base > min, BaseBelowMinSnafu);
                snafu::ensure!(factor >= 1., ReduceFactorSnafu);
                Ok(Some((base / min).log(factor).ceil()))
            }
        }
    }
}

/// Optimizer parameters for a single epoch.
pub struct EpochOptimizer<'a> {
    inner: &'a mut tch::COptimizer,

    variables: &'a Mutex<tch::nn::Variables>,

    adam: AdamParameters,

    /// Base learning rate for the current epoch.
    base_learning_rate: f64,

    /// Current step within the epoch.
    current_step: usize,

    /// Last set learning rate.
    last_lr: f64,

    /// Warm up minimum learning rate.
    warmup_lr: f64,

    /// The amount of steps in the warmup phase.
    warmup_steps: usize,
    /// The amount of steps after the warmup phase.
    normal_steps: usize,

    /// Size of the macro-batch. Defines for how long gradients are accumulated.
    macro_batch: usize,

    /// The amount of processed mini batches.
    mini_batches_processed: usize,

    /// Learning rate scheduler.
    scheduler: &'a LearningRateScheduler,
}

impl EpochOptimizer<'_> {
    /// Returns the base learning rate for the current epoch.
    pub fn base_learning_rate(&self) -> f64 {
        self.base_learning_rate
    }

    /// Finishes the epoch explicitly, applying the leftover gradients.
    pub fn finish(mut self) -> Result<(), TchError> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> Result<(), TchError> {
        if self.mini_batches_processed != 0 {
            self.mini_batches_processed = 0;
            self.inner.step()?;
            self.inner.zero_grad()?;
        }
        Ok(())
    }

    fn restart_every(&self, restarts: usize) -> usize {
        (self.normal_steps / (restarts + 1)).max(1)
    }

    /// Computes the learning rate for the current step.
    fn compute_lr(&self) -> f64 {
        let epoch_lr = self.base_learning_rate;

        if self.current_step < self.warmup_steps {
            let factor =
                self.current_step as f64 / self.warmup_steps.saturating_sub(1).max(1) as f64;
            (epoch_lr - self.warmup_lr) * factor + self.warmup_lr
        } else {
            let step = self.current_step - self.warmup_steps;
            match *self.scheduler {
                LearningRateScheduler::CosineAnnealing { restarts, factor } => {
                    let progress = step as f64 / self.restart_every(restarts) as f64 % 1.;

                    let min_lr = epoch_lr / factor;
                    let max_lr = epoch_lr;

                    let annealing = 0.5 + 0.5 * (progress * std::f64::consts::PI).cos();
                    min_lr + annealing * (max_lr - min_lr)
                }
                LearningRateScheduler::Constant => epoch_lr,
            }
        }
    }

    fn reset_when_required(&mut self) -> Result<(), TchError> {
        if self.current_step < self.warmup_steps {
            return Ok(());
        }
        let step = self.current_step - self.warmup_steps;
        if let LearningRateScheduler::CosineAnnealing { restarts, .. } = *self.scheduler {
            if step % self.restart_every(restarts) == 0 {
                // Reset momentum.
                self.reset_inner()?;
            }
        }
        Ok(())
    }

    /// Returns the current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.last_lr
    }

    /// Processes the mini batch.
    pub fn next_mini_batch(&mut self, loss: &Tensor) -> Result<(), TchError> {
        let lr = self.compute_lr();

        self.current_step += 1;
        self.last_lr = lr;
        self.inner.set_learning_rate(lr)?;

        // Compute (and accumulate) gradients.
        loss.backward();

        self.mini_batches_processed += 1;
        if self.mini_batches_processed == self.macro_batch {
            self.mini_batches_processed = 0;

            self.reset_when_required()?;

            // Perform the gradient descend for the accumulated gradients.
            self.inner.step()?;
            self.inner.zero_grad()?;
        }
        Ok(())
    }

    /// Resets internal optimizer, dropping the accumulated moments.
    pub fn reset_inner(&mut self) -> Result<(), TchError> {
        *self.inner = prepare_c_optimizer(self.variables, &self.adam)?;
        self.inner.set_learning_rate(self.last_lr)
    }
}

impl Drop for EpochOptimizer<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.finish_impl() {
            tracing::error!(%error, "Unable to apply the remaining gradients");
        }
    }
}

impl Optimizer {
    /// Initializes a new optimizer with the learning rate strategy.
    ///
    /// `total_steps` represents the amount of mini batches in an epoch.
    pub fn new(
        var_store: &tch::nn::VarStore,
        cfg: OptimizerConfiguration,
        total_steps: usize,
        macro_batch: usize,
    ) -> Result<Self, InitError> {
        let variables = Arc::clone(&var_store.variables_);

        let warmup_steps = cfg.warmup_steps.clamp(0., 1.) * total_steps as f64;
        let warmup_steps = (warmup_steps.round() as usize).min(total_steps);
        let normal_steps = total_steps - warmup_steps;

        if let Some(epochs) = cfg.validate()? {
            tracing::info!("The minimum base learning rate will be reached in {epochs} epochs");
        }

        let inner = prepare_c_optimizer(&variables, &cfg.adam)?;

        Ok(Self {
            variables,
            inner,
            cfg,
            current_epoch: 0,
            warmup_steps,
            normal_steps,
            macro_batch: macro_batch.max(1),
        })
    }

    /// Starts the epoch.
    pub fn start_epoch(&mut self) -> Result<EpochOptimizer<'_>, TchError> {
        let base_learning_rate = self.cfg.inter_epoch.at_epoch(self.current_epoch);
        self.current_epoch += 1;

        let warmup_lr = if self.warmup_steps == 0 {
            base_learning_rate
        } else {
            self.cfg.warmup
        };
        self.inner.set_learning_rate(warmup_lr)?;

        Ok(EpochOptimizer {
            inner: &mut self.inner,
            variables: &self.variables,
            adam: self.cfg.adam,
            base_learning_rate,
            current_step: 0,
            last_lr: warmup_lr,
            warmup_lr,
            warmup_steps: self.warmup_steps,
            normal_steps: self.normal_steps,
            macro_batch: self.macro_batch,
            mini_batches_processed: 0,
            scheduler: &self.cfg.within_epoch,
        })
    }
}

fn prepare_c_optimizer(
    variables: &Mutex<tch::nn::Variables>,
    adam: &AdamParameters,
) -> Result<tch::COptimizer, TchError> {
    let amsgrad = false;

    // The actual learning rate is set by the caller.
    let mut c_optimizer = tch::COptimizer::adam(
        1e-3,
        adam.beta1,
        adam.beta2,
        adam.weight_decay,
        adam.eps,
        amsgrad,
    )?;

    let vars = variables.lock().unwrap_or_else(PoisonError::into_inner);
    for var in &vars.trainable_variables {
        c_optimizer.add_parameters(&var.tensor, var.group)?;
    }

    Ok(c_optimizer)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_epoch_config() {
        #[derive(Debug, serde::Deserialize)]
        struct LrConfig {
            epoch: EpochLearningRate,
        }

        let LrConfig { epoch } = toml::from_str(
            r#"
[epoch.linear_decrease]
base = 0.5
delta = 0.1
min = 0.3
"#,
        )
        .unwrap();
        assert!(matches!(epoch, EpochLearningRate::LinearDecrease { .. }));
        assert_eq!(epoch.at_epoch(0), 0.5);
        assert!((epoch.at_epoch(1) - 0.4).abs() < 1e-12);
        assert_eq!(epoch.at_epoch(10), 0.3);

        let LrConfig { epoch } = toml::from_str(
            r#"
[epoch.constant]
base = 0.5
"#,
        )
        .unwrap();
        assert_eq!(epoch, EpochLearningRate::Constant { base: 0.5 });
        assert_eq!(epoch.at_epoch(7), 0.5);
    }

    #[test]
    fn check_scheduler_config() {
        #[derive(Debug, serde::Deserialize)]
        struct Cfg {
            inner: LearningRateScheduler,
        }

        let Cfg { inner } = toml::from_str(
            r#"
[inner.cosine_annealing]
restarts = 10
factor = 100
"#,
        )
        .unwrap();
        assert!(matches!(
            inner,
            LearningRateScheduler::CosineAnnealing { .. }
        ));

        let Cfg { inner } = toml::from_str(r#"inner = "constant""#).unwrap();
        assert!(matches!(inner, LearningRateScheduler::Constant));
    }

    #[test]
    fn defaults_match_plain_adam() {
        let cfg: OptimizerConfiguration = toml::from_str("").unwrap();
        assert_eq!(cfg.inter_epoch, EpochLearningRate::Constant { base: 1e-3 });
        assert_eq!(cfg.within_epoch, LearningRateScheduler::Constant);
        assert_eq!(cfg.adam, AdamParameters::default());
        assert_eq!(cfg.validate().unwrap(), None);
    }

    #[test]
    fn invalid_schedules() {
        let cfg = OptimizerConfiguration {
            inter_epoch: EpochLearningRate::LinearDecrease {
                base: 0.1,
                delta: 0.,
                min: 0.01,
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Delta)));

        let cfg = OptimizerConfiguration {
            within_epoch: LearningRateScheduler::CosineAnnealing {
                restarts: 0,
                factor: 0.5,
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::AnnealingFactor)));
    }

    #[test]
    fn optimizer_steps_reduce_the_loss() {
        tch::manual_seed(0);
        let var_store = tch::nn::VarStore::new(tch::Device::Cpu);
        let weight = var_store.root().zeros("weight", &[1]);
        let cfg = OptimizerConfiguration {
            inter_epoch: EpochLearningRate::Constant { base: 0.1 },
            ..Default::default()
        };
        let mut optimizer = Optimizer::new(&var_store, cfg, 20, 1).unwrap();
        let loss_at = |weight: &Tensor| (weight - 3.).square().sum(tch::Kind::Float);

        let before = loss_at(&weight).double_value(&[]);
        let mut epoch = optimizer.start_epoch().unwrap();
        for _ in 0..20 {
            epoch.next_mini_batch(&loss_at(&weight)).unwrap();
        }
        assert!((epoch.learning_rate() - 0.1).abs() < 1e-12);
        epoch.finish().unwrap();
        let after = loss_at(&weight).double_value(&[]);
        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn adam_moments_survive_epochs() {
        let cfg = OptimizerConfiguration {
            inter_epoch: EpochLearningRate::Constant { base: 0.1 },
            ..Default::default()
        };
        let loss_at = |weight: &Tensor| (weight - 3.).square().sum(tch::Kind::Float);

        let var_store = tch::nn::VarStore::new(tch::Device::Cpu);
        let weight = var_store.root().zeros("weight", &[1]);
        let mut optimizer = Optimizer::new(&var_store, cfg, 5, 1).unwrap();
        let mut epoch = optimizer.start_epoch().unwrap();
        for _ in 0..5 {
            epoch.next_mini_batch(&loss_at(&weight)).unwrap();
        }
        epoch.finish().unwrap();
        let start = weight.double_value(&[0]);

        let mut epoch = optimizer.start_epoch().unwrap();
        epoch.next_mini_batch(&loss_at(&weight)).unwrap();
        epoch.finish().unwrap();
        let continued = weight.double_value(&[0]) - start;

        // The very first Adam step moves a weight by exactly the learning rate.
        let fresh_store = tch::nn::VarStore::new(tch::Device::Cpu);
        let fresh_weight = fresh_store
            .root()
            .var("weight", &[1], tch::nn::Init::Const(start));
        let mut fresh = Optimizer::new(&fresh_store, cfg, 5, 1).unwrap();
        let mut epoch = fresh.start_epoch().unwrap();
        epoch.next_mini_batch(&loss_at(&fresh_weight)).unwrap();
        epoch.finish().unwrap();
        let restarted = fresh_weight.double_value(&[0]) - start;

        assert!((restarted - 0.1).abs() < 1e-4, "fresh step {restarted}");
        assert!(
            (continued - restarted).abs() > 1e-4,
            "second epoch stepped like a fresh optimizer: {continued} vs {restarted}"
        );
    }
}
