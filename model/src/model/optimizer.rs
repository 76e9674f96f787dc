use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::HashMap;
use tracing::info;

use super::config::{LrSchedule, OptimizerType};

/// Updates parameters in place from their gradients.
pub trait Optimizer: Send + Sync {
    /// Called once per batch before the parameter updates.
    fn begin_step(&mut self) {}
    fn update(&mut self, param_id: &str, param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>);
    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, lr: f32);
}

/// Builds the optimizer named by a training configuration.
pub fn from_config(kind: &OptimizerType, learning_rate: f32) -> Box<dyn Optimizer> {
    match *kind {
        OptimizerType::Adam {
            beta1,
            beta2,
            epsilon,
        } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
        OptimizerType::SGD { momentum } => Box::new(Sgd::new(learning_rate, momentum)),
    }
}

/// SGD with momentum
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let velocity = self
            .velocity
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        // v = momentum * v + grad
        // param -= lr * v
        let (momentum, lr) = (self.momentum, self.learning_rate);
        Zip::from(&mut param)
            .and(velocity)
            .and(&grad)
            .for_each(|p, v, &g| {
                *v = momentum * *v + g;
                *p -= lr * *v;
            });
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

/// Adam
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: i32,

    // first moment
    m: HashMap<String, ArrayD<f32>>,
    // second moment
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            timestep: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn timestep(&self) -> i32 {
        self.timestep
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.timestep += 1;
    }

    fn update(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let t = self.timestep.max(1);
        let m = self
            .m
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
        let v = self
            .v
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        Zip::from(&mut param)
            .and(m)
            .and(v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                // m_t = beta1 * m_{t-1} + (1 - beta1) * g
                *m = beta1 * *m + (1.0 - beta1) * g;
                // v_t = beta2 * v_{t-1} + (1 - beta2) * g^2
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

/// Learning rate scheduler
pub enum LrScheduler {
    StepDecay {
        step_size: usize,
        gamma: f32,
        last_epoch: usize,
    },
    ReduceOnPlateau {
        factor: f32,
        patience: usize,
        best_loss: f32,
        num_bad_epochs: usize,
    },
}

impl LrScheduler {
    pub fn step_decay(step_size: usize, gamma: f32) -> Self {
        LrScheduler::StepDecay {
            step_size,
            gamma,
            last_epoch: 0,
        }
    }

    pub fn reduce_on_plateau(factor: f32, patience: usize) -> Self {
        LrScheduler::ReduceOnPlateau {
            factor,
            patience,
            best_loss: f32::INFINITY,
            num_bad_epochs: 0,
        }
    }

    pub fn from_config(schedule: &LrSchedule) -> Self {
        match *schedule {
            LrSchedule::StepDecay { step_size, gamma } => Self::step_decay(step_size, gamma),
            LrSchedule::ReduceOnPlateau { factor, patience } => {
                Self::reduce_on_plateau(factor, patience)
            }
        }
    }

    /// Call at the end of every epoch.
    pub fn step_epoch(&mut self, optimizer: &mut dyn Optimizer) {
        if let LrScheduler::StepDecay {
            step_size,
            gamma,
            last_epoch,
        } = self
        {
            *last_epoch += 1;
            if *step_size > 0 && *last_epoch % *step_size == 0 {
                let new_lr = optimizer.learning_rate() * *gamma;
                optimizer.set_learning_rate(new_lr);
                info!("Learning rate reduced to {:.6}", new_lr);
            }
        }
    }

    /// Call with the epoch's validation loss.
    pub fn step_loss(&mut self, optimizer: &mut dyn Optimizer, loss: f32) {
        if let LrScheduler::ReduceOnPlateau {
            factor,
            patience,
            best_loss,
            num_bad_epochs,
        } = self
        {
            if loss < *best_loss {
                *best_loss = loss;
                *num_bad_epochs = 0;
            } else {
                *num_bad_epochs += 1;
                if *num_bad_epochs >= *patience {
                    let new_lr = optimizer.learning_rate() * *factor;
                    optimizer.set_learning_rate(new_lr);
                    info!("Plateau detected, learning rate reduced to {:.6}", new_lr);
                    *num_bad_epochs = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_sgd_momentum() {
        let mut optimizer = Sgd::new(0.1, 0.5);
        let mut param = ArrayD::ones(IxDyn(&[2, 2]));
        let grad = ArrayD::ones(IxDyn(&[2, 2]));

        optimizer.begin_step();
        optimizer.update("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0, 0]], 0.9, epsilon = 1e-6);

        // velocity = 0.5 * 1 + 1 = 1.5
        optimizer.begin_step();
        optimizer.update("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0, 0]], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
        let mut param = ArrayD::ones(IxDyn(&[3]));
        let grad = ArrayD::from_elem(IxDyn(&[3]), 4.0);

        optimizer.begin_step();
        optimizer.update("w", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0]], 0.999, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_timestep_counts_steps_not_parameters() {
        let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
        let mut a = ArrayD::ones(IxDyn(&[2]));
        let mut b = ArrayD::ones(IxDyn(&[2]));
        let grad = ArrayD::ones(IxDyn(&[2]));

        optimizer.begin_step();
        optimizer.update("a", a.view_mut(), grad.view());
        optimizer.update("b", b.view_mut(), grad.view());
        assert_eq!(optimizer.timestep(), 1);
        assert_abs_diff_eq!(a[[0]], b[[0]], epsilon = 1e-9);
    }

    #[test]
    fn test_step_decay() {
        let mut optimizer = Sgd::new(0.1, 0.0);
        let mut scheduler = LrScheduler::step_decay(2, 0.5);
        scheduler.step_epoch(&mut optimizer);
        assert_abs_diff_eq!(optimizer.learning_rate(), 0.1);
        scheduler.step_epoch(&mut optimizer);
        assert_abs_diff_eq!(optimizer.learning_rate(), 0.05);
    }

    #[test]
    fn test_reduce_on_plateau() {
        let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let mut scheduler = LrScheduler::reduce_on_plateau(0.1, 2);
        scheduler.step_loss(&mut optimizer, 1.0);
        scheduler.step_loss(&mut optimizer, 1.1);
        assert_abs_diff_eq!(optimizer.learning_rate(), 0.01);
        scheduler.step_loss(&mut optimizer, 1.2);
        assert_abs_diff_eq!(optimizer.learning_rate(), 0.001, epsilon = 1e-8);
    }
}
