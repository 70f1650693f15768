use crate::network::Param;
use ndarray::{Array4, Zip};

/// The Adam learn rule, with bias-corrected first and second moment
/// estimates of the gradient.
#[derive(Copy, Clone, Debug)]
pub struct Adam {
    pub learn_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Adam {
    pub fn new(learn_rate: f32) -> Self {
        Self {
            learn_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// Creates the moment state for a parameter, which must be kept for the
    /// lifetime of the parameter
    pub fn init_state(&self, param: &Param) -> AdamState {
        AdamState {
            m: Array4::zeros(param.value.raw_dim()),
            v: Array4::zeros(param.value.raw_dim()),
            t: 0,
        }
    }

    /// Moves the parameter value against its current gradient
    pub fn step(&self, param: &mut Param, state: &mut AdamState) {
        state.t += 1;

        let t = state.t as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let step_size = self.learn_rate * correction2.sqrt() / correction1;

        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        Zip::from(&mut param.value)
            .and(&param.grad)
            .and(&mut state.m)
            .and(&mut state.v)
            .for_each(|value, &grad, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * grad;
                *v = beta2 * *v + (1.0 - beta2) * grad * grad;
                *value -= step_size * *m / (v.sqrt() + epsilon);
            });
    }
}

/// The per-parameter state of the Adam learn rule
#[derive(Clone, Debug)]
pub struct AdamState {
    m: Array4<f32>,
    v: Array4<f32>,
    t: u32,
}

impl AdamState {
    /// The number of steps taken
    pub fn steps(&self) -> u32 {
        self.t
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn first_step_moves_by_learn_rate() {
        let adam = Adam::new(2.0);
        let mut param = Param::new(Array4::from_elem((1, 1, 2, 2), 10.0));
        param.grad.fill(0.3);
        param.grad[[0, 0, 1, 1]] = -5.0;

        let mut state = adam.init_state(&param);
        adam.step(&mut param, &mut state);

        // With bias correction the first step is the learn rate times the
        // sign of the gradient
        assert_relative_eq!(param.value[[0, 0, 0, 0]], 8.0, epsilon = 1e-4);
        assert_relative_eq!(param.value[[0, 0, 1, 1]], 12.0, epsilon = 1e-4);
        assert_eq!(state.steps(), 1);
    }

    #[test]
    fn zero_gradient_stays_put() {
        let adam = Adam::new(2.0);
        let mut param = Param::new(Array4::from_elem((1, 3, 2, 2), 1.5));
        let mut state = adam.init_state(&param);

        for _ in 0..3 {
            adam.step(&mut param, &mut state);
        }

        assert!(param.value.iter().all(|v| *v == 1.5));
        assert_eq!(state.steps(), 3);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let adam = Adam::new(0.1);
        let mut param = Param::new(Array4::from_elem((1, 1, 1, 1), 5.0));
        let mut state = adam.init_state(&param);

        for _ in 0..500 {
            let x = param.value[[0, 0, 0, 0]];
            param.grad[[0, 0, 0, 0]] = 2.0 * (x - 1.0);
            adam.step(&mut param, &mut state);
        }

        assert_relative_eq!(param.value[[0, 0, 0, 0]], 1.0, epsilon = 0.05);
    }
}
