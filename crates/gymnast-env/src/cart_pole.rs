use std::f64::consts::PI;

use rand::{Rng as _, SeedableRng as _};
use rand_pcg::Pcg64;

use crate::{Action, ActionSpace, EnvError, Environment, Observation, Step, check_action};

const GRAVITY: f64 = 9.8;
const CART_MASS: f64 = 1.0;
const POLE_MASS: f64 = 0.1;
const TOTAL_MASS: f64 = CART_MASS + POLE_MASS;
const POLE_HALF_LENGTH: f64 = 0.5;
const POLE_MASS_LENGTH: f64 = POLE_MASS * POLE_HALF_LENGTH;
const FORCE_MAG: f64 = 10.0;
const TAU: f64 = 0.02;
const THETA_THRESHOLD: f64 = 12.0 * 2.0 * PI / 360.0;
const X_THRESHOLD: f64 = 2.4;

/// Classic pole balancing task.
///
/// A pole is attached to a cart moving along a frictionless track. Action `0`
/// pushes the cart left, action `1` pushes it right. Every frame the pole stays
/// up yields a reward of `1.0`; the episode ends when the pole leans more than
/// 12 degrees or the cart leaves the track.
///
/// Observation: `[x, x_dot, theta, theta_dot]`.
#[derive(Debug, Clone)]
pub struct CartPole {
    rng: Pcg64,
    state: Option<[f64; 4]>,
    done: bool,
}

impl CartPole {
    pub const TASK_NAME: &'static str = "cart-pole";

    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
            state: None,
            done: false,
        }
    }
}

impl Environment for CartPole {
    fn action_space(&self) -> ActionSpace {
        ActionSpace::discrete(2)
    }

    fn reset(&mut self) -> Observation {
        let state = [(); 4].map(|()| self.rng.random_range(-0.05..0.05));
        self.state = Some(state);
        self.done = false;
        state.to_vec()
    }

    fn step(&mut self, action: Action) -> Result<Step, EnvError> {
        check_action(self.action_space(), action)?;
        let [x, x_dot, theta, theta_dot] = self.state.ok_or(EnvError::NotReset)?;
        if self.done {
            return Ok(Step {
                observation: vec![x, x_dot, theta, theta_dot],
                reward: 0.0,
                terminal: true,
            });
        }

        let force = if action == 1 { FORCE_MAG } else { -FORCE_MAG };
        let (sin_theta, cos_theta) = theta.sin_cos();
        let temp = (force + POLE_MASS_LENGTH * theta_dot.powi(2) * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta.powi(2) / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        let next = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.state = Some(next);
        self.done = next[0].abs() > X_THRESHOLD || next[2].abs() > THETA_THRESHOLD;

        Ok(Step {
            observation: next.to_vec(),
            reward: 1.0,
            terminal: self.done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_before_reset_fails() {
        let mut env = CartPole::new(0);
        assert!(matches!(env.step(0), Err(EnvError::NotReset)));
    }

    #[test]
    fn test_reset_is_seeded() {
        let mut a = CartPole::new(42);
        let mut b = CartPole::new(42);
        assert_eq!(a.reset(), b.reset());
        assert!(a.reset().iter().all(|v| v.abs() < 0.05));
    }

    #[test]
    fn test_constant_push_topples_pole() {
        let mut env = CartPole::new(3);
        env.reset();
        let mut frames = 0;
        loop {
            let step = env.step(1).unwrap();
            frames += 1;
            if step.terminal {
                break;
            }
            assert!(frames < 500, "pole never fell");
        }
        assert!(frames > 1);
        let after = env.step(1).unwrap();
        assert!(after.terminal);
        assert_eq!(after.reward, 0.0);
    }
}
