//! 学習率スケジュール。
//!
//! `by_epoch()` が `true` のスケジュールはエポック境界でコントローラが、
//! `false` のものはオプティマイザのステップごとに学習戦略が `step()` を呼びます。

use serde::{Deserialize, Serialize};

/// 学習率スケジュールの共通インターフェース。
pub trait LrScheduler {
    /// エポック単位で更新するか（`false` ならステップ単位）。
    fn by_epoch(&self) -> bool;

    fn step(&mut self);

    /// 現在の学習率。
    fn get_lr(&self) -> f64;

    /// これまでに `step()` が呼ばれた回数。再開時の復元に使います。
    fn last_step(&self) -> usize;

    fn set_last_step(&mut self, step: usize);
}

/// 一定の学習率。
#[derive(Debug, Clone)]
pub struct ConstantLr {
    learning_rate: f64,
    by_epoch: bool,
    last_step: usize,
}

impl ConstantLr {
    pub fn new(learning_rate: f64, by_epoch: bool) -> Self {
        Self {
            learning_rate,
            by_epoch,
            last_step: 0,
        }
    }
}

impl LrScheduler for ConstantLr {
    fn by_epoch(&self) -> bool {
        self.by_epoch
    }

    fn step(&mut self) {
        self.last_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.learning_rate
    }

    fn last_step(&self) -> usize {
        self.last_step
    }

    fn set_last_step(&mut self, step: usize) {
        self.last_step = step;
    }
}

/// `step_size` 回ごとに `gamma` 倍する階段状の減衰。
#[derive(Debug, Clone)]
pub struct StepDecay {
    learning_rate: f64,
    step_size: usize,
    gamma: f64,
    by_epoch: bool,
    last_step: usize,
}

impl StepDecay {
    pub fn new(learning_rate: f64, step_size: usize, gamma: f64, by_epoch: bool) -> Self {
        Self {
            learning_rate,
            step_size: step_size.max(1),
            gamma,
            by_epoch,
            last_step: 0,
        }
    }
}

impl LrScheduler for StepDecay {
    fn by_epoch(&self) -> bool {
        self.by_epoch
    }

    fn step(&mut self) {
        self.last_step += 1;
    }

    fn get_lr(&self) -> f64 {
        let decays = (self.last_step / self.step_size) as i32;
        self.learning_rate * self.gamma.powi(decays)
    }

    fn last_step(&self) -> usize {
        self.last_step
    }

    fn set_last_step(&mut self, step: usize) {
        self.last_step = step;
    }
}

/// 設定ファイルに書くスケジュールの種類。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LrSchedulerConfig {
    Constant {
        learning_rate: f64,
        #[serde(default)]
        by_epoch: bool,
    },
    Step {
        learning_rate: f64,
        step_size: usize,
        gamma: f64,
        #[serde(default)]
        by_epoch: bool,
    },
}

impl Default for LrSchedulerConfig {
    fn default() -> Self {
        LrSchedulerConfig::Step {
            learning_rate: 0.001,
            step_size: 20000,
            gamma: 0.9,
            by_epoch: false,
        }
    }
}

impl LrSchedulerConfig {
    pub fn init(&self) -> Box<dyn LrScheduler> {
        match *self {
            LrSchedulerConfig::Constant {
                learning_rate,
                by_epoch,
            } => Box::new(ConstantLr::new(learning_rate, by_epoch)),
            LrSchedulerConfig::Step {
                learning_rate,
                step_size,
                gamma,
                by_epoch,
            } => Box::new(StepDecay::new(learning_rate, step_size, gamma, by_epoch)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_drops_every_step_size() {
        let mut sched = StepDecay::new(1.0, 2, 0.5, false);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            lrs.push(sched.get_lr());
            sched.step();
        }
        assert_eq!(lrs, vec![1.0, 1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn restoring_last_step_restores_lr() {
        let mut sched = LrSchedulerConfig::default().init();
        assert!(!sched.by_epoch());
        sched.set_last_step(40000);
        assert!((sched.get_lr() - 0.001 * 0.81).abs() < 1e-12);
    }

    #[test]
    fn config_is_tagged_by_name() {
        let cfg: LrSchedulerConfig =
            serde_json::from_str(r#"{"name":"constant","learning_rate":0.01,"by_epoch":true}"#)
                .unwrap();
        let sched = cfg.init();
        assert!(sched.by_epoch());
        assert_eq!(sched.get_lr(), 0.01);
    }
}
