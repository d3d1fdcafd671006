//! フルバッチの L-BFGS オプティマイザ。
//!
//! パラメータと勾配をホスト上の平坦なベクタとして扱います。
//! ラインサーチは行わず、固定のステップ幅で更新します。

use crate::error::{PinnError, PinnResult};
use burn::config::Config;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;

/// パラメータを1本のベクタとして読み書きできるモデル。
pub trait Flatten: Sized {
    fn parameters(&self) -> PinnResult<Vec<f32>>;

    /// `flat` の値でパラメータを置き換えたモデルを返します。長さが合わなければエラー。
    fn with_parameters(self, flat: &[f32]) -> PinnResult<Self>;
}

/// 勾配を `Flatten::parameters` と同じ順序で取り出せるモデル。
pub trait FlatGradients<B: AutodiffBackend>: Flatten {
    fn gradients(&self, grads: &B::Gradients) -> PinnResult<Vec<f32>>;
}

#[derive(Config, Debug)]
pub struct LbfgsConfig {
    #[config(default = 1.0)]
    pub learning_rate: f64,
    /// 1回の `step` で行う最大反復数
    #[config(default = 1)]
    pub max_iter: usize,
    #[config(default = 100)]
    pub history_size: usize,
    #[config(default = 1e-7)]
    pub tolerance_grad: f64,
    #[config(default = 1e-9)]
    pub tolerance_change: f64,
}

/// 設定ファイル上の `lbfgs` ブロック。省略した項目は既定値になります。
#[derive(Deserialize)]
struct LbfgsFields {
    learning_rate: Option<f64>,
    max_iter: Option<usize>,
    history_size: Option<usize>,
    tolerance_grad: Option<f64>,
    tolerance_change: Option<f64>,
}

pub(crate) fn lbfgs_with_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LbfgsConfig, D::Error> {
    let fields = LbfgsFields::deserialize(deserializer)?;
    let mut cfg = LbfgsConfig::new();
    if let Some(v) = fields.learning_rate {
        cfg.learning_rate = v;
    }
    if let Some(v) = fields.max_iter {
        cfg.max_iter = v;
    }
    if let Some(v) = fields.history_size {
        cfg.history_size = v;
    }
    if let Some(v) = fields.tolerance_grad {
        cfg.tolerance_grad = v;
    }
    if let Some(v) = fields.tolerance_change {
        cfg.tolerance_change = v;
    }
    Ok(cfg)
}

impl LbfgsConfig {
    pub fn init(&self) -> Lbfgs {
        Lbfgs {
            config: self.clone(),
            state: LbfgsState::default(),
        }
    }
}

/// 反復をまたいで保持する曲率情報。チェックポイントに JSON で保存されます。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LbfgsState {
    pub n_iter: usize,
    direction: Vec<f64>,
    step_size: f64,
    old_dirs: VecDeque<Vec<f64>>,
    old_steps: VecDeque<Vec<f64>>,
    ro: VecDeque<f64>,
    h_diag: f64,
    prev_grad: Vec<f64>,
    prev_loss: f64,
}

#[derive(Debug, Clone)]
pub struct Lbfgs {
    config: LbfgsConfig,
    state: LbfgsState,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn abs_max(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}

fn widen(v: Vec<f32>) -> Vec<f64> {
    v.into_iter().map(f64::from).collect()
}

impl Lbfgs {
    pub fn config(&self) -> &LbfgsConfig {
        &self.config
    }

    pub fn state(&self) -> &LbfgsState {
        &self.state
    }

    pub fn restore_state(&mut self, state: LbfgsState) {
        self.state = state;
    }

    /// 最大 `max_iter` 回の更新を行い、最初に評価した損失を返します。
    ///
    /// `closure` は現在のモデルで損失と平坦化された勾配を計算します。
    pub fn step<M, F>(&mut self, model: M, mut closure: F) -> PinnResult<(M, f64)>
    where
        M: Flatten,
        F: FnMut(&M) -> PinnResult<(f64, Vec<f32>)>,
    {
        let cfg = &self.config;
        let mut params = widen(model.parameters()?);
        let mut model = model;

        let (orig_loss, grad) = closure(&model)?;
        let mut loss = orig_loss;
        let mut grad = widen(grad);
        if grad.len() != params.len() {
            return Err(PinnError::shape(format!(
                "gradient has {} values, parameters have {}",
                grad.len(),
                params.len()
            )));
        }
        if abs_max(&grad) <= cfg.tolerance_grad {
            return Ok((model, orig_loss));
        }

        let state = &mut self.state;
        let mut n_iter = 0;
        while n_iter < cfg.max_iter {
            n_iter += 1;
            state.n_iter += 1;

            if state.n_iter == 1 {
                state.direction = grad.iter().map(|g| -g).collect();
                state.old_dirs.clear();
                state.old_steps.clear();
                state.ro.clear();
                state.h_diag = 1.0;
            } else {
                let y: Vec<f64> = grad.iter().zip(&state.prev_grad).map(|(g, p)| g - p).collect();
                let s: Vec<f64> = state.direction.iter().map(|d| d * state.step_size).collect();
                let ys = dot(&y, &s);
                if ys > 1e-10 {
                    if state.old_dirs.len() == cfg.history_size {
                        state.old_dirs.pop_front();
                        state.old_steps.pop_front();
                        state.ro.pop_front();
                    }
                    state.h_diag = ys / dot(&y, &y);
                    state.old_dirs.push_back(y);
                    state.old_steps.push_back(s);
                    state.ro.push_back(1.0 / ys);
                }

                // two-loop recursion
                let k = state.old_dirs.len();
                let mut al = vec![0.0; k];
                let mut q: Vec<f64> = grad.iter().map(|g| -g).collect();
                for i in (0..k).rev() {
                    al[i] = dot(&state.old_steps[i], &q) * state.ro[i];
                    for (qj, yj) in q.iter_mut().zip(&state.old_dirs[i]) {
                        *qj -= al[i] * yj;
                    }
                }
                let mut r: Vec<f64> = q.iter().map(|v| v * state.h_diag).collect();
                for i in 0..k {
                    let be = dot(&state.old_dirs[i], &r) * state.ro[i];
                    for (rj, sj) in r.iter_mut().zip(&state.old_steps[i]) {
                        *rj += sj * (al[i] - be);
                    }
                }
                state.direction = r;
            }

            state.prev_grad = grad.clone();
            state.prev_loss = loss;

            state.step_size = if state.n_iter == 1 {
                let g_sum: f64 = grad.iter().map(|g| g.abs()).sum();
                (1.0_f64).min(1.0 / g_sum) * cfg.learning_rate
            } else {
                cfg.learning_rate
            };

            let gtd = dot(&grad, &state.direction);
            if gtd > -cfg.tolerance_change {
                break;
            }

            for (p, d) in params.iter_mut().zip(&state.direction) {
                *p += state.step_size * d;
            }
            let flat: Vec<f32> = params.iter().map(|&p| p as f32).collect();
            model = model.with_parameters(&flat)?;

            if n_iter == cfg.max_iter {
                break;
            }
            let (new_loss, new_grad) = closure(&model)?;
            loss = new_loss;
            grad = widen(new_grad);

            if abs_max(&grad) <= cfg.tolerance_grad {
                break;
            }
            if abs_max(&state.direction) * state.step_size.abs() <= cfg.tolerance_change {
                break;
            }
            if (loss - state.prev_loss).abs() < cfg.tolerance_change {
                break;
            }
        }

        Ok((model, orig_loss))
    }
}
