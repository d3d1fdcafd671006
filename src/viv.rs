//! 渦励振 (VIV) の変位データに対する教師あり学習の問題設定。
//!
//! 減衰振動 `eta(t) = A·exp(-ζt)·sin(ωt)` を等間隔にサンプルしたデータで、
//! 時刻 `t_f` から変位 `eta` を予測するモデルを学習・評価します。

use crate::error::{PinnError, PinnResult};
use crate::model::Surrogate;
use crate::solver::{Constraint, EvalStrategy, TrainingState};
use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// 合成データと損失の重みの設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VivConfig {
    pub num_points: usize,
    pub t_start: f64,
    pub t_end: f64,
    pub amplitude: f64,
    pub damping: f64,
    pub omega: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    /// `eta` の MSE に掛ける重み
    pub eta_weight: f64,
}

impl Default for VivConfig {
    fn default() -> Self {
        Self {
            num_points: 100,
            t_start: 0.0,
            t_end: 10.0,
            amplitude: 1.0,
            damping: 0.1,
            omega: 2.0,
            train_batch_size: 150,
            eval_batch_size: 32,
            eta_weight: 100.0,
        }
    }
}

/// 行優先で並べた入力とラベル。
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub input: Vec<f32>,
    pub label: Vec<f32>,
    pub input_dim: usize,
    pub label_dim: usize,
}

impl Dataset {
    pub fn new(input: Vec<f32>, label: Vec<f32>, input_dim: usize, label_dim: usize) -> PinnResult<Self> {
        if input_dim == 0 || label_dim == 0 || input.len() % input_dim != 0 {
            return Err(PinnError::shape("dataset dimensions must divide the data"));
        }
        let len = input.len() / input_dim;
        if len == 0 || label.len() != len * label_dim {
            return Err(PinnError::shape(format!(
                "dataset has {len} inputs but {} label values",
                label.len()
            )));
        }
        Ok(Self {
            input,
            label,
            input_dim,
            label_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.input.len() / self.input_dim
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// `indices` の行を `[n, dim]` のテンソルとして取り出します。
    fn gather<B: Backend>(&self, indices: &[usize], device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let pick = |data: &[f32], dim: usize| -> Vec<f32> {
            indices
                .iter()
                .flat_map(|&i| data[i * dim..(i + 1) * dim].iter().copied())
                .collect()
        };
        let n = indices.len();
        let input = Tensor::from_data(
            TensorData::new(pick(&self.input, self.input_dim), [n, self.input_dim]),
            device,
        );
        let label = Tensor::from_data(
            TensorData::new(pick(&self.label, self.label_dim), [n, self.label_dim]),
            device,
        );
        (input, label)
    }
}

/// 減衰振動を等間隔にサンプルします。
pub fn synthetic_displacement(cfg: &VivConfig) -> PinnResult<Dataset> {
    if cfg.num_points < 2 || cfg.t_end <= cfg.t_start {
        return Err(PinnError::config("need at least 2 points on a non-empty time range"));
    }
    let dt = (cfg.t_end - cfg.t_start) / (cfg.num_points - 1) as f64;
    let (t, eta): (Vec<f32>, Vec<f32>) = (0..cfg.num_points)
        .map(|i| {
            let t = cfg.t_start + dt * i as f64;
            let eta = cfg.amplitude * (-cfg.damping * t).exp() * (cfg.omega * t).sin();
            (t as f32, eta as f32)
        })
        .unzip();
    Dataset::new(t, eta, 1, 1)
}

/// シャッフルしたミニバッチで MSE を取る教師あり制約。
pub struct SupervisedConstraint<B: Backend> {
    name: String,
    data: Dataset,
    batch_size: usize,
    weight: f64,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    batch: Option<(Tensor<B, 2>, Tensor<B, 2>)>,
    device: B::Device,
}

impl<B: Backend> SupervisedConstraint<B> {
    pub fn new(
        name: impl Into<String>,
        data: Dataset,
        batch_size: usize,
        weight: f64,
        rng: StdRng,
        device: B::Device,
    ) -> PinnResult<Self> {
        if batch_size == 0 {
            return Err(PinnError::config("batch_size must be at least 1"));
        }
        let order = (0..data.len()).collect();
        Ok(Self {
            name: name.into(),
            cursor: data.len(),
            data,
            batch_size,
            weight,
            rng,
            order,
            batch: None,
            device,
        })
    }

    fn weighted_mse<M: Surrogate<B>>(&self, model: &M, input: Tensor<B, 2>, label: Tensor<B, 2>) -> Tensor<B, 1> {
        MseLoss::new()
            .forward(model.predict(input), label, Reduction::Mean)
            .mul_scalar(self.weight)
    }
}

impl<M, B> Constraint<M, B> for SupervisedConstraint<B>
where
    B: AutodiffBackend,
    M: Surrogate<B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    /// データを使い切ったら並べ替えて先頭から取り直します。末尾の端数もバッチにします。
    fn next_batch(&mut self) -> PinnResult<usize> {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.data.gather(&self.order[self.cursor..end], &self.device);
        self.cursor = end;
        let n = batch.0.dims()[0];
        self.batch = Some(batch);
        Ok(n)
    }

    fn batch_loss(&self, model: &M) -> PinnResult<Tensor<B, 1>> {
        let (input, label) = self
            .batch
            .clone()
            .ok_or_else(|| PinnError::config(format!("{}: next_batch was not called", self.name)))?;
        Ok(self.weighted_mse(model, input, label))
    }

    fn full_loss(&self, model: &M) -> PinnResult<Tensor<B, 1>> {
        let (input, label) = self.data.gather(&self.order, &self.device);
        Ok(self.weighted_mse(model, input, label))
    }
}

/// 推論モードのモデルで全データの MSE を計算する評価器。
///
/// 推論用のモデルは `state.model.valid()` で取り出すので、`state.mode()` には依存しません。
pub struct SupervisedValidator<B: AutodiffBackend> {
    name: String,
    data: Dataset,
    batch_size: usize,
    device: <B::InnerBackend as Backend>::Device,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> SupervisedValidator<B> {
    pub fn new(
        name: impl Into<String>,
        data: Dataset,
        batch_size: usize,
        device: <B::InnerBackend as Backend>::Device,
    ) -> PinnResult<Self> {
        if batch_size == 0 {
            return Err(PinnError::config("batch_size must be at least 1"));
        }
        Ok(Self {
            name: name.into(),
            data,
            batch_size,
            device,
            _backend: PhantomData,
        })
    }
}

impl<M, O, B> EvalStrategy<M, O> for SupervisedValidator<B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    M::InnerModule: Surrogate<B::InnerBackend>,
{
    fn run_eval(&mut self, state: &mut TrainingState<M, O>, epoch: usize) -> PinnResult<f64> {
        let model = state.model.valid();
        let key = model
            .output_keys()
            .first()
            .map(|k| format!("MSE.{k}"))
            .unwrap_or_else(|| "MSE".to_string());
        let indices: Vec<usize> = (0..self.data.len()).collect();
        let chunks: Vec<&[usize]> = indices.chunks(self.batch_size).collect();
        let log_freq = state.config.log_freq;

        let mut sq_sum = 0.0;
        let mut count = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let (input, label) = self.data.gather::<B::InnerBackend>(chunk, &self.device);
            let pred = model.predict(input);
            let n = chunk.len();
            let elems = pred.dims().iter().product::<usize>();
            let sq = (pred - label)
                .powf_scalar(2.0)
                .sum()
                .into_scalar()
                .elem::<f64>();
            let mse = sq / elems as f64;
            sq_sum += sq;
            count += elems;

            state.eval_metrics.update("loss", mse, n);
            state.eval_metrics.update(&key, mse, n);
            let iter = i + 1;
            if iter == 1 || iter % log_freq == 0 || iter == chunks.len() {
                tracing::info!(
                    "[Eval][Epoch {epoch}][Iter {iter}/{}] {}: {}",
                    chunks.len(),
                    self.name,
                    state.eval_metrics.val_summary()
                );
            }
        }
        Ok(sq_sum / count.max(1) as f64)
    }
}
