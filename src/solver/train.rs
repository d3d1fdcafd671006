use super::{EpochStrategy, TrainingState};
use crate::error::{PinnError, PinnResult};
use crate::lbfgs::{FlatGradients, Lbfgs};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use std::time::Instant;

/// 名前付きの損失の供給源。
pub trait Constraint<M, B: AutodiffBackend> {
    fn name(&self) -> &str;

    /// 次のミニバッチを用意し、そのサンプル数を返します。
    fn next_batch(&mut self) -> PinnResult<usize>;

    /// 現在のミニバッチでの重み付き損失。
    fn batch_loss(&self, model: &M) -> PinnResult<Tensor<B, 1>>;

    /// 全データでの重み付き損失。
    fn full_loss(&self, model: &M) -> PinnResult<Tensor<B, 1>>;
}

fn scalar<B: AutodiffBackend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

fn log_iter(epoch: usize, epochs: usize, iter: usize, iters: usize, lr: f64, line: String) {
    tracing::info!("[Train][Epoch {epoch}/{epochs}][Iter {iter}/{iters}] lr: {lr:.5}, {line}");
}

/// ミニバッチで勾配を計算し、`update_freq` 回ごとにオプティマイザを進めます。
pub struct StandardEpoch<M, B: AutodiffBackend> {
    constraints: Vec<Box<dyn Constraint<M, B>>>,
}

impl<M, B: AutodiffBackend> StandardEpoch<M, B> {
    pub fn new(constraints: Vec<Box<dyn Constraint<M, B>>>) -> PinnResult<Self> {
        if constraints.is_empty() {
            return Err(PinnError::config("at least one constraint is required"));
        }
        Ok(Self { constraints })
    }
}

impl<M, B, O> EpochStrategy<M, O> for StandardEpoch<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn run_epoch(&mut self, state: &mut TrainingState<M, O>, epoch: usize) -> PinnResult<()> {
        let epochs = state.config.epochs;
        let iters = state.config.iters_per_epoch;
        let update_freq = state.config.update_freq;
        let log_freq = state.config.log_freq;
        let mut accumulated: Option<Tensor<B, 1>> = None;

        for iter in 1..=iters {
            let batch_start = Instant::now();
            let mut reader_cost = 0.0;
            let mut total: Option<Tensor<B, 1>> = None;
            let mut samples = 0;

            for constraint in self.constraints.iter_mut() {
                let read_start = Instant::now();
                let n = constraint.next_batch()?;
                reader_cost += read_start.elapsed().as_secs_f64();

                let loss = constraint.batch_loss(&state.model)?;
                state.metrics.update(constraint.name(), scalar(&loss), n);
                samples += n;
                total = Some(match total {
                    Some(total) => total + loss,
                    None => loss,
                });
            }
            let total = total.ok_or_else(|| PinnError::config("no constraint produced a loss"))?;
            state.metrics.update("loss", scalar(&total), samples);

            let scaled = if update_freq > 1 {
                total.div_scalar(update_freq as f64)
            } else {
                total
            };
            accumulated = Some(match accumulated.take() {
                Some(acc) => acc + scaled,
                None => scaled,
            });

            let lr = state.scheduler.get_lr();
            if iter % update_freq == 0 {
                if let Some(loss) = accumulated.take() {
                    let grads = GradientsParams::from_grads(loss.backward(), &state.model);
                    state.model = state.optimizer.step(lr, state.model.clone(), grads);
                    if !state.scheduler.by_epoch() {
                        state.scheduler.step();
                    }
                }
            }

            state.time_info.batch_cost.update(batch_start.elapsed().as_secs_f64(), 1);
            state.time_info.reader_cost.update(reader_cost, 1);
            if iter == 1 || iter % log_freq == 0 || iter == iters {
                log_iter(
                    epoch,
                    epochs,
                    iter,
                    iters,
                    lr,
                    format!(
                        "{}, {}",
                        state.metrics.val_summary(),
                        state.time_info.summary()
                    ),
                );
            }
        }
        Ok(())
    }
}

/// 全データの損失を L-BFGS に渡して最適化します。
pub struct LbfgsEpoch<M, B: AutodiffBackend> {
    constraints: Vec<Box<dyn Constraint<M, B>>>,
}

impl<M, B: AutodiffBackend> LbfgsEpoch<M, B> {
    pub fn new(constraints: Vec<Box<dyn Constraint<M, B>>>) -> PinnResult<Self> {
        if constraints.is_empty() {
            return Err(PinnError::config("at least one constraint is required"));
        }
        Ok(Self { constraints })
    }
}

impl<M, B> EpochStrategy<M, Lbfgs> for LbfgsEpoch<M, B>
where
    B: AutodiffBackend,
    M: FlatGradients<B> + Clone,
{
    fn run_epoch(&mut self, state: &mut TrainingState<M, Lbfgs>, epoch: usize) -> PinnResult<()> {
        let epochs = state.config.epochs;
        let iters = state.config.iters_per_epoch;
        let log_freq = state.config.log_freq;
        let lr = state.optimizer.config().learning_rate;

        for iter in 1..=iters {
            let batch_start = Instant::now();
            let constraints = &self.constraints;
            let mut terms: Vec<(String, f64)> = Vec::new();

            let closure = |model: &M| -> PinnResult<(f64, Vec<f32>)> {
                let mut total: Option<Tensor<B, 1>> = None;
                let record = terms.is_empty();
                for constraint in constraints {
                    let loss = constraint.full_loss(model)?;
                    if record {
                        terms.push((constraint.name().to_string(), scalar(&loss)));
                    }
                    total = Some(match total {
                        Some(total) => total + loss,
                        None => loss,
                    });
                }
                let total =
                    total.ok_or_else(|| PinnError::config("no constraint produced a loss"))?;
                let value = scalar(&total);
                let grads = total.backward();
                Ok((value, model.gradients(&grads)?))
            };
            let (model, loss) = state.optimizer.step(state.model.clone(), closure)?;
            state.model = model;

            for (name, value) in &terms {
                state.metrics.update(name, *value, 1);
            }
            state.metrics.update("loss", loss, 1);
            state.time_info.batch_cost.update(batch_start.elapsed().as_secs_f64(), 1);

            if iter == 1 || iter % log_freq == 0 || iter == iters {
                log_iter(
                    epoch,
                    epochs,
                    iter,
                    iters,
                    lr,
                    format!(
                        "{}, {}",
                        state.metrics.val_summary(),
                        state.time_info.batch_cost.avg_info()
                    ),
                );
            }
        }
        Ok(())
    }
}
