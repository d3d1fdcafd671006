//! エポック単位の学習ループと評価の制御。
//!
//! 1エポックの中身（バッチの取り出し、逆伝播、パラメータ更新）は
//! [`EpochStrategy`] に、評価の1パスは [`EvalStrategy`] に任せます。
//! ループ自体は評価・学習率の更新・チェックポイント保存の順序だけを管理します。

mod eval;
mod train;

pub use eval::InferenceScope;
pub use train::{Constraint, LbfgsEpoch, StandardEpoch};

use crate::checkpoint::{CheckpointStore, CheckpointTag};
use crate::config::TrainingConfig;
use crate::dist::DistEnv;
use crate::error::{PinnError, PinnResult};
use crate::metric::{BestMetric, MetricAggregate, MetricRecord, TimeInfo};
use crate::schedule::LrScheduler;

/// モデルの動作モード。
///
/// 状態上のフラグで、評価器が `valid()` で推論用モデルを取り出すことと対応します。
/// 評価パスの間だけ [`InferenceScope`] が `Eval` にします。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// 学習ループの現在位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    EpochRunning,
    Evaluating,
    Checkpointing,
    Completed,
}

/// エポックごとに記録する推移。グラフ描画に使います。
#[derive(Debug, Clone, Default)]
pub struct History {
    /// (エポック, 平均 `loss`)
    pub train_loss: Vec<(usize, f64)>,
    /// (エポック, 評価メトリック)
    pub eval_metric: Vec<(usize, f64)>,
}

/// 学習中に変化するものをまとめた状態。
pub struct TrainingState<M, O> {
    pub config: TrainingConfig,
    pub env: DistEnv,
    pub model: M,
    pub optimizer: O,
    pub scheduler: Box<dyn LrScheduler>,
    /// 現在のエポックの学習メトリック
    pub metrics: MetricAggregate,
    /// 現在の評価パスのメトリック
    pub eval_metrics: MetricAggregate,
    pub time_info: TimeInfo,
    pub best: BestMetric,
    pub history: History,
    mode: Mode,
}

impl<M, O> TrainingState<M, O> {
    pub fn new(config: TrainingConfig, env: DistEnv, model: M, optimizer: O) -> Self {
        let scheduler = config.lr_scheduler.init();
        let best = BestMetric::new(config.metric_direction);
        Self {
            config,
            env,
            model,
            optimizer,
            scheduler,
            metrics: MetricAggregate::new(),
            eval_metrics: MetricAggregate::new(),
            time_info: TimeInfo::default(),
            best,
            history: History::default(),
            mode: Mode::Train,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}

/// 1エポック分の学習。メトリックは `state.metrics` に積みます。
pub trait EpochStrategy<M, O> {
    fn run_epoch(&mut self, state: &mut TrainingState<M, O>, epoch: usize) -> PinnResult<()>;
}

/// 評価データ全体を1回走査し、ベストメトリックの比較に使う値を返します。
/// バッチごとのメトリックは `state.eval_metrics` に積みます。
pub trait EvalStrategy<M, O> {
    fn run_eval(&mut self, state: &mut TrainingState<M, O>, epoch: usize) -> PinnResult<f64>;
}

/// 複数プロセスで学習するときにモデルとオプティマイザを包む処理。
pub trait DistributedAdapter<M, O> {
    fn wrap(&mut self, state: &mut TrainingState<M, O>) -> PinnResult<()>;
}

/// 学習・評価ループ。
pub struct Solver<M, O> {
    state: TrainingState<M, O>,
    phase: Phase,
    trainer: Option<Box<dyn EpochStrategy<M, O>>>,
    validator: Option<Box<dyn EvalStrategy<M, O>>>,
    store: Box<dyn CheckpointStore<M, O>>,
    dist: Option<Box<dyn DistributedAdapter<M, O>>>,
}

impl<M: Clone, O> Solver<M, O> {
    /// 設定に学習済みモデルのパスがあれば、ここで重みを読み込みます。
    pub fn new(
        state: TrainingState<M, O>,
        trainer: Box<dyn EpochStrategy<M, O>>,
        store: Box<dyn CheckpointStore<M, O>>,
    ) -> PinnResult<Self> {
        Self::build(state, Some(trainer), store)
    }

    /// 評価だけを行うソルバー。`train` を呼ぶと設定エラーになります。
    pub fn evaluator(
        state: TrainingState<M, O>,
        store: Box<dyn CheckpointStore<M, O>>,
    ) -> PinnResult<Self> {
        Self::build(state, None, store)
    }

    fn build(
        state: TrainingState<M, O>,
        trainer: Option<Box<dyn EpochStrategy<M, O>>>,
        store: Box<dyn CheckpointStore<M, O>>,
    ) -> PinnResult<Self> {
        let mut solver = Self {
            state,
            phase: Phase::Initializing,
            trainer,
            validator: None,
            store,
            dist: None,
        };
        if let Some(path) = solver.state.config.pretrained_model_path.clone() {
            solver.state.model = solver
                .store
                .load_pretrained(&path, solver.state.model.clone())?;
        }
        Ok(solver)
    }
}

impl<M, O> Solver<M, O> {
    pub fn with_validator(mut self, validator: Box<dyn EvalStrategy<M, O>>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_distributed(mut self, adapter: Box<dyn DistributedAdapter<M, O>>) -> Self {
        self.dist = Some(adapter);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState<M, O> {
        &self.state
    }

    pub fn into_state(self) -> TrainingState<M, O> {
        self.state
    }

    fn check_collaborators(&self) -> PinnResult<()> {
        self.state.config.validate()?;
        if self.trainer.is_none() {
            return Err(PinnError::config("this solver was built for evaluation only"));
        }
        if self.state.config.eval_during_train && self.validator.is_none() {
            return Err(PinnError::config(
                "eval_during_train is set but no validator was given",
            ));
        }
        if self.state.env.is_distributed() && self.dist.is_none() {
            return Err(PinnError::config(format!(
                "world size is {} but no distributed adapter was given",
                self.state.env.world_size
            )));
        }
        Ok(())
    }

    fn save(&self, record: MetricRecord, tag: CheckpointTag) -> PinnResult<()> {
        let state = &self.state;
        self.store.save(
            &state.model,
            &state.optimizer,
            state.scheduler.as_ref(),
            record,
            tag,
        )
    }

    /// チェックポイントから再開する場合は、そのエポックの次から始めます。
    fn resume(&mut self) -> PinnResult<usize>
    where
        M: Clone,
        O: Clone,
    {
        let Some(path) = self.state.config.checkpoint_path.clone() else {
            return Ok(1);
        };
        let state = &mut self.state;
        let (model, optimizer, record) = self.store.load_checkpoint(
            &path,
            state.model.clone(),
            state.optimizer.clone(),
            state.scheduler.as_mut(),
        )?;
        state.model = model;
        state.optimizer = optimizer;
        match record {
            Some(record) => {
                if state.best.observe(record.metric, record.epoch) {
                    tracing::info!("[Train] 読み込んだメトリックをベストとして使います ({record})");
                }
                Ok(record.epoch + 1)
            }
            None => Ok(1),
        }
    }

    /// 設定されたエポック数まで学習します。
    pub fn train(&mut self) -> PinnResult<()>
    where
        M: Clone,
        O: Clone,
    {
        self.phase = Phase::Initializing;
        self.check_collaborators()?;
        let start_epoch = self.resume()?;
        if let Some(adapter) = self.dist.as_mut() {
            if self.state.env.is_distributed() {
                adapter.wrap(&mut self.state)?;
            }
        }

        let epochs = self.state.config.epochs;
        let direction = self.state.config.metric_direction;
        tracing::info!("[Train] 学習を開始します: epoch {start_epoch} から {epochs} まで");

        for epoch in start_epoch..=epochs {
            self.phase = Phase::EpochRunning;
            self.state.time_info.reset();
            let trainer = self
                .trainer
                .as_mut()
                .ok_or_else(|| PinnError::config("no epoch strategy was given"))?;
            trainer.run_epoch(&mut self.state, epoch)?;

            tracing::info!(
                "[Train][Epoch {epoch}/{epochs}][Avg] {}",
                self.state.metrics.avg_summary()
            );
            if let Some(loss) = self.state.metrics.get("loss") {
                self.state.history.train_loss.push((epoch, loss.avg()));
            }
            self.state.metrics.clear();

            let mut cur_metric = direction.worst();
            if self.state.config.should_eval(epoch) {
                cur_metric = self.eval(epoch)?;
                self.state.history.eval_metric.push((epoch, cur_metric));
                if self.state.best.observe(cur_metric, epoch) {
                    self.phase = Phase::Checkpointing;
                    self.save(self.state.best.record(), CheckpointTag::Best)?;
                }
                tracing::info!(
                    "[Eval][Epoch {epoch}][best metric: {}]",
                    self.state.best.metric()
                );
            }

            if self.state.scheduler.by_epoch() {
                self.state.scheduler.step();
            }

            self.phase = Phase::Checkpointing;
            let record = MetricRecord {
                metric: cur_metric,
                epoch,
            };
            if self.state.config.should_save(epoch) {
                self.save(record, CheckpointTag::Epoch(epoch))?;
            }
            self.save(record, CheckpointTag::Latest)?;
        }

        self.phase = Phase::Completed;
        tracing::info!(
            "[Train] 学習が完了しました (best {})",
            self.state.best.record()
        );
        Ok(())
    }

    /// 評価を1パス行います。モデルのモードは呼び出し前の状態に戻ります。
    pub fn eval(&mut self, epoch: usize) -> PinnResult<f64> {
        let validator = self
            .validator
            .as_mut()
            .ok_or_else(|| PinnError::config("no validator was given"))?;
        self.phase = Phase::Evaluating;

        let metric = {
            let mut scope = InferenceScope::new(&mut self.state);
            scope.eval_metrics.clear();
            let metric = validator.run_eval(&mut *scope, epoch)?;
            tracing::info!(
                "[Eval][Epoch {epoch}][Avg] {}",
                scope.eval_metrics.avg_summary()
            );
            metric
        };
        Ok(metric)
    }
}
