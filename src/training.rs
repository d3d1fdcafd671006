use crate::checkpoint::{CheckpointManager, OptimizerState};
use crate::config::{TrainMode, TrainingConfig};
use crate::dist::{DistEnv, seed_everything};
use crate::error::PinnResult;
use crate::metric::MetricRecord;
use crate::model::{Mlp, build_model};
use crate::plot::plot_history;
use crate::solver::{
    Constraint, EpochStrategy, History, LbfgsEpoch, Solver, StandardEpoch, TrainingState,
};
use crate::viv::{Dataset, SupervisedConstraint, SupervisedValidator, synthetic_displacement};
use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use std::time::{Duration, Instant};

pub type TrainBackend = Autodiff<NdArray<f32>>;
pub type TrainModel = Mlp<TrainBackend>;

/// 学習の結果。
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub best: MetricRecord,
    pub history: History,
    pub elapsed: Duration,
}

/// 問題設定とモデルまで組み立てた学習の材料。
pub(crate) struct Setup {
    pub env: DistEnv,
    pub model: TrainModel,
    pub constraints: Vec<Box<dyn Constraint<TrainModel, TrainBackend>>>,
    pub validator: SupervisedValidator<TrainBackend>,
    pub store: CheckpointManager<TrainBackend>,
}

pub(crate) fn setup(config: &TrainingConfig) -> PinnResult<Setup> {
    config.validate()?;
    let device = Default::default();
    let env = DistEnv::from_env()?;
    let rng = seed_everything::<TrainBackend>(config.seed, env.rank);

    let data: Dataset = synthetic_displacement(&config.viv)?;
    let model = build_model::<TrainBackend>(&config.arch, &device)?;
    let constraint = SupervisedConstraint::new(
        "EQ",
        data.clone(),
        config.viv.train_batch_size,
        config.viv.eta_weight,
        rng,
        device,
    )?;
    let validator =
        SupervisedValidator::new("eta_mse", data, config.viv.eval_batch_size, device)?;
    let store = CheckpointManager::new(&config.output_dir, config.arch.name(), env.rank, device);

    Ok(Setup {
        env,
        model,
        constraints: vec![Box::new(constraint) as Box<dyn Constraint<_, _>>],
        validator,
        store,
    })
}

impl Setup {
    pub(crate) fn into_solver<O>(
        self,
        config: TrainingConfig,
        optimizer: O,
        trainer: Box<dyn EpochStrategy<TrainModel, O>>,
    ) -> PinnResult<Solver<TrainModel, O>>
    where
        O: OptimizerState<TrainBackend> + 'static,
    {
        let state = TrainingState::new(config, self.env, self.model, optimizer);
        Ok(Solver::new(state, trainer, Box::new(self.store))?.with_validator(Box::new(self.validator)))
    }

    /// 学習戦略とオプティマイザを持たない評価用のソルバーを作ります。
    pub(crate) fn into_evaluator(self, config: TrainingConfig) -> PinnResult<Solver<TrainModel, ()>> {
        let state = TrainingState::new(config, self.env, self.model, ());
        Ok(Solver::evaluator(state, Box::new(self.store))?.with_validator(Box::new(self.validator)))
    }
}

fn train_with<O: Clone>(mut solver: Solver<TrainModel, O>) -> PinnResult<(MetricRecord, History)> {
    solver.train()?;
    let state = solver.into_state();
    Ok((state.best.record(), state.history))
}

/// `train` サブコマンドを実行します。
pub fn run(config: TrainingConfig) -> PinnResult<TrainSummary> {
    let setup = setup(&config)?;
    if setup.env.rank == 0 {
        config.save(config.output_dir.join("config.json"))?;
    }
    let rank = setup.env.rank;
    let output_dir = config.output_dir.clone();

    tracing::info!(
        "学習を開始します (VIV, {:?}) - バックエンド: NdArray (CPU)",
        config.train_mode
    );
    let training_start = Instant::now();

    let (best, history) = match config.train_mode {
        TrainMode::Standard => {
            let mut setup = setup;
            let trainer = StandardEpoch::new(std::mem::take(&mut setup.constraints))?;
            let optimizer = AdamConfig::new().init::<TrainBackend, TrainModel>();
            train_with(setup.into_solver(config, optimizer, Box::new(trainer))?)?
        }
        TrainMode::Lbfgs => {
            let mut setup = setup;
            let trainer = LbfgsEpoch::new(std::mem::take(&mut setup.constraints))?;
            let optimizer = config.lbfgs.init();
            train_with(setup.into_solver(config, optimizer, Box::new(trainer))?)?
        }
    };

    let elapsed = training_start.elapsed();
    tracing::info!("学習が完了しました。学習時間: {elapsed:.2?}");

    if rank == 0 {
        let graph = output_dir.join("loss_graph.png");
        match plot_history(&history, &graph) {
            Ok(()) => tracing::info!("損失グラフを '{}' に保存しました。", graph.display()),
            Err(e) => tracing::warn!("損失グラフを描けませんでした: {e}"),
        }
    }

    Ok(TrainSummary {
        best,
        history,
        elapsed,
    })
}
