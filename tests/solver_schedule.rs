use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use viv_pinn::checkpoint::{CheckpointStore, CheckpointTag};
use viv_pinn::config::TrainingConfig;
use viv_pinn::dist::DistEnv;
use viv_pinn::metric::MetricRecord;
use viv_pinn::schedule::{LrScheduler, LrSchedulerConfig};
use viv_pinn::solver::{
    DistributedAdapter, EpochStrategy, EvalStrategy, Mode, Phase, Solver, TrainingState,
};
use viv_pinn::{PinnError, PinnResult};

type State = TrainingState<(), ()>;

#[derive(Default)]
struct Log {
    epochs: Vec<usize>,
    evals: Vec<(usize, Mode)>,
    saves: Vec<(CheckpointTag, MetricRecord)>,
    pretrained: Vec<PathBuf>,
    wraps: usize,
}

type Shared = Rc<RefCell<Log>>;

struct CountingEpoch(Shared);

impl EpochStrategy<(), ()> for CountingEpoch {
    fn run_epoch(&mut self, state: &mut State, epoch: usize) -> PinnResult<()> {
        self.0.borrow_mut().epochs.push(epoch);
        state.metrics.update("loss", 1.0 / epoch as f64, 1);
        Ok(())
    }
}

/// 呼ばれた順に `metrics` の値を返す評価器。`fail_at` のエポックではエラーを返します。
struct ScriptedEval {
    log: Shared,
    metrics: Vec<f64>,
    fail_at: Option<usize>,
}

impl EvalStrategy<(), ()> for ScriptedEval {
    fn run_eval(&mut self, state: &mut State, epoch: usize) -> PinnResult<f64> {
        let mut log = self.log.borrow_mut();
        log.evals.push((epoch, state.mode()));
        if self.fail_at == Some(epoch) {
            return Err(PinnError::tensor("evaluation failed"));
        }
        let metric = self.metrics[log.evals.len() - 1];
        state.eval_metrics.update("MSE.eta", metric, 1);
        Ok(metric)
    }
}

struct RecordingStore {
    log: Shared,
    resume_from: Option<MetricRecord>,
}

impl CheckpointStore<(), ()> for RecordingStore {
    fn save(
        &self,
        _model: &(),
        _optimizer: &(),
        _scheduler: &dyn LrScheduler,
        record: MetricRecord,
        tag: CheckpointTag,
    ) -> PinnResult<()> {
        self.log.borrow_mut().saves.push((tag, record));
        Ok(())
    }

    fn load_checkpoint(
        &self,
        _path: &Path,
        model: (),
        optimizer: (),
        scheduler: &mut dyn LrScheduler,
    ) -> PinnResult<((), (), Option<MetricRecord>)> {
        if let Some(record) = self.resume_from {
            scheduler.set_last_step(record.epoch);
        }
        Ok((model, optimizer, self.resume_from))
    }

    fn load_pretrained(&self, path: &Path, model: ()) -> PinnResult<()> {
        self.log.borrow_mut().pretrained.push(path.to_path_buf());
        Ok(model)
    }
}

struct CountingAdapter(Shared);

impl DistributedAdapter<(), ()> for CountingAdapter {
    fn wrap(&mut self, state: &mut State) -> PinnResult<()> {
        let mut log = self.0.borrow_mut();
        assert!(log.epochs.is_empty(), "wrap must run before the first epoch");
        assert!(state.env.is_distributed());
        log.wraps += 1;
        Ok(())
    }
}

fn config(epochs: usize, eval_freq: usize, save_freq: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        eval_freq,
        start_eval_epoch: 1,
        save_freq,
        lr_scheduler: LrSchedulerConfig::Constant {
            learning_rate: 1e-3,
            by_epoch: false,
        },
        ..Default::default()
    }
}

fn scripted_solver(config: TrainingConfig, log: &Shared, metrics: Vec<f64>) -> Solver<(), ()> {
    solver_with(config, log, metrics, None, None)
}

fn solver_with(
    config: TrainingConfig,
    log: &Shared,
    metrics: Vec<f64>,
    fail_at: Option<usize>,
    resume_from: Option<MetricRecord>,
) -> Solver<(), ()> {
    let state = TrainingState::new(config, DistEnv::default(), (), ());
    let store = RecordingStore {
        log: log.clone(),
        resume_from,
    };
    Solver::new(state, Box::new(CountingEpoch(log.clone())), Box::new(store))
        .unwrap()
        .with_validator(Box::new(ScriptedEval {
            log: log.clone(),
            metrics,
            fail_at,
        }))
}

fn saves_of(log: &Shared, pred: impl Fn(&CheckpointTag) -> bool) -> Vec<(CheckpointTag, MetricRecord)> {
    log.borrow()
        .saves
        .iter()
        .filter(|(tag, _)| pred(tag))
        .cloned()
        .collect()
}

#[test]
fn five_epochs_follow_eval_and_save_cadence() {
    let log = Shared::default();
    let mut solver = scripted_solver(config(5, 2, 3), &log, vec![2.0, 1.0]);
    solver.train().unwrap();

    let evals: Vec<usize> = log.borrow().evals.iter().map(|(e, _)| *e).collect();
    assert_eq!(evals, vec![2, 4]);
    assert_eq!(log.borrow().epochs, vec![1, 2, 3, 4, 5]);

    let latest = saves_of(&log, |t| *t == CheckpointTag::Latest);
    assert_eq!(latest.len(), 5);
    let epoch_saves: Vec<CheckpointTag> = saves_of(&log, |t| matches!(t, CheckpointTag::Epoch(_)))
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(epoch_saves, vec![CheckpointTag::Epoch(3)]);
    assert_eq!(solver.phase(), Phase::Completed);
}

#[test]
fn eval_runs_in_inference_mode_and_restores_training_mode() {
    let log = Shared::default();
    let mut solver = scripted_solver(config(2, 1, 0), &log, vec![1.0, 1.0]);
    solver.train().unwrap();
    assert!(log.borrow().evals.iter().all(|(_, mode)| *mode == Mode::Eval));
    assert_eq!(solver.state().mode(), Mode::Train);
}

#[test]
fn best_metric_moves_only_on_strict_improvement() {
    let log = Shared::default();
    let mut solver = scripted_solver(config(4, 1, 0), &log, vec![3.0, 5.0, 3.0, 1.0]);
    solver.train().unwrap();

    let best: Vec<MetricRecord> = saves_of(&log, |t| *t == CheckpointTag::Best)
        .into_iter()
        .map(|(_, r)| r)
        .collect();
    assert_eq!(
        best,
        vec![
            MetricRecord { metric: 3.0, epoch: 1 },
            MetricRecord { metric: 1.0, epoch: 4 },
        ]
    );
    assert_eq!(solver.state().best.record(), MetricRecord { metric: 1.0, epoch: 4 });

    // latest carries the metric of its own epoch, not the best one
    let latest = saves_of(&log, |t| *t == CheckpointTag::Latest);
    assert_eq!(latest[1].1, MetricRecord { metric: 5.0, epoch: 2 });
    assert_eq!(solver.state().history.eval_metric.len(), 4);
    assert_eq!(solver.state().history.train_loss[1], (2, 0.5));
}

#[test]
fn epochs_without_eval_save_the_worst_metric() {
    let log = Shared::default();
    let mut solver = scripted_solver(config(3, 2, 1), &log, vec![0.5]);
    solver.train().unwrap();

    let first_epoch = saves_of(&log, |t| *t == CheckpointTag::Epoch(1));
    assert_eq!(first_epoch.len(), 1);
    assert!(first_epoch[0].1.metric.is_infinite());
    let second_epoch = saves_of(&log, |t| *t == CheckpointTag::Epoch(2));
    assert_eq!(second_epoch[0].1.metric, 0.5);
}

#[test]
fn failing_eval_propagates_and_restores_mode() {
    let log = Shared::default();
    let mut solver = solver_with(config(3, 1, 0), &log, vec![1.0, 1.0, 1.0], Some(2), None);

    let err = solver.train().unwrap_err();
    assert!(matches!(err, PinnError::Tensor(_)));
    assert_eq!(solver.state().mode(), Mode::Train);
    assert_eq!(solver.phase(), Phase::Evaluating);
    assert_eq!(log.borrow().epochs, vec![1, 2]);
    // epoch 2 never reached its checkpoints
    assert_eq!(saves_of(&log, |t| *t == CheckpointTag::Latest).len(), 1);
}

#[test]
fn epoch_cadence_schedule_steps_once_per_epoch() {
    let log = Shared::default();
    let mut cfg = config(4, 1, 0);
    cfg.eval_during_train = false;
    cfg.lr_scheduler = LrSchedulerConfig::Step {
        learning_rate: 1.0,
        step_size: 2,
        gamma: 0.5,
        by_epoch: true,
    };
    let mut by_epoch = scripted_solver(cfg, &log, vec![]);
    by_epoch.train().unwrap();
    assert_eq!(by_epoch.state().scheduler.last_step(), 4);
    assert!((by_epoch.state().scheduler.get_lr() - 0.25).abs() < 1e-12);
    assert!(log.borrow().evals.is_empty());

    let log = Shared::default();
    let mut cfg = config(4, 1, 0);
    cfg.eval_during_train = false;
    let mut constant = scripted_solver(cfg, &log, vec![]);
    constant.train().unwrap();
    assert_eq!(constant.state().scheduler.last_step(), 0);
}

#[test]
fn eval_without_validator_is_a_config_error() {
    let log = Shared::default();
    let state = TrainingState::new(config(2, 1, 0), DistEnv::default(), (), ());
    let store = RecordingStore {
        log: log.clone(),
        resume_from: None,
    };
    let mut solver = Solver::new(state, Box::new(CountingEpoch(log.clone())), Box::new(store)).unwrap();
    assert!(matches!(solver.train(), Err(PinnError::Config(_))));
    assert!(matches!(solver.eval(1), Err(PinnError::Config(_))));
    assert!(log.borrow().epochs.is_empty());
}

#[test]
fn evaluator_evaluates_but_refuses_to_train() {
    let log = Shared::default();
    let state = TrainingState::new(config(2, 1, 0), DistEnv::default(), (), ());
    let store = RecordingStore {
        log: log.clone(),
        resume_from: None,
    };
    let mut solver = Solver::evaluator(state, Box::new(store))
        .unwrap()
        .with_validator(Box::new(ScriptedEval {
            log: log.clone(),
            metrics: vec![0.25],
            fail_at: None,
        }));
    assert_eq!(solver.eval(0).unwrap(), 0.25);
    assert_eq!(log.borrow().evals, vec![(0, Mode::Eval)]);
    assert_eq!(solver.state().mode(), Mode::Train);

    assert!(matches!(solver.train(), Err(PinnError::Config(_))));
    assert!(log.borrow().epochs.is_empty());
    assert!(log.borrow().saves.is_empty());
}

#[test]
fn distributed_run_needs_an_adapter() {
    let log = Shared::default();
    let mut solver = scripted_solver(config(2, 1, 0), &log, vec![1.0, 1.0]);
    // the env is fixed at construction, so rebuild with a world size of 2
    let mut state = solver.into_state();
    state.env = DistEnv {
        rank: 0,
        world_size: 2,
    };
    let build = |state: State| {
        Solver::new(
            state,
            Box::new(CountingEpoch(log.clone())),
            Box::new(RecordingStore {
                log: log.clone(),
                resume_from: None,
            }),
        )
        .unwrap()
        .with_validator(Box::new(ScriptedEval {
            log: log.clone(),
            metrics: vec![1.0, 1.0],
            fail_at: None,
        }))
    };

    solver = build(state);
    assert!(matches!(solver.train(), Err(PinnError::Config(_))));

    let mut solver = build(solver.into_state()).with_distributed(Box::new(CountingAdapter(log.clone())));
    solver.train().unwrap();
    assert_eq!(log.borrow().wraps, 1);
    assert_eq!(log.borrow().epochs, vec![1, 2]);
}

#[test]
fn resume_starts_after_the_saved_epoch() {
    let log = Shared::default();
    let mut cfg = config(5, 1, 0);
    cfg.checkpoint_path = Some(PathBuf::from("out/checkpoints/latest"));
    let record = MetricRecord {
        metric: 0.5,
        epoch: 3,
    };
    let mut solver = solver_with(cfg, &log, vec![0.7, 0.4], None, Some(record));
    solver.train().unwrap();

    assert_eq!(log.borrow().epochs, vec![4, 5]);
    assert_eq!(solver.state().scheduler.last_step(), 3);
    // 0.7 does not beat the loaded 0.5, 0.4 does
    let best: Vec<MetricRecord> = saves_of(&log, |t| *t == CheckpointTag::Best)
        .into_iter()
        .map(|(_, r)| r)
        .collect();
    assert_eq!(best, vec![MetricRecord { metric: 0.4, epoch: 5 }]);
}

#[test]
fn resume_with_unevaluated_record_keeps_best_empty() {
    let log = Shared::default();
    let mut cfg = config(4, 1, 0);
    cfg.checkpoint_path = Some(PathBuf::from("out/checkpoints/latest"));
    let record = MetricRecord {
        metric: f64::INFINITY,
        epoch: 2,
    };
    let mut solver = solver_with(cfg, &log, vec![2.0, 3.0], None, Some(record));
    solver.train().unwrap();
    assert_eq!(log.borrow().epochs, vec![3, 4]);
    assert_eq!(solver.state().best.record(), MetricRecord { metric: 2.0, epoch: 3 });
}

#[test]
fn pretrained_weights_load_at_construction() {
    let log = Shared::default();
    let mut cfg = config(1, 1, 0);
    cfg.pretrained_model_path = Some(PathBuf::from("weights/best_model"));
    let _solver = scripted_solver(cfg, &log, vec![1.0]);
    assert_eq!(log.borrow().pretrained, vec![PathBuf::from("weights/best_model")]);
}
