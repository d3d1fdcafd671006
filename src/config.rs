//! 学習・評価の設定。JSON ファイルから読み込み、出力ディレクトリに書き戻します。

use crate::error::{PinnError, PinnResult};
use crate::lbfgs::LbfgsConfig;
use crate::metric::MetricDirection;
use crate::model::ArchConfig;
use crate::schedule::LrSchedulerConfig;
use crate::viv::VivConfig;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// エポックごとの学習方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TrainMode {
    /// ミニバッチ + Adam
    #[default]
    Standard,
    /// フルバッチ + L-BFGS
    Lbfgs,
}

/// 学習ループの設定。省略した項目は VIV 問題の既定値になります。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub iters_per_epoch: usize,
    /// 何イテレーション分の勾配を溜めてから更新するか
    pub update_freq: usize,
    /// `epoch_N` を保存する間隔。0 なら保存しない
    pub save_freq: usize,
    pub eval_during_train: bool,
    pub eval_freq: usize,
    pub start_eval_epoch: usize,
    pub log_freq: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub train_mode: TrainMode,
    pub metric_direction: MetricDirection,
    pub pretrained_model_path: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub arch: ArchConfig,
    pub lr_scheduler: LrSchedulerConfig,
    #[serde(deserialize_with = "crate::lbfgs::lbfgs_with_defaults")]
    pub lbfgs: LbfgsConfig,
    pub viv: VivConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100_000,
            iters_per_epoch: 1,
            update_freq: 1,
            save_freq: 1000,
            eval_during_train: true,
            eval_freq: 1000,
            start_eval_epoch: 1,
            log_freq: 10,
            seed: 42,
            output_dir: PathBuf::from("./output_viv"),
            train_mode: TrainMode::Standard,
            metric_direction: MetricDirection::Lower,
            pretrained_model_path: None,
            checkpoint_path: None,
            arch: ArchConfig::default(),
            lr_scheduler: LrSchedulerConfig::default(),
            lbfgs: LbfgsConfig::new(),
            viv: VivConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: impl AsRef<Path>) -> PinnResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            PinnError::config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PinnResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 0 だと意味をなさない間隔を弾きます。
    pub fn validate(&self) -> PinnResult<()> {
        let cadences = [
            ("epochs", self.epochs),
            ("iters_per_epoch", self.iters_per_epoch),
            ("update_freq", self.update_freq),
            ("eval_freq", self.eval_freq),
            ("log_freq", self.log_freq),
        ];
        for (name, value) in cadences {
            if value == 0 {
                return Err(PinnError::config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    /// このエポックで評価するか。`start_eval_epoch` が `eval_freq` の倍数でなければ
    /// 最初の評価はその次の倍数になります。
    pub fn should_eval(&self, epoch: usize) -> bool {
        self.eval_during_train && epoch % self.eval_freq == 0 && epoch >= self.start_eval_epoch
    }

    pub fn should_save(&self, epoch: usize) -> bool {
        self.save_freq > 0 && epoch % self.save_freq == 0
    }
}
