use crate::config::{TrainMode, TrainingConfig};
use crate::error::PinnResult;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Vortex-induced vibration surrogate training with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または eval）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// モデルを学習し、チェックポイントを出力ディレクトリに保存します
    Train(RunArgs),
    /// 学習済みモデルを評価データで評価します
    Eval(RunArgs),
}

/// 両サブコマンド共通の引数。指定したものだけ設定ファイルの値を上書きします。
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON の設定ファイル
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, value_enum)]
    pub train_mode: Option<TrainMode>,
    /// 学習を再開するチェックポイント（例: output_viv/checkpoints/latest）
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// 重みだけを読み込むモデルファイル
    #[arg(long)]
    pub pretrained: Option<PathBuf>,
}

impl RunArgs {
    /// 設定ファイル（無ければ既定値）を読み、コマンドライン引数で上書きします。
    pub fn resolve(&self) -> PinnResult<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(mode) = self.train_mode {
            config.train_mode = mode;
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint_path = Some(path.clone());
        }
        if let Some(path) = &self.pretrained {
            config.pretrained_model_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "viv-pinn",
            "train",
            "--epochs",
            "3",
            "--train-mode",
            "lbfgs",
            "--output-dir",
            "/tmp/viv",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.train_mode, TrainMode::Lbfgs);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/viv"));
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn zero_epochs_is_rejected() {
        let args = RunArgs {
            epochs: Some(0),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }
}
