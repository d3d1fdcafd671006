use crate::config::TrainingConfig;
use crate::error::{PinnError, PinnResult};
use crate::training::setup;
use std::time::Instant;

/// `eval` サブコマンドを実行します。学習済みモデルで評価データを1回走査し、MSE を返します。
pub fn run(config: TrainingConfig) -> PinnResult<f64> {
    let Some(pretrained) = config.pretrained_model_path.clone() else {
        return Err(PinnError::config(
            "eval needs pretrained_model_path (--pretrained)",
        ));
    };

    tracing::info!("評価を実行します - バックエンド: NdArray (CPU)");
    let eval_start = Instant::now();

    let mut solver = setup(&config)?.into_evaluator(config)?;
    tracing::info!("'{}' の重みで評価します", pretrained.display());

    let metric = solver.eval(0)?;
    tracing::info!(
        "評価が完了しました。MSE: {metric:.6e}, 評価時間: {:.2?}",
        eval_start.elapsed()
    );
    Ok(metric)
}
