//! # 渦励振 (VIV) サロゲートモデルの学習プログラム
//!
//! `burn` フレームワークで、時刻から構造物の変位を予測するネットワークを学習します。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --config viv.json
//! ```
//!
//! ### 途中から再開
//! ```bash
//! cargo run --release -- train --checkpoint output_viv/checkpoints/latest
//! ```
//!
//! ### 評価
//! ```bash
//! cargo run --release -- eval --pretrained output_viv/checkpoints/best_model
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use viv_pinn::cli::{Cli, Commands};
use viv_pinn::{evaluation, logging, training};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => {
            let config = args.resolve().context("invalid training configuration")?;
            logging::init(Some(&config.output_dir.join("train.log")))?;
            let summary = training::run(config).context("training failed")?;
            tracing::info!("=> ベスト: {}", summary.best);
        }
        Commands::Eval(args) => {
            let config = args.resolve().context("invalid evaluation configuration")?;
            logging::init(Some(&config.output_dir.join("eval.log")))?;
            evaluation::run(config).context("evaluation failed")?;
        }
    }
    Ok(())
}
