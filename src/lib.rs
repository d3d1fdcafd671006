//! # 渦励振 (VIV) のための物理情報ニューラルネットワーク (PINN) ライブラリ
//!
//! `burn` フレームワークの上に、次のコンポーネントを提供します。
//!
//! - [`init`]: パラメータをその場で書き換える初期化関数群 (Xavier, Kaiming, 切断正規分布など)
//! - [`solver`]: エポック単位の学習ループと評価、ベストメトリックの追跡
//! - [`checkpoint`]: `best_model` / `latest` / `epoch_N` のチェックポイント
//! - [`viv`]: 減衰振動データに対する教師あり制約と評価器

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dist;
pub mod error;
pub mod evaluation;
pub mod init;
pub mod lbfgs;
pub mod logging;
pub mod metric;
pub mod model;
pub mod param;
pub mod plot;
pub mod schedule;
pub mod solver;
pub mod training;
pub mod viv;

pub use error::{PinnError, PinnResult};
