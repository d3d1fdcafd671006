//! チェックポイントの保存と読み込み。
//!
//! `{output_dir}/checkpoints/` の下にタグごとに次のファイルを書きます。
//!
//! - `{tag}.mpk`: モデルの重み
//! - `{tag}_optim.*`: オプティマイザの状態
//! - `{tag}.json`: メトリック、学習率スケジュールの位置、モデル名

use crate::error::PinnResult;
use crate::lbfgs::{Lbfgs, LbfgsState};
use crate::metric::MetricRecord;
use crate::schedule::LrScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Optimizer, SimpleOptimizer};
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// 保存するスナップショットの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Best,
    Latest,
    Epoch(usize),
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointTag::Best => write!(f, "best_model"),
            CheckpointTag::Latest => write!(f, "latest"),
            CheckpointTag::Epoch(epoch) => write!(f, "epoch_{epoch}"),
        }
    }
}

/// `{tag}.json` の中身。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_name: String,
    pub metric: MetricRecord,
    pub lr_last_step: usize,
}

/// オプティマイザの状態をファイルへ書き出す方法。
///
/// `stem` には拡張子を付けないパスを渡します。
pub trait OptimizerState<B: Backend>: Sized {
    fn save_state(&self, stem: &Path) -> PinnResult<()>;

    fn load_state(self, stem: &Path, device: &B::Device) -> PinnResult<Self>;
}

impl<B, M, O> OptimizerState<B> for OptimizerAdaptor<O, M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: SimpleOptimizer<B::InnerBackend>,
{
    fn save_state(&self, stem: &Path) -> PinnResult<()> {
        Recorder::<B>::record(
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            self.to_record(),
            stem.to_path_buf(),
        )?;
        Ok(())
    }

    fn load_state(self, stem: &Path, device: &B::Device) -> PinnResult<Self> {
        let record = Recorder::<B>::load(
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            stem.to_path_buf(),
            device,
        )?;
        Ok(self.load_record(record))
    }
}

impl<B: Backend> OptimizerState<B> for Lbfgs {
    fn save_state(&self, stem: &Path) -> PinnResult<()> {
        fs::write(
            stem.with_extension("json"),
            serde_json::to_string(self.state())?,
        )?;
        Ok(())
    }

    fn load_state(mut self, stem: &Path, _device: &B::Device) -> PinnResult<Self> {
        let json = fs::read_to_string(stem.with_extension("json"))?;
        let state: LbfgsState = serde_json::from_str(&json)?;
        self.restore_state(state);
        Ok(self)
    }
}

/// 状態を持たないオプティマイザ。評価だけを行うソルバーで使います。
impl<B: Backend> OptimizerState<B> for () {
    fn save_state(&self, _stem: &Path) -> PinnResult<()> {
        Ok(())
    }

    fn load_state(self, _stem: &Path, _device: &B::Device) -> PinnResult<Self> {
        Ok(())
    }
}

/// 学習ループから見た永続化の窓口。
pub trait CheckpointStore<M, O> {
    /// モデル・オプティマイザ・メトリックを `tag` の名前で保存します。
    fn save(
        &self,
        model: &M,
        optimizer: &O,
        scheduler: &dyn LrScheduler,
        record: MetricRecord,
        tag: CheckpointTag,
    ) -> PinnResult<()>;

    /// `path`（拡張子なし、または `.mpk`）から学習状態を復元します。
    /// メタデータがなければ `None` を返します。
    fn load_checkpoint(
        &self,
        path: &Path,
        model: M,
        optimizer: O,
        scheduler: &mut dyn LrScheduler,
    ) -> PinnResult<(M, O, Option<MetricRecord>)>;

    /// 重みだけを読み込みます。
    fn load_pretrained(&self, path: &Path, model: M) -> PinnResult<M>;
}

/// `NamedMpkFileRecorder` でファイルに保存するストア。rank 0 だけが書き込みます。
pub struct CheckpointManager<B: Backend> {
    dir: PathBuf,
    model_name: String,
    rank: usize,
    device: B::Device,
}

impl<B: Backend> CheckpointManager<B> {
    pub fn new(
        output_dir: impl AsRef<Path>,
        model_name: impl Into<String>,
        rank: usize,
        device: B::Device,
    ) -> Self {
        Self {
            dir: output_dir.as_ref().join("checkpoints"),
            model_name: model_name.into(),
            rank,
            device,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// タグに対応する拡張子なしのパス。
    pub fn stem(&self, tag: CheckpointTag) -> PathBuf {
        self.dir.join(tag.to_string())
    }

    fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
        NamedMpkFileRecorder::<FullPrecisionSettings>::new()
    }
}

fn optim_stem(stem: &Path) -> PathBuf {
    let mut name = stem
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("_optim");
    stem.with_file_name(name)
}

impl<B, M, O> CheckpointStore<M, O> for CheckpointManager<B>
where
    B: Backend,
    M: Module<B>,
    O: OptimizerState<B>,
{
    fn save(
        &self,
        model: &M,
        optimizer: &O,
        scheduler: &dyn LrScheduler,
        record: MetricRecord,
        tag: CheckpointTag,
    ) -> PinnResult<()> {
        if self.rank != 0 {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let stem = self.stem(tag);

        model.clone().save_file(stem.clone(), &Self::recorder())?;
        optimizer.save_state(&optim_stem(&stem))?;
        let meta = CheckpointMeta {
            model_name: self.model_name.clone(),
            metric: record,
            lr_last_step: scheduler.last_step(),
        };
        fs::write(
            stem.with_extension("json"),
            serde_json::to_string_pretty(&meta)?,
        )?;

        tracing::info!("チェックポイントを保存しました: {}", stem.display());
        Ok(())
    }

    fn load_checkpoint(
        &self,
        path: &Path,
        model: M,
        optimizer: O,
        scheduler: &mut dyn LrScheduler,
    ) -> PinnResult<(M, O, Option<MetricRecord>)> {
        let stem = path.with_extension("");
        let model = model.load_file(stem.clone(), &Self::recorder(), &self.device)?;
        let optimizer = optimizer.load_state(&optim_stem(&stem), &self.device)?;

        let meta_path = stem.with_extension("json");
        let record = if meta_path.exists() {
            let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
            if meta.model_name != self.model_name {
                tracing::warn!(
                    "チェックポイントのモデル名 '{}' が現在のモデル '{}' と異なります",
                    meta.model_name,
                    self.model_name
                );
            }
            scheduler.set_last_step(meta.lr_last_step);
            Some(meta.metric)
        } else {
            None
        };

        tracing::info!("チェックポイントを読み込みました: {}", stem.display());
        Ok((model, optimizer, record))
    }

    fn load_pretrained(&self, path: &Path, model: M) -> PinnResult<M> {
        let stem = path.with_extension("");
        let model = model.load_file(stem.clone(), &Self::recorder(), &self.device)?;
        tracing::info!("学習済みモデルを読み込みました: {}", stem.display());
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbfgs::{Flatten, LbfgsConfig};
    use crate::model::{Mlp, MlpConfig};
    use crate::param::to_host;
    use crate::schedule::{ConstantLr, StepDecay};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    fn mlp<B: Backend>() -> Mlp<B> {
        MlpConfig::new(vec!["t_f".into()], vec!["eta".into()])
            .with_num_layers(2)
            .with_hidden_size(4)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn tags_format_like_file_names() {
        assert_eq!(CheckpointTag::Best.to_string(), "best_model");
        assert_eq!(CheckpointTag::Latest.to_string(), "latest");
        assert_eq!(CheckpointTag::Epoch(12).to_string(), "epoch_12");
        assert_eq!(
            optim_stem(Path::new("out/checkpoints/latest")),
            PathBuf::from("out/checkpoints/latest_optim")
        );
    }

    #[test]
    fn save_and_resume_with_adam() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointManager::<TestAutodiff>::new(dir.path(), "MLP", 0, Default::default());
        let model = mlp::<TestAutodiff>();
        let optim = AdamConfig::new().init::<TestAutodiff, Mlp<TestAutodiff>>();
        let mut sched = StepDecay::new(0.1, 10, 0.5, false);
        sched.set_last_step(25);
        let record = MetricRecord {
            metric: f64::INFINITY,
            epoch: 3,
        };

        store
            .save(&model, &optim, &sched, record, CheckpointTag::Epoch(3))
            .unwrap();
        let stem = store.stem(CheckpointTag::Epoch(3));
        assert!(stem.with_extension("mpk").exists());
        assert!(stem.with_extension("json").exists());

        let mut fresh = ConstantLr::new(0.1, false);
        let (loaded, _optim, meta) = store
            .load_checkpoint(&stem.with_extension("mpk"), mlp::<TestAutodiff>(), optim, &mut fresh)
            .unwrap();
        assert_eq!(meta, Some(record));
        assert_eq!(fresh.last_step(), 25);

        let input = Tensor::<TestAutodiff, 2>::ones([2, 1], &Default::default());
        assert_eq!(
            to_host(loaded.forward(input.clone())).unwrap(),
            to_host(model.forward(input)).unwrap()
        );
    }

    #[test]
    fn lbfgs_state_reloads_exactly_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointManager::<TestBackend>::new(dir.path(), "MLP", 0, Default::default());
        let sched = ConstantLr::new(1.0, false);
        let record = MetricRecord {
            metric: 0.5,
            epoch: 1,
        };
        let mut optim = LbfgsConfig::new().with_learning_rate(0.1).init();
        let mut model = mlp::<TestBackend>();
        for _ in 0..3 {
            model = optim
                .step(model, |m| {
                    let p = m.parameters()?;
                    let loss = p.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>() / 2.0;
                    Ok((loss, p))
                })
                .unwrap()
                .0;
        }
        store
            .save(&model, &optim, &sched, record, CheckpointTag::Latest)
            .unwrap();
        assert!(dir.path().join("checkpoints/latest_optim.json").exists());

        let stem = dir.path().join("checkpoints/latest_optim");
        let restored = OptimizerState::<TestBackend>::load_state(
            LbfgsConfig::new().with_learning_rate(0.1).init(),
            &stem,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(restored.state(), optim.state());
    }

    #[test]
    fn non_zero_rank_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointManager::<TestBackend>::new(dir.path(), "MLP", 1, Default::default());
        let sched = ConstantLr::new(1.0, false);
        let record = MetricRecord {
            metric: 0.5,
            epoch: 1,
        };
        store
            .save(&mlp::<TestBackend>(), &LbfgsConfig::new().init(), &sched, record, CheckpointTag::Latest)
            .unwrap();
        assert!(!store.dir().exists());
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointManager::<TestBackend>::new(dir.path(), "MLP", 0, Default::default());
        let res = CheckpointStore::<Mlp<TestBackend>, Lbfgs>::load_pretrained(
            &store,
            &dir.path().join("nothing"),
            mlp(),
        );
        assert!(res.is_err());
    }
}
