use crate::error::{PinnError, PinnResult};
use crate::init::{self, FanMode, Nonlinearity};
use crate::lbfgs::{FlatGradients, Flatten};
use crate::param::{overwrite, to_host};
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Deserializer, Serialize};
use std::iter;

/// 隠れ層の活性化関数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Sin,
    Silu,
    Relu,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Sin => x.sin(),
            Activation::Silu => activation::silu(x),
            Activation::Relu => activation::relu(x),
            Activation::Sigmoid => activation::sigmoid(x),
            Activation::Identity => x,
        }
    }

    /// Kaiming 初期化のゲイン計算に使う非線形関数。
    pub fn nonlinearity(self) -> Nonlinearity {
        match self {
            Activation::Tanh => Nonlinearity::Tanh,
            Activation::Relu => Nonlinearity::Relu,
            Activation::Sigmoid => Nonlinearity::Sigmoid,
            Activation::Sin | Activation::Silu | Activation::Identity => Nonlinearity::Linear,
        }
    }
}

/// 全結合層の重みの初期化方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerInit {
    /// 重み・バイアスとも U(-1/√d_in, 1/√d_in)
    Linear,
    XavierNormal,
    XavierUniform,
    KaimingUniform,
    KaimingNormal,
}

impl LayerInit {
    /// `Linear` の重みは `[d_input, d_output]` なので fan は `reverse = true` で計算します。
    fn apply<B: Backend>(self, linear: &mut Linear<B>, activation: Activation) -> PinnResult<()> {
        let nonlinearity = activation.nonlinearity();
        match self {
            LayerInit::Linear => {
                return init::linear_init(&mut linear.weight, linear.bias.as_mut());
            }
            LayerInit::XavierNormal => init::xavier_normal(&mut linear.weight, 1.0, true)?,
            LayerInit::XavierUniform => init::xavier_uniform(&mut linear.weight, 1.0, true)?,
            LayerInit::KaimingUniform => init::kaiming_uniform(
                &mut linear.weight,
                0.0,
                FanMode::FanIn,
                nonlinearity,
                true,
            )?,
            LayerInit::KaimingNormal => init::kaiming_normal(
                &mut linear.weight,
                0.0,
                FanMode::FanIn,
                nonlinearity,
                true,
            )?,
        }
        if let Some(bias) = linear.bias.as_mut() {
            init::zeros(bias)?;
        }
        Ok(())
    }
}

/// 多層パーセプトロンの設定。
#[derive(Config, Debug)]
pub struct MlpConfig {
    /// 入力変数の名前（列の順序）
    pub input_keys: Vec<String>,
    /// 出力変数の名前（列の順序）
    pub output_keys: Vec<String>,
    #[config(default = 5)]
    pub num_layers: usize,
    #[config(default = 50)]
    pub hidden_size: usize,
    #[config(default = "Activation::Tanh")]
    pub activation: Activation,
    /// 偶数番目の隠れ層ごとに残差接続を入れる
    #[config(default = false)]
    pub skip_connection: bool,
    #[config(default = "LayerInit::XavierNormal")]
    pub init: LayerInit,
}

impl MlpConfig {
    /// 層を作り、設定された方法で重みを初期化します。
    pub fn init<B: Backend>(&self, device: &B::Device) -> PinnResult<Mlp<B>> {
        if self.input_keys.is_empty() || self.output_keys.is_empty() {
            return Err(PinnError::config("MLP needs at least one input and one output key"));
        }
        if self.num_layers == 0 || self.hidden_size == 0 {
            return Err(PinnError::config("MLP needs num_layers >= 1 and hidden_size >= 1"));
        }

        let mut linears = Vec::with_capacity(self.num_layers);
        let mut d_input = self.input_keys.len();
        for _ in 0..self.num_layers {
            let mut linear = LinearConfig::new(d_input, self.hidden_size).init(device);
            self.init.apply(&mut linear, self.activation)?;
            linears.push(linear);
            d_input = self.hidden_size;
        }
        let mut last = LinearConfig::new(self.hidden_size, self.output_keys.len()).init(device);
        self.init.apply(&mut last, Activation::Identity)?;

        Ok(Mlp {
            linears,
            last,
            layout: Ignored(MlpLayout {
                input_keys: self.input_keys.clone(),
                output_keys: self.output_keys.clone(),
                activation: self.activation,
                skip_connection: self.skip_connection,
            }),
        })
    }
}

/// 学習されない構造情報。
#[derive(Debug, Clone)]
pub struct MlpLayout {
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
    pub activation: Activation,
    pub skip_connection: bool,
}

/// 座標（VIV では時刻 `t_f`）から物理量（変位 `eta`）を予測する多層パーセプトロン。
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    linears: Vec<Linear<B>>,
    last: Linear<B>,
    layout: Ignored<MlpLayout>,
}

impl<B: Backend> Mlp<B> {
    /// 順伝播を実行します。入力は `[N, input_keys.len()]` です。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let layout = &self.layout.0;
        let mut x = input;
        let mut skip: Option<Tensor<B, 2>> = None;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if layout.skip_connection && i % 2 == 0 {
                if let Some(prev) = skip {
                    x = x + prev;
                }
                skip = Some(x.clone());
            }
            x = layout.activation.forward(x);
        }
        self.last.forward(x)
    }

    pub fn layout(&self) -> &MlpLayout {
        &self.layout.0
    }

    fn layers(&self) -> impl Iterator<Item = &Linear<B>> {
        self.linears.iter().chain(iter::once(&self.last))
    }

    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Linear<B>> {
        self.linears.iter_mut().chain(iter::once(&mut self.last))
    }
}

/// 入出力が名前付きの列で表される代理モデル。
pub trait Surrogate<B: Backend> {
    fn predict(&self, input: Tensor<B, 2>) -> Tensor<B, 2>;

    fn input_keys(&self) -> &[String];

    fn output_keys(&self) -> &[String];
}

impl<B: Backend> Surrogate<B> for Mlp<B> {
    fn predict(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(input)
    }

    fn input_keys(&self) -> &[String] {
        &self.layout.0.input_keys
    }

    fn output_keys(&self) -> &[String] {
        &self.layout.0.output_keys
    }
}

impl<B: Backend> Flatten for Mlp<B> {
    fn parameters(&self) -> PinnResult<Vec<f32>> {
        let mut flat = Vec::with_capacity(self.num_params());
        for linear in self.layers() {
            flat.extend(to_host(linear.weight.val())?);
            if let Some(bias) = &linear.bias {
                flat.extend(to_host(bias.val())?);
            }
        }
        Ok(flat)
    }

    fn with_parameters(mut self, flat: &[f32]) -> PinnResult<Self> {
        let mut offset = 0;
        for linear in self.layers_mut() {
            offset = overwrite(&mut linear.weight, flat, offset)?;
            if let Some(bias) = linear.bias.as_mut() {
                offset = overwrite(bias, flat, offset)?;
            }
        }
        if offset != flat.len() {
            return Err(PinnError::shape(format!(
                "flat parameter vector has {} values, model has {offset}",
                flat.len()
            )));
        }
        Ok(self)
    }
}

impl<B: AutodiffBackend> FlatGradients<B> for Mlp<B> {
    fn gradients(&self, grads: &B::Gradients) -> PinnResult<Vec<f32>> {
        fn collect<B: AutodiffBackend, const D: usize>(
            value: Tensor<B, D>,
            grads: &B::Gradients,
            flat: &mut Vec<f32>,
        ) -> PinnResult<()> {
            match value.grad(grads) {
                Some(grad) => flat.extend(to_host(grad)?),
                None => flat.extend(iter::repeat_n(0.0, value.dims().iter().product())),
            }
            Ok(())
        }

        let mut flat = Vec::with_capacity(self.num_params());
        for linear in self.layers() {
            collect(linear.weight.val(), grads, &mut flat)?;
            if let Some(bias) = &linear.bias {
                collect(bias.val(), grads, &mut flat)?;
            }
        }
        Ok(flat)
    }
}

/// 既知のアーキテクチャの閉じた集合。設定ファイルでは `"name"` で選びます。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ArchConfig {
    #[serde(rename = "MLP", deserialize_with = "mlp_with_defaults")]
    Mlp(MlpConfig),
}

/// 設定ファイル上の MLP ブロック。省略した項目は `MlpConfig::new` の既定値になります。
#[derive(Deserialize)]
struct MlpFields {
    input_keys: Vec<String>,
    output_keys: Vec<String>,
    num_layers: Option<usize>,
    hidden_size: Option<usize>,
    activation: Option<Activation>,
    skip_connection: Option<bool>,
    init: Option<LayerInit>,
}

fn mlp_with_defaults<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MlpConfig, D::Error> {
    let fields = MlpFields::deserialize(deserializer)?;
    let mut cfg = MlpConfig::new(fields.input_keys, fields.output_keys);
    if let Some(v) = fields.num_layers {
        cfg.num_layers = v;
    }
    if let Some(v) = fields.hidden_size {
        cfg.hidden_size = v;
    }
    if let Some(v) = fields.activation {
        cfg.activation = v;
    }
    if let Some(v) = fields.skip_connection {
        cfg.skip_connection = v;
    }
    if let Some(v) = fields.init {
        cfg.init = v;
    }
    Ok(cfg)
}

impl Default for ArchConfig {
    fn default() -> Self {
        ArchConfig::Mlp(MlpConfig::new(
            vec!["t_f".to_string()],
            vec!["eta".to_string()],
        ))
    }
}

impl ArchConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ArchConfig::Mlp(_) => "MLP",
        }
    }
}

/// 設定に対応するモデルを構築します。
pub fn build_model<B: Backend>(cfg: &ArchConfig, device: &B::Device) -> PinnResult<Mlp<B>> {
    let model = match cfg {
        ArchConfig::Mlp(mlp) => mlp.init(device)?,
    };
    tracing::info!(
        "モデル {} を構築しました (パラメータ数: {})",
        cfg.name(),
        model.num_params()
    );
    Ok(model)
}
