//! パラメータの初期化ルーチン群。
//!
//! 一様分布・正規分布・切断正規分布・定数、および Xavier/Glorot と
//! Kaiming/He の分散スケーリング初期化を提供します。
//! すべて `Param` をその場で書き換え、`ParamId` は保持されます。
//! 書き込みは [`NoGradScope`] の中で行われるため、自動微分のテープには残りません。

use crate::error::{PinnError, PinnResult};
use crate::param::{NoGradScope, to_host};
use burn::module::Param;
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor, TensorData};
use std::f64::consts::SQRT_2;
use std::str::FromStr;

/// 形状から求めた入力側・出力側の結合数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanStatistics {
    pub fan_in: usize,
    pub fan_out: usize,
}

/// `[out, in, ...]`（`reverse` のときは `[in, out, ...]`）として fan を計算します。
///
/// 3次元目以降は受容野サイズとして両方に掛かります。
/// 例えば畳み込みの重み `[cout, cin, kh, kw]` は `reverse = false`、
/// `burn` の `Linear` の重み `[d_input, d_output]` は `reverse = true` です。
pub fn fan_in_fan_out(dims: &[usize], reverse: bool) -> PinnResult<FanStatistics> {
    if dims.len() < 2 {
        return Err(PinnError::shape(format!(
            "tensor rank should be no less than 2, but got {}",
            dims.len()
        )));
    }
    let (num_input_fmaps, num_output_fmaps) = if reverse {
        (dims[0], dims[1])
    } else {
        (dims[1], dims[0])
    };
    let receptive_field_size: usize = dims[2..].iter().product();
    Ok(FanStatistics {
        fan_in: num_input_fmaps * receptive_field_size,
        fan_out: num_output_fmaps * receptive_field_size,
    })
}

/// Kaiming 初期化で分散の基準にする側。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    FanIn,
    FanOut,
}

impl FanMode {
    pub fn select(self, fans: FanStatistics) -> usize {
        match self {
            FanMode::FanIn => fans.fan_in,
            FanMode::FanOut => fans.fan_out,
        }
    }
}

impl FromStr for FanMode {
    type Err = PinnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fan_in" => Ok(FanMode::FanIn),
            "fan_out" => Ok(FanMode::FanOut),
            other => Err(PinnError::config(format!(
                "Mode {other} not supported, please use one of [\"fan_in\", \"fan_out\"]"
            ))),
        }
    }
}

/// ゲインの計算に使う非線形関数の名前。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonlinearity {
    Linear,
    Conv1d,
    Conv2d,
    Conv3d,
    ConvTranspose1d,
    ConvTranspose2d,
    ConvTranspose3d,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Selu,
}

impl FromStr for Nonlinearity {
    type Err = PinnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nonlinearity = match s {
            "linear" => Nonlinearity::Linear,
            "conv1d" => Nonlinearity::Conv1d,
            "conv2d" => Nonlinearity::Conv2d,
            "conv3d" => Nonlinearity::Conv3d,
            "conv_transpose1d" => Nonlinearity::ConvTranspose1d,
            "conv_transpose2d" => Nonlinearity::ConvTranspose2d,
            "conv_transpose3d" => Nonlinearity::ConvTranspose3d,
            "sigmoid" => Nonlinearity::Sigmoid,
            "tanh" => Nonlinearity::Tanh,
            "relu" => Nonlinearity::Relu,
            "leaky_relu" => Nonlinearity::LeakyRelu,
            "selu" => Nonlinearity::Selu,
            other => {
                return Err(PinnError::config(format!(
                    "Unsupported nonlinearity {other}"
                )));
            }
        };
        Ok(nonlinearity)
    }
}

/// 非線形関数ごとの推奨ゲイン。
///
/// `leaky_relu` の負の傾きは `param` で与え、未指定なら 0.01 を使います。
pub fn calculate_gain(nonlinearity: Nonlinearity, param: Option<f64>) -> f64 {
    match nonlinearity {
        Nonlinearity::Linear
        | Nonlinearity::Conv1d
        | Nonlinearity::Conv2d
        | Nonlinearity::Conv3d
        | Nonlinearity::ConvTranspose1d
        | Nonlinearity::ConvTranspose2d
        | Nonlinearity::ConvTranspose3d
        | Nonlinearity::Sigmoid => 1.0,
        Nonlinearity::Tanh => 5.0 / 3.0,
        Nonlinearity::Relu => 2.0_f64.sqrt(),
        Nonlinearity::LeakyRelu => {
            let negative_slope = param.unwrap_or(0.01);
            (2.0 / (1.0 + negative_slope.powi(2))).sqrt()
        }
        Nonlinearity::Selu => 3.0 / 4.0,
    }
}

fn checked_dims<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
) -> PinnResult<[usize; D]> {
    let dims = param.val().dims();
    if dims.iter().product::<usize>() == 0 {
        return Err(PinnError::shape(format!(
            "cannot initialize a tensor without elements, shape {dims:?}"
        )));
    }
    Ok(dims)
}

/// U(low, high) で埋めます。
pub fn uniform<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    low: f64,
    high: f64,
) -> PinnResult<()> {
    let dims = checked_dims(param)?;
    let mut scope = NoGradScope::new(param);
    let value = Tensor::random(dims, Distribution::Uniform(low, high), &scope.device());
    scope.write(value);
    Ok(())
}

/// N(mean, std²) で埋めます。
pub fn normal<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    mean: f64,
    std: f64,
) -> PinnResult<()> {
    let dims = checked_dims(param)?;
    let mut scope = NoGradScope::new(param);
    let value = Tensor::random(dims, Distribution::Normal(mean, std), &scope.device());
    scope.write(value);
    Ok(())
}

fn norm_cdf(x: f64) -> f64 {
    (1.0 + statrs::function::erf::erf(x / SQRT_2)) / 2.0
}

/// 平均が区間 `[low, high]` から 2σ 以上離れているか。
pub fn mean_far_from_bounds(mean: f64, std: f64, low: f64, high: f64) -> bool {
    mean < low - 2.0 * std || mean > high + 2.0 * std
}

/// `[low, high]` で切断した N(mean, std²) で埋めます。
///
/// 逆累積分布関数法: 境界を標準正規 CDF で `[l, u]` に写し、
/// `[2l-1, 2u-1]` 上の一様乱数に逆誤差関数を適用してから
/// `std·√2` 倍して `mean` を足し、最後に `[low, high]` へクランプします。
pub fn truncated_normal<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    mean: f64,
    std: f64,
    low: f64,
    high: f64,
) -> PinnResult<()> {
    if mean_far_from_bounds(mean, std, low, high) {
        tracing::warn!(
            "mean({mean}) is more than 2 std({std}) from [low, high]([{low}, {high}]) in truncated_normal. \
             The distribution of values may be incorrect."
        );
    }
    let dims = checked_dims(param)?;
    let mut scope = NoGradScope::new(param);
    let device = scope.device();

    let l = norm_cdf((low - mean) / std);
    let u = norm_cdf((high - mean) / std);
    let (from, to) = (2.0 * l - 1.0, 2.0 * u - 1.0);

    // [0, 1) の一様乱数を [2l-1, 2u-1] へ写すのは f64 で行う
    let unit = Tensor::<B, D>::random(dims, Distribution::Default, &device);
    let values: Vec<f32> = to_host(unit)?
        .into_iter()
        .map(|x| {
            let p = from + (to - from) * x as f64;
            (statrs::function::erf::erf_inv(p) * std * SQRT_2 + mean) as f32
        })
        .collect();

    let value = Tensor::<B, D>::from_data(TensorData::new(values, dims), &device).clamp(low, high);
    scope.write(value);
    Ok(())
}

/// すべての要素を `value` にします。
pub fn constant<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    value: f64,
) -> PinnResult<()> {
    let dims = checked_dims(param)?;
    let mut scope = NoGradScope::new(param);
    let filled = Tensor::full(dims, value, &scope.device());
    scope.write(filled);
    Ok(())
}

pub fn ones<B: Backend, const D: usize>(param: &mut Param<Tensor<B, D>>) -> PinnResult<()> {
    constant(param, 1.0)
}

pub fn zeros<B: Backend, const D: usize>(param: &mut Param<Tensor<B, D>>) -> PinnResult<()> {
    constant(param, 0.0)
}

fn xavier_std(dims: &[usize], gain: f64, reverse: bool) -> PinnResult<f64> {
    let fans = fan_in_fan_out(dims, reverse)?;
    Ok(gain * (2.0 / (fans.fan_in + fans.fan_out) as f64).sqrt())
}

/// Xavier/Glorot 一様分布: `k = √3·gain·√(2/(fan_in+fan_out))` として U(-k, k)。
pub fn xavier_uniform<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    gain: f64,
    reverse: bool,
) -> PinnResult<()> {
    let std = xavier_std(&param.val().dims(), gain, reverse)?;
    let k = 3.0_f64.sqrt() * std;
    uniform(param, -k, k)
}

/// Xavier/Glorot 正規分布: N(0, (gain·√(2/(fan_in+fan_out)))²)。
pub fn xavier_normal<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    gain: f64,
    reverse: bool,
) -> PinnResult<()> {
    let std = xavier_std(&param.val().dims(), gain, reverse)?;
    normal(param, 0.0, std)
}

fn kaiming_std(
    dims: &[usize],
    a: f64,
    mode: FanMode,
    nonlinearity: Nonlinearity,
    reverse: bool,
) -> PinnResult<f64> {
    let fan = mode.select(fan_in_fan_out(dims, reverse)?);
    let gain = calculate_gain(nonlinearity, Some(a));
    Ok(gain / (fan as f64).sqrt())
}

/// Kaiming/He 一様分布。`a` は `leaky_relu` の負の傾きです。
pub fn kaiming_uniform<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    a: f64,
    mode: FanMode,
    nonlinearity: Nonlinearity,
    reverse: bool,
) -> PinnResult<()> {
    let std = kaiming_std(&param.val().dims(), a, mode, nonlinearity, reverse)?;
    let k = 3.0_f64.sqrt() * std;
    uniform(param, -k, k)
}

/// Kaiming/He 正規分布。
pub fn kaiming_normal<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    a: f64,
    mode: FanMode,
    nonlinearity: Nonlinearity,
    reverse: bool,
) -> PinnResult<()> {
    let std = kaiming_std(&param.val().dims(), a, mode, nonlinearity, reverse)?;
    normal(param, 0.0, std)
}

/// 全結合層として重みとバイアスを U(-1/√shape[0], 1/√shape[0]) で初期化します。
pub fn linear_init<B: Backend>(
    weight: &mut Param<Tensor<B, 2>>,
    bias: Option<&mut Param<Tensor<B, 1>>>,
) -> PinnResult<()> {
    let bound = 1.0 / (weight.val().dims()[0] as f64).sqrt();
    uniform(weight, -bound, bound)?;
    if let Some(bias) = bias {
        uniform(bias, -bound, bound)?;
    }
    Ok(())
}

/// 畳み込み層として重みとバイアスを U(-1/√∏shape[1..], 1/√∏shape[1..]) で初期化します。
pub fn conv_init<B: Backend, const D: usize>(
    weight: &mut Param<Tensor<B, D>>,
    bias: Option<&mut Param<Tensor<B, 1>>>,
) -> PinnResult<()> {
    let dims = weight.val().dims();
    if D < 2 {
        return Err(PinnError::shape(format!(
            "conv weight rank should be no less than 2, but got {D}"
        )));
    }
    let receptive: usize = dims[1..].iter().product();
    let bound = 1.0 / (receptive as f64).sqrt();
    uniform(weight, -bound, bound)?;
    if let Some(bias) = bias {
        uniform(bias, -bound, bound)?;
    }
    Ok(())
}
