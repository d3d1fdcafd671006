//! 学習中の集計値と、ベストメトリックの記録。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 平均値を追跡するメーター。
#[derive(Debug, Clone)]
pub struct AverageMeter {
    name: String,
    precision: usize,
    postfix: &'static str,
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>, precision: usize, postfix: &'static str) -> Self {
        Self {
            name: name.into(),
            precision,
            postfix,
            val: 0.0,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0;
    }

    /// `n` 個分の値 `val` を加えます。
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn avg_info(&self) -> String {
        format!(
            "{}: {:.*}{}",
            self.name,
            self.precision,
            self.avg(),
            self.postfix
        )
    }

    pub fn val_info(&self) -> String {
        format!(
            "{}: {:.*}{}",
            self.name,
            self.precision,
            self.val,
            self.postfix
        )
    }
}

/// キーごとの `AverageMeter` を登録順に保持します。
#[derive(Debug, Clone, Default)]
pub struct MetricAggregate {
    meters: Vec<AverageMeter>,
}

impl MetricAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, key: &str, val: f64, n: usize) {
        match self.meters.iter_mut().find(|m| m.name() == key) {
            Some(meter) => meter.update(val, n),
            None => {
                let mut meter = AverageMeter::new(key, 5, "");
                meter.update(val, n);
                self.meters.push(meter);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&AverageMeter> {
        self.meters.iter().find(|m| m.name() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AverageMeter> {
        self.meters.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn clear(&mut self) {
        self.meters.clear();
    }

    /// `key: avg, key: avg, ...` 形式の要約。
    pub fn avg_summary(&self) -> String {
        self.meters
            .iter()
            .map(AverageMeter::avg_info)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn val_summary(&self) -> String {
        self.meters
            .iter()
            .map(AverageMeter::val_info)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 1イテレーションの所要時間を測るメーターの組。
#[derive(Debug, Clone)]
pub struct TimeInfo {
    pub batch_cost: AverageMeter,
    pub reader_cost: AverageMeter,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            batch_cost: AverageMeter::new("batch_cost", 5, "s"),
            reader_cost: AverageMeter::new("reader_cost", 5, "s"),
        }
    }
}

impl TimeInfo {
    pub fn reset(&mut self) {
        self.batch_cost.reset();
        self.reader_cost.reset();
    }

    pub fn summary(&self) -> String {
        format!(
            "{}, {}",
            self.batch_cost.avg_info(),
            self.reader_cost.avg_info()
        )
    }
}

/// メトリックの改善方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    #[default]
    Lower,
    Higher,
}

impl MetricDirection {
    /// まだ評価していない状態を表す値。
    pub fn worst(self) -> f64 {
        match self {
            MetricDirection::Lower => f64::INFINITY,
            MetricDirection::Higher => f64::NEG_INFINITY,
        }
    }

    /// `candidate` が `best` より厳密に良いか。NaN は改善とみなしません。
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            MetricDirection::Lower => candidate < best,
            MetricDirection::Higher => candidate > best,
        }
    }
}

/// ある時点のメトリックと、そのエポック。チェックポイントと一緒に保存されます。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(with = "float_repr")]
    pub metric: f64,
    pub epoch: usize,
}

impl fmt::Display for MetricRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metric: {}, epoch: {}", self.metric, self.epoch)
    }
}

/// これまでで最良のメトリック。改善したときだけ更新されます。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMetric {
    direction: MetricDirection,
    record: MetricRecord,
}

impl BestMetric {
    pub fn new(direction: MetricDirection) -> Self {
        Self {
            direction,
            record: MetricRecord {
                metric: direction.worst(),
                epoch: 0,
            },
        }
    }

    pub fn metric(&self) -> f64 {
        self.record.metric
    }

    pub fn epoch(&self) -> usize {
        self.record.epoch
    }

    pub fn record(&self) -> MetricRecord {
        self.record
    }

    pub fn direction(&self) -> MetricDirection {
        self.direction
    }

    /// 改善していれば記録を更新して `true` を返します。
    pub fn observe(&mut self, metric: f64, epoch: usize) -> bool {
        if self.direction.improves(metric, self.record.metric) {
            self.record = MetricRecord { metric, epoch };
            true
        } else {
            false
        }
    }
}

/// 非有限値を `"inf"`/`"-inf"`/`"nan"` の文字列として保存します。
mod float_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = if value.is_finite() {
            Repr::Number(*value)
        } else if value.is_nan() {
            Repr::Text("nan".into())
        } else if *value > 0.0 {
            Repr::Text("inf".into())
        } else {
            Repr::Text("-inf".into())
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!(
                    "invalid metric value '{other}'"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_weights_by_count() {
        let mut meter = AverageMeter::new("loss", 3, "");
        meter.update(1.0, 1);
        meter.update(4.0, 3);
        assert_eq!(meter.count(), 4);
        assert!((meter.avg() - 3.25).abs() < 1e-12);
        assert_eq!(meter.avg_info(), "loss: 3.250");
        assert_eq!(meter.val_info(), "loss: 4.000");
    }

    #[test]
    fn aggregate_keeps_insertion_order_and_clears() {
        let mut agg = MetricAggregate::new();
        agg.update("loss", 2.0, 1);
        agg.update("eta", 1.0, 1);
        agg.update("loss", 4.0, 1);
        assert_eq!(agg.avg_summary(), "loss: 3.00000, eta: 1.00000");
        agg.clear();
        assert!(agg.is_empty());
    }

    #[test]
    fn best_metric_only_moves_on_strict_improvement() {
        let mut best = BestMetric::new(MetricDirection::Lower);
        assert!(best.observe(3.0, 2));
        assert!(!best.observe(3.0, 4));
        assert!(!best.observe(5.0, 6));
        assert!(!best.observe(f64::NAN, 8));
        assert_eq!(best.record(), MetricRecord { metric: 3.0, epoch: 2 });

        let mut higher = BestMetric::new(MetricDirection::Higher);
        assert!(higher.observe(0.1, 1));
        assert!(higher.observe(0.2, 2));
        assert!(!higher.observe(0.15, 3));
        assert_eq!(higher.epoch(), 2);
    }

    #[test]
    fn non_finite_metric_survives_json() {
        let record = MetricRecord {
            metric: f64::INFINITY,
            epoch: 7,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"metric":"inf","epoch":7}"#);
        let back: MetricRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);

        let finite: MetricRecord = serde_json::from_str(r#"{"metric":0.5,"epoch":1}"#).unwrap();
        assert_eq!(finite.metric, 0.5);
    }
}
