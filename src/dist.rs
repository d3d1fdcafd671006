//! プロセスの rank / world size と乱数シードの設定。

use crate::error::{PinnError, PinnResult};
use burn::prelude::Backend;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::env;

/// このプロセスが分散学習のどこに位置するか。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for DistEnv {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl DistEnv {
    /// 環境変数から読み取ります。どちらも無ければ単一プロセスとみなします。
    pub fn from_env() -> PinnResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `RANK`/`WORLD_SIZE` を優先し、無ければ `PADDLE_TRAINER_ID`/`PADDLE_TRAINERS_NUM` を見ます。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PinnResult<Self> {
        let read = |primary: &str, fallback: &str| -> PinnResult<Option<usize>> {
            match lookup(primary).or_else(|| lookup(fallback)) {
                Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                    PinnError::Distributed(format!("{primary} is not an integer: '{raw}'"))
                }),
                None => Ok(None),
            }
        };
        let rank = read("RANK", "PADDLE_TRAINER_ID")?.unwrap_or(0);
        let world_size = read("WORLD_SIZE", "PADDLE_TRAINERS_NUM")?.unwrap_or(1);
        if world_size == 0 || rank >= world_size {
            return Err(PinnError::Distributed(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// バックエンドの乱数とホスト側の乱数を `base + rank` で初期化します。
pub fn seed_everything<B: Backend>(base: u64, rank: usize) -> StdRng {
    let seed = base.wrapping_add(rank as u64);
    B::seed(seed);
    StdRng::seed_from_u64(seed)
}
