//! 레코드 손실 시뮬레이션
//!
//! 수신측이 재조립 완료 시 레코드마다 한 번씩 호출하는 판정 함수.
//! 실제 전송 경로가 완벽해도 불완전한 링크를 흉내낼 수 있음

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::record::RecordId;

/// 레코드 손실 판정
pub trait LossModel: Send + Sync {
    /// true면 해당 레코드를 받지 못한 것으로 처리
    fn is_lost(&self, record_id: RecordId) -> bool;
}

/// 손실 없음 (기본값)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoss;

impl LossModel for NoLoss {
    fn is_lost(&self, _record_id: RecordId) -> bool {
        false
    }
}

/// 레코드별 독립 확률 손실
pub struct RandomLoss {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomLoss {
    /// `probability`는 0.0 ~ 1.0으로 잘림. NaN은 0.0
    pub fn new(probability: f64) -> Self {
        Self::from_rng(probability, StdRng::from_entropy())
    }

    /// 재현 가능한 테스트용
    pub fn with_seed(probability: f64, seed: u64) -> Self {
        Self::from_rng(probability, StdRng::seed_from_u64(seed))
    }

    /// 퍼센트 단위 (수신기 `--loss` 인자)
    pub fn from_percent(percent: f64) -> Self {
        Self::new(percent / 100.0)
    }

    fn from_rng(probability: f64, rng: StdRng) -> Self {
        Self {
            probability: if probability.is_nan() {
                0.0
            } else {
                probability.clamp(0.0, 1.0)
            },
            rng: Mutex::new(rng),
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl LossModel for RandomLoss {
    fn is_lost(&self, _record_id: RecordId) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        self.rng.lock().gen_bool(self.probability)
    }
}

impl<F> LossModel for F
where
    F: Fn(RecordId) -> bool + Send + Sync,
{
    fn is_lost(&self, record_id: RecordId) -> bool {
        self(record_id)
    }
}
