//! 프로토콜 설정

use std::time::Duration;

use crate::message::{DATA_HEADER_LEN, DATA_SEGMENT_LEN};
use crate::{Error, Result, DEFAULT_BLAST_SIZE, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_RECORD_SIZE};

/// 블라스트 크기 자동 선택 범위 (레코드 수)
const FIT_BLAST_MIN: usize = 200;
const FIT_BLAST_MAX: usize = 10_000;

/// 실용적인 UDP 페이로드 상한
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 레코드 크기 (바이트)
    pub record_size: usize,

    /// 블라스트당 레코드 수 (M)
    pub blast_size: usize,

    /// DATA 프래그먼트를 포함한 모든 데이터그램의 최대 크기
    pub max_datagram_size: usize,

    /// MISSING 대기 타임아웃 (밀리초)
    pub report_timeout_ms: u64,

    /// 응답 없이 BLAST_END를 다시 보내는 최대 횟수
    pub max_report_retries: u32,

    /// 블라스트당 재전송 라운드 한도 (None이면 무제한)
    pub max_retransmit_rounds: Option<u32>,

    /// HELLO_ACK 대기 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// HELLO 최대 전송 횟수
    pub max_handshake_retries: u32,

    /// 디스크 읽기 → 전송 큐 깊이 (블라스트 수)
    pub queue_depth: usize,

    /// 수신측 유휴 타임아웃 (밀리초, None이면 DISCONNECT까지 대기)
    pub idle_timeout_ms: Option<u64>,

    /// DISCONNECT 반복 전송 횟수
    pub disconnect_repeats: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            blast_size: DEFAULT_BLAST_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            report_timeout_ms: 200,
            max_report_retries: 10,
            max_retransmit_rounds: Some(100),
            handshake_timeout_ms: 500,
            max_handshake_retries: 20,
            queue_depth: 8,
            idle_timeout_ms: None,
            disconnect_repeats: 3,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로컬 루프백용 설정 (큰 데이터그램, 짧은 타임아웃)
    pub fn loopback() -> Self {
        Self {
            max_datagram_size: MAX_UDP_PAYLOAD,
            report_timeout_ms: 50,
            handshake_timeout_ms: 100,
            ..Self::default()
        }
    }

    /// 손실이 큰 링크용 설정
    pub fn lossy_link() -> Self {
        Self {
            report_timeout_ms: 500,
            max_report_retries: 30,
            max_retransmit_rounds: Some(1_000),
            handshake_timeout_ms: 1_000,
            max_handshake_retries: 60,
            disconnect_repeats: 8,
            ..Self::default()
        }
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// 프래그먼트 하나에 담을 수 있는 레코드 수
    ///
    /// 레코드마다 세그먼트가 따로 붙는 최악의 경우(희소한 재전송) 기준
    pub fn records_per_fragment(&self) -> usize {
        self.max_datagram_size.saturating_sub(DATA_HEADER_LEN)
            / (self.record_size + DATA_SEGMENT_LEN)
    }

    /// 데이터그램 상한 안에서 블라스트 크기 선택
    ///
    /// 프래그먼트 단위로 나눠 보내므로 M은 데이터그램 크기에 묶이지 않음.
    /// 블라스트 하나의 메모리 사용량만 [200, 10000] 레코드로 제한
    pub fn fit_blast_size(&self, total_records: u64) -> usize {
        (total_records as usize).clamp(FIT_BLAST_MIN, FIT_BLAST_MAX)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.record_size == 0 || self.record_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "record_size {} (1..=u32::MAX)",
                self.record_size
            )));
        }
        if self.blast_size == 0 || self.blast_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "blast_size {} (1..=u32::MAX)",
                self.blast_size
            )));
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_size {} > {}",
                self.max_datagram_size, MAX_UDP_PAYLOAD
            )));
        }
        if self.records_per_fragment() == 0 {
            return Err(Error::InvalidConfig(format!(
                "record_size {}인 레코드 하나가 max_datagram_size {}에 들어가지 않음",
                self.record_size, self.max_datagram_size
            )));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
        Config::loopback().validate().unwrap();
        Config::lossy_link().validate().unwrap();
    }

    #[test]
    fn test_records_per_fragment() {
        let config = Config::default();
        // (1472 - 17) / (512 + 8)
        assert_eq!(config.records_per_fragment(), 2);
        assert_eq!(Config::loopback().records_per_fragment(), 125);
    }

    #[test]
    fn test_record_larger_than_datagram_rejected() {
        let config = Config {
            record_size: 2048,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_fit_blast_size_clamps() {
        let config = Config::default();
        assert_eq!(config.fit_blast_size(20), 200);
        assert_eq!(config.fit_blast_size(5_000), 5_000);
        assert_eq!(config.fit_blast_size(1 << 40), 10_000);
    }
}
