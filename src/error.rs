//! 에러 타입 정의

use thiserror::Error;

use crate::record::BlastId;

/// 블라스트 전송 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    /// 선언된 길이/개수가 실제 데이터그램 크기와 맞지 않음
    #[error("잘못된 메시지: {reason}")]
    Malformed { reason: String },

    /// 이미 닫힌 블라스트나 세션 상태와 맞지 않는 메시지
    #[error("프로토콜 위반: {reason}")]
    ProtocolViolation { reason: String },

    #[error("응답 타임아웃: {what} ({attempts}회 시도)")]
    Timeout { what: &'static str, attempts: u32 },

    #[error("핸드쉐이크 실패: HELLO_ACK 없음 ({attempts}회 시도)")]
    HandshakeFailed { attempts: u32 },

    #[error("블라스트 {blast_id} 중단: MISSING 응답 없음 ({attempts}회 재시도)")]
    RetryExhausted { blast_id: BlastId, attempts: u32 },

    #[error("블라스트 {blast_id} 중단: 재전송 라운드 한도 초과 ({rounds} rounds)")]
    RoundsExhausted { blast_id: BlastId, rounds: u32 },

    #[error("파일이 너무 큼: 레코드 {total_records}개는 u32 레코드 ID 범위를 넘음")]
    FileTooLarge { total_records: u64 },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// 세션을 계속 진행할 수 있는 (지역적으로 흡수되는) 에러인지 여부
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Malformed { .. } | Error::ProtocolViolation { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
