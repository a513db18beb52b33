//! # Blast Transfer
//!
//! UDP 위의 선택적 재전송(selective repeat) 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **레코드/블라스트**: 파일을 고정 크기 레코드로 자르고 M개씩 블라스트로 묶음
//! - **프래그먼트**: 블라스트를 데이터그램 크기의 DATA로 분할, 세그먼트로 레코드 구간 표시
//! - **누락 보고**: 수신자가 블라스트마다 누락 레코드 구간(MISSING)을 보고
//! - **선택적 재전송**: 보고된 레코드만 다시 읽어 같은 blast_id로 재전송, 빈 보고가 올 때까지 반복
//! - **유한 재시도**: 응답이 없으면 BLAST_END를 제한된 횟수만 다시 보내고 블라스트를 중단
//! - **명시적 타입 태그**: 모든 메시지는 첫 바이트로 구분, 길이 검사 후 디코딩

pub mod config;
pub mod error;
pub mod fragment;
pub mod loss;
pub mod message;
pub mod receiver;
pub mod record;
pub mod sender;
pub mod stats;

pub use config::Config;
pub use error::{Error, Result};
pub use fragment::{FragmentBuilder, InsertOutcome, ReassemblyBuffer};
pub use loss::{LossModel, NoLoss, RandomLoss};
pub use message::{BlastEnd, DataFragment, Message, MessageType, MissingReport};
pub use receiver::Receiver;
pub use record::{merge_ranges, Blast, BlastId, RecordId, Segment, SessionParams};
pub use sender::{BlastPhase, Sender};
pub use stats::{ReceiverStats, SenderStats};

/// 기본 레코드 크기 (바이트)
pub const DEFAULT_RECORD_SIZE: usize = 512;

/// 기본 블라스트 크기 (레코드 수)
pub const DEFAULT_BLAST_SIZE: usize = 200;

/// 기본 데이터그램 상한 (1500 MTU - 20 IP - 8 UDP)
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1472;

/// 수신 버퍼 크기
pub const RECV_BUFFER_SIZE: usize = 65_536;
