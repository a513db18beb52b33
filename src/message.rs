//! 프로토콜 메시지 정의
//!
//! 모든 메시지는 첫 바이트의 타입 태그로 구분됨 (크기/내용 추측 없음).
//! 정수 필드는 모두 big-endian.
//!
//! ```text
//! HELLO       tag | record_size:u32 | total_records:u64 | name_len:u16 | name
//!                 | blast_size:u32 | file_size:u64
//! HELLO_ACK   tag
//! DATA        tag | blast_id:u32 | fragment_index:u32 | fragment_count:u32
//!                 | segment_count:u32 | {start:u32, end:u32}* | payload
//! BLAST_END   tag | blast_id:u32 | range_start:u64 | range_end:u64
//! MISSING     tag | blast_id:u32 | range_count:u16 | {start:u64, end:u64}*
//! DISCONNECT  tag
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::record::{BlastId, RecordId, Segment, SessionParams};
use crate::{Error, Result};

/// DATA 고정 헤더 크기 (태그 + u32 4개)
pub const DATA_HEADER_LEN: usize = 1 + 4 * 4;

/// DATA 세그먼트 하나의 크기
pub const DATA_SEGMENT_LEN: usize = 8;

/// MISSING 고정 헤더 크기 (태그 + blast_id + range_count)
pub const MISSING_HEADER_LEN: usize = 1 + 4 + 2;

/// MISSING 구간 하나의 크기
pub const MISSING_RANGE_LEN: usize = 16;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// 세션 파라미터 전달 (송신자 → 수신자)
    Hello = 1,

    /// HELLO 확인
    HelloAck = 2,

    /// 블라스트 프래그먼트
    Data = 3,

    /// 라운드 종료 표시 (송신자 → 수신자)
    BlastEnd = 4,

    /// 누락 레코드 보고 (수신자 → 송신자)
    Missing = 5,

    /// 세션 종료
    Disconnect = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => MessageType::Hello,
            2 => MessageType::HelloAck,
            3 => MessageType::Data,
            4 => MessageType::BlastEnd,
            5 => MessageType::Missing,
            6 => MessageType::Disconnect,
            other => return Err(Error::malformed(format!("알 수 없는 타입 태그 {}", other))),
        })
    }
}

/// DATA 프래그먼트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    pub blast_id: BlastId,

    /// 이번 라운드 내 프래그먼트 인덱스
    pub fragment_index: u32,

    /// 이번 라운드의 총 프래그먼트 수
    pub fragment_count: u32,

    /// 오름차순, 겹치지 않는 레코드 구간
    pub segments: Vec<Segment>,

    /// 세그먼트 순서대로 이어붙인 레코드 데이터
    pub payload: Bytes,
}

impl DataFragment {
    /// 세그먼트가 설명하는 레코드 수
    pub fn record_count(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// 인코딩 후 크기
    pub fn encoded_len(&self) -> usize {
        DATA_HEADER_LEN + self.segments.len() * DATA_SEGMENT_LEN + self.payload.len()
    }

    /// payload 길이가 세그먼트 × record_size와 맞는지 검사
    pub fn check_payload(&self, record_size: u32) -> Result<()> {
        let expected = self.record_count() * record_size as u64;
        if self.payload.len() as u64 != expected {
            return Err(Error::malformed(format!(
                "blast {} fragment {}: payload {} bytes, 세그먼트 기준 {} bytes",
                self.blast_id,
                self.fragment_index,
                self.payload.len(),
                expected
            )));
        }
        Ok(())
    }

    /// (레코드 ID, 레코드 데이터) 순회. `check_payload` 통과 후에만 호출
    pub fn records(&self, record_size: u32) -> impl Iterator<Item = (RecordId, Bytes)> + '_ {
        let record_size = record_size as usize;
        self.segments
            .iter()
            .flat_map(Segment::ids)
            .enumerate()
            .map(move |(i, id)| {
                let offset = i * record_size;
                (id, self.payload.slice(offset..offset + record_size))
            })
    }
}

/// 라운드 종료 표시
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlastEnd {
    pub blast_id: BlastId,
    pub range: Segment,
}

/// 누락 레코드 보고
///
/// `ranges`가 비어 있으면 블라스트 전체 수신 완료
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReport {
    pub blast_id: BlastId,
    pub ranges: Vec<Segment>,
}

impl MissingReport {
    pub fn complete(blast_id: BlastId) -> Self {
        Self {
            blast_id,
            ranges: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 보고된 누락 레코드 수
    pub fn record_count(&self) -> u64 {
        self.ranges.iter().map(Segment::len).sum()
    }

    /// 데이터그램 하나에 담을 수 있는 최대 구간 수
    pub fn max_ranges(max_datagram_size: usize) -> usize {
        (max_datagram_size.saturating_sub(MISSING_HEADER_LEN) / MISSING_RANGE_LEN)
            .min(u16::MAX as usize)
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(SessionParams),
    HelloAck,
    Data(DataFragment),
    BlastEnd(BlastEnd),
    Missing(MissingReport),
    Disconnect,
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::HelloAck => MessageType::HelloAck,
            Message::Data(_) => MessageType::Data,
            Message::BlastEnd(_) => MessageType::BlastEnd,
            Message::Missing(_) => MessageType::Missing,
            Message::Disconnect => MessageType::Disconnect,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.msg_type() as u8);

        match self {
            Message::Hello(params) => {
                let name = params.file_name.as_bytes();
                let name = &name[..name.len().min(u16::MAX as usize)];
                buf.put_u32(params.record_size);
                buf.put_u64(params.total_records);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name);
                buf.put_u32(params.blast_size);
                buf.put_u64(params.file_size);
            }
            Message::Data(fragment) => {
                buf.put_u32(fragment.blast_id);
                buf.put_u32(fragment.fragment_index);
                buf.put_u32(fragment.fragment_count);
                buf.put_u32(fragment.segments.len() as u32);
                for segment in &fragment.segments {
                    // SessionParams::validate가 u32 범위를 보장
                    buf.put_u32(segment.start as u32);
                    buf.put_u32(segment.end as u32);
                }
                buf.put_slice(&fragment.payload);
            }
            Message::BlastEnd(end) => {
                buf.put_u32(end.blast_id);
                buf.put_u64(end.range.start);
                buf.put_u64(end.range.end);
            }
            Message::Missing(report) => {
                buf.put_u32(report.blast_id);
                buf.put_u16(report.ranges.len() as u16);
                for range in &report.ranges {
                    buf.put_u64(range.start);
                    buf.put_u64(range.end);
                }
            }
            Message::HelloAck | Message::Disconnect => {}
        }

        buf.freeze()
    }

    /// 인코딩 후 크기
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Hello(params) => 1 + 4 + 8 + 2 + params.file_name.len() + 4 + 8,
            Message::Data(fragment) => fragment.encoded_len(),
            Message::BlastEnd(_) => 1 + 4 + 8 + 8,
            Message::Missing(report) => {
                MISSING_HEADER_LEN + report.ranges.len() * MISSING_RANGE_LEN
            }
            Message::HelloAck | Message::Disconnect => 1,
        }
    }

    /// 바이트에서 역직렬화
    ///
    /// 선언된 개수/길이는 인덱싱 전에 남은 길이와 비교함. 맞지 않으면 `Error::Malformed`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        need(buf, 1, "타입 태그")?;
        let msg_type = MessageType::try_from(buf.get_u8())?;

        let message = match msg_type {
            MessageType::Hello => {
                need(buf, 4 + 8 + 2, "HELLO 헤더")?;
                let record_size = buf.get_u32();
                let total_records = buf.get_u64();
                let name_len = buf.get_u16() as usize;

                need(buf, name_len + 4 + 8, "HELLO 파일 이름")?;
                let file_name = String::from_utf8(buf[..name_len].to_vec())
                    .map_err(|_| Error::malformed("HELLO 파일 이름이 UTF-8이 아님"))?;
                buf.advance(name_len);
                let blast_size = buf.get_u32();
                let file_size = buf.get_u64();

                Message::Hello(SessionParams {
                    file_name,
                    file_size,
                    record_size,
                    total_records,
                    blast_size,
                })
            }

            MessageType::HelloAck => Message::HelloAck,

            MessageType::Data => {
                need(buf, DATA_HEADER_LEN - 1, "DATA 헤더")?;
                let blast_id = buf.get_u32();
                let fragment_index = buf.get_u32();
                let fragment_count = buf.get_u32();
                let segment_count = buf.get_u32() as usize;

                let segments_len = segment_count
                    .checked_mul(DATA_SEGMENT_LEN)
                    .ok_or_else(|| Error::malformed("segment_count 오버플로우"))?;
                need(buf, segments_len, "DATA 세그먼트")?;

                let mut segments = Vec::with_capacity(segment_count);
                for _ in 0..segment_count {
                    let start = buf.get_u32() as RecordId;
                    let end = buf.get_u32() as RecordId;
                    segments.push(checked_segment(segments.last(), start, end)?);
                }

                let payload = Bytes::copy_from_slice(buf);
                buf = &[];

                Message::Data(DataFragment {
                    blast_id,
                    fragment_index,
                    fragment_count,
                    segments,
                    payload,
                })
            }

            MessageType::BlastEnd => {
                need(buf, 4 + 8 + 8, "BLAST_END")?;
                let blast_id = buf.get_u32();
                let start = buf.get_u64();
                let end = buf.get_u64();
                Message::BlastEnd(BlastEnd {
                    blast_id,
                    range: checked_segment(None, start, end)?,
                })
            }

            MessageType::Missing => {
                need(buf, MISSING_HEADER_LEN - 1, "MISSING 헤더")?;
                let blast_id = buf.get_u32();
                let range_count = buf.get_u16() as usize;
                need(buf, range_count * MISSING_RANGE_LEN, "MISSING 구간")?;

                let mut ranges = Vec::with_capacity(range_count);
                for _ in 0..range_count {
                    let start = buf.get_u64();
                    let end = buf.get_u64();
                    ranges.push(checked_segment(ranges.last(), start, end)?);
                }
                Message::Missing(MissingReport { blast_id, ranges })
            }

            MessageType::Disconnect => Message::Disconnect,
        };

        if buf.has_remaining() {
            return Err(Error::malformed(format!(
                "{:?} 뒤에 {} bytes 남음",
                msg_type,
                buf.remaining()
            )));
        }

        Ok(message)
    }
}

impl From<DataFragment> for Message {
    fn from(fragment: DataFragment) -> Self {
        Message::Data(fragment)
    }
}

impl From<MissingReport> for Message {
    fn from(report: MissingReport) -> Self {
        Message::Missing(report)
    }
}

impl From<BlastEnd> for Message {
    fn from(end: BlastEnd) -> Self {
        Message::BlastEnd(end)
    }
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.len() < len {
        return Err(Error::malformed(format!(
            "{}: {} bytes 필요, {} bytes 남음",
            what,
            len,
            buf.len()
        )));
    }
    Ok(())
}

/// 구간 유효성 (start <= end, 직전 구간보다 뒤)
fn checked_segment(prev: Option<&Segment>, start: RecordId, end: RecordId) -> Result<Segment> {
    if start > end {
        return Err(Error::malformed(format!("구간 [{}, {}] 역순", start, end)));
    }
    if let Some(prev) = prev {
        if start <= prev.end {
            return Err(Error::malformed(format!(
                "구간 [{}, {}]이 [{}, {}]와 겹치거나 정렬되지 않음",
                start, end, prev.start, prev.end
            )));
        }
    }
    Ok(Segment { start, end })
}
