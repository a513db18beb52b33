//! 프래그먼트 분할과 재조립
//!
//! - FragmentBuilder: 블라스트(또는 재전송 대상 레코드)를 데이터그램 크기의 DATA로 분할
//! - ReassemblyBuffer: 한 라운드의 프래그먼트를 모으는 수신측 버퍼

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::message::{DataFragment, DATA_HEADER_LEN, DATA_SEGMENT_LEN};
use crate::record::{BlastId, RecordId, Segment};
use crate::Config;

/// 프래그먼트 생성기 (송신측)
pub struct FragmentBuilder {
    record_size: usize,
    max_datagram_size: usize,
}

impl FragmentBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            record_size: config.record_size,
            max_datagram_size: config.max_datagram_size,
        }
    }

    /// 레코드들을 DATA 프래그먼트로 분할
    ///
    /// `records`는 ID 오름차순이어야 함. 연속된 ID는 한 세그먼트로 묶이고,
    /// 인코딩된 프래그먼트는 항상 `max_datagram_size` 이하
    pub fn build<I>(&self, blast_id: BlastId, records: I) -> Vec<DataFragment>
    where
        I: IntoIterator<Item = (RecordId, Bytes)>,
    {
        let mut fragments = Vec::new();
        let mut segments: Vec<Segment> = Vec::new();
        let mut payload = BytesMut::new();

        for (id, data) in records {
            debug_assert_eq!(data.len(), self.record_size);

            let extends = matches!(segments.last(), Some(last) if last.end + 1 == id);
            let segment_count = segments.len() + usize::from(!extends);
            let encoded = DATA_HEADER_LEN
                + segment_count * DATA_SEGMENT_LEN
                + payload.len()
                + self.record_size;

            if encoded > self.max_datagram_size && !segments.is_empty() {
                fragments.push(Self::pending(blast_id, &mut segments, &mut payload));
                segments.push(Segment::single(id));
            } else if extends {
                if let Some(last) = segments.last_mut() {
                    last.end = id;
                }
            } else {
                segments.push(Segment::single(id));
            }
            payload.extend_from_slice(&data);
        }

        if !segments.is_empty() {
            fragments.push(Self::pending(blast_id, &mut segments, &mut payload));
        }

        let fragment_count = fragments.len() as u32;
        for (index, fragment) in fragments.iter_mut().enumerate() {
            fragment.fragment_index = index as u32;
            fragment.fragment_count = fragment_count;
        }
        fragments
    }

    fn pending(
        blast_id: BlastId,
        segments: &mut Vec<Segment>,
        payload: &mut BytesMut,
    ) -> DataFragment {
        DataFragment {
            blast_id,
            fragment_index: 0,
            fragment_count: 0,
            segments: std::mem::take(segments),
            payload: payload.split().freeze(),
        }
    }
}

/// 프래그먼트 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 빈 슬롯에 저장됨
    Stored,

    /// 이미 채워진 슬롯 (무시)
    Duplicate,

    /// fragment_index >= fragment_count
    OutOfRange,

    /// 버퍼와 다른 fragment_count (다른 라운드의 프래그먼트)
    CountMismatch,
}

/// 재조립 버퍼 (수신측)
///
/// 첫 프래그먼트의 fragment_count로 슬롯 수가 정해짐
#[derive(Debug)]
pub struct ReassemblyBuffer {
    pub blast_id: BlastId,

    /// 슬롯별 프래그먼트
    slots: Vec<Option<DataFragment>>,

    /// 채워진 슬롯 수
    filled: u32,

    /// 생성 시간
    created_at: Instant,
}

impl ReassemblyBuffer {
    pub fn new(blast_id: BlastId, fragment_count: u32) -> Self {
        Self {
            blast_id,
            slots: vec![None; fragment_count as usize],
            filled: 0,
            created_at: Instant::now(),
        }
    }

    pub fn fragment_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// 프래그먼트 삽입. 빈 슬롯일 때만 저장
    pub fn insert(&mut self, fragment: DataFragment) -> InsertOutcome {
        if fragment.fragment_count != self.fragment_count() {
            return InsertOutcome::CountMismatch;
        }

        match self.slots.get_mut(fragment.fragment_index as usize) {
            None => InsertOutcome::OutOfRange,
            Some(Some(_)) => InsertOutcome::Duplicate,
            Some(slot) => {
                *slot = Some(fragment);
                self.filled += 1;
                InsertOutcome::Stored
            }
        }
    }

    /// 모든 슬롯이 채워졌는지
    pub fn is_complete(&self) -> bool {
        self.filled == self.fragment_count()
    }

    pub fn filled(&self) -> u32 {
        self.filled
    }

    /// 비어 있는 슬롯 인덱스
    pub fn missing_fragments(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 채워진 슬롯을 프래그먼트 순서대로 레코드로 풀어냄
    ///
    /// 미완성 버퍼에서도 호출 가능 (라운드 종료 시 남은 조각 회수)
    pub fn into_records(self, record_size: u32) -> Vec<(RecordId, Bytes)> {
        self.slots
            .into_iter()
            .flatten()
            .flat_map(|fragment| fragment.records(record_size).collect::<Vec<_>>())
            .collect()
    }
}
