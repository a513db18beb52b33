//! 레코드와 블라스트 정의
//!
//! - Record: 파일을 `record_size` 바이트로 자른 단위 (마지막 레코드는 0으로 패딩)
//! - Blast: 연속된 최대 `blast_size`개 레코드 묶음, 확인 응답의 단위
//! - Segment: 레코드 ID 폐구간 `[start, end]`

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::RangeInclusive;
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::{Error, Result};

/// 레코드 ID (0부터 시작)
pub type RecordId = u64;

/// 블라스트 ID (세션 내에서 단조 증가, 재사용 없음)
pub type BlastId = u32;

/// 레코드 ID 폐구간
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub start: RecordId,
    pub end: RecordId,
}

impl Segment {
    pub fn new(start: RecordId, end: RecordId) -> Self {
        debug_assert!(start <= end, "segment start {} > end {}", start, end);
        Self { start, end }
    }

    pub fn single(id: RecordId) -> Self {
        Self { start: id, end: id }
    }

    /// 구간에 포함된 레코드 수
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.start <= id && id <= self.end
    }

    pub fn ids(&self) -> RangeInclusive<RecordId> {
        self.start..=self.end
    }

    /// 두 구간의 교집합
    pub fn intersect(&self, other: &Segment) -> Option<Segment> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then(|| Segment::new(start, end))
    }
}

/// 레코드 ID 집합을 오름차순의 최소 개수 연속 구간으로 병합
///
/// 입력 순서와 중복은 상관없음. `{3,4,5,9,10,15}` -> `[3,5] [9,10] [15,15]`
pub fn merge_ranges<I>(ids: I) -> Vec<Segment>
where
    I: IntoIterator<Item = RecordId>,
{
    let sorted: BTreeSet<RecordId> = ids.into_iter().collect();
    let mut ranges: Vec<Segment> = Vec::new();

    for id in sorted {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == id => last.end = id,
            _ => ranges.push(Segment::single(id)),
        }
    }

    ranges
}

/// 올림 나눗셈 (`n`이 u64::MAX 근처여도 넘치지 않음). `d`가 0이면 0
fn ceil_div(n: u64, d: u64) -> u64 {
    match n.checked_div(d) {
        Some(quotient) => quotient + u64::from(n % d != 0),
        None => 0,
    }
}

/// 파일 크기에 필요한 레코드 수 (올림)
pub fn total_records(file_size: u64, record_size: u32) -> u64 {
    ceil_div(file_size, record_size as u64)
}

/// 세션 파라미터
///
/// 핸드쉐이크 때 한 번 정해지고 세션 동안 바뀌지 않음
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// 전송 파일 이름 (경로 제외)
    pub file_name: String,

    /// 원본 파일 크기 (바이트)
    pub file_size: u64,

    /// 레코드 크기 (바이트)
    pub record_size: u32,

    /// 총 레코드 수 = ceil(file_size / record_size)
    pub total_records: u64,

    /// 블라스트당 레코드 수 (M)
    pub blast_size: u32,
}

impl SessionParams {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        record_size: u32,
        blast_size: u32,
    ) -> Result<Self> {
        if record_size == 0 || blast_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "record_size={} blast_size={} (0 불가)",
                record_size, blast_size
            )));
        }

        let params = Self {
            file_name: file_name.into(),
            file_size,
            record_size,
            total_records: total_records(file_size, record_size),
            blast_size,
        };
        params.validate()?;
        Ok(params)
    }

    /// 상대방이 보낸 파라미터의 내부 일관성 검사
    pub fn validate(&self) -> Result<()> {
        if self.record_size == 0 || self.blast_size == 0 {
            return Err(Error::malformed("record_size/blast_size 0"));
        }
        if self.total_records != total_records(self.file_size, self.record_size) {
            return Err(Error::malformed(format!(
                "total_records {} != ceil({} / {})",
                self.total_records, self.file_size, self.record_size
            )));
        }
        if self.file_name.len() > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "파일 이름 {} bytes (최대 {})",
                self.file_name.len(),
                u16::MAX
            )));
        }
        // DATA 세그먼트는 u32 레코드 ID를 사용
        if self.total_records > u32::MAX as u64 + 1 {
            return Err(Error::FileTooLarge {
                total_records: self.total_records,
            });
        }
        Ok(())
    }

    /// 레코드 길이 (바이트)
    pub fn record_len(&self) -> usize {
        self.record_size as usize
    }

    /// 총 블라스트 수
    pub fn blast_count(&self) -> u64 {
        ceil_div(self.total_records, self.blast_size as u64)
    }

    /// 레코드가 속한 블라스트
    pub fn blast_of(&self, id: RecordId) -> BlastId {
        (id / self.blast_size as u64) as BlastId
    }

    /// 블라스트가 담당하는 레코드 구간 (범위 밖이면 None)
    pub fn blast_range(&self, blast_id: BlastId) -> Option<Segment> {
        let start = blast_id as u64 * self.blast_size as u64;
        if start >= self.total_records {
            return None;
        }
        let end = (start + self.blast_size as u64).min(self.total_records) - 1;
        Some(Segment::new(start, end))
    }

    /// 모든 블라스트를 ID 순서대로
    pub fn blasts(&self) -> impl Iterator<Item = (BlastId, Segment)> + '_ {
        (0..self.blast_count()).filter_map(move |id| {
            let id = id as BlastId;
            self.blast_range(id).map(|range| (id, range))
        })
    }

    /// 레코드의 파일 내 오프셋
    pub fn record_offset(&self, id: RecordId) -> u64 {
        id * self.record_size as u64
    }

    /// 패딩 포함 출력 크기 = total_records × record_size
    pub fn padded_len(&self) -> u64 {
        self.total_records * self.record_size as u64
    }
}

/// 블라스트 (송신측 값 객체)
#[derive(Debug, Clone)]
pub struct Blast {
    pub id: BlastId,

    /// 담당 레코드 구간
    pub range: Segment,

    /// 구간 순서대로의 레코드 데이터 (각각 record_size 바이트)
    pub records: Vec<Bytes>,
}

impl Blast {
    /// (레코드 ID, 데이터) 순회
    pub fn records(&self) -> impl Iterator<Item = (RecordId, &Bytes)> + '_ {
        self.range.ids().zip(self.records.iter())
    }
}

/// 원본 파일에서 레코드 단위로 읽는 리더
///
/// 순차 읽기(블라스트 생성)와 재전송용 임의 위치 읽기를 모두 처리
pub struct RecordReader<R> {
    inner: R,
    record_size: usize,
    total_records: u64,
}

impl RecordReader<File> {
    pub fn open(path: impl AsRef<Path>, params: &SessionParams) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?, params))
    }
}

impl<R: Read + Seek> RecordReader<R> {
    pub fn new(inner: R, params: &SessionParams) -> Self {
        Self {
            inner,
            record_size: params.record_len(),
            total_records: params.total_records,
        }
    }

    /// 구간의 레코드들을 읽음 (파일 끝을 넘는 부분은 0)
    pub fn read_range(&mut self, range: Segment) -> io::Result<Vec<Bytes>> {
        if range.end >= self.total_records {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record {} out of range ({})", range.end, self.total_records),
            ));
        }

        self.inner
            .seek(SeekFrom::Start(range.start * self.record_size as u64))?;

        let mut buf = BytesMut::zeroed(range.len() as usize * self.record_size);
        read_padded(&mut self.inner, &mut buf)?;

        let mut data = buf.freeze();
        Ok((0..range.len())
            .map(|_| data.split_to(self.record_size))
            .collect())
    }

    /// 블라스트 하나를 통째로 읽음
    pub fn read_blast(&mut self, id: BlastId, range: Segment) -> io::Result<Blast> {
        let records = self.read_range(range)?;
        Ok(Blast { id, range, records })
    }
}

/// EOF까지 또는 버퍼가 찰 때까지 읽음 (남은 부분은 그대로 둠)
fn read_padded<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// 파일 전체 CRC32 (양쪽 로그 비교용)
pub fn file_crc32(path: impl AsRef<Path>) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_merge_ranges() {
        let ranges = merge_ranges([3, 4, 5, 9, 10, 15]);
        assert_eq!(
            ranges,
            vec![Segment::new(3, 5), Segment::new(9, 10), Segment::new(15, 15)]
        );
    }

    #[test]
    fn test_merge_ranges_unsorted_with_duplicates() {
        let ranges = merge_ranges([10, 3, 4, 4, 9, 5]);
        assert_eq!(ranges, vec![Segment::new(3, 5), Segment::new(9, 10)]);
        assert!(merge_ranges(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_partition_covers_every_record_once() {
        for total in [1u64, 7, 19, 20, 21, 100, 401] {
            for blast_size in [1u32, 3, 20, 200] {
                let params = SessionParams::new("f", total * 4, 4, blast_size).unwrap();
                assert_eq!(params.total_records, total);

                let mut next = 0u64;
                let mut last_id: Option<BlastId> = None;
                for (id, range) in params.blasts() {
                    if let Some(prev) = last_id {
                        assert!(id > prev);
                    }
                    last_id = Some(id);
                    assert_eq!(range.start, next);
                    assert!(range.len() <= blast_size as u64);
                    for rec in range.ids() {
                        assert_eq!(params.blast_of(rec), id);
                    }
                    next = range.end + 1;
                }
                assert_eq!(next, total);
            }
        }
    }

    #[test]
    fn test_session_params_rounding() {
        let params = SessionParams::new("test.bin", 10_000, 512, 20).unwrap();
        assert_eq!(params.total_records, 20);
        assert_eq!(params.blast_count(), 1);
        assert_eq!(params.padded_len(), 10_240);
        assert_eq!(params.blast_range(0), Some(Segment::new(0, 19)));
        assert_eq!(params.blast_range(1), None);

        let params = SessionParams::new("test.bin", 10_000, 512, 8).unwrap();
        assert_eq!(params.blast_count(), 3);
        assert_eq!(params.blast_range(2), Some(Segment::new(16, 19)));
    }

    #[test]
    fn test_empty_file_has_no_blasts() {
        let params = SessionParams::new("empty", 0, 512, 20).unwrap();
        assert_eq!(params.total_records, 0);
        assert_eq!(params.blasts().count(), 0);
    }

    #[test]
    fn test_huge_file_size_does_not_overflow() {
        assert_eq!(total_records(u64::MAX, 512), u64::MAX / 512 + 1);
        assert_eq!(total_records(u64::MAX, 1), u64::MAX);
        assert_eq!(total_records(1_000, 0), 0);

        // 상대가 보낸 HELLO 값: total_records가 파일 크기와 맞지 않음
        let hello = SessionParams {
            file_name: "x".into(),
            file_size: u64::MAX,
            record_size: 512,
            total_records: 0,
            blast_size: 20,
        };
        assert!(matches!(hello.validate(), Err(Error::Malformed { .. })));

        // 일관되지만 u32 레코드 ID 범위를 넘는 경우
        let hello = SessionParams {
            total_records: total_records(u64::MAX, 512),
            ..hello
        };
        assert!(matches!(hello.validate(), Err(Error::FileTooLarge { .. })));
        assert_eq!(hello.blast_count(), (u64::MAX / 512 + 1) / 20 + 1);
    }

    #[test]
    fn test_validate_rejects_inconsistent_total() {
        let mut params = SessionParams::new("f", 1000, 100, 5).unwrap();
        params.total_records = 11;
        assert!(matches!(params.validate(), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_record_reader_pads_final_record() {
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let params = SessionParams::new("f", data.len() as u64, 100, 2).unwrap();
        let mut reader = RecordReader::new(Cursor::new(data.clone()), &params);

        let blast = reader.read_blast(1, params.blast_range(1).unwrap()).unwrap();
        assert_eq!(blast.records.len(), 1);
        assert_eq!(&blast.records[0][..50], &data[200..]);
        assert!(blast.records[0][50..].iter().all(|&b| b == 0));

        // 재전송용 임의 위치 읽기
        let again = reader.read_range(Segment::single(1)).unwrap();
        assert_eq!(&again[0][..], &data[100..200]);

        assert!(reader.read_range(Segment::single(3)).is_err());
    }
}
