//! 전송 통계

use std::time::{Duration, Instant};

/// 처리율 계산 (bytes/sec). 경과 시간이 0이면 0
fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}

/// 시작/종료 시각
#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Timing {
    fn start(&mut self) {
        self.start.get_or_insert_with(Instant::now);
    }

    fn finish(&mut self) {
        self.end = Some(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// 송신측 통계
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    /// 전송 파일 이름
    pub file_name: String,

    /// 닫힌 블라스트 수
    pub blasts_sent: u64,

    /// 전송한 DATA 프래그먼트 수 (재전송 포함)
    pub fragments_sent: u64,

    /// 재전송 라운드에서 보낸 프래그먼트 수
    pub fragments_retransmitted: u64,

    /// 전송한 바이트 (모든 데이터그램)
    pub bytes_sent: u64,

    /// 수신한 MISSING 보고 수
    pub report_round_trips: u64,

    /// 보고된 누락 레코드 누적 수
    pub missing_records_reported: u64,

    /// 타임아웃으로 다시 보낸 BLAST_END 수
    pub blast_end_resends: u64,

    /// 원본 파일 CRC32
    pub source_crc32: Option<u32>,

    timing: Timing,
}

impl SenderStats {
    /// CSV 헤더 (실험 스크립트가 마지막 CSV 줄을 파싱)
    pub const CSV_HEADER: &'static str = "file,throughput_mbps,loss_events,retransmits";

    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    /// 첫 블라스트 전송 시 호출
    pub fn mark_started(&mut self) {
        self.timing.start();
    }

    /// DISCONNECT 전송 시 호출
    pub fn mark_finished(&mut self) {
        self.timing.finish();
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.timing.elapsed()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        rate(self.bytes_sent, self.elapsed())
    }

    pub fn throughput_mbps(&self) -> f64 {
        self.throughput() * 8.0 / 1_000_000.0
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "blasts_sent={} fragments_sent={} bytes_sent={} rec_miss_msgs={} missing_records_reported={} | Duration: {:.3}s | Throughput: {:.0} B/s ({:.2} Mbps)",
            self.blasts_sent,
            self.fragments_sent,
            self.bytes_sent,
            self.report_round_trips,
            self.missing_records_reported,
            self.elapsed().as_secs_f64(),
            self.throughput(),
            self.throughput_mbps(),
        )
    }

    /// `file,throughput_mbps,loss_events,retransmits`
    pub fn csv_line(&self) -> String {
        format!(
            "{},{:.3},{},{}",
            self.file_name,
            self.throughput_mbps(),
            self.missing_records_reported,
            self.fragments_retransmitted,
        )
    }
}

/// 수신측 통계
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    /// 수신 파일 이름
    pub file_name: String,

    /// 닫힌 (빈 MISSING을 보낸) 블라스트 수
    pub blasts_received: u64,

    /// 저장된 DATA 프래그먼트 수 (중복 제외)
    pub fragments_received: u64,

    /// 중복 프래그먼트 수
    pub duplicate_fragments: u64,

    /// DATA 데이터그램 바이트 합
    pub bytes_received: u64,

    /// 출력 파일에 쓴 레코드 수 (레코드당 한 번)
    pub records_written: u64,

    /// 시뮬레이션으로 손실 처리된 레코드 수 (레코드당 한 번)
    pub records_lost_sim: u64,

    /// 손실 후 재전송으로 복구된 레코드 수
    pub records_recovered: u64,

    /// 보낸 MISSING 보고 수
    pub reports_sent: u64,

    /// 버린 잘못된 데이터그램 수
    pub malformed_datagrams: u64,

    /// 무시한 오래된/불일치 프래그먼트 수
    pub stale_fragments: u64,

    /// 출력 파일 CRC32
    pub output_crc32: Option<u32>,

    timing: Timing,
}

impl ReceiverStats {
    pub const CSV_HEADER: &'static str = "file,throughput_mbps,records_written,records_lost_sim";

    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    /// 첫 DATA 수신 시 호출
    pub fn mark_started(&mut self) {
        self.timing.start();
    }

    /// DISCONNECT 수신 시 호출
    pub fn mark_finished(&mut self) {
        self.timing.finish();
    }

    pub fn elapsed(&self) -> Duration {
        self.timing.elapsed()
    }

    pub fn throughput(&self) -> f64 {
        rate(self.bytes_received, self.elapsed())
    }

    pub fn throughput_mbps(&self) -> f64 {
        self.throughput() * 8.0 / 1_000_000.0
    }

    pub fn summary(&self) -> String {
        format!(
            "blasts_received={} bytes_received={} records_written={} records_lost_sim={} records_recovered={} | Duration: {:.3}s | Throughput: {:.0} B/s ({:.2} Mbps)",
            self.blasts_received,
            self.bytes_received,
            self.records_written,
            self.records_lost_sim,
            self.records_recovered,
            self.elapsed().as_secs_f64(),
            self.throughput(),
            self.throughput_mbps(),
        )
    }

    pub fn csv_line(&self) -> String {
        format!(
            "{},{:.3},{},{}",
            self.file_name,
            self.throughput_mbps(),
            self.records_written,
            self.records_lost_sim,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstarted_stats_are_zero() {
        let stats = SenderStats::new("a.bin");
        assert_eq!(stats.elapsed(), Duration::ZERO);
        assert_eq!(stats.throughput(), 0.0);
    }

    #[test]
    fn test_csv_line_matches_header() {
        let mut stats = SenderStats::new("test_100kb.bin");
        stats.missing_records_reported = 12;
        stats.fragments_retransmitted = 5;
        stats.mark_started();
        stats.mark_finished();

        let line = stats.csv_line();
        let parts: Vec<&str> = line.split(',').collect();
        assert_eq!(parts.len(), SenderStats::CSV_HEADER.split(',').count());
        assert_eq!(parts[0], "test_100kb.bin");
        assert!(parts[1].parse::<f64>().is_ok());
        assert_eq!(parts[2], "12");
        assert_eq!(parts[3], "5");
    }

    #[test]
    fn test_finished_elapsed_is_frozen() {
        let mut stats = ReceiverStats::new("b.bin");
        stats.mark_started();
        stats.mark_finished();
        let first = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), first);
        assert!(stats.summary().contains("records_written=0"));
    }
}
