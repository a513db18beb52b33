//! 수신자
//!
//! - HELLO로 세션 시작, 출력 파일을 미리 패딩 길이로 생성
//! - 블라스트별 재조립 버퍼에 프래그먼트 수집
//! - 버퍼가 완성되거나 BLAST_END가 오면 레코드를 쓰고 MISSING 보고
//! - DISCONNECT에서 원래 크기로 자르고 종료
//!
//! 단일 태스크에서만 상태에 접근하므로 락 없음

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::fragment::{InsertOutcome, ReassemblyBuffer};
use crate::loss::{LossModel, NoLoss};
use crate::message::{BlastEnd, DataFragment, Message, MissingReport};
use crate::record::{self, merge_ranges, BlastId, RecordId, Segment, SessionParams};
use crate::stats::ReceiverStats;
use crate::{Config, Error, Result, RECV_BUFFER_SIZE};

/// 상대가 보낸 이름을 쓸 수 없을 때의 출력 파일 이름
const DEFAULT_OUTPUT_NAME: &str = "received.bin";

/// 블라스트별 수신 상태
struct BlastProgress {
    range: Segment,

    /// 현재 라운드의 재조립 버퍼
    buffer: Option<ReassemblyBuffer>,

    /// 시뮬레이션 손실로 아직 쓰지 못한 레코드
    lost: BTreeSet<RecordId>,

    /// 버퍼 완성으로 이미 보고했음 (다음 BLAST_END 하나는 흡수)
    answered: bool,

    /// 빈 MISSING을 보냄. 이후 DATA는 무시
    closed: bool,
}

impl BlastProgress {
    fn new(range: Segment) -> Self {
        Self {
            range,
            buffer: None,
            lost: BTreeSet::new(),
            answered: false,
            closed: false,
        }
    }
}

/// 진행 중인 전송 세션
struct Session {
    params: SessionParams,
    peer: SocketAddr,
    output_path: PathBuf,
    output: File,

    /// 레코드별 기록 여부
    written: Vec<bool>,

    blasts: HashMap<BlastId, BlastProgress>,

    /// MISSING 하나에 담을 구간 수 상한
    max_ranges: usize,
}

impl Session {
    async fn create(
        params: SessionParams,
        peer: SocketAddr,
        output_dir: &Path,
        max_ranges: usize,
    ) -> Result<Self> {
        let output_path = output_dir.join(output_name(&params.file_name));
        let output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output_path)
            .await?;
        output.set_len(params.padded_len()).await?;

        Ok(Self {
            written: vec![false; params.total_records as usize],
            params,
            peer,
            output_path,
            output,
            blasts: HashMap::new(),
            max_ranges,
        })
    }

    /// DATA 처리. 버퍼가 완성되면 보낼 MISSING 반환
    async fn on_data(
        &mut self,
        fragment: DataFragment,
        loss: &dyn LossModel,
        stats: &mut ReceiverStats,
    ) -> Result<Option<MissingReport>> {
        fragment.check_payload(self.params.record_size)?;

        let blast_id = fragment.blast_id;
        let range = self
            .params
            .blast_range(blast_id)
            .ok_or_else(|| Error::violation(format!("블라스트 {} 범위 밖", blast_id)))?;
        if fragment.fragment_count == 0 || u64::from(fragment.fragment_count) > range.len() {
            return Err(Error::violation(format!(
                "블라스트 {}: fragment_count {}",
                blast_id, fragment.fragment_count
            )));
        }
        if let Some(segment) = fragment
            .segments
            .iter()
            .find(|segment| segment.intersect(&range) != Some(**segment))
        {
            return Err(Error::violation(format!(
                "블라스트 {}: 세그먼트 {}-{}가 {}-{} 밖",
                blast_id, segment.start, segment.end, range.start, range.end
            )));
        }

        let blast = self
            .blasts
            .entry(blast_id)
            .or_insert_with(|| BlastProgress::new(range));
        if blast.closed {
            stats.stale_fragments += 1;
            debug!("닫힌 블라스트 {}의 DATA 무시", blast_id);
            return Ok(None);
        }

        // fragment_count가 다르면 새 라운드: 이전 라운드의 남은 버퍼 교체
        let fragment_count = fragment.fragment_count;
        let mismatched = blast
            .buffer
            .as_ref()
            .map_or(false, |buffer| buffer.fragment_count() != fragment_count);
        if mismatched {
            if let Some(old) = blast.buffer.take() {
                warn!(
                    "블라스트 {}: 이전 라운드 버퍼 폐기 ({}/{} fragments)",
                    blast_id,
                    old.filled(),
                    old.fragment_count()
                );
                stats.stale_fragments += u64::from(old.filled());
            }
        }

        let buffer = blast
            .buffer
            .get_or_insert_with(|| ReassemblyBuffer::new(blast_id, fragment_count));
        match buffer.insert(fragment) {
            InsertOutcome::Stored => stats.fragments_received += 1,
            InsertOutcome::Duplicate => {
                stats.duplicate_fragments += 1;
                return Ok(None);
            }
            outcome => {
                return Err(Error::violation(format!(
                    "블라스트 {}: 프래그먼트 삽입 실패 {:?}",
                    blast_id, outcome
                )))
            }
        }
        if !buffer.is_complete() {
            return Ok(None);
        }

        blast.answered = true;
        let records = match blast.buffer.take() {
            Some(buffer) => buffer.into_records(self.params.record_size),
            None => Vec::new(),
        };
        self.apply(blast_id, records, loss, stats).await?;
        Ok(Some(self.report(blast_id, stats)))
    }

    /// BLAST_END 처리. 보낼 MISSING이 있으면 반환
    async fn on_blast_end(
        &mut self,
        end: BlastEnd,
        loss: &dyn LossModel,
        stats: &mut ReceiverStats,
    ) -> Result<Option<MissingReport>> {
        let blast_id = end.blast_id;
        let range = self
            .params
            .blast_range(blast_id)
            .ok_or_else(|| Error::violation(format!("BLAST_END: 블라스트 {} 범위 밖", blast_id)))?;
        if end.range != range {
            warn!(
                "BLAST_END 구간 불일치: 블라스트 {} {}-{} (예상 {}-{})",
                blast_id, end.range.start, end.range.end, range.start, range.end
            );
        }

        let blast = self
            .blasts
            .entry(blast_id)
            .or_insert_with(|| BlastProgress::new(range));

        // 버퍼 완성으로 이미 보고한 라운드의 BLAST_END
        if blast.answered && blast.buffer.is_none() {
            blast.answered = false;
            debug!("블라스트 {}: 응답한 라운드의 BLAST_END 흡수", blast_id);
            return Ok(None);
        }
        blast.answered = false;

        if let Some(buffer) = blast.buffer.take() {
            debug!(
                "블라스트 {}: 미완성 버퍼 회수 ({}/{} fragments, missing {:?})",
                blast_id,
                buffer.filled(),
                buffer.fragment_count(),
                buffer.missing_fragments()
            );
            let records = buffer.into_records(self.params.record_size);
            self.apply(blast_id, records, loss, stats).await?;
        }

        Ok(Some(self.report(blast_id, stats)))
    }

    /// 레코드 판정 후 기록. 연속 레코드는 한 번에 씀
    async fn apply(
        &mut self,
        blast_id: BlastId,
        records: Vec<(RecordId, Bytes)>,
        loss: &dyn LossModel,
        stats: &mut ReceiverStats,
    ) -> Result<()> {
        let Session {
            params,
            output,
            written,
            blasts,
            ..
        } = self;
        let Some(blast) = blasts.get_mut(&blast_id) else {
            return Ok(());
        };

        let mut run_start: Option<RecordId> = None;
        let mut run = BytesMut::new();
        let mut next_id: RecordId = 0;

        for (id, data) in records {
            let slot = id as usize;
            if written[slot] {
                blast.lost.remove(&id);
                continue;
            }
            if loss.is_lost(id) {
                if blast.lost.insert(id) {
                    stats.records_lost_sim += 1;
                }
                continue;
            }

            if run_start.is_some() && id != next_id {
                flush_run(output, params, &mut run_start, &mut run).await?;
            }
            run_start.get_or_insert(id);
            run.extend_from_slice(&data);
            next_id = id + 1;

            written[slot] = true;
            stats.records_written += 1;
            if blast.lost.remove(&id) {
                stats.records_recovered += 1;
            }
        }
        flush_run(output, params, &mut run_start, &mut run).await
    }

    /// 블라스트 구간 중 아직 쓰지 않은 레코드로 MISSING 생성
    ///
    /// 비어 있으면 블라스트를 닫음
    fn report(&mut self, blast_id: BlastId, stats: &mut ReceiverStats) -> MissingReport {
        let Some(blast) = self.blasts.get_mut(&blast_id) else {
            return MissingReport::complete(blast_id);
        };

        let written = &self.written;
        let mut ranges = merge_ranges(blast.range.ids().filter(|&id| !written[id as usize]));
        if ranges.len() > self.max_ranges {
            debug!(
                "블라스트 {}: 누락 구간 {}개 중 {}개만 보고",
                blast_id,
                ranges.len(),
                self.max_ranges
            );
            ranges.truncate(self.max_ranges);
        }

        if ranges.is_empty() && !blast.closed {
            blast.closed = true;
            blast.buffer = None;
            blast.lost.clear();
            stats.blasts_received += 1;
            debug!("블라스트 {} 수신 완료", blast_id);
        }

        MissingReport { blast_id, ranges }
    }

    /// 미완료 상태 로그
    fn log_unfinished(&self) {
        for (blast_id, blast) in &self.blasts {
            if let Some(buffer) = &blast.buffer {
                warn!(
                    "블라스트 {}: 재조립 미완료 ({}/{} fragments, {:?} 경과)",
                    blast_id,
                    buffer.filled(),
                    buffer.fragment_count(),
                    buffer.age()
                );
            }
        }

        let unwritten = self.written.iter().filter(|written| !**written).count();
        if unwritten > 0 {
            let open = self
                .params
                .blasts()
                .filter(|(id, _)| !self.blasts.get(id).map_or(false, |blast| blast.closed))
                .count();
            warn!(
                "{}: 레코드 {}개 미수신, 닫히지 않은 블라스트 {}개",
                self.params.file_name, unwritten, open
            );
        }
    }

    /// 원래 크기로 자르고 디스크에 반영
    async fn finish(self) -> Result<PathBuf> {
        self.log_unfinished();
        let mut output = self.output;
        output.flush().await?;
        output.set_len(self.params.file_size).await?;
        output.sync_all().await?;
        Ok(self.output_path)
    }
}

/// 모아 둔 연속 레코드를 한 번에 기록
async fn flush_run(
    output: &mut File,
    params: &SessionParams,
    run_start: &mut Option<RecordId>,
    run: &mut BytesMut,
) -> Result<()> {
    if let Some(start) = run_start.take() {
        output
            .seek(SeekFrom::Start(params.record_offset(start)))
            .await?;
        output.write_all(run).await?;
        run.clear();
    }
    Ok(())
}

/// 상대가 보낸 이름에서 경로 부분을 제거
fn output_name(file_name: &str) -> &str {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_OUTPUT_NAME)
}

/// 수신자
pub struct Receiver {
    config: Config,
    socket: UdpSocket,
    output_dir: PathBuf,
    loss: Box<dyn LossModel>,
    session: Option<Session>,
    stats: ReceiverStats,
}

impl Receiver {
    /// 소켓 바인드. 출력 파일은 HELLO를 받으면 `output_dir` 아래에 생성
    pub async fn bind(
        config: Config,
        bind_addr: SocketAddr,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("Blast receiver listening on {}", socket.local_addr()?);

        Ok(Self {
            config,
            socket,
            output_dir: output_dir.into(),
            loss: Box::new(NoLoss),
            session: None,
            stats: ReceiverStats::default(),
        })
    }

    /// 레코드 손실 시뮬레이션 설정
    pub fn with_loss(mut self, loss: impl LossModel + 'static) -> Self {
        self.loss = Box::new(loss);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// DISCONNECT까지 수신
    pub async fn run(mut self) -> Result<ReceiverStats> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, from) = self.recv(&mut buf).await?;

            let message = match Message::from_bytes(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    self.stats.malformed_datagrams += 1;
                    warn!("{}의 데이터그램 버림 ({} bytes): {}", from, len, e);
                    continue;
                }
            };

            let result = match message {
                Message::Hello(params) => self.handle_hello(params, from).await,
                Message::Data(fragment) => self.handle_data(fragment, len, from).await,
                Message::BlastEnd(end) => self.handle_blast_end(end, from).await,
                Message::Disconnect => {
                    if self.is_peer(from) {
                        return self.finish().await;
                    }
                    debug!("세션 밖 DISCONNECT 무시: {}", from);
                    Ok(())
                }
                other => {
                    debug!("수신측에서 무시: {:?} from {}", other.msg_type(), from);
                    Ok(())
                }
            };

            match result {
                Err(e @ Error::ProtocolViolation { .. }) => {
                    self.stats.stale_fragments += 1;
                    warn!("{}: {}", from, e);
                }
                Err(e) if e.is_recoverable() => {
                    self.stats.malformed_datagrams += 1;
                    warn!("{}: {}", from, e);
                }
                other => other?,
            }
        }
    }

    fn is_peer(&self, from: SocketAddr) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.peer == from)
    }

    async fn handle_hello(&mut self, params: SessionParams, from: SocketAddr) -> Result<()> {
        params
            .validate()
            .map_err(|e| Error::malformed(format!("HELLO: {}", e)))?;

        let file_name = params.file_name.clone();
        let max_ranges = MissingReport::max_ranges(self.config.max_datagram_size).max(1);
        // 출력 파일을 만들 수 없는 HELLO는 거절하고 기존 세션 유지
        let session = Session::create(params, from, &self.output_dir, max_ranges)
            .await
            .map_err(|e| Error::malformed(format!("HELLO {}: 출력 파일 준비 실패: {}", file_name, e)))?;

        if let Some(old) = self.session.replace(session) {
            warn!("새 HELLO ({}): 이전 세션 {} 폐기", from, old.params.file_name);
            old.log_unfinished();
        }

        if let Some(session) = &self.session {
            info!(
                "세션 시작: {} → {} ({} bytes, {} records, blast_size {})",
                from,
                file_name,
                session.params.file_size,
                session.params.total_records,
                session.params.blast_size
            );
            debug!("출력 파일: {}", session.output_path.display());
        }
        self.stats = ReceiverStats::new(file_name);

        self.send(&Message::HelloAck, from).await
    }

    async fn handle_data(&mut self, fragment: DataFragment, len: usize, from: SocketAddr) -> Result<()> {
        let Some(session) = self.session.as_mut().filter(|session| session.peer == from) else {
            self.stats.stale_fragments += 1;
            debug!("세션 밖 DATA 무시: {}", from);
            return Ok(());
        };

        self.stats.mark_started();
        self.stats.bytes_received += len as u64;
        let report = session
            .on_data(fragment, self.loss.as_ref(), &mut self.stats)
            .await?;
        if let Some(report) = report {
            self.send_report(report, from).await?;
        }
        Ok(())
    }

    async fn handle_blast_end(&mut self, end: BlastEnd, from: SocketAddr) -> Result<()> {
        let Some(session) = self.session.as_mut().filter(|session| session.peer == from) else {
            debug!("세션 밖 BLAST_END 무시: {}", from);
            return Ok(());
        };

        let report = session
            .on_blast_end(end, self.loss.as_ref(), &mut self.stats)
            .await?;
        if let Some(report) = report {
            self.send_report(report, from).await?;
        }
        Ok(())
    }

    async fn send_report(&mut self, report: MissingReport, to: SocketAddr) -> Result<()> {
        if report.is_complete() {
            debug!("블라스트 {}: MISSING (없음)", report.blast_id);
        } else {
            debug!(
                "블라스트 {}: MISSING {}개 레코드 {:?}",
                report.blast_id,
                report.record_count(),
                report.ranges
            );
        }
        self.stats.reports_sent += 1;
        self.send(&Message::Missing(report), to).await
    }

    async fn send(&self, message: &Message, to: SocketAddr) -> Result<()> {
        self.socket.send_to(&message.to_bytes(), to).await?;
        Ok(())
    }

    /// 데이터그램 하나 수신. 유휴 타임아웃이 설정되어 있으면 적용
    async fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let Some(idle) = self.config.idle_timeout() else {
            return Ok(self.socket.recv_from(buf).await?);
        };

        match tokio::time::timeout(idle, self.socket.recv_from(buf)).await {
            Ok(received) => Ok(received?),
            Err(_) => {
                warn!("{:?} 동안 수신 없음", idle);
                if let Some(session) = &self.session {
                    session.log_unfinished();
                }
                Err(Error::Timeout {
                    what: "수신 유휴",
                    attempts: 1,
                })
            }
        }
    }

    /// DISCONNECT: 출력 파일 마무리 후 통계 반환
    async fn finish(mut self) -> Result<ReceiverStats> {
        self.stats.mark_finished();
        let Some(session) = self.session.take() else {
            return Ok(self.stats);
        };

        let path = session.finish().await?;
        let crc_path = path.clone();
        match tokio::task::spawn_blocking(move || record::file_crc32(crc_path)).await {
            Ok(Ok(crc)) => {
                self.stats.output_crc32 = Some(crc);
                info!("출력 CRC32: {:08x}", crc);
            }
            Ok(Err(e)) => warn!("출력 CRC32 계산 실패: {}", e),
            Err(e) => warn!("CRC32 태스크 실패: {}", e),
        }

        info!("수신 완료 ({}): {}", path.display(), self.stats.summary());
        Ok(self.stats)
    }
}
