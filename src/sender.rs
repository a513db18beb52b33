//! 송신자
//!
//! - 디스크 읽기 태스크(spawn_blocking) → 제한된 큐 → 전송 루프
//! - 블라스트 하나를 닫은 뒤에 다음 블라스트 전송 (정지-대기)
//! - MISSING 보고에 있는 레코드만 다시 읽어 재전송
//!
//! 블라스트 단계:
//! READING → SENDING → AWAITING_REPORT → (RETRANSMITTING → AWAITING_REPORT)* → CLOSED

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::fragment::FragmentBuilder;
use crate::message::{BlastEnd, DataFragment, Message, MissingReport};
use crate::record::{self, Blast, BlastId, RecordId, RecordReader, Segment, SessionParams};
use crate::stats::SenderStats;
use crate::{Config, Error, Result, RECV_BUFFER_SIZE};

/// 파일 이름을 알 수 없을 때 HELLO에 싣는 이름
const FALLBACK_FILE_NAME: &str = "data.bin";

/// 블라스트 진행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlastPhase {
    /// 디스크에서 읽는 중 (읽기 태스크)
    Reading,

    /// 최초 DATA 전송 중
    Sending,

    /// BLAST_END 후 MISSING 대기
    AwaitingReport,

    /// 보고된 레코드 재전송 중
    Retransmitting,

    /// 빈 MISSING 수신
    Closed,
}

/// 송신자
pub struct Sender {
    config: Config,
    socket: UdpSocket,
    peer: SocketAddr,
    source: PathBuf,
    params: SessionParams,
    builder: FragmentBuilder,

    /// 재전송용 리더 (처음 필요할 때 열림)
    reader: Option<RecordReader<File>>,

    stats: SenderStats,
    recv_buf: Vec<u8>,
}

impl Sender {
    /// 소켓을 바인드하고 세션 파라미터 준비
    pub async fn bind(
        config: Config,
        bind_addr: SocketAddr,
        peer: SocketAddr,
        source: impl AsRef<Path>,
    ) -> Result<Self> {
        config.validate()?;

        let source = source.as_ref().to_path_buf();
        let file_size = tokio::fs::metadata(&source).await?.len();
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_string();
        let params = SessionParams::new(
            file_name,
            file_size,
            config.record_size as u32,
            config.blast_size as u32,
        )?;

        let socket = UdpSocket::bind(bind_addr).await?;
        info!(
            "Blast sender bound on {} → {} ({}: {} bytes, {} records, {} blasts)",
            socket.local_addr()?,
            peer,
            params.file_name,
            params.file_size,
            params.total_records,
            params.blast_count()
        );

        Ok(Self {
            builder: FragmentBuilder::new(&config),
            stats: SenderStats::new(params.file_name.clone()),
            config,
            socket,
            peer,
            source,
            params,
            reader: None,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// 핸드쉐이크 → 전체 블라스트 전송 → DISCONNECT
    pub async fn run(mut self) -> Result<SenderStats> {
        self.handshake().await?;
        self.transfer().await?;
        self.disconnect().await?;

        let source = self.source.clone();
        match tokio::task::spawn_blocking(move || record::file_crc32(source)).await {
            Ok(Ok(crc)) => {
                self.stats.source_crc32 = Some(crc);
                info!("원본 CRC32: {:08x}", crc);
            }
            Ok(Err(e)) => warn!("원본 CRC32 계산 실패: {}", e),
            Err(e) => warn!("CRC32 태스크 실패: {}", e),
        }

        info!("전송 완료: {}", self.stats.summary());
        Ok(self.stats)
    }

    /// HELLO를 보내고 HELLO_ACK 대기. 제한된 횟수만 재시도
    async fn handshake(&mut self) -> Result<()> {
        let hello = Message::Hello(self.params.clone()).to_bytes();
        let attempts = self.config.max_handshake_retries.max(1);

        for attempt in 1..=attempts {
            self.send(&hello).await?;
            let deadline = Instant::now() + self.config.handshake_timeout();

            while let Some(message) = self.recv_until(deadline).await? {
                if message == Message::HelloAck {
                    info!("핸드쉐이크 완료: {} ({}회 시도)", self.peer, attempt);
                    return Ok(());
                }
                debug!("핸드쉐이크 중 무시: {:?}", message.msg_type());
            }
            debug!("HELLO_ACK 타임아웃 ({}/{})", attempt, attempts);
        }

        warn!("핸드쉐이크 실패: {}", self.peer);
        Err(Error::HandshakeFailed { attempts })
    }

    /// 읽기 태스크가 채운 큐에서 블라스트를 하나씩 꺼내 전송
    async fn transfer(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(self.config.queue_depth);
        let producer = spawn_reader(self.source.clone(), self.params.clone(), tx);

        while let Some(blast) = rx.recv().await {
            self.send_blast(blast).await?;
        }

        // 큐가 닫힘: 읽기 태스크 종료. 읽기 에러는 여기서 전파
        producer.await.map_err(|_| Error::ChannelError)??;
        Ok(())
    }

    async fn send_blast(&mut self, blast: Blast) -> Result<()> {
        let Blast { id, range, records } = blast;
        self.stats.mark_started();
        debug!(
            "블라스트 {} {:?}: 레코드 {}-{}",
            id,
            BlastPhase::Sending,
            range.start,
            range.end
        );

        let fragments = self.builder.build(id, range.ids().zip(records));
        self.send_fragments(fragments).await?;
        self.close_blast(id, range).await?;

        self.stats.blasts_sent += 1;
        debug!("블라스트 {} {:?}", id, BlastPhase::Closed);
        Ok(())
    }

    /// 빈 MISSING을 받을 때까지 BLAST_END → 보고 → 재전송 반복
    async fn close_blast(&mut self, blast_id: BlastId, range: Segment) -> Result<()> {
        let end = Message::BlastEnd(BlastEnd { blast_id, range }).to_bytes();
        let mut rounds = 0u32;

        loop {
            self.send(&end).await?;
            let report = self.await_report(blast_id, &end).await?;
            self.stats.report_round_trips += 1;

            if report.is_complete() {
                return Ok(());
            }

            rounds += 1;
            self.stats.missing_records_reported += report.record_count();
            if let Some(max) = self.config.max_retransmit_rounds {
                if rounds > max {
                    warn!("블라스트 {}: 재전송 라운드 한도 {} 초과", blast_id, max);
                    return Err(Error::RoundsExhausted {
                        blast_id,
                        rounds: max,
                    });
                }
            }

            debug!(
                "블라스트 {} {:?}: round {}, 누락 레코드 {}개 ({} ranges)",
                blast_id,
                BlastPhase::Retransmitting,
                rounds,
                report.record_count(),
                report.ranges.len()
            );
            self.retransmit(blast_id, range, &report.ranges).await?;
        }
    }

    /// 이 블라스트의 MISSING 대기
    ///
    /// 다른 blast_id의 보고는 이전 라운드의 늦은 응답이므로 무시.
    /// 타임아웃마다 BLAST_END를 다시 보내고, 한도를 넘으면 블라스트 중단
    async fn await_report(&mut self, blast_id: BlastId, end: &Bytes) -> Result<MissingReport> {
        let mut resends = 0u32;

        loop {
            let deadline = Instant::now() + self.config.report_timeout();
            while let Some(message) = self.recv_until(deadline).await? {
                match message {
                    Message::Missing(report) if report.blast_id == blast_id => return Ok(report),
                    Message::Missing(report) => {
                        debug!("늦은 MISSING 무시: 블라스트 {}", report.blast_id)
                    }
                    other => debug!("{:?} 대기 중 무시: {:?}", BlastPhase::AwaitingReport, other.msg_type()),
                }
            }

            if resends >= self.config.max_report_retries {
                warn!(
                    "블라스트 {}: MISSING 응답 없음, {}회 재시도 후 중단",
                    blast_id, resends
                );
                return Err(Error::RetryExhausted {
                    blast_id,
                    attempts: resends,
                });
            }

            resends += 1;
            self.stats.blast_end_resends += 1;
            debug!(
                "블라스트 {}: MISSING 타임아웃, BLAST_END 재전송 ({}/{})",
                blast_id, resends, self.config.max_report_retries
            );
            self.send(end).await?;
        }
    }

    /// 보고된 구간을 블라스트 범위로 잘라 다시 읽고 같은 blast_id로 전송
    async fn retransmit(&mut self, blast_id: BlastId, range: Segment, missing: &[Segment]) -> Result<()> {
        let wanted: Vec<Segment> = missing
            .iter()
            .filter_map(|segment| {
                let clipped = segment.intersect(&range);
                if clipped != Some(*segment) {
                    warn!(
                        "블라스트 {}: 범위 밖 누락 구간 {}-{} 잘라냄",
                        blast_id, segment.start, segment.end
                    );
                }
                clipped
            })
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let records = self.reread(wanted).await?;
        let fragments = self.builder.build(blast_id, records);
        self.stats.fragments_retransmitted += fragments.len() as u64;
        self.send_fragments(fragments).await
    }

    /// 블로킹 풀에서 레코드 재읽기. 리더는 다음 라운드를 위해 돌려받음
    async fn reread(&mut self, ranges: Vec<Segment>) -> Result<Vec<(RecordId, Bytes)>> {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => RecordReader::open(&self.source, &self.params)?,
        };

        let (reader, records) = tokio::task::spawn_blocking(move || {
            let records = read_ranges(&mut reader, &ranges);
            (reader, records)
        })
        .await
        .map_err(|_| Error::ChannelError)?;

        self.reader = Some(reader);
        Ok(records?)
    }

    async fn send_fragments(&mut self, fragments: Vec<DataFragment>) -> Result<()> {
        for fragment in fragments {
            let bytes = Message::from(fragment).to_bytes();
            self.send(&bytes).await?;
            self.stats.fragments_sent += 1;
        }
        Ok(())
    }

    /// DISCONNECT는 응답이 없으므로 여러 번 전송
    async fn disconnect(&mut self) -> Result<()> {
        self.stats.mark_finished();
        let bytes = Message::Disconnect.to_bytes();
        for _ in 0..self.config.disconnect_repeats.max(1) {
            self.send(&bytes).await?;
        }
        info!("DISCONNECT 전송: {}", self.peer);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.peer).await?;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// 마감 시각까지 피어의 메시지 하나 수신. 시간이 지나면 None
    ///
    /// 다른 주소에서 온 데이터그램과 잘못된 데이터그램은 버리고 계속 대기
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Message>> {
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("수신 에러 무시: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            if from != self.peer {
                debug!("알 수 없는 주소의 데이터그램 무시: {}", from);
                continue;
            }

            match Message::from_bytes(&self.recv_buf[..len]) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("데이터그램 버림 ({} bytes): {}", len, e),
            }
        }
    }
}

/// 블라스트를 순서대로 읽어 큐에 넣는 블로킹 태스크
///
/// 큐가 가득 차면 전송 루프가 따라올 때까지 대기. 전송 루프가 끝나면 조용히 종료
fn spawn_reader(
    source: PathBuf,
    params: SessionParams,
    tx: mpsc::Sender<Blast>,
) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut reader = RecordReader::open(&source, &params)?;
        for (id, range) in params.blasts() {
            let blast = reader.read_blast(id, range)?;
            debug!("블라스트 {} {:?} 완료", id, BlastPhase::Reading);
            if tx.blocking_send(blast).is_err() {
                debug!("전송 루프 종료, 읽기 중단");
                break;
            }
        }
        Ok(())
    })
}

fn read_ranges(
    reader: &mut RecordReader<File>,
    ranges: &[Segment],
) -> io::Result<Vec<(RecordId, Bytes)>> {
    let mut records = Vec::new();
    for range in ranges {
        let data = reader.read_range(*range)?;
        records.extend(range.ids().zip(data));
    }
    Ok(records)
}

/// 피어 포트가 닫혔을 때 일부 플랫폼이 돌려주는 ICMP 에러
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}
