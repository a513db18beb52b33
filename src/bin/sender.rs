//! Blast 송신자
//!
//! 파일을 레코드/블라스트로 나눠 UDP로 전송, MISSING 보고에 따라 선택적 재전송
//!
//! 사용법:
//!   cargo run --release --bin blast-sender -- --peer <ADDR> --file <PATH> [OPTIONS]
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin blast-sender -- -p 127.0.0.1:9000 -f data.bin
//!
//!   # 큰 블라스트, 로컬 루프백 설정
//!   cargo run --release --bin blast-sender -- -p 127.0.0.1:9000 -f data.bin --loopback --blast-size 2000

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use blastxfer::record::total_records;
use blastxfer::{Config, Sender, SenderStats};

type BoxError = Box<dyn StdError>;

/// 송신자 실행 설정
struct SenderArgs {
    bind_addr: SocketAddr,
    peer: SocketAddr,
    file_path: Option<PathBuf>,
    auto_blast: bool,
    csv: bool,
    config: Config,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer: SocketAddr::from(([127, 0, 0, 1], 9000)),
            file_path: None,
            auto_blast: false,
            csv: false,
            config: Config::default(),
        }
    }
}

fn value<T>(args: &[String], i: usize, flag: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: StdError + 'static,
{
    let raw = args
        .get(i + 1)
        .ok_or_else(|| format!("{} 값 필요", flag))?;
    raw.parse::<T>()
        .map_err(|e| format!("{} {}: {}", flag, raw, e).into())
}

fn parse_args() -> Result<SenderArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => {
                parsed.bind_addr = value(&args, i, flag)?;
                i += 1;
            }
            "--peer" | "-p" => {
                parsed.peer = value(&args, i, flag)?;
                i += 1;
            }
            "--file" | "-f" => {
                parsed.file_path = Some(value(&args, i, flag)?);
                i += 1;
            }
            "--loopback" => {
                parsed.config = Config {
                    record_size: parsed.config.record_size,
                    blast_size: parsed.config.blast_size,
                    ..Config::loopback()
                };
            }
            "--lossy" => {
                parsed.config = Config {
                    record_size: parsed.config.record_size,
                    blast_size: parsed.config.blast_size,
                    ..Config::lossy_link()
                };
            }
            "--record-size" => {
                parsed.config.record_size = value(&args, i, flag)?;
                i += 1;
            }
            "--blast-size" => {
                parsed.config.blast_size = value(&args, i, flag)?;
                i += 1;
            }
            "--auto-blast" => parsed.auto_blast = true,
            "--max-datagram" => {
                parsed.config.max_datagram_size = value(&args, i, flag)?;
                i += 1;
            }
            "--report-timeout" => {
                parsed.config.report_timeout_ms = value(&args, i, flag)?;
                i += 1;
            }
            "--max-retries" => {
                parsed.config.max_report_retries = value(&args, i, flag)?;
                i += 1;
            }
            "--max-rounds" => {
                let rounds: u32 = value(&args, i, flag)?;
                parsed.config.max_retransmit_rounds = (rounds > 0).then_some(rounds);
                i += 1;
            }
            "--csv" => parsed.csv = true,
            "--help" | "-h" => {
                println!(
                    r#"Blast Sender - UDP 선택적 재전송 파일 송신자

파일을 고정 크기 레코드로 자르고 M개씩 블라스트로 묶어 전송
- 블라스트마다 BLAST_END 후 MISSING 보고 대기
- 보고된 레코드만 다시 읽어 재전송, 빈 보고가 오면 다음 블라스트

사용법:
  cargo run --release --bin blast-sender -- --peer <ADDR> --file <PATH> [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:0)
  -p, --peer <ADDR>        수신자 주소 (기본: 127.0.0.1:9000)
  -f, --file <PATH>        전송할 파일 (필수)
  --record-size <BYTES>    레코드 크기 (기본: 512)
  --blast-size <N>         블라스트당 레코드 수 (기본: 200)
  --auto-blast             파일 크기로 블라스트 크기 선택 (200 ~ 10000)
  --max-datagram <BYTES>   데이터그램 상한 (기본: 1472)
  --report-timeout <MS>    MISSING 대기 타임아웃 (기본: 200)
  --max-retries <N>        응답 없을 때 BLAST_END 재전송 한도 (기본: 10)
  --max-rounds <N>         블라스트당 재전송 라운드 한도, 0 = 무제한 (기본: 100)
  --loopback               로컬 루프백 설정 (큰 데이터그램, 짧은 타임아웃)
  --lossy                  손실이 큰 링크용 설정
  --csv                    마지막에 CSV 헤더와 요약 줄 출력
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other).into()),
        }
        i += 1;
    }

    Ok(parsed)
}

fn print_csv(stats: &SenderStats) {
    println!("{}", SenderStats::CSV_HEADER);
    println!("{}", stats.csv_line());
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = parse_args()?;
    let file_path = args.file_path.take().ok_or("--file 필요 (--help 참고)")?;

    args.config.validate()?;
    if args.auto_blast {
        let file_size = std::fs::metadata(&file_path)?.len();
        let records = total_records(file_size, args.config.record_size as u32);
        args.config.blast_size = args.config.fit_blast_size(records);
    }

    info!("Blast sender starting...");
    info!("Record size: {} bytes", args.config.record_size);
    info!("Blast size: {} records", args.config.blast_size);
    info!("Max datagram: {} bytes", args.config.max_datagram_size);
    info!(
        "Records per fragment (worst case): {}",
        args.config.records_per_fragment()
    );

    let sender = Sender::bind(args.config, args.bind_addr, args.peer, &file_path).await?;
    let stats = sender.run().await?;

    println!("{}", stats.summary());
    if args.csv {
        print_csv(&stats);
    }
    Ok(())
}
