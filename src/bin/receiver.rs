//! Blast 수신자
//!
//! HELLO로 세션을 받고 블라스트마다 누락 레코드를 보고, DISCONNECT에서 종료
//!
//! 사용법:
//!   cargo run --release --bin blast-receiver -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin blast-receiver -- --bind 0.0.0.0:9000 --output ./recv
//!
//!   # 레코드 10% 손실 시뮬레이션
//!   cargo run --release --bin blast-receiver -- -o ./recv --loss 10

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use blastxfer::{Config, RandomLoss, Receiver, ReceiverStats};

type BoxError = Box<dyn StdError>;

/// 수신자 실행 설정
struct ReceiverArgs {
    bind_addr: SocketAddr,
    output_dir: PathBuf,
    loss_percent: f64,
    seed: Option<u64>,
    csv: bool,
    config: Config,
}

impl Default for ReceiverArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            output_dir: PathBuf::from("."),
            loss_percent: 0.0,
            seed: None,
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

fn parse_args() -> Result<ReceiverArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReceiverArgs::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => {
                parsed.bind_addr = value(&args, i, flag)?;
                i += 1;
            }
            "--output" | "-o" => {
                parsed.output_dir = value(&args, i, flag)?;
                i += 1;
            }
            "--loss" | "-l" => {
                let percent: f64 = value(&args, i, flag)?;
                if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
                    return Err(format!("{} {}: 0 ~ 100 사이 값 필요", flag, percent).into());
                }
                parsed.loss_percent = percent;
                i += 1;
            }
            "--seed" => {
                parsed.seed = Some(value(&args, i, flag)?);
                i += 1;
            }
            "--max-datagram" => {
                parsed.config.max_datagram_size = value(&args, i, flag)?;
                i += 1;
            }
            "--idle-timeout" => {
                let secs: u64 = value(&args, i, flag)?;
                parsed.config.idle_timeout_ms = (secs > 0).then_some(secs * 1000);
                i += 1;
            }
            "--csv" => parsed.csv = true,
            "--help" | "-h" => {
                println!(
                    r#"Blast Receiver - UDP 선택적 재전송 파일 수신자

HELLO로 세션을 열고 출력 디렉터리에 파일을 기록
- 블라스트마다 누락 레코드 구간(MISSING) 보고
- DISCONNECT를 받으면 원래 크기로 자르고 종료

사용법:
  cargo run --release --bin blast-receiver -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:9000)
  -o, --output <DIR>       출력 디렉터리 (기본: .)
  -l, --loss <PERCENT>     레코드 손실 시뮬레이션 비율 0~100 (기본: 0)
  --seed <N>               손실 시뮬레이션 시드 (재현용)
  --max-datagram <BYTES>   MISSING 데이터그램 상한 (기본: 1472)
  --idle-timeout <SECS>    수신 없이 기다릴 최대 시간, 0 = 무제한 (기본: 0)
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

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    tokio::fs::create_dir_all(&args.output_dir).await?;

    info!("Blast receiver starting...");
    info!("Output directory: {}", args.output_dir.display());
    info!("Simulated record loss: {:.1}%", args.loss_percent);

    let loss = match args.seed {
        Some(seed) => RandomLoss::with_seed(args.loss_percent / 100.0, seed),
        None => RandomLoss::from_percent(args.loss_percent),
    };
    let receiver = Receiver::bind(args.config, args.bind_addr, &args.output_dir)
        .await?
        .with_loss(loss);
    let stats = receiver.run().await?;

    println!("{}", stats.summary());
    if args.csv {
        println!("{}", ReceiverStats::CSV_HEADER);
        println!("{}", stats.csv_line());
    }
    Ok(())
}
