//! Loopback 통합 테스트: 실제 UDP 소켓으로 송신자와 수신자를 연결하고
//! 출력 파일이 원본과 바이트 단위로 같은지 확인

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use blastxfer::{
    Config, DataFragment, Error, LossModel, Message, MessageType, NoLoss, RandomLoss, Receiver,
    ReceiverStats, Segment, Sender, SenderStats, SessionParams,
};

const TEST_DEADLINE: Duration = Duration::from_secs(30);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn test_config() -> Config {
    Config {
        record_size: 512,
        blast_size: 20,
        report_timeout_ms: 30,
        max_report_retries: 20,
        handshake_timeout_ms: 50,
        max_handshake_retries: 20,
        idle_timeout_ms: Some(5_000),
        ..Config::loopback()
    }
}

/// 알려진 패턴으로 입력 파일 생성
fn write_input(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let path = dir.join("input.bin");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &data).unwrap();
    (path, data)
}

struct Outcome {
    sent: SenderStats,
    received: ReceiverStats,
    input: Vec<u8>,
    output: Vec<u8>,
}

async fn transfer<L: LossModel + 'static>(config: Config, file_size: usize, loss: L) -> Outcome {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, input) = write_input(dir.path(), file_size);
    let out_dir = dir.path().join("out");
    fs::create_dir(&out_dir).unwrap();

    let receiver = Receiver::bind(config.clone(), localhost(), &out_dir)
        .await
        .unwrap()
        .with_loss(loss);
    let recv_addr = receiver.local_addr().unwrap();
    let recv_task = tokio::spawn(receiver.run());

    let sender = Sender::bind(config, localhost(), recv_addr, &input_path)
        .await
        .unwrap();
    let sent = tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung")
        .unwrap();
    let received = tokio::time::timeout(TEST_DEADLINE, recv_task)
        .await
        .expect("receiver hung")
        .unwrap()
        .unwrap();

    let output = fs::read(out_dir.join("input.bin")).unwrap();
    Outcome {
        sent,
        received,
        input,
        output,
    }
}

/// 양방향으로 데이터그램을 무작위로 버리는 중계기
///
/// 첫 번째로 보낸 쪽을 송신자로 기억. DISCONNECT는 항상 통과
async fn spawn_relay(target: SocketAddr, drop_rate: f64, seed: u64) -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind(localhost()).await.unwrap();
    let addr = socket.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut client: Option<SocketAddr> = None;
        let mut buf = vec![0u8; 65_536];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            let to = if from == target {
                match client {
                    Some(client) => client,
                    None => continue,
                }
            } else {
                client = Some(from);
                target
            };
            if buf[0] != MessageType::Disconnect as u8 && rng.gen_bool(drop_rate) {
                continue;
            }
            let _ = socket.send_to(&buf[..len], to).await;
        }
    });
    (addr, handle)
}

#[tokio::test]
async fn loopback_transfer_without_loss() {
    let outcome = transfer(test_config(), 10_000, NoLoss).await;

    assert_eq!(outcome.output, outcome.input);
    // 10000 / 512 → 레코드 20개, 블라스트 1개
    assert_eq!(outcome.received.records_written, 20);
    assert_eq!(outcome.received.records_lost_sim, 0);
    assert_eq!(outcome.received.blasts_received, 1);
    assert_eq!(outcome.sent.blasts_sent, 1);
    assert_eq!(outcome.sent.missing_records_reported, 0);
    assert_eq!(outcome.sent.fragments_retransmitted, 0);
    assert_eq!(outcome.sent.source_crc32, outcome.received.output_crc32);
    assert!(outcome.sent.source_crc32.is_some());
}

#[tokio::test]
async fn loopback_transfer_many_blasts_small_datagrams() {
    let config = Config {
        max_datagram_size: 1_472,
        ..test_config()
    };
    let outcome = transfer(config, 200_003, NoLoss).await;

    assert_eq!(outcome.output, outcome.input);
    // ceil(200003 / 512) = 391 레코드, 20개씩 → 20 블라스트
    assert_eq!(outcome.received.records_written, 391);
    assert_eq!(outcome.sent.blasts_sent, 20);
    assert_eq!(outcome.received.blasts_received, 20);
}

#[tokio::test]
async fn loopback_transfer_with_simulated_loss() {
    let outcome = transfer(test_config(), 100_000, RandomLoss::with_seed(0.3, 7)).await;

    assert_eq!(outcome.output, outcome.input);
    let total_records = (100_000u64 + 511) / 512;
    assert_eq!(outcome.received.records_written, total_records);
    assert!(outcome.received.records_lost_sim > 0);
    assert_eq!(
        outcome.received.records_recovered,
        outcome.received.records_lost_sim
    );
    assert!(outcome.sent.missing_records_reported >= outcome.received.records_lost_sim);
    assert!(outcome.sent.fragments_retransmitted > 0);
    assert_eq!(outcome.sent.source_crc32, outcome.received.output_crc32);
}

#[tokio::test]
async fn loopback_transfer_with_unbounded_rounds() {
    let config = Config {
        max_retransmit_rounds: None,
        ..test_config()
    };
    let outcome = transfer(config, 50_000, RandomLoss::with_seed(0.3, 11)).await;

    assert_eq!(outcome.output, outcome.input);
    assert_eq!(outcome.received.records_written, (50_000u64 + 511) / 512);
    assert!(outcome.received.records_lost_sim > 0);
    assert_eq!(
        outcome.received.records_recovered,
        outcome.received.records_lost_sim
    );
}

#[tokio::test]
async fn loopback_transfer_empty_file() {
    let outcome = transfer(test_config(), 0, NoLoss).await;

    assert!(outcome.output.is_empty());
    assert_eq!(outcome.sent.blasts_sent, 0);
    assert_eq!(outcome.received.records_written, 0);
}

#[tokio::test]
async fn transfer_through_lossy_relay() {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, input) = write_input(dir.path(), 60_000);
    let out_dir = dir.path().join("out");
    fs::create_dir(&out_dir).unwrap();

    let config = Config {
        max_datagram_size: 1_472,
        max_report_retries: 50,
        ..test_config()
    };

    let receiver = Receiver::bind(config.clone(), localhost(), &out_dir)
        .await
        .unwrap();
    let recv_addr = receiver.local_addr().unwrap();
    let recv_task = tokio::spawn(receiver.run());
    let (relay_addr, relay) = spawn_relay(recv_addr, 0.1, 42).await;

    let sender = Sender::bind(config, localhost(), relay_addr, &input_path)
        .await
        .unwrap();
    let sent = tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung")
        .unwrap();
    let received = tokio::time::timeout(TEST_DEADLINE, recv_task)
        .await
        .expect("receiver hung")
        .unwrap()
        .unwrap();
    relay.abort();

    assert_eq!(fs::read(out_dir.join("input.bin")).unwrap(), input);
    assert_eq!(received.records_written, (60_000u64 + 511) / 512);
    assert_eq!(received.records_lost_sim, 0);
    assert!(sent.fragments_sent > 0);
}

#[tokio::test]
async fn sender_gives_up_when_reports_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, _) = write_input(dir.path(), 5_000);

    // HELLO에만 응답하고 그 뒤로는 침묵하는 피어
    let fake = UdpSocket::bind(localhost()).await.unwrap();
    let fake_addr = fake.local_addr().unwrap();
    let fake_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            let Ok((len, from)) = fake.recv_from(&mut buf).await else {
                continue;
            };
            if let Ok(Message::Hello(_)) = Message::from_bytes(&buf[..len]) {
                let _ = fake.send_to(&Message::HelloAck.to_bytes(), from).await;
            }
        }
    });

    let config = Config {
        report_timeout_ms: 20,
        max_report_retries: 3,
        ..test_config()
    };
    let sender = Sender::bind(config, localhost(), fake_addr, &input_path)
        .await
        .unwrap();
    let result = tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung");
    fake_task.abort();

    assert!(matches!(
        result,
        Err(Error::RetryExhausted {
            blast_id: 0,
            attempts: 3
        })
    ));
}

#[tokio::test]
async fn sender_handshake_fails_against_silent_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, _) = write_input(dir.path(), 1_000);
    let silent = UdpSocket::bind(localhost()).await.unwrap();

    let config = Config {
        handshake_timeout_ms: 10,
        max_handshake_retries: 4,
        ..test_config()
    };
    let sender = Sender::bind(config, localhost(), silent.local_addr().unwrap(), &input_path)
        .await
        .unwrap();
    let result = tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung");

    assert!(matches!(result, Err(Error::HandshakeFailed { attempts: 4 })));
}

#[tokio::test]
async fn receiver_survives_malformed_datagrams() {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, input) = write_input(dir.path(), 8_000);
    let out_dir = dir.path().join("out");
    fs::create_dir(&out_dir).unwrap();

    let receiver = Receiver::bind(test_config(), localhost(), &out_dir)
        .await
        .unwrap();
    let recv_addr = receiver.local_addr().unwrap();
    let recv_task = tokio::spawn(receiver.run());

    // 알 수 없는 태그, 잘린 HELLO, 개수가 부풀려진 MISSING
    let noise = UdpSocket::bind(localhost()).await.unwrap();
    for garbage in [
        vec![0xFF, 0x01, 0x02],
        vec![MessageType::Hello as u8, 0, 0],
        vec![MessageType::Missing as u8, 0, 0, 0, 1, 0xFF, 0xFF],
        Vec::new(),
    ] {
        noise.send_to(&garbage, recv_addr).await.unwrap();
    }

    let sender = Sender::bind(test_config(), localhost(), recv_addr, &input_path)
        .await
        .unwrap();
    tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung")
        .unwrap();
    let received = tokio::time::timeout(TEST_DEADLINE, recv_task)
        .await
        .expect("receiver hung")
        .unwrap()
        .unwrap();

    assert_eq!(fs::read(out_dir.join("input.bin")).unwrap(), input);
    assert_eq!(received.records_written, (8_000u64 + 511) / 512);
}

#[tokio::test]
async fn receiver_idle_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        idle_timeout_ms: Some(50),
        ..test_config()
    };
    let receiver = Receiver::bind(config, localhost(), dir.path()).await.unwrap();

    let result = tokio::time::timeout(TEST_DEADLINE, receiver.run())
        .await
        .expect("receiver hung");
    assert!(matches!(result, Err(Error::Timeout { .. })));
}

#[tokio::test]
async fn receiver_rejects_overflowing_hello() {
    let dir = tempfile::tempdir().unwrap();
    let (input_path, input) = write_input(dir.path(), 6_000);
    let out_dir = dir.path().join("out");
    fs::create_dir(&out_dir).unwrap();

    let receiver = Receiver::bind(test_config(), localhost(), &out_dir)
        .await
        .unwrap();
    let recv_addr = receiver.local_addr().unwrap();
    let recv_task = tokio::spawn(receiver.run());

    // file_size가 u64::MAX 근처인 HELLO (레코드 수 계산이 넘치는 값)
    let hello = Message::Hello(SessionParams {
        file_name: "x".into(),
        file_size: u64::MAX,
        record_size: 512,
        total_records: 0,
        blast_size: 20,
    });
    let attacker = UdpSocket::bind(localhost()).await.unwrap();
    attacker.send_to(&hello.to_bytes(), recv_addr).await.unwrap();

    // HELLO_ACK 없음
    let mut buf = vec![0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(200), attacker.recv_from(&mut buf)).await;
    assert!(reply.is_err());
    assert!(!recv_task.is_finished());

    // 수신 루프는 계속 동작
    let sender = Sender::bind(test_config(), localhost(), recv_addr, &input_path)
        .await
        .unwrap();
    tokio::time::timeout(TEST_DEADLINE, sender.run())
        .await
        .expect("sender hung")
        .unwrap();
    tokio::time::timeout(TEST_DEADLINE, recv_task)
        .await
        .expect("receiver hung")
        .unwrap()
        .unwrap();

    assert_eq!(fs::read(out_dir.join("input.bin")).unwrap(), input);
    assert!(!out_dir.join("x").exists());
}

#[tokio::test]
async fn receiver_counts_protocol_violations_as_stale() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::bind(test_config(), localhost(), dir.path())
        .await
        .unwrap();
    let recv_addr = receiver.local_addr().unwrap();
    let recv_task = tokio::spawn(receiver.run());

    // 테스트 소켓이 직접 송신자 역할
    let peer = UdpSocket::bind(localhost()).await.unwrap();
    let params = SessionParams::new("manual.bin", 1_000, 100, 5).unwrap();
    peer.send_to(&Message::Hello(params).to_bytes(), recv_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 64];
    let (len, _) = tokio::time::timeout(TEST_DEADLINE, peer.recv_from(&mut buf))
        .await
        .expect("no HELLO_ACK")
        .unwrap();
    assert_eq!(Message::from_bytes(&buf[..len]).unwrap(), Message::HelloAck);

    // 존재하지 않는 블라스트 7의 DATA (블라스트는 0, 1뿐)
    let stray = Message::Data(DataFragment {
        blast_id: 7,
        fragment_index: 0,
        fragment_count: 1,
        segments: vec![Segment::single(35)],
        payload: Bytes::from(vec![0u8; 100]),
    });
    peer.send_to(&stray.to_bytes(), recv_addr).await.unwrap();
    peer.send_to(&[0xFF], recv_addr).await.unwrap();
    peer.send_to(&Message::Disconnect.to_bytes(), recv_addr)
        .await
        .unwrap();

    let stats = tokio::time::timeout(TEST_DEADLINE, recv_task)
        .await
        .expect("receiver hung")
        .unwrap()
        .unwrap();
    assert_eq!(stats.stale_fragments, 1);
    assert_eq!(stats.malformed_datagrams, 1);
    assert_eq!(stats.records_written, 0);
}
