//! SNP 송신 데모
//!
//! UDP 데이터그램 하나를 소형 프레임 알림 하나로 취급해 PCB를 구동한다.
//!
//! 사용법:
//!   cargo run --release --bin snp-sender -- [OPTIONS]
//!
//! 예시:
//!   # 4KB 페이로드 1회 전송
//!   cargo run --release --bin snp-sender -- --peer 127.0.0.1:9100 --size 4096
//!
//!   # 작은 MTU로 10회 반복
//!   cargo run --release --bin snp-sender -- --peer 127.0.0.1:9100 --mtu 32 --count 10

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use snp::link::FrameSink;
use snp::{diag, Config, Notify, Pcb, Role, TransportError};

/// UDP 소켓을 FrameSink로 노출
struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl FrameSink for UdpSink {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.socket
            .try_send_to(frame, self.peer)
            .map(|_| ())
            .map_err(TransportError::Io)
    }
}

/// 송신 데모 설정
struct SenderArgs {
    bind_addr: SocketAddr,
    peer_addr: SocketAddr,
    size: usize,
    count: u32,
    config: Config,
    verbose: bool,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9101".parse().unwrap(),
            peer_addr: "127.0.0.1:9100".parse().unwrap(),
            size: 4096,
            count: 1,
            config: Config::default(),
            verbose: false,
        }
    }
}

fn parse_args() -> SenderArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    parsed.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    parsed.peer_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    parsed.size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    parsed.count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    parsed.config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    parsed.config.timeout_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--nak-loops" => {
                if i + 1 < args.len() {
                    parsed.config.max_nak_loops = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                parsed.verbose = true;
                parsed.config.log_mask = diag::ALL;
            }
            "--help" | "-h" => {
                println!(
                    r#"SNP Sender - Segmented Notification Protocol 송신 데모

UDP 데이터그램을 소형 프레임 링크로 사용해 세그먼트 전송을 수행한다.

사용법:
  cargo run --release --bin snp-sender -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9101)
  -p, --peer <ADDR>       수신측 주소 (기본: 127.0.0.1:9100)
  -s, --size <BYTES>      전송 페이로드 크기 (기본: 4096)
  -c, --count <N>         전송 반복 횟수 (기본: 1)
  --mtu <BYTES>           프레임 MTU, 4~247 (기본: 247)
  --timeout <MS>          ACK 대기 타임아웃 밀리초 (기본: 500)
  --nak-loops <N>         NAK 라운드 상한 (기본: 6)
  -v, --verbose           진단 로그 전체 활성화
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    parsed
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("로그 초기화 실패");

    let socket = Arc::new(
        UdpSocket::bind(args.bind_addr)
            .await
            .expect("소켓 바인딩 실패"),
    );

    let mut pcb = Pcb::with_config(1, Role::Sender, args.config.clone()).expect("PCB 생성 실패");
    pcb.set_output(Box::new(UdpSink {
        socket: socket.clone(),
        peer: args.peer_addr,
    }));
    let pcb = Arc::new(Mutex::new(pcb));

    // 테스트 페이로드 생성
    let payload: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();

    info!(
        "SNP Sender started on {}, peer: {}, {} bytes x {}",
        args.bind_addr, args.peer_addr, args.size, args.count
    );
    pcb.lock().send(&payload).expect("전송 시작 실패");

    let mut buf = vec![0u8; 65535];
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    let mut remaining = args.count;

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, _addr)) => {
                        if let Err(e) = pcb.lock().input(&buf[..len]) {
                            warn!("입력 처리 에러: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("수신 에러: {}", e);
                    }
                }
            }
            _ = tick.tick() => {
                if let Err(e) = pcb.lock().update() {
                    warn!("update 에러: {}", e);
                }
            }
        }

        // 통지 처리
        let mut done = false;
        {
            let mut pcb = pcb.lock();
            while let Some(notify) = pcb.poll_notify() {
                match notify {
                    Notify::Completed => {
                        remaining -= 1;
                        info!("전송 완료 ({} 남음)", remaining);
                        if remaining == 0 {
                            done = true;
                        } else if let Err(e) = pcb.send(&payload) {
                            warn!("전송 시작 실패: {}", e);
                            done = true;
                        }
                    }
                    Notify::Failed(reason) => {
                        warn!("전송 실패: {}", reason);
                        done = true;
                    }
                    Notify::PeerUnbond => {
                        info!("상대가 연결을 해제함");
                        done = true;
                    }
                    Notify::Delivered(_) => {}
                }
            }
        }
        if done {
            break;
        }
    }

    info!("{}", pcb.lock().stats().summary());
}
