//! SNP 수신 데모
//!
//! UDP로 들어오는 프레임을 PCB에 먹이고 재조립된 페이로드를 보고한다.
//! 상대 주소는 첫 데이터그램에서 학습한다.
//!
//! 사용법:
//!   cargo run --release --bin snp-receiver -- [OPTIONS]

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

/// 수신 데모 설정
struct ReceiverArgs {
    bind_addr: SocketAddr,
    count: u32,
    config: Config,
    verbose: bool,
}

impl Default for ReceiverArgs {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".parse().unwrap(),
            count: 1,
            config: Config::default(),
            verbose: false,
        }
    }
}

fn parse_args() -> ReceiverArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReceiverArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    parsed.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
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
                    r#"SNP Receiver - Segmented Notification Protocol 수신 데모

UDP 데이터그램을 소형 프레임 링크로 사용해 세그먼트를 재조립한다.

사용법:
  cargo run --release --bin snp-receiver -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9100)
  -c, --count <N>         수신 대기 전송 수 (기본: 1)
  --mtu <BYTES>           프레임 MTU, 4~247 (기본: 247)
  --timeout <MS>          NAK 타임아웃 밀리초 (기본: 500)
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

    let pcb = Arc::new(Mutex::new(
        Pcb::with_config(1, Role::Receiver, args.config.clone()).expect("PCB 생성 실패"),
    ));

    info!("SNP Receiver started on {}", args.bind_addr);

    let mut buf = vec![0u8; 65535];
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    let mut peer: Option<SocketAddr> = None;
    let mut remaining = args.count;

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        // 첫 데이터그램에서 상대 주소를 학습해 ACK 경로를 연다
                        if peer != Some(addr) {
                            peer = Some(addr);
                            pcb.lock().set_output(Box::new(UdpSink {
                                socket: socket.clone(),
                                peer: addr,
                            }));
                            info!("송신측 연결: {}", addr);
                        }
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
                    Notify::Delivered(data) => {
                        remaining -= 1;
                        info!("페이로드 수신: {} bytes ({} 남음)", data.len(), remaining);
                        if remaining == 0 {
                            done = true;
                        }
                    }
                    Notify::Failed(reason) => {
                        warn!("수신 실패: {}", reason);
                    }
                    Notify::PeerUnbond => {
                        info!("상대가 연결을 해제함");
                        done = true;
                    }
                    Notify::Completed => {}
                }
            }
        }
        if done {
            break;
        }
    }

    info!("{}", pcb.lock().stats().summary());
}
