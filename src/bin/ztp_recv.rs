//! ZTP 수신 데모 - TCP 위 ZMODEM 파일 수신
//!
//! 연결을 하나 받아 일반 트래픽은 stdout으로 흘리고, ZRQINIT가
//! 감지되면 세션을 열어 제안되는 파일들을 전부 받아 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin ztp-recv -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin ztp-recv -- --listen 0.0.0.0:9100 --output ./incoming

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ztp::{Detection, Sentry, SessionEvent, SessionRole};

/// 수신 데모 설정
struct RecvConfig {
    listen_addr: String,
    output_dir: PathBuf,
}

fn parse_args() -> RecvConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RecvConfig {
        listen_addr: "0.0.0.0:9100".to_string(),
        output_dir: PathBuf::from("."),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    config.listen_addr = args[i + 1].clone();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"ZTP Recv - ZMODEM 파일 수신 데모

터미널 트래픽 사이에서 ZMODEM 세션 시작을 감지해 파일을 받는다.

사용법:
  cargo run --release --bin ztp-recv -- [OPTIONS]

옵션:
  -l, --listen <ADDR>    수신 대기 주소 (기본: 0.0.0.0:9100)
  -o, --output <DIR>     저장 디렉터리 (기본: 현재 디렉터리)
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 경로 조작을 막기 위해 파일명만 남긴다
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "received.bin".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();
    std::fs::create_dir_all(&config.output_dir)?;

    info!("ZTP Recv starting...");
    info!("Listen: {}", config.listen_addr);
    info!("Output dir: {:?}", config.output_dir);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let (mut socket, peer) = listener.accept().await?;
    info!("연결 수락: {}", peer);

    let outbound: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let pending: Arc<Mutex<Option<Detection>>> = Arc::new(Mutex::new(None));

    let outbound_sink = outbound.clone();
    let pending_sink = pending.clone();
    let mut sentry = Sentry::new(
        |bytes| {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(bytes);
            let _ = stdout.flush();
        },
        move |bytes| outbound_sink.lock().extend_from_slice(bytes),
        move |detection| *pending_sink.lock() = Some(detection),
        || warn!("감지 철회됨"),
    );

    let mut session = None;
    let mut current_name: Option<String> = None;
    let mut spool: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let queued: Vec<u8> = std::mem::take(&mut *outbound.lock());
        if !queued.is_empty() {
            socket.write_all(&queued).await?;
        }

        let n = socket.read(&mut buf).await?;
        if n == 0 {
            info!("피어가 연결을 닫음");
            return Ok(());
        }
        sentry.consume(&buf[..n])?;

        // 새 감지: 이쪽은 수신 역할만 받는다
        if let Some(detection) = pending.lock().take() {
            if detection.session_role() == SessionRole::Receive {
                let confirmed = detection.confirm()?;
                confirmed
                    .lock()
                    .as_receive_mut()
                    .expect("receive 세션이어야 함")
                    .start()?;
                session = Some(confirmed);
                info!("ZMODEM 세션 시작, 제안 대기");
            } else {
                detection.deny();
            }
        }

        let Some(active) = &session else { continue };
        let mut done = false;
        {
            let mut active = active.lock();
            let Some(receiver) = active.as_receive_mut() else {
                continue;
            };

            while let Some(event) = receiver.poll_event() {
                match event {
                    SessionEvent::Offer(offer) => {
                        let name = sanitize_name(&offer.details.name);
                        info!(
                            name = %name,
                            size = ?offer.details.size,
                            "파일 제안 수신, 수락"
                        );
                        current_name = Some(name);
                        spool.clear();
                        receiver.accept(0)?;
                    }
                    SessionEvent::DataIn(payload) => {
                        spool.extend_from_slice(&payload);
                    }
                    SessionEvent::FileEnd => {
                        let name = current_name.take().unwrap_or_else(|| "received.bin".into());
                        let path = config.output_dir.join(&name);
                        std::fs::write(&path, &spool)?;
                        info!("저장 완료: {:?} ({} bytes)", path, spool.len());
                        spool.clear();
                    }
                    SessionEvent::SessionEnd => {
                        info!("세션 종료");
                        done = true;
                    }
                    _ => {}
                }
            }
        }

        if done {
            // 종료 마커 뒤 트래픽은 sentry가 이미 터미널로 돌려보냈다
            let queued: Vec<u8> = std::mem::take(&mut *outbound.lock());
            if !queued.is_empty() {
                socket.write_all(&queued).await?;
            }
            return Ok(());
        }
    }
}
