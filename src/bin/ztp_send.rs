//! ZTP 송신 데모 - TCP 위 ZMODEM 파일 전송
//!
//! 터미널 트래픽이 섞여 들어올 수 있는 소켓에 ZRQINIT를 쏘고,
//! 상대(ztp-recv 또는 rz류)의 ZRINIT를 sentry로 감지해 파일을 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin ztp-send -- [OPTIONS]
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin ztp-send -- --connect 127.0.0.1:9100 --file data.bin

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ztp::{Detection, FileDetails, Header, Sentry, Session, SessionEvent, SessionRole};

/// 송신 데모 설정
struct SendConfig {
    connect_addr: String,
    file_path: PathBuf,
    offer_name: Option<String>,
}

fn parse_args() -> SendConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut connect_addr = "127.0.0.1:9100".to_string();
    let mut file_path = None;
    let mut offer_name = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--connect" | "-c" => {
                if i + 1 < args.len() {
                    connect_addr = args[i + 1].clone();
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    offer_name = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"ZTP Send - ZMODEM 파일 송신 데모

터미널 바이트 스트림 위에서 ZMODEM 세션을 열고 파일 하나를 보낸다.

사용법:
  cargo run --release --bin ztp-send -- [OPTIONS]

옵션:
  -c, --connect <ADDR>   접속 주소 (기본: 127.0.0.1:9100)
  -f, --file <PATH>      전송할 파일 경로 (필수)
  -n, --name <NAME>      제안에 실을 파일 이름 (기본: 경로의 파일명)
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    SendConfig {
        connect_addr,
        file_path: file_path.expect("--file 경로 필요 (--help 참고)"),
        offer_name,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();
    let data = std::fs::read(&config.file_path)?;
    let offer_name = config.offer_name.clone().unwrap_or_else(|| {
        config
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into())
    });

    info!("ZTP Send starting...");
    info!("Connect: {}", config.connect_addr);
    info!("File: {:?} ({} bytes)", config.file_path, data.len());

    let mut socket = TcpStream::connect(&config.connect_addr).await?;

    // sentry 배선: 터미널 출력은 stdout, 송신 바이트는 큐에 모았다가 flush
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

    // 수신 프로그램 기동 신호
    socket.write_all(&Header::Zrqinit.to_hex()).await?;

    let mut session: Option<Arc<Mutex<Session>>> = None;
    let mut offered = false;
    let mut buf = vec![0u8; 65536];

    loop {
        // 세션 출력 flush
        let queued: Vec<u8> = std::mem::take(&mut *outbound.lock());
        if !queued.is_empty() {
            socket.write_all(&queued).await?;
        }

        tokio::select! {
            read = socket.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    warn!("피어가 연결을 닫음");
                    return Ok(());
                }
                sentry.consume(&buf[..n])?;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if let Some(active) = &session {
                    if let Some(sender) = active.lock().as_send_mut() {
                        sender.tick()?;
                    }
                }
            }
        }

        // 새 감지 확인: 이쪽은 송신 역할만 의미가 있다
        if let Some(detection) = pending.lock().take() {
            if detection.session_role() == SessionRole::Send {
                session = Some(detection.confirm()?);
                info!("수신측 ZRINIT 확인, 세션 시작");
            } else {
                detection.deny();
            }
        }

        let Some(active) = &session else { continue };
        let mut active = active.lock();
        let Some(sender) = active.as_send_mut() else { continue };

        if !offered {
            let mut details = FileDetails::new(offer_name.clone(), data.len() as u64);
            details.files_remaining = Some(1);
            details.bytes_remaining = Some(data.len() as u64);
            sender.send_offer(&details)?;
            offered = true;
        }

        let mut done = false;
        while let Some(event) = sender.poll_event() {
            match event {
                SessionEvent::OfferAccepted { offset } => {
                    info!(offset, "제안 수락됨, 데이터 전송");
                    sender.send_data(&data[offset as usize..])?;
                    sender.end_file(&[])?;
                }
                SessionEvent::OfferSkipped => {
                    warn!("제안 거절됨, 세션 종료");
                    sender.close()?;
                }
                SessionEvent::FileEnd => {
                    info!("파일 전송 완료, 세션 종료");
                    sender.close()?;
                }
                SessionEvent::SessionEnd => {
                    info!("세션 종료");
                    done = true;
                }
                _ => {}
            }
        }
        drop(active);

        if done {
            let queued: Vec<u8> = std::mem::take(&mut *outbound.lock());
            if !queued.is_empty() {
                socket.write_all(&queued).await?;
            }
            return Ok(());
        }
    }
}
