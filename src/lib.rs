//! # ZTP (Zmodem Transfer Protocol)
//!
//! 터미널 바이트 스트림 위에서 동작하는 sans-I/O ZMODEM 엔진
//!
//! ## 핵심 특징
//! - **Sentry 감지**: 일반 터미널 트래픽을 방해하지 않고 세션 시작 신호 탐지
//! - **3종 헤더 프레이밍**: hex / binary-16-CRC / binary-32-CRC
//! - **ZDLE 이스케이프**: 문맥 의존 이스케이프 오토마톤 (`@` 뒤 규칙 포함)
//! - **송신/수신 상태기계**: ZRINIT→ZFILE→ZDATA→ZEOF→ZFIN 핸드쉐이크
//! - **Sans-I/O**: 코어는 소켓을 열지 않음, "도착한 바이트"를 먹고 "보낼 바이트"를 뱉음
//! - **단일 스레드 협력형**: consume 호출 안에서 모든 파싱과 상태 전이가 동기적으로 완료

pub mod config;
pub mod crc;
pub mod encode;
pub mod error;
pub mod header;
pub mod offer;
pub mod receive;
pub mod send;
pub mod sentry;
pub mod session;
pub mod subpacket;
pub mod zdle;

pub use config::Config;
pub use error::{Error, Result};
pub use header::{CrcWidth, Header};
pub use offer::{FileDetails, FileOffer, ZfileOptions};
pub use receive::ReceiveSession;
pub use send::SendSession;
pub use sentry::{Detection, Sentry};
pub use session::{Frame, Session, SessionEvent, SessionRole};
pub use subpacket::{Subpacket, SubpacketEnd};
pub use zdle::{Zdle, ZdleConfig};

/// ZDLE 이스케이프 마커 (CAN과 동일한 바이트)
pub const ZDLE: u8 = 0x18;

/// ASCII XON (무조건 무시되는 흐름제어 바이트)
pub const XON: u8 = 0x11;

/// ASCII XOFF
pub const XOFF: u8 = 0x13;

/// 헤더 프레임 패딩 문자 `*`
pub const ZPAD: u8 = b'*';

/// 세션 중단 시퀀스 (CAN 5회)
pub const ABORT_SEQUENCE: [u8; 5] = [0x18, 0x18, 0x18, 0x18, 0x18];

/// 세션 종료 마커 "OO" (over-and-out)
pub const OVER_AND_OUT: [u8; 2] = [b'O', b'O'];

/// 서브패킷 최대 페이로드 (공식 1KiB, lrzsz 관례로 8KiB 허용)
pub const MAX_SUBPACKET_SIZE: usize = 8192;
