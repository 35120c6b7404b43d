//! 프로토콜 설정

use std::time::Duration;

use crate::MAX_SUBPACKET_SIZE;

/// ZTP 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 서브패킷 최대 페이로드 (바이트)
    ///
    /// 공식 한도는 1KiB지만 lrzsz 관례에 맞춰 8KiB까지 허용
    pub max_subpacket_size: usize,

    /// 파일 전송 사이 유휴 keep-alive (ZSINIT) 간격
    pub keepalive_interval: Duration,

    /// 0x10/0x90 이스케이프 완화 (고속 모드, 일부 피어와 비호환)
    pub turbo_escape: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_subpacket_size: MAX_SUBPACKET_SIZE,
            keepalive_interval: Duration::from_secs(5),
            turbo_escape: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 공식 1KiB 한도를 지키는 보수적 설정 (엄격한 피어용)
    pub fn strict() -> Self {
        Self {
            max_subpacket_size: 1024,
            keepalive_interval: Duration::from_secs(5),
            turbo_escape: false,
        }
    }

    /// 신뢰 가능한 고속 링크용 설정
    pub fn fast_link() -> Self {
        Self {
            max_subpacket_size: MAX_SUBPACKET_SIZE,
            keepalive_interval: Duration::from_secs(10),
            turbo_escape: true,
        }
    }
}
