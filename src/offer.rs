//! 파일 제안 메타데이터
//!
//! ZFILE 헤더의 옵션 바이트 해석과, ZFILE 데이터 서브패킷에 실리는
//! `이름 NUL 크기 mtime mode serial [남은파일수 [남은바이트수]]` 텍스트
//! 포맷의 직렬화/파싱. mtime과 mode는 8진수, 나머지는 10진수.

use tracing::warn;

use crate::{Error, Result};

/// 전송할 파일 하나의 메타데이터
///
/// 송신측이 제공하면 ZFILE 페이로드로 직렬화되고, 수신측은 같은 포맷을
/// 되읽어 offer 이벤트로 노출한다. `serial`은 이 프로토콜 리비전에서
/// 의미가 없으므로 항상 비워야 한다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDetails {
    /// 파일 이름
    pub name: String,

    /// 파일 크기 (바이트)
    pub size: Option<u64>,

    /// 수정 시각 (unix 초)
    pub mtime: Option<u64>,

    /// 퍼미션 비트 (송신 시 0x8000이 OR됨)
    pub mode: Option<u32>,

    /// 예약 필드, 항상 미설정
    pub serial: Option<u32>,

    /// 이 파일 포함 남은 파일 수
    pub files_remaining: Option<u64>,

    /// 이 파일 포함 남은 바이트 수
    pub bytes_remaining: Option<u64>,
}

impl FileDetails {
    /// 이름과 크기만으로 생성
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size: Some(size),
            ..Default::default()
        }
    }

    /// 송신 전 검증
    ///
    /// 잘못된 필드는 바이트가 하나라도 나가기 전에 거절된다.
    pub fn validate(&self) -> Result<()> {
        if self.serial.is_some() {
            return Err(Error::Validation("\"serial\"은 의미 없는 필드".into()));
        }
        if self.files_remaining == Some(0) {
            return Err(Error::Validation(
                "\"files_remaining\"은 주어진다면 양수여야 함".into(),
            ));
        }
        if looks_like_header(self.name.as_bytes()) {
            warn!(
                name = %self.name,
                "파일 이름에 ZMODEM 헤더처럼 보이는 제어문자가 있음, 세션이 깨질 수 있음"
            );
        }
        Ok(())
    }

    /// ZFILE 서브패킷 페이로드로 직렬화
    pub fn to_payload(&self) -> Vec<u8> {
        let mut pieces = vec![
            self.size.unwrap_or(0).to_string(),
            match self.mtime {
                Some(mtime) => format!("{mtime:o}"),
                None => "0".into(),
            },
            match self.mode {
                Some(mode) => format!("{:o}", 0x8000 | mode),
                None => "0".into(),
            },
            "0".into(), // serial
        ];
        if let Some(files) = self.files_remaining {
            pieces.push(files.to_string());
            if let Some(bytes) = self.bytes_remaining {
                pieces.push(bytes.to_string());
            }
        }

        let mut payload = self.name.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(pieces.join(" ").as_bytes());
        payload
    }

    /// ZFILE 서브패킷 페이로드 파싱
    ///
    /// 숫자 필드는 관대하게 읽는다: 비어 있거나 깨진 필드는 `None`.
    pub fn from_payload(payload: &[u8]) -> Self {
        let (name, rest) = match payload.iter().position(|&b| b == 0) {
            Some(nul) => (&payload[..nul], &payload[nul + 1..]),
            None => (payload, &[][..]),
        };

        let rest = String::from_utf8_lossy(rest);
        let mut fields = rest.split(' ');
        let mut next = |radix: u32| -> Option<u64> {
            fields
                .next()
                .and_then(|f| u64::from_str_radix(f, radix).ok())
        };

        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            size: next(10),
            mtime: next(8),
            mode: next(8).map(|m| m as u32),
            serial: next(10).map(|s| s as u32),
            files_remaining: next(10),
            bytes_remaining: next(10),
        }
    }
}

/// 헤더 프레임 시작처럼 보이는 바이트열인지 (`*\x18A`, `*\x18C`, `**\x18B`)
fn looks_like_header(bytes: &[u8]) -> bool {
    bytes.windows(3).any(|w| {
        w[0] == b'*' && w[1] == 0x18 && (w[2] == b'A' || w[2] == b'C')
    }) || bytes
        .windows(4)
        .any(|w| w == [b'*', b'*', 0x18, b'B'])
}

/// ZFILE 변환 옵션
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Binary,
    Text,
    Resume,
}

/// ZFILE 충돌 관리 옵션
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Management {
    NewerOrLonger,
    Crc,
    Append,
    Clobber,
    Newer,
    MtimeOrLength,
    Protect,
    Rename,
}

/// ZFILE 전송 계층 옵션 (기능 비트만 존재, 실제로 협상하지 않음)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Compress,
    Encrypt,
    Rle,
}

/// ZFILE 헤더 페이로드 4바이트의 옵션 해석
///
/// 바이트 순서: [extended, transport, management, conversion].
/// management 바이트의 0x80은 skip-if-absent 비트, 값은 하위 5비트.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZfileOptions {
    pub sparse: bool,
    pub skip_if_absent: bool,
    pub conversion: Option<Conversion>,
    pub management: Option<Management>,
    pub transport: Option<Transport>,
}

const ZXSPARS: u8 = 0x40;
const ZMSKNOLOC: u8 = 0x80;
const MANAGEMENT_MASK: u8 = 0x1f;

impl ZfileOptions {
    /// ZFILE 페이로드 4바이트 해석
    pub fn from_bytes4(bytes4: [u8; 4]) -> Self {
        Self {
            sparse: bytes4[0] & ZXSPARS != 0,
            skip_if_absent: bytes4[2] & ZMSKNOLOC != 0,
            transport: match bytes4[1] {
                1 => Some(Transport::Compress),
                2 => Some(Transport::Encrypt),
                3 => Some(Transport::Rle),
                _ => None,
            },
            management: match bytes4[2] & MANAGEMENT_MASK {
                1 => Some(Management::NewerOrLonger),
                2 => Some(Management::Crc),
                3 => Some(Management::Append),
                4 => Some(Management::Clobber),
                5 => Some(Management::Newer),
                6 => Some(Management::MtimeOrLength),
                7 => Some(Management::Protect),
                8 => Some(Management::Rename),
                _ => None,
            },
            conversion: match bytes4[3] {
                1 => Some(Conversion::Binary),
                2 => Some(Conversion::Text),
                3 => Some(Conversion::Resume),
                _ => None,
            },
        }
    }
}

/// 수신측에 노출되는 파일 제안 (메타데이터 + ZFILE 옵션)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub details: FileDetails,
    pub options: ZfileOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let details = FileDetails {
            name: "report.txt".into(),
            size: Some(20000),
            mtime: Some(0o17_000_000_000),
            mode: Some(0o644),
            serial: None,
            files_remaining: Some(3),
            bytes_remaining: Some(65536),
        };
        let payload = details.to_payload();
        let parsed = FileDetails::from_payload(&payload);

        assert_eq!(parsed.name, "report.txt");
        assert_eq!(parsed.size, Some(20000));
        assert_eq!(parsed.mtime, Some(0o17_000_000_000));
        // 송신 시 mode에 0x8000이 OR된다
        assert_eq!(parsed.mode, Some(0x8000 | 0o644));
        assert_eq!(parsed.serial, Some(0));
        assert_eq!(parsed.files_remaining, Some(3));
        assert_eq!(parsed.bytes_remaining, Some(65536));
    }

    #[test]
    fn test_payload_wire_format() {
        let details = FileDetails::new("a.bin", 42);
        assert_eq!(details.to_payload(), b"a.bin\x0042 0 0 0");
    }

    #[test]
    fn test_payload_without_optional_tail() {
        let parsed = FileDetails::from_payload(b"x\x00100 0 0 0");
        assert_eq!(parsed.size, Some(100));
        assert_eq!(parsed.files_remaining, None);
        assert_eq!(parsed.bytes_remaining, None);
    }

    #[test]
    fn test_validate_rejects_serial() {
        let details = FileDetails {
            serial: Some(7),
            ..FileDetails::new("f", 1)
        };
        assert!(matches!(details.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_zero_files_remaining() {
        let details = FileDetails {
            files_remaining: Some(0),
            ..FileDetails::new("f", 1)
        };
        assert!(matches!(details.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_zfile_options_decoding() {
        let options = ZfileOptions::from_bytes4([0x40, 2, 0x80 | 4, 1]);
        assert!(options.sparse);
        assert!(options.skip_if_absent);
        assert_eq!(options.transport, Some(Transport::Encrypt));
        assert_eq!(options.management, Some(Management::Clobber));
        assert_eq!(options.conversion, Some(Conversion::Binary));

        let zeroed = ZfileOptions::from_bytes4([0; 4]);
        assert_eq!(zeroed, ZfileOptions::default());
    }
}
