//! ZMODEM 헤더 코덱
//!
//! 헤더는 타입 번호 하나 + 페이로드 4바이트. 세 가지 와이어 프레이밍:
//! - **hex**: `* * ZDLE 'B'` + ASCII hex(타입+페이로드+CRC16) + CR LF (+XON)
//! - **binary-16**: `* ZDLE 'A'` + ZDLE(타입+페이로드+CRC16)
//! - **binary-32**: `* ZDLE 'C'` + ZDLE(타입+페이로드+CRC32)
//!
//! 파싱은 불변 슬라이스 + 소비 길이 반환 방식: 입력이 부족하면 `None`,
//! 프레임이 손상됐으면 에러.

use crate::crc;
use crate::encode::{octets_to_hex, pack_u32_le, parse_hex_octets, unpack_u32_le};
use crate::offer::ZfileOptions;
use crate::zdle::Zdle;
use crate::{Error, Result, XON, ZDLE, ZPAD};

/// binary-16 프레임 식별 문자
pub const ZBIN: u8 = b'A';

/// hex 프레임 식별 문자
pub const ZHEX: u8 = b'B';

/// binary-32 프레임 식별 문자
pub const ZBIN32: u8 = b'C';

pub(crate) const HEX_HEADER_PREFIX: [u8; 4] = [ZPAD, ZPAD, ZDLE, ZHEX];
pub(crate) const BINARY16_HEADER_PREFIX: [u8; 3] = [ZPAD, ZDLE, ZBIN];
pub(crate) const BINARY32_HEADER_PREFIX: [u8; 3] = [ZPAD, ZDLE, ZBIN32];

const HEX_HEADER_CRLF: [u8; 2] = [0x0d, 0x0a];
const HEX_HEADER_CRLF_XON: [u8; 3] = [0x0d, 0x0a, XON];

/// ZRINIT 기능 플래그
pub mod zrinit_flags {
    /// 전이중 I/O 가능
    pub const CANFDX: u8 = 0x01;
    /// 디스크 I/O와 수신 중첩 가능
    pub const CANOVIO: u8 = 0x02;
    /// BREAK 신호 전송 가능
    pub const CANBRK: u8 = 0x04;
    /// 암호화 협상 가능 (사용하지 않음)
    pub const CANCRY: u8 = 0x08;
    /// LZW 압축 협상 가능 (사용하지 않음)
    pub const CANLZW: u8 = 0x10;
    /// 32비트 CRC 수용 가능
    pub const CANFC32: u8 = 0x20;
    /// 제어문자 이스케이프 요구
    pub const ESCCTL: u8 = 0x40;
    /// 8번째 비트 이스케이프 요구
    pub const ESC8: u8 = 0x80;
}

/// ZSINIT 플래그 (ZRINIT의 상위 2비트와 동일한 의미)
pub mod zsinit_flags {
    pub const ESCCTL: u8 = 0x40;
    pub const ESC8: u8 = 0x80;
}

/// 헤더 뒤에 오는 서브패킷 CRC 폭
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcWidth {
    Crc16,
    Crc32,
}

impl CrcWidth {
    /// CRC 바이트 수
    pub fn len(&self) -> usize {
        match self {
            CrcWidth::Crc16 => 2,
            CrcWidth::Crc32 => 4,
        }
    }
}

/// ZMODEM 헤더 (타입 번호별 닫힌 변형 집합)
///
/// 페이로드가 의미 없는 변형은 0으로 채운 4바이트를 직렬화한다.
/// ZNAK(6)과 13-19번은 파싱 시 미지원 헤더 에러.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Zrqinit,
    Zrinit([u8; 4]),
    Zsinit([u8; 4]),
    Zack([u8; 4]),
    Zfile([u8; 4]),
    Zskip,
    Zabort,
    Zfin,
    Zrpos([u8; 4]),
    Zdata([u8; 4]),
    Zeof([u8; 4]),
    Zferr,
}

impl Header {
    /// ZRINIT 생성 (수신측 기능 광고)
    pub fn zrinit(flags: u8, bufsize: u16) -> Self {
        let [lo, hi] = bufsize.to_le_bytes();
        Header::Zrinit([lo, hi, 0, flags])
    }

    /// ZSINIT 생성 (송신측 이스케이프 요구; attn 시퀀스는 서브패킷으로 따름)
    pub fn zsinit(flags: u8) -> Self {
        Header::Zsinit([0, 0, 0, flags])
    }

    /// 페이로드 없는 ZACK
    pub fn zack() -> Self {
        Header::Zack([0; 4])
    }

    /// 파일 오프셋을 실어 보내는 ZACK
    pub fn zack_with_offset(offset: u32) -> Self {
        Header::Zack(pack_u32_le(offset))
    }

    /// ZRPOS 생성 (해당 오프셋부터 데이터 요청)
    pub fn zrpos(offset: u32) -> Self {
        Header::Zrpos(pack_u32_le(offset))
    }

    /// ZDATA 생성 (이 오프셋부터 데이터 프레임 시작)
    pub fn zdata(offset: u32) -> Self {
        Header::Zdata(pack_u32_le(offset))
    }

    /// ZEOF 생성 (파일 끝 오프셋 보고)
    pub fn zeof(offset: u32) -> Self {
        Header::Zeof(pack_u32_le(offset))
    }

    /// 프로토콜 타입 번호
    pub fn type_number(&self) -> u8 {
        match self {
            Header::Zrqinit => 0,
            Header::Zrinit(_) => 1,
            Header::Zsinit(_) => 2,
            Header::Zack(_) => 3,
            Header::Zfile(_) => 4,
            Header::Zskip => 5,
            Header::Zabort => 7,
            Header::Zfin => 8,
            Header::Zrpos(_) => 9,
            Header::Zdata(_) => 10,
            Header::Zeof(_) => 11,
            // 원본 프로토콜 표 기준 12. 11로 적은 구현도 있으나 ZEOF와
            // 충돌하므로 레지스트리 값을 따른다.
            Header::Zferr => 12,
        }
    }

    /// 헤더 이름
    pub fn name(&self) -> &'static str {
        match self {
            Header::Zrqinit => "ZRQINIT",
            Header::Zrinit(_) => "ZRINIT",
            Header::Zsinit(_) => "ZSINIT",
            Header::Zack(_) => "ZACK",
            Header::Zfile(_) => "ZFILE",
            Header::Zskip => "ZSKIP",
            Header::Zabort => "ZABORT",
            Header::Zfin => "ZFIN",
            Header::Zrpos(_) => "ZRPOS",
            Header::Zdata(_) => "ZDATA",
            Header::Zeof(_) => "ZEOF",
            Header::Zferr => "ZFERR",
        }
    }

    /// 페이로드 4바이트
    pub fn bytes4(&self) -> [u8; 4] {
        match self {
            Header::Zrinit(b)
            | Header::Zsinit(b)
            | Header::Zack(b)
            | Header::Zfile(b)
            | Header::Zrpos(b)
            | Header::Zdata(b)
            | Header::Zeof(b) => *b,
            _ => [0; 4],
        }
    }

    /// 타입 번호와 페이로드에서 헤더 복원
    pub fn from_parts(type_number: u8, bytes4: [u8; 4]) -> Result<Self> {
        let header = match type_number {
            0 => Header::Zrqinit,
            1 => Header::Zrinit(bytes4),
            2 => Header::Zsinit(bytes4),
            3 => Header::Zack(bytes4),
            4 => Header::Zfile(bytes4),
            5 => Header::Zskip,
            7 => Header::Zabort,
            8 => Header::Zfin,
            9 => Header::Zrpos(bytes4),
            10 => Header::Zdata(bytes4),
            11 => Header::Zeof(bytes4),
            12 => Header::Zferr,
            6 => return Err(Error::UnsupportedHeader("ZNAK".into())),
            13 => return Err(Error::UnsupportedHeader("ZCRC".into())),
            14 => return Err(Error::UnsupportedHeader("ZCHALLENGE".into())),
            15 => return Err(Error::UnsupportedHeader("ZCOMPL".into())),
            16 => return Err(Error::UnsupportedHeader("ZCAN".into())),
            17 => return Err(Error::UnsupportedHeader("ZFREECNT".into())),
            18 => return Err(Error::UnsupportedHeader("ZCOMMAND".into())),
            19 => return Err(Error::UnsupportedHeader("ZSTDERR".into())),
            n => return Err(Error::UnsupportedHeader(format!("타입 {n}"))),
        };
        Ok(header)
    }

    // ------------------------------------------------------------------
    // 페이로드 해석

    /// 오프셋 해석 (ZRPOS/ZDATA/ZEOF/ZACK)
    pub fn offset(&self) -> Option<u32> {
        match self {
            Header::Zrpos(b) | Header::Zdata(b) | Header::Zeof(b) | Header::Zack(b) => {
                Some(unpack_u32_le(b))
            }
            _ => None,
        }
    }

    /// ZRINIT가 광고한 버퍼 크기. 0이면 논스톱 I/O 가능 → `None`
    pub fn buffer_size(&self) -> Option<u16> {
        match self {
            Header::Zrinit(b) => match u16::from_le_bytes([b[0], b[1]]) {
                0 => None,
                size => Some(size),
            },
            _ => None,
        }
    }

    fn zrinit_flag(&self, flag: u8) -> bool {
        matches!(self, Header::Zrinit(b) if b[3] & flag != 0)
    }

    /// 전이중 I/O 가능 여부 (ZRINIT)
    pub fn can_full_duplex(&self) -> bool {
        self.zrinit_flag(zrinit_flags::CANFDX)
    }

    /// 수신/디스크 I/O 중첩 가능 여부 (ZRINIT)
    pub fn can_overlap_io(&self) -> bool {
        self.zrinit_flag(zrinit_flags::CANOVIO)
    }

    /// BREAK 전송 가능 여부 (ZRINIT)
    pub fn can_break(&self) -> bool {
        self.zrinit_flag(zrinit_flags::CANBRK)
    }

    /// 32비트 CRC 수용 여부 (ZRINIT)
    pub fn can_fcs_32(&self) -> bool {
        self.zrinit_flag(zrinit_flags::CANFC32)
    }

    /// 제어문자 이스케이프 요구 여부 (ZRINIT/ZSINIT)
    pub fn escape_ctrl_chars(&self) -> bool {
        match self {
            Header::Zrinit(b) | Header::Zsinit(b) => b[3] & zrinit_flags::ESCCTL != 0,
            _ => false,
        }
    }

    /// 8번째 비트 이스케이프 요구 여부 (ZRINIT/ZSINIT)
    ///
    /// lrzsz도 syncterm도 쓰지 않는 미구현 기능. 요구가 오면 거절한다.
    pub fn escape_8th_bit(&self) -> bool {
        match self {
            Header::Zrinit(b) | Header::Zsinit(b) => b[3] & zrinit_flags::ESC8 != 0,
            _ => false,
        }
    }

    /// ZFILE 옵션 바이트 해석
    pub fn zfile_options(&self) -> Option<ZfileOptions> {
        match self {
            Header::Zfile(b) => Some(ZfileOptions::from_bytes4(*b)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // 직렬화

    /// CRC 계산 대상: 타입 번호 + 페이로드 4바이트
    fn crc_input(&self) -> [u8; 5] {
        let b = self.bytes4();
        [self.type_number(), b[0], b[1], b[2], b[3]]
    }

    fn hex_ending(&self) -> &'static [u8] {
        match self {
            // ZACK/ZFERR에는 XON을 붙이지 않는다 (흐름제어 재개 금지)
            Header::Zack(_) | Header::Zferr => &HEX_HEADER_CRLF,
            _ => &HEX_HEADER_CRLF_XON,
        }
    }

    /// hex 프레이밍 직렬화
    pub fn to_hex(&self) -> Vec<u8> {
        let body = self.crc_input();
        let mut to_crc = body.to_vec();
        to_crc.extend_from_slice(&crc::crc16(&body));

        let mut out = HEX_HEADER_PREFIX.to_vec();
        out.extend_from_slice(&octets_to_hex(&to_crc));
        out.extend_from_slice(self.hex_ending());
        out
    }

    /// binary-16 프레이밍 직렬화 (페이로드와 CRC 모두 ZDLE 인코딩)
    pub fn to_binary16(&self, zdle: &mut Zdle) -> Vec<u8> {
        self.to_binary(zdle, &BINARY16_HEADER_PREFIX, |d| crc::crc16(d).to_vec())
    }

    /// binary-32 프레이밍 직렬화
    pub fn to_binary32(&self, zdle: &mut Zdle) -> Vec<u8> {
        self.to_binary(zdle, &BINARY32_HEADER_PREFIX, |d| crc::crc32(d).to_vec())
    }

    fn to_binary(
        &self,
        zdle: &mut Zdle,
        prefix: &[u8],
        crc_fn: impl Fn(&[u8]) -> Vec<u8>,
    ) -> Vec<u8> {
        let body = self.crc_input();
        let mut to_encode = body.to_vec();
        to_encode.extend_from_slice(&crc_fn(&body));

        let mut out = prefix.to_vec();
        out.extend_from_slice(&zdle.encode(&to_encode));
        out
    }

    // ------------------------------------------------------------------
    // 파싱

    /// 다음 인식 가능한 프레임 시작 전까지의 garbage 바이트 수를 반환
    ///
    /// 인식 가능한 프레임 프리픽스를 만나거나, 프리픽스인지 판정하기에
    /// 바이트가 부족하면 그 위치에서 멈춘다 (read 경계에 걸린 프레임
    /// 시작을 버리지 않기 위해). ZPAD가 아예 없으면 전부 garbage.
    pub fn trim_leading_garbage(buf: &[u8]) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            match buf[pos..].iter().position(|&b| b == ZPAD) {
                None => return buf.len(),
                Some(at) => pos += at,
            }

            let rest = &buf[pos..];
            if rest.len() < 2 {
                return pos;
            }

            if rest[1] == ZPAD {
                if rest.len() < HEX_HEADER_PREFIX.len() {
                    if HEX_HEADER_PREFIX.starts_with(rest) {
                        return pos;
                    }
                } else if rest[2] == HEX_HEADER_PREFIX[2] && rest[3] == HEX_HEADER_PREFIX[3] {
                    return pos;
                }
            } else if rest[1] == ZDLE {
                if rest.len() < BINARY16_HEADER_PREFIX.len() {
                    return pos;
                }
                if rest[2] == ZBIN || rest[2] == ZBIN32 {
                    return pos;
                }
            }

            // 이 ZPAD는 프레임 시작이 아니었다
            pos += 1;
        }
        pos
    }

    /// 프리픽스를 보고 hex/binary-16/binary-32 파서로 분기
    ///
    /// 성공 시 (헤더, 후속 서브패킷의 CRC 폭, 소비 바이트 수).
    /// 입력 부족이면 `Ok(None)`. 세 프리픽스 중 무엇도 아닌 3바이트
    /// 이상의 입력은 프로토콜 위반.
    pub fn parse(buf: &[u8]) -> Result<Option<(Header, CrcWidth, usize)>> {
        if buf.len() >= 2 && buf[1] == ZPAD {
            return Ok(Self::parse_hex(buf)?.map(|(h, n)| (h, CrcWidth::Crc16, n)));
        }
        if buf.len() >= 3 && buf[2] == ZBIN {
            return Ok(Self::parse_binary16(buf)?.map(|(h, n)| (h, CrcWidth::Crc16, n)));
        }
        if buf.len() >= 3 && buf[2] == ZBIN32 {
            return Ok(Self::parse_binary32(buf)?.map(|(h, n)| (h, CrcWidth::Crc32, n)));
        }
        if buf.len() < 3 {
            return Ok(None);
        }
        Err(Error::ProtocolViolation(format!(
            "인식할 수 없는 헤더 프레임: {:02x?}",
            &buf[..buf.len().min(8)]
        )))
    }

    /// hex 헤더 파싱
    ///
    /// LF(0x0a, lrzsz는 0x8a도 보냄)가 프레임 시작 12바이트 안에 없으면
    /// 잘못된 헤더. hex 구간은 18바이트, CR이 선행하면 19바이트.
    pub fn parse_hex(buf: &[u8]) -> Result<Option<(Header, usize)>> {
        let lf_pos = buf
            .iter()
            .position(|&b| b == 0x8a)
            .or_else(|| buf.iter().position(|&b| b == 0x0a));

        let Some(lf_pos) = lf_pos else {
            if buf.len() > 11 {
                return Err(Error::MalformedHeader(
                    "12바이트 안에 LF가 없음".into(),
                ));
            }
            return Ok(None);
        };

        let mut hex_section = &buf[..lf_pos];
        let consumed = lf_pos + 1;

        if hex_section.len() == 19 {
            let preceding = hex_section[18];
            if preceding != 0x0d && preceding != 0x8d {
                return Err(Error::MalformedHeader("LF 앞에 CR이 없음".into()));
            }
            hex_section = &hex_section[..18];
        } else if hex_section.len() != 18 {
            return Err(Error::MalformedHeader(format!(
                "LF 앞 바이트 수가 {} (18 또는 19여야 함)",
                hex_section.len()
            )));
        }

        // 프리픽스 4바이트 뒤 14 hex 문자 → 타입 1 + 페이로드 4 + CRC 2
        let octets = parse_hex_octets(&hex_section[4..])?;
        let header = Self::from_crc16_block(&octets)?;
        Ok(Some((header, consumed)))
    }

    fn parse_binary16(buf: &[u8]) -> Result<Option<(Header, usize)>> {
        let Some((decoded, consumed)) = Zdle::splice(buf, BINARY16_HEADER_PREFIX.len(), 7) else {
            return Ok(None);
        };
        Ok(Some((Self::from_crc16_block(&decoded)?, consumed)))
    }

    fn parse_binary32(buf: &[u8]) -> Result<Option<(Header, usize)>> {
        let Some((decoded, consumed)) = Zdle::splice(buf, BINARY32_HEADER_PREFIX.len(), 9) else {
            return Ok(None);
        };
        crc::verify32(&decoded[..5], &decoded[5..])?;
        Ok(Some((
            Self::from_parts(decoded[0], [decoded[1], decoded[2], decoded[3], decoded[4]])?,
            consumed,
        )))
    }

    /// 타입+페이로드+CRC16 7바이트 블록 검증 및 복원
    fn from_crc16_block(decoded: &[u8]) -> Result<Header> {
        crc::verify16(&decoded[..5], &decoded[5..])?;
        Self::from_parts(decoded[0], [decoded[1], decoded[2], decoded[3], decoded[4]])
    }
}
