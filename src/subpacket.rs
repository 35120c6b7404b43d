//! 데이터 서브패킷 코덱
//!
//! 서브패킷 = ZDLE(페이로드) + `ZDLE` + 종결 바이트 + ZDLE(CRC).
//! CRC는 페이로드+종결 바이트에 대해 계산하며 세션이 협상한 폭(16/32)을
//! 따른다. 종결 바이트 4종이 프레임 종료 여부와 ACK 요청 여부를 나타낸다.

use crate::crc;
use crate::header::CrcWidth;
use crate::zdle::Zdle;
use crate::{Result, ZDLE};

/// 서브패킷 종결 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpacketEnd {
    /// ZCRCE: 프레임 종료, ACK 없음 (다음은 헤더)
    EndNoAck,
    /// ZCRCG: 프레임 계속, ACK 없음 (스트리밍 기본)
    NoEndNoAck,
    /// ZCRCQ: 프레임 계속, ACK 요청
    NoEndAck,
    /// ZCRCW: 프레임 종료, ACK 요청
    EndAck,
}

impl SubpacketEnd {
    /// 와이어 종결 바이트
    pub fn byte(&self) -> u8 {
        match self {
            SubpacketEnd::EndNoAck => 0x68,
            SubpacketEnd::NoEndNoAck => 0x69,
            SubpacketEnd::NoEndAck => 0x6a,
            SubpacketEnd::EndAck => 0x6b,
        }
    }

    /// 종결 바이트 해석, 미정의 값이면 `None`
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x68 => Some(SubpacketEnd::EndNoAck),
            0x69 => Some(SubpacketEnd::NoEndNoAck),
            0x6a => Some(SubpacketEnd::NoEndAck),
            0x6b => Some(SubpacketEnd::EndAck),
            _ => None,
        }
    }

    /// 이 서브패킷으로 데이터 프레임이 끝나는지
    pub fn is_frame_end(&self) -> bool {
        matches!(self, SubpacketEnd::EndNoAck | SubpacketEnd::EndAck)
    }

    /// 수신측의 ACK(ZACK)를 요구하는지
    pub fn ack_expected(&self) -> bool {
        matches!(self, SubpacketEnd::NoEndAck | SubpacketEnd::EndAck)
    }
}

/// 데이터 서브패킷 (페이로드 + 종결 종류)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpacket {
    pub payload: Vec<u8>,
    pub end: SubpacketEnd,
}

impl Subpacket {
    /// 새 서브패킷 생성
    pub fn new(payload: Vec<u8>, end: SubpacketEnd) -> Self {
        Self { payload, end }
    }

    /// 서브패킷 직렬화
    ///
    /// 인코더의 `@` 뒤 문맥이 페이로드에서 CRC 구간으로 이어진다.
    /// ZDLE 마커와 종결 바이트 자체는 인코더 상태를 건드리지 않는다.
    pub fn encode(&self, zdle: &mut Zdle, width: CrcWidth) -> Vec<u8> {
        let mut crc_input = self.payload.clone();
        crc_input.push(self.end.byte());

        let mut out = zdle.encode(&self.payload);
        out.push(ZDLE);
        out.push(self.end.byte());
        match width {
            CrcWidth::Crc16 => out.extend_from_slice(&zdle.encode(&crc::crc16(&crc_input))),
            CrcWidth::Crc32 => out.extend_from_slice(&zdle.encode(&crc::crc32(&crc_input))),
        }
        out
    }

    /// 원시 버퍼에서 서브패킷 하나 파싱
    ///
    /// `ZDLE` + 종결 바이트를 스캔해서 페이로드 경계를 찾고, 뒤따르는
    /// CRC를 splice한 뒤 검증한다. 종결 마커가 아직 없거나 CRC 바이트가
    /// 부족하면 `Ok(None)` — 입력은 건드리지 않으므로 복원이 필요 없다.
    pub fn parse(buf: &[u8], width: CrcWidth) -> Result<Option<(Subpacket, usize)>> {
        let mut search_from = 0;
        let (zdle_at, end) = loop {
            let Some(at) = buf[search_from..]
                .iter()
                .position(|&b| b == ZDLE)
                .map(|p| search_from + p)
            else {
                return Ok(None);
            };
            if at + 1 >= buf.len() {
                return Ok(None);
            }
            if let Some(end) = SubpacketEnd::from_byte(buf[at + 1]) {
                break (at, end);
            }
            search_from = at + 1;
        };

        // 종결 마커 뒤의 CRC (원시 기준 ZDLE+종결 2바이트 건너뜀)
        let Some((crc_bytes, crc_consumed)) =
            Zdle::splice(&buf[zdle_at..], 2, width.len())
        else {
            return Ok(None);
        };

        let payload = Zdle::decode(&buf[..zdle_at]);

        let mut crc_input = payload.clone();
        crc_input.push(end.byte());
        match width {
            CrcWidth::Crc16 => crc::verify16(&crc_input, &crc_bytes)?,
            CrcWidth::Crc32 => crc::verify32(&crc_input, &crc_bytes)?,
        }

        Ok(Some((Subpacket::new(payload, end), zdle_at + crc_consumed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zdle::ZdleConfig;

    fn escaping_encoder() -> Zdle {
        Zdle::new(ZdleConfig {
            escape_ctrl_chars: true,
            turbo_escape: false,
        })
    }

    #[test]
    fn test_encode_parse_round_trip_16() {
        // 이스케이프 대상 바이트가 잔뜩 섞인 페이로드
        let payload: Vec<u8> = (0u8..=255).collect();
        let subpacket = Subpacket::new(payload.clone(), SubpacketEnd::NoEndNoAck);

        let wire = subpacket.encode(&mut escaping_encoder(), CrcWidth::Crc16);
        let (parsed, consumed) = Subpacket::parse(&wire, CrcWidth::Crc16).unwrap().unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.end, SubpacketEnd::NoEndNoAck);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_encode_parse_round_trip_32() {
        let subpacket = Subpacket::new(b"file data".to_vec(), SubpacketEnd::EndAck);
        let wire = subpacket.encode(&mut escaping_encoder(), CrcWidth::Crc32);
        let (parsed, _) = Subpacket::parse(&wire, CrcWidth::Crc32).unwrap().unwrap();
        assert_eq!(parsed, subpacket);
    }

    #[test]
    fn test_empty_payload() {
        let subpacket = Subpacket::new(vec![], SubpacketEnd::EndNoAck);
        let wire = subpacket.encode(&mut escaping_encoder(), CrcWidth::Crc16);
        let (parsed, consumed) = Subpacket::parse(&wire, CrcWidth::Crc16).unwrap().unwrap();
        assert!(parsed.payload.is_empty());
        assert!(parsed.end.is_frame_end());
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_parse_incomplete_returns_none() {
        let subpacket = Subpacket::new(b"abc".to_vec(), SubpacketEnd::NoEndAck);
        let wire = subpacket.encode(&mut escaping_encoder(), CrcWidth::Crc16);

        // 종결 마커 없음
        assert!(Subpacket::parse(&wire[..3], CrcWidth::Crc16)
            .unwrap()
            .is_none());
        // 종결 마커는 있지만 CRC 바이트 부족
        assert!(Subpacket::parse(&wire[..wire.len() - 1], CrcWidth::Crc16)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_detects_crc_corruption() {
        let subpacket = Subpacket::new(b"abcdef".to_vec(), SubpacketEnd::NoEndNoAck);
        let mut wire = subpacket.encode(&mut escaping_encoder(), CrcWidth::Crc16);
        wire[0] ^= 0x01;
        assert!(Subpacket::parse(&wire, CrcWidth::Crc16).is_err());
    }

    #[test]
    fn test_end_kind_predicates() {
        assert!(SubpacketEnd::EndAck.is_frame_end());
        assert!(SubpacketEnd::EndAck.ack_expected());
        assert!(!SubpacketEnd::NoEndNoAck.is_frame_end());
        assert!(!SubpacketEnd::NoEndNoAck.ack_expected());
        assert_eq!(SubpacketEnd::from_byte(0x6a), Some(SubpacketEnd::NoEndAck));
        assert_eq!(SubpacketEnd::from_byte(0x42), None);
    }
}
