//! 수신 세션 상태기계
//!
//! ZRINIT 송신 → ZFILE 제안 수신 → ZRPOS로 수락 → ZDATA 서브패킷
//! 스트림 → ZEOF 검증 → 다시 ZRINIT, ZFIN이 오면 echo 후 "OO"로 종료.
//! 수신측은 항상 hex 헤더만 보낸다.

use bytes::{Buf, Bytes};
use tracing::{debug, info, warn};

use crate::header::{zrinit_flags, Header};
use crate::offer::{FileDetails, FileOffer};
use crate::session::{find_subarray, ByteSink, Frame, Framing, SessionCore, SessionEvent};
use crate::subpacket::Subpacket;
use crate::zdle::ZdleConfig;
use crate::{Error, Result, OVER_AND_OUT};

/// 수신측이 ZRINIT에 싣는 기능 플래그
///
/// ESCCTL은 요구하지 않는다 (ZDLE 디코더는 어느 쪽이든 읽는다).
/// CANFC32는 lsz의 16비트 CRC 경로에 있는 버퍼 오버플로우를 우회시키기
/// 위해 항상 광고한다.
const ZRINIT_FLAGS: u8 = zrinit_flags::CANFDX | zrinit_flags::CANOVIO | zrinit_flags::CANFC32;

/// 수신 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReceiveState {
    /// 파일 사이. `draining`이면 스킵한 파일의 잔여 ZDATA/ZEOF를 무시
    AwaitingOffer { draining: bool },
    /// ZFILE 헤더를 받았고 메타데이터 서브패킷 대기
    AwaitingFileData { header: Header },
    /// ZSINIT 헤더를 받았고 attn 서브패킷 대기
    AwaitingSinitData,
    /// 제안을 호출자에게 노출, accept/skip 대기
    Offered,
    /// ZRPOS를 보냈고 ZDATA 헤더 대기
    AwaitingData,
    /// 데이터 서브패킷 스트림 수신 중
    ReceivingData,
    /// 프레임이 끝났고 ZEOF 대기
    AwaitingEof,
}

impl ReceiveState {
    fn name(&self) -> &'static str {
        match self {
            ReceiveState::AwaitingOffer { .. } => "awaiting-offer",
            ReceiveState::AwaitingFileData { .. } => "awaiting-file-data",
            ReceiveState::AwaitingSinitData => "awaiting-sinit-data",
            ReceiveState::Offered => "offered",
            ReceiveState::AwaitingData => "awaiting-data",
            ReceiveState::ReceivingData => "receiving-data",
            ReceiveState::AwaitingEof => "awaiting-eof",
        }
    }
}

/// ZMODEM 수신 세션
pub struct ReceiveSession {
    pub(crate) core: SessionCore,
    state: ReceiveState,
    started: bool,
    file_offset: u32,
    file_details: Option<FileDetails>,
    attn: Option<Vec<u8>>,
    got_zfin: bool,
    bytes_after_oo: Option<Vec<u8>>,
}

impl ReceiveSession {
    /// 새 수신 세션 생성 (보통 sentry가 ZRQINIT을 보고 만든다)
    pub fn new() -> Self {
        Self {
            core: SessionCore::new(ZdleConfig::default()),
            state: ReceiveState::AwaitingOffer { draining: false },
            started: false,
            file_offset: 0,
            file_details: None,
            attn: None,
            got_zfin: false,
            bytes_after_oo: None,
        }
    }

    /// 송신 싱크 설정
    pub fn set_sender(&mut self, sender: ByteSink) {
        self.core.set_sender(sender);
    }

    /// 다음 이벤트 꺼내기
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.core.poll_event()
    }

    /// 첫 ZRINIT을 보내 송신측에 제안을 요청
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;
        self.send_zrinit()
    }

    /// 세션이 끝났는지
    pub fn has_ended(&self) -> bool {
        self.core.aborted || self.bytes_after_oo.is_some()
    }

    /// ZSINIT로 전달된 attn 시퀀스
    pub fn attn_sequence(&self) -> Option<&[u8]> {
        self.attn.as_deref()
    }

    /// 세션 중단
    pub fn abort(&mut self) -> Result<()> {
        self.core.abort()
    }

    /// "OO" 뒤에 도착한 비프로토콜 바이트 (터미널로 재주입용)
    pub fn trailing_bytes(&self) -> Result<Vec<u8>> {
        if self.core.aborted {
            return Ok(Vec::new());
        }
        match &self.bytes_after_oo {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(Error::SessionNotCompleted),
        }
    }

    /// 송신측 입력 바이트 소비
    pub fn consume(&mut self, input: &[u8]) -> Result<()> {
        if self.bytes_after_oo.is_some() {
            return Err(Error::SessionCompleted);
        }
        if self.core.aborted {
            return Err(Error::AlreadyAborted);
        }
        if input.is_empty() {
            return Ok(());
        }
        self.core.enqueue_input(input);
        self.core.check_abort_sequence()?;
        self.consume_first()
    }

    fn consume_first(&mut self) -> Result<()> {
        loop {
            if self.got_zfin {
                if self.core.input.len() < 2 {
                    return Ok(());
                }
                if find_subarray(&self.core.input, &OVER_AND_OUT) == Some(0) {
                    let trailing = self.core.input[OVER_AND_OUT.len()..].to_vec();
                    self.core.input.clear();
                    self.bytes_after_oo = Some(trailing);
                    info!("세션 정상 종료 (over-and-out)");
                    self.core.emit(SessionEvent::SessionEnd);
                } else {
                    warn!(
                        buffer = ?&self.core.input[..],
                        "ZFIN 뒤에는 \"OO\"만 와야 함"
                    );
                }
                return Ok(());
            }

            let progressed = if self.expects_subpacket() {
                self.parse_and_consume_subpacket()?
            } else {
                self.parse_and_consume_header()?
            };

            if !progressed || self.core.input.is_empty() {
                return Ok(());
            }
        }
    }

    fn expects_subpacket(&self) -> bool {
        matches!(
            self.state,
            ReceiveState::AwaitingFileData { .. }
                | ReceiveState::AwaitingSinitData
                | ReceiveState::ReceivingData
        )
    }

    // ------------------------------------------------------------------
    // 헤더 처리

    fn parse_and_consume_header(&mut self) -> Result<bool> {
        let Some(header) = self.core.parse_header()? else {
            return Ok(false);
        };
        self.handle_header(header)?;
        Ok(true)
    }

    fn handle_header(&mut self, header: Header) -> Result<()> {
        // ZFIN은 어느 헤더 대기 상태에서든 핸드쉐이크를 끝낸다
        if header == Header::Zfin {
            return self.consume_zfin();
        }

        let state = std::mem::replace(
            &mut self.state,
            ReceiveState::AwaitingOffer { draining: false },
        );
        match (state, header) {
            (ReceiveState::AwaitingOffer { .. }, header @ Header::Zfile(_)) => {
                self.state = ReceiveState::AwaitingFileData { header };
            }
            (ReceiveState::AwaitingOffer { .. }, Header::Zsinit(_)) => {
                // keep-alive. 내용은 ZDLE 인코딩 세부사항뿐이라 상태에
                // 영향을 주지 않는다
                self.state = ReceiveState::AwaitingSinitData;
            }
            (ReceiveState::AwaitingOffer { draining: true }, Header::Zdata(_)) => {
                debug!("스킵한 파일의 잔여 ZDATA 무시");
                self.state = ReceiveState::AwaitingOffer { draining: true };
            }
            (ReceiveState::AwaitingOffer { draining: true }, Header::Zeof(_)) => {
                debug!("스킵한 파일의 잔여 ZEOF 무시");
                self.state = ReceiveState::AwaitingOffer { draining: false };
            }
            (ReceiveState::AwaitingData, Header::Zdata(bytes4)) => {
                self.consume_zdata(Header::Zdata(bytes4))?;
            }
            (ReceiveState::AwaitingEof, Header::Zeof(bytes4)) => {
                self.consume_zeof(Header::Zeof(bytes4))?;
            }
            (state, header) => {
                return Err(Error::ProtocolViolation(format!(
                    "{} 상태에서 처리할 수 없는 헤더 {}",
                    state.name(),
                    header.name()
                )));
            }
        }
        Ok(())
    }

    fn consume_zfin(&mut self) -> Result<()> {
        self.got_zfin = true;
        self.state = ReceiveState::AwaitingOffer { draining: false };
        self.core.send_header(&Header::Zfin, Framing::Hex)
    }

    fn consume_zdata(&mut self, header: Header) -> Result<()> {
        let offset = header.offset().unwrap_or(0);
        if self.file_offset != offset {
            // 재동기화(오류 정정)는 신뢰 전송 가정하에 미구현
            return Err(Error::ProtocolViolation(format!(
                "ZDATA 오프셋 불일치 (local {} != peer {})",
                self.file_offset, offset
            )));
        }
        self.state = ReceiveState::ReceivingData;
        Ok(())
    }

    fn consume_zeof(&mut self, header: Header) -> Result<()> {
        let offset = header.offset().unwrap_or(0);
        if self.file_offset != offset {
            return Err(Error::ProtocolViolation(format!(
                "ZEOF 오프셋 불일치 (local {} != peer {})",
                self.file_offset, offset
            )));
        }
        info!(
            name = self.file_details.as_ref().map(|d| d.name.as_str()),
            bytes = self.file_offset,
            "파일 수신 완료"
        );
        self.core.emit(SessionEvent::FileEnd);
        self.file_details = None;
        self.state = ReceiveState::AwaitingOffer { draining: false };
        self.send_zrinit()
    }

    // ------------------------------------------------------------------
    // 서브패킷 처리

    fn parse_and_consume_subpacket(&mut self) -> Result<bool> {
        let width = self.core.last_header_crc;
        let Some((subpacket, consumed)) = Subpacket::parse(&self.core.input, width)? else {
            return Ok(false);
        };
        self.core.input.advance(consumed);
        self.core.emit(SessionEvent::Receive(Frame::Data {
            len: subpacket.payload.len(),
            end: subpacket.end,
        }));

        let state = std::mem::replace(
            &mut self.state,
            ReceiveState::AwaitingOffer { draining: false },
        );
        match state {
            ReceiveState::AwaitingFileData { header } => {
                self.consume_zfile_data(&header, subpacket)?;
            }
            ReceiveState::AwaitingSinitData => {
                self.attn = Some(subpacket.payload);
                self.core.send_header(&Header::zack(), Framing::Hex)?;
                self.state = ReceiveState::AwaitingOffer { draining: false };
            }
            ReceiveState::ReceivingData => {
                let frame_end = subpacket.end.is_frame_end();
                self.consume_zdata_data(subpacket)?;
                self.state = if frame_end {
                    ReceiveState::AwaitingEof
                } else {
                    ReceiveState::ReceivingData
                };
            }
            // expects_subpacket()이 참인 상태에서만 진입한다
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "{} 상태에서 서브패킷 수신",
                    state.name()
                )));
            }
        }
        Ok(true)
    }

    fn consume_zfile_data(&mut self, header: &Header, subpacket: Subpacket) -> Result<()> {
        if self.file_details.is_some() {
            return Err(Error::ProtocolViolation(
                "한 제안에 ZFILE 데이터 서브패킷이 두 번 도착".into(),
            ));
        }

        let details = FileDetails::from_payload(&subpacket.payload);
        let options = header.zfile_options().unwrap_or_default();
        debug!(name = %details.name, size = ?details.size, "파일 제안 수신");

        self.file_details = Some(details.clone());
        self.state = ReceiveState::Offered;
        self.core
            .emit(SessionEvent::Offer(FileOffer { details, options }));
        Ok(())
    }

    fn consume_zdata_data(&mut self, subpacket: Subpacket) -> Result<()> {
        self.file_offset += subpacket.payload.len() as u32;
        let ack_wanted = subpacket.end.ack_expected() && !subpacket.end.is_frame_end();
        self.core
            .emit(SessionEvent::DataIn(Bytes::from(subpacket.payload)));
        if ack_wanted {
            self.core
                .send_header(&Header::zack_with_offset(self.file_offset), Framing::Hex)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 호출자 동작

    /// 현재 제안을 수락하고 `offset`부터 데이터를 요청 (부분 전송 재개 지원)
    pub fn accept(&mut self, offset: u32) -> Result<()> {
        if self.state != ReceiveState::Offered {
            return Err(Error::NoPendingOffer);
        }
        self.file_offset = offset;
        self.state = ReceiveState::AwaitingData;
        self.send_zrpos()
    }

    /// 현재 제안(또는 진행 중인 전송)을 건너뛴다
    pub fn skip(&mut self) -> Result<()> {
        let draining = match self.state {
            ReceiveState::Offered => false,
            ReceiveState::AwaitingData
            | ReceiveState::ReceivingData
            | ReceiveState::AwaitingEof => true,
            _ => return Err(Error::NoPendingOffer),
        };
        self.file_details = None;
        self.state = ReceiveState::AwaitingOffer { draining };
        self.core.send_header(&Header::Zskip, Framing::Hex)
    }

    fn send_zrinit(&mut self) -> Result<()> {
        self.core
            .send_header(&Header::zrinit(ZRINIT_FLAGS, 0), Framing::Hex)
    }

    fn send_zrpos(&mut self) -> Result<()> {
        self.core
            .send_header(&Header::zrpos(self.file_offset), Framing::Hex)
    }
}

impl Default for ReceiveSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CrcWidth;
    use crate::subpacket::SubpacketEnd;
    use crate::zdle::Zdle;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// 세션이 보낸 바이트를 캡처하는 수신 세션
    fn session_with_capture() -> (ReceiveSession, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let mut session = ReceiveSession::new();
        session.set_sender(Box::new(move |bytes| sink.lock().extend_from_slice(bytes)));
        (session, sent)
    }

    fn drain_events(session: &mut ReceiveSession) -> Vec<SessionEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    fn zfile_wire(details: &FileDetails) -> Vec<u8> {
        let mut zdle = Zdle::default();
        let mut wire = Header::Zfile([0; 4]).to_binary16(&mut zdle);
        wire.extend_from_slice(
            &Subpacket::new(details.to_payload(), SubpacketEnd::EndAck)
                .encode(&mut zdle, CrcWidth::Crc16),
        );
        wire
    }

    #[test]
    fn test_start_sends_zrinit() {
        let (mut session, sent) = session_with_capture();
        session.start().unwrap();
        assert_eq!(
            sent.lock().clone(),
            Header::zrinit(ZRINIT_FLAGS, 0).to_hex()
        );
        assert!(matches!(session.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn test_offer_surfaces_and_accept_sends_zrpos() {
        let (mut session, sent) = session_with_capture();
        session.start().unwrap();
        sent.lock().clear();

        session
            .consume(&zfile_wire(&FileDetails::new("hello.txt", 5)))
            .unwrap();

        let events = drain_events(&mut session);
        let offer = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::Offer(offer) => Some(offer.clone()),
                _ => None,
            })
            .expect("offer 이벤트가 없음");
        assert_eq!(offer.details.name, "hello.txt");
        assert_eq!(offer.details.size, Some(5));

        session.accept(0).unwrap();
        assert_eq!(sent.lock().clone(), Header::zrpos(0).to_hex());
    }

    #[test]
    fn test_skip_sends_zskip_and_clears_offer() {
        let (mut session, sent) = session_with_capture();
        session.start().unwrap();
        session
            .consume(&zfile_wire(&FileDetails::new("unwanted.bin", 9)))
            .unwrap();
        sent.lock().clear();

        session.skip().unwrap();
        assert_eq!(sent.lock().clone(), Header::Zskip.to_hex());
        assert!(matches!(session.accept(0), Err(Error::NoPendingOffer)));
    }

    #[test]
    fn test_data_flow_acks_and_offsets() {
        let (mut session, sent) = session_with_capture();
        session.start().unwrap();
        session
            .consume(&zfile_wire(&FileDetails::new("data.bin", 6)))
            .unwrap();
        session.accept(0).unwrap();
        sent.lock().clear();

        let mut zdle = Zdle::default();
        let mut wire = Header::zdata(0).to_binary16(&mut zdle);
        wire.extend_from_slice(
            &Subpacket::new(b"abc".to_vec(), SubpacketEnd::NoEndAck)
                .encode(&mut zdle, CrcWidth::Crc16),
        );
        wire.extend_from_slice(
            &Subpacket::new(b"def".to_vec(), SubpacketEnd::EndNoAck)
                .encode(&mut zdle, CrcWidth::Crc16),
        );
        session.consume(&wire).unwrap();

        // ZCRCQ에만 ZACK(누적 오프셋)이 나간다
        assert_eq!(
            sent.lock().clone(),
            Header::zack_with_offset(3).to_hex()
        );

        let payloads: Vec<Bytes> = drain_events(&mut session)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::DataIn(payload) => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![Bytes::from("abc"), Bytes::from("def")]);

        // ZEOF 오프셋 일치 → file_end 후 ZRINIT 재전송
        sent.lock().clear();
        session.consume(&Header::zeof(6).to_hex()).unwrap();
        let events = drain_events(&mut session);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::FileEnd))
                .count(),
            1
        );
        assert_eq!(
            sent.lock().clone(),
            Header::zrinit(ZRINIT_FLAGS, 0).to_hex()
        );
    }

    #[test]
    fn test_zdata_offset_mismatch_is_fatal() {
        let (mut session, _sent) = session_with_capture();
        session.start().unwrap();
        session
            .consume(&zfile_wire(&FileDetails::new("x", 1)))
            .unwrap();
        session.accept(0).unwrap();

        let mut zdle = Zdle::default();
        let wire = Header::zdata(512).to_binary16(&mut zdle);
        assert!(matches!(
            session.consume(&wire),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_zfin_handshake_and_trailing_bytes() {
        let (mut session, sent) = session_with_capture();
        session.start().unwrap();
        sent.lock().clear();

        session.consume(&Header::Zfin.to_hex()).unwrap();
        assert_eq!(sent.lock().clone(), Header::Zfin.to_hex());
        assert!(matches!(
            session.trailing_bytes(),
            Err(Error::SessionNotCompleted)
        ));

        session.consume(b"OOback to shell").unwrap();
        assert!(session.has_ended());
        assert_eq!(session.trailing_bytes().unwrap(), b"back to shell");
        assert!(matches!(session.consume(b"x"), Err(Error::SessionCompleted)));
    }

    #[test]
    fn test_peer_abort_sequence() {
        let (mut session, _sent) = session_with_capture();
        session.start().unwrap();
        assert!(matches!(
            session.consume(&[0x18; 5]),
            Err(Error::PeerAborted)
        ));
        assert!(session.has_ended());
    }

    #[test]
    fn test_garbage_between_headers_is_surfaced() {
        let (mut session, _sent) = session_with_capture();
        session.start().unwrap();

        let mut wire = b"login: ".to_vec();
        wire.extend_from_slice(&zfile_wire(&FileDetails::new("f", 0)));
        session.consume(&wire).unwrap();

        let garbage: Vec<Bytes> = drain_events(&mut session)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Garbage(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(garbage, vec![Bytes::from("login: ")]);
    }
}
