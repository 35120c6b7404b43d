//! 세션 공통 기반
//!
//! 송신/수신 세션이 합성으로 품는 `SessionCore`: 미소비 입력 버퍼,
//! ZDLE 인코더, 송신 싱크, 이벤트 큐, 마지막 수신 헤더 기록, 중단 처리.
//! 헤더/서브패킷은 입력 버퍼에 나타난 순서 그대로 동기적으로 디스패치된다.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::header::{CrcWidth, Header};
use crate::offer::FileOffer;
use crate::receive::ReceiveSession;
use crate::send::SendSession;
use crate::subpacket::SubpacketEnd;
use crate::zdle::{Zdle, ZdleConfig};
use crate::{Error, Result, ABORT_SEQUENCE, XOFF, XON};

/// 세션 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// 파일을 받는 쪽
    Receive,
    /// 파일을 보내는 쪽
    Send,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Receive => "receive",
            SessionRole::Send => "send",
        }
    }
}

/// 수신된 프로토콜 프레임 요약 (observability용)
///
/// 서브패킷 페이로드는 `DataIn` 이벤트로 정확히 한 번 전달되므로
/// 여기서는 길이와 종결 종류만 싣는다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header(Header),
    Data { len: usize, end: SubpacketEnd },
}

/// 세션이 호출자에게 내보내는 이벤트
///
/// 고정된 이벤트 집합. 호출자는 `poll_event()`로 큐를 비운다.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// 프로토콜 프레임 수신 (모든 헤더/서브패킷)
    Receive(Frame),
    /// 프로토콜이 아닌 바이트가 스트림에 섞여 있었음
    Garbage(Bytes),
    /// (수신) 송신측이 파일을 제안함 — accept/skip으로 응답
    Offer(FileOffer),
    /// (수신) 데이터 서브패킷 페이로드
    DataIn(Bytes),
    /// 파일 하나의 전송 완료 (수신: ZEOF 검증 후, 송신: ZEOF 후 ZRINIT 수신)
    FileEnd,
    /// (송신) 제안이 수락됨, offset부터 전송 시작
    OfferAccepted { offset: u32 },
    /// (송신) 제안이 거절됨
    OfferSkipped,
    /// 세션 종료 (정상 종료 또는 중단)
    SessionEnd,
}

/// 송신 바이트 싱크
pub type ByteSink = Box<dyn FnMut(&[u8]) + Send>;

/// 헤더 송신 프레이밍 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Hex,
    Binary16,
    #[allow(dead_code)] // 수용은 하지만 현재 송신 경로는 16비트를 쓴다
    Binary32,
}

/// 부분 배열 검색. 없으면 `None`
pub(crate) fn find_subarray(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// 세션 공유 상태 (합성용)
pub(crate) struct SessionCore {
    /// 아직 소비되지 않은 입력
    pub input: BytesMut,

    /// ZDLE 인코더 (송신 전용; 디코딩은 무상태)
    pub zdle: Zdle,

    /// 마지막으로 수신한 헤더 이름
    pub last_header_name: Option<&'static str>,

    /// 마지막 수신 헤더의 CRC 폭 (후속 서브패킷에 적용)
    pub last_header_crc: CrcWidth,

    /// 마지막으로 송신한 헤더 이름
    pub last_sent_header: Option<&'static str>,

    /// abort() 또는 피어 중단 이후 참
    pub aborted: bool,

    sender: Option<ByteSink>,
    garbage_sink: Option<ByteSink>,
    events: VecDeque<SessionEvent>,
}

impl SessionCore {
    pub fn new(zdle_config: ZdleConfig) -> Self {
        Self {
            input: BytesMut::new(),
            zdle: Zdle::new(zdle_config),
            last_header_name: None,
            last_header_crc: CrcWidth::Crc16,
            last_sent_header: None,
            aborted: false,
            sender: None,
            garbage_sink: None,
            events: VecDeque::new(),
        }
    }

    pub fn set_sender(&mut self, sender: ByteSink) {
        self.sender = Some(sender);
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    pub fn set_garbage_sink(&mut self, sink: ByteSink) {
        self.garbage_sink = Some(sink);
    }

    /// 바이트 송신. 중단된 세션에서는 에러
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.aborted {
            return Err(Error::AlreadyAborted);
        }
        let sender = self.sender.as_mut().ok_or(Error::NoSender)?;
        sender(bytes);
        Ok(())
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// 흐름제어 바이트(XON/XOFF와 8비트 변형)를 버리고 입력 버퍼에 추가
    pub fn enqueue_input(&mut self, input: &[u8]) {
        self.input.reserve(input.len());
        self.input.extend(
            input
                .iter()
                .copied()
                .filter(|&b| !matches!(b, XON | XOFF | 0x91 | 0x93)),
        );
    }

    /// 버퍼 어딘가에 중단 시퀀스(CAN 5회)가 있으면 세션 중단
    pub fn check_abort_sequence(&mut self) -> Result<()> {
        if let Some(at) = find_subarray(&self.input, &ABORT_SEQUENCE) {
            self.input.advance(at + ABORT_SEQUENCE.len());
            self.aborted = true;
            self.emit(SessionEvent::SessionEnd);
            return Err(Error::PeerAborted);
        }
        Ok(())
    }

    /// 헤더 앞의 garbage를 떼어 터미널 쪽으로 보낸다
    pub fn trim_leading_garbage(&mut self) {
        let garbage_len = Header::trim_leading_garbage(&self.input);
        if garbage_len == 0 {
            return;
        }
        let garbage = self.input.split_to(garbage_len).freeze();
        debug!(len = garbage.len(), "프로토콜 아닌 바이트 건너뜀");
        match self.garbage_sink.as_mut() {
            Some(sink) => sink(&garbage),
            None => self.emit(SessionEvent::Garbage(garbage)),
        }
    }

    /// 헤더 하나 파싱 시도. garbage 트리밍 포함
    pub fn parse_header(&mut self) -> Result<Option<Header>> {
        self.trim_leading_garbage();
        let Some((header, width, consumed)) = Header::parse(&self.input)? else {
            return Ok(None);
        };
        self.input.advance(consumed);
        debug!(name = header.name(), bytes4 = ?header.bytes4(), "헤더 수신");
        self.last_header_name = Some(header.name());
        self.last_header_crc = width;
        self.emit(SessionEvent::Receive(Frame::Header(header.clone())));
        Ok(Some(header))
    }

    /// 헤더 직렬화 후 송신
    pub fn send_header(&mut self, header: &Header, framing: Framing) -> Result<()> {
        let bytes = self.header_bytes(header, framing);
        debug!(name = header.name(), ?framing, "헤더 송신");
        self.send(&bytes)?;
        self.last_sent_header = Some(header.name());
        Ok(())
    }

    /// 헤더 직렬화 (송신하지 않음)
    pub fn header_bytes(&mut self, header: &Header, framing: Framing) -> Vec<u8> {
        match framing {
            Framing::Hex => header.to_hex(),
            Framing::Binary16 => header.to_binary16(&mut self.zdle),
            Framing::Binary32 => header.to_binary32(&mut self.zdle),
        }
    }

    /// 중단 시퀀스 송신 후 세션 중단
    ///
    /// 백스페이스 5개는 피어 셸의 라인 편집 버퍼에 남을 수 있는
    /// CAN 문자를 지우기 위한 것.
    pub fn abort(&mut self) -> Result<()> {
        if self.aborted {
            return Err(Error::AlreadyAborted);
        }
        let mut bytes = ABORT_SEQUENCE.to_vec();
        bytes.extend_from_slice(&[0x08; 5]);
        if self.sender.is_some() {
            self.send(&bytes)?;
        }
        self.aborted = true;
        self.emit(SessionEvent::SessionEnd);
        Ok(())
    }
}

/// 역할별 세션의 합
///
/// sentry가 첫 헤더로부터 만들어 내는 타입. 호출자는 역할에 맞는
/// 세부 API가 필요하면 `as_receive_mut`/`as_send_mut`으로 내려간다.
pub enum Session {
    Receive(ReceiveSession),
    Send(SendSession),
}

impl Session {
    /// 버퍼 맨 앞의 hex 헤더로부터 세션 생성 (sentry 전용)
    ///
    /// ZRQINIT → 수신 세션, ZRINIT → 송신 세션 (기능 검증 실패 시 None).
    /// 성공하면 소비한 헤더 바이트를 버퍼에서 제거한다.
    pub fn parse(buf: &mut Vec<u8>) -> Option<Session> {
        let (header, consumed) = match Header::parse_hex(buf) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return None,
            Err(err) => {
                // 세션 시작 후보가 아니었을 뿐, 보고할 일은 아니다
                debug!(%err, "hex 헤더 후보 파싱 실패");
                return None;
            }
        };

        let session = match header {
            Header::Zrqinit => Session::Receive(ReceiveSession::new()),
            Header::Zrinit(_) => match SendSession::new(&header) {
                Ok(session) => Session::Send(session),
                Err(err) => {
                    warn!(%err, "ZRINIT 기능 검증 실패, 세션으로 취급하지 않음");
                    return None;
                }
            },
            _ => return None,
        };

        buf.drain(..consumed);
        Some(session)
    }

    /// 세션 역할
    pub fn role(&self) -> SessionRole {
        match self {
            Session::Receive(_) => SessionRole::Receive,
            Session::Send(_) => SessionRole::Send,
        }
    }

    /// 입력 바이트 소비
    pub fn consume(&mut self, input: &[u8]) -> Result<()> {
        match self {
            Session::Receive(session) => session.consume(input),
            Session::Send(session) => session.consume(input),
        }
    }

    /// 송신 싱크 설정
    pub fn set_sender(&mut self, sender: ByteSink) {
        match self {
            Session::Receive(session) => session.set_sender(sender),
            Session::Send(session) => session.set_sender(sender),
        }
    }

    /// garbage 바이트 싱크 설정 (미설정 시 `SessionEvent::Garbage`로 나감)
    pub fn set_garbage_sink(&mut self, sink: ByteSink) {
        match self {
            Session::Receive(session) => session.core.set_garbage_sink(sink),
            Session::Send(session) => session.core.set_garbage_sink(sink),
        }
    }

    /// 다음 이벤트 꺼내기
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        match self {
            Session::Receive(session) => session.poll_event(),
            Session::Send(session) => session.poll_event(),
        }
    }

    /// 세션이 끝났는지 (정상 종료 또는 중단)
    pub fn has_ended(&self) -> bool {
        match self {
            Session::Receive(session) => session.has_ended(),
            Session::Send(session) => session.has_ended(),
        }
    }

    /// 세션 중단
    pub fn abort(&mut self) -> Result<()> {
        match self {
            Session::Receive(session) => session.abort(),
            Session::Send(session) => session.abort(),
        }
    }

    /// 세션 종료 마커("OO") 뒤에 도착한 비프로토콜 바이트
    pub fn trailing_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Session::Receive(session) => session.trailing_bytes(),
            Session::Send(_) => Ok(Vec::new()),
        }
    }

    /// 수신 세션 접근
    pub fn as_receive_mut(&mut self) -> Option<&mut ReceiveSession> {
        match self {
            Session::Receive(session) => Some(session),
            Session::Send(_) => None,
        }
    }

    /// 송신 세션 접근
    pub fn as_send_mut(&mut self) -> Option<&mut SendSession> {
        match self {
            Session::Send(session) => Some(session),
            Session::Receive(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_subarray() {
        assert_eq!(find_subarray(&[1, 2, 3, 4, 5], &[1, 2]), Some(0));
        assert_eq!(find_subarray(&[1, 2, 3, 4, 5], &[3, 4]), Some(2));
        assert_eq!(find_subarray(&[1, 2, 3, 4, 5], &[6, 7]), None);
        assert_eq!(
            find_subarray(&[0, 0, 0x18, 0x18, 0x18, 0x18, 0x18, 0], &ABORT_SEQUENCE),
            Some(2)
        );
    }

    #[test]
    fn test_enqueue_strips_flow_control_bytes() {
        let mut core = SessionCore::new(ZdleConfig::default());
        core.enqueue_input(&[XON, 0x65, XOFF, 0x66, XON | 0x80, XOFF | 0x80]);
        assert_eq!(&core.input[..], &[0x65, 0x66]);
    }

    #[test]
    fn test_abort_sequence_detection() {
        let mut core = SessionCore::new(ZdleConfig::default());
        core.enqueue_input(b"ab\x18\x18\x18\x18\x18cd");
        assert!(matches!(
            core.check_abort_sequence(),
            Err(Error::PeerAborted)
        ));
        assert!(core.aborted);
        // 시퀀스까지 소비되고 나머지는 남는다
        assert_eq!(&core.input[..], b"cd");
    }

    #[test]
    fn test_send_after_abort_fails() {
        let mut core = SessionCore::new(ZdleConfig::default());
        core.set_sender(Box::new(|_| {}));
        core.abort().unwrap();
        assert!(matches!(core.send(b"x"), Err(Error::AlreadyAborted)));
        assert!(matches!(core.abort(), Err(Error::AlreadyAborted)));
    }

    #[test]
    fn test_session_parse_zrqinit_yields_receive() {
        let mut buf = Header::Zrqinit.to_hex();
        buf.pop(); // sentry는 말미 XON을 따로 처리한다
        let session = Session::parse(&mut buf).unwrap();
        assert_eq!(session.role(), SessionRole::Receive);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_session_parse_rejects_half_duplex_zrinit() {
        use crate::header::zrinit_flags::CANOVIO;
        // CANFDX 없는 ZRINIT는 송신 세션이 되지 못한다
        let mut buf = Header::zrinit(CANOVIO, 0).to_hex();
        buf.pop();
        assert!(Session::parse(&mut buf).is_none());
    }

    #[test]
    fn test_session_parse_garbage_yields_none() {
        let mut buf = b"not a header".to_vec();
        assert!(Session::parse(&mut buf).is_none());
    }
}
