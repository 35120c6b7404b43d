//! 송신 세션 상태기계
//!
//! 이미 수신한 ZRINIT로부터만 생성된다 (기능 검증 포함). 유휴 구간에는
//! ZSINIT keep-alive, 제안은 ZFILE, 데이터는 ZDATA 프레임 하나에
//! ≤8KiB 조각들, 파일 끝은 ZEOF, 종료는 ZFIN/"OO".
//!
//! 제어문자는 항상 이스케이프한다. IEXTEN이 켜진 셸이 0x0F/0x16을
//! 먹어버리는 환경이 실존하기 때문에, 피어의 ZRINIT가 ESCCTL을 빼고
//! 왔다면 첫 제안 전에 ZSINIT(ESCCTL)/ZACK 왕복으로 강제한다.

use std::time::Instant;

use tracing::{debug, info};

use crate::config::Config;
use crate::header::{zsinit_flags, CrcWidth, Header};
use crate::offer::FileDetails;
use crate::session::{ByteSink, Framing, SessionCore, SessionEvent};
use crate::subpacket::{Subpacket, SubpacketEnd};
use crate::zdle::ZdleConfig;
use crate::{Error, Result, OVER_AND_OUT};

/// 송신 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum SendState {
    /// 파일 사이 유휴 (keep-alive 동작 중)
    Idle,
    /// 제안 전 ZSINIT를 보냈고 ZACK 대기 (보낼 ZFILE 페이로드 보관)
    AwaitingEscapeAck { payload: Vec<u8> },
    /// ZFILE을 보냈고 ZRPOS/ZSKIP 대기
    AwaitingOfferReply,
    /// 제안이 수락되어 파일 전송 중
    Sending,
    /// ZEOF를 보냈고 피어의 다음 ZRINIT 대기
    AwaitingZrinit,
    /// ZFIN을 보냈고 echo 대기
    Closing,
    /// "OO"까지 보내고 종료
    Ended,
}

impl SendState {
    fn name(&self) -> &'static str {
        match self {
            SendState::Idle => "idle",
            SendState::AwaitingEscapeAck { .. } => "awaiting-escape-ack",
            SendState::AwaitingOfferReply => "awaiting-offer-reply",
            SendState::Sending => "sending",
            SendState::AwaitingZrinit => "awaiting-zrinit",
            SendState::Closing => "closing",
            SendState::Ended => "ended",
        }
    }
}

/// ZMODEM 송신 세션
pub struct SendSession {
    pub(crate) core: SessionCore,
    config: Config,
    state: SendState,
    file_offset: u32,
    /// 현재 ZDATA 프레임의 헤더를 이미 보냈는지
    sent_zdata: bool,
    /// ZSINIT에 대한 ZACK을 받은 적이 있는지
    got_zsinit_zack: bool,
    /// 피어의 ZRINIT가 ESCCTL을 요구했는지
    peer_escctl: bool,
    keepalive_started: Option<Instant>,
    start_keepalive_on_set_sender: bool,
    sent_oo: bool,
}

impl SendSession {
    /// 수신한 ZRINIT로부터 송신 세션 생성
    ///
    /// 피어 기능을 즉시 검증한다: 버퍼 크기 광고, 반이중, 논중첩 I/O,
    /// 8비트 이스케이프 요구는 전부 미지원으로 거절.
    pub fn new(zrinit: &Header) -> Result<Self> {
        Self::with_config(zrinit, Config::default())
    }

    /// 설정을 지정해 생성
    pub fn with_config(zrinit: &Header, config: Config) -> Result<Self> {
        if !matches!(zrinit, Header::Zrinit(_)) {
            return Err(Error::ProtocolViolation(format!(
                "첫 헤더는 ZRINIT이어야 함, {} 아님",
                zrinit.name()
            )));
        }

        let mut session = Self {
            core: SessionCore::new(ZdleConfig {
                escape_ctrl_chars: true,
                turbo_escape: config.turbo_escape,
            }),
            config,
            state: SendState::Idle,
            file_offset: 0,
            sent_zdata: false,
            got_zsinit_zack: false,
            peer_escctl: false,
            keepalive_started: None,
            start_keepalive_on_set_sender: true,
            sent_oo: false,
        };
        session.consume_zrinit(zrinit)?;
        session.core.last_header_name = Some("ZRINIT");
        Ok(session)
    }

    /// 송신 싱크 설정. 최초 설정 시 keep-alive 타이머도 시작한다
    pub fn set_sender(&mut self, sender: ByteSink) {
        self.core.set_sender(sender);
        if self.start_keepalive_on_set_sender {
            self.start_keepalive_on_set_sender = false;
            self.start_keepalive();
        }
    }

    /// 다음 이벤트 꺼내기
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.core.poll_event()
    }

    /// 세션이 끝났는지
    pub fn has_ended(&self) -> bool {
        self.core.aborted || self.sent_oo
    }

    /// 현재 파일 오프셋
    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }

    /// 세션 중단
    pub fn abort(&mut self) -> Result<()> {
        self.stop_keepalive();
        self.core.abort()
    }

    fn consume_zrinit(&mut self, header: &Header) -> Result<()> {
        if let Some(size) = header.buffer_size() {
            return Err(Error::UnsupportedCapability(format!(
                "버퍼 크기 광고 ({size})"
            )));
        }
        if !header.can_full_duplex() {
            return Err(Error::UnsupportedCapability("반이중 I/O".into()));
        }
        if !header.can_overlap_io() {
            return Err(Error::UnsupportedCapability("논중첩 I/O".into()));
        }
        if header.escape_8th_bit() {
            return Err(Error::UnsupportedCapability("8비트 이스케이프".into()));
        }

        self.peer_escctl = header.escape_ctrl_chars();
        if !self.peer_escctl {
            debug!("피어가 ESCCTL을 요구하지 않음, 제안 전에 ZSINIT로 강제한다");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // keep-alive

    fn start_keepalive(&mut self) {
        self.keepalive_started = Some(Instant::now());
    }

    fn stop_keepalive(&mut self) {
        self.keepalive_started = None;
    }

    /// 유휴 keep-alive 구동. 임베더가 주기적으로 불러준다
    ///
    /// 파일 사이 유휴 시간이 설정 간격을 넘으면 ZSINIT를 다시 보내
    /// lrzsz류 피어의 타임아웃을 막는다.
    pub fn tick(&mut self) -> Result<()> {
        if self.state != SendState::Idle {
            return Ok(());
        }
        let Some(started) = self.keepalive_started else {
            return Ok(());
        };
        if started.elapsed() >= self.config.keepalive_interval {
            self.send_zsinit()?;
            self.start_keepalive();
        }
        Ok(())
    }

    fn send_zsinit(&mut self) -> Result<()> {
        let mut flags = 0;
        if self.core.zdle.escapes_ctrl_chars() {
            flags |= zsinit_flags::ESCCTL;
        }
        // lsz처럼 ZSINIT는 hex로, 페이로드는 NUL 하나짜리 end-ack 서브패킷
        self.send_header_and_data(&Header::zsinit(flags), Framing::Hex, &[0], SubpacketEnd::EndAck)
    }

    // ------------------------------------------------------------------
    // 입력 소비

    /// 수신측 입력 바이트 소비
    pub fn consume(&mut self, input: &[u8]) -> Result<()> {
        if self.core.aborted {
            return Err(Error::AlreadyAborted);
        }
        if input.is_empty() {
            return Ok(());
        }
        self.core.enqueue_input(input);
        self.core.check_abort_sequence()?;

        // 수신 프로그램은 응답이 없으면 'C'를 보내 YMODEM으로 내려가려
        // 한다. 그 시점이면 세션은 살릴 수 없다
        if self.core.input.len() == 1 && self.core.input[0] == b'C' {
            return Err(Error::YmodemDowngrade);
        }

        loop {
            let Some(header) = self.core.parse_header()? else {
                return Ok(());
            };
            self.handle_header(header)?;
            if self.core.input.is_empty() {
                return Ok(());
            }
        }
    }

    fn handle_header(&mut self, header: Header) -> Result<()> {
        let state = std::mem::replace(&mut self.state, SendState::Idle);
        match (state, header) {
            // keep-alive ZSINIT에 대한 응답
            (SendState::Idle, Header::Zack(_)) => {
                self.got_zsinit_zack = true;
            }
            (SendState::AwaitingEscapeAck { payload }, Header::Zack(_)) => {
                self.got_zsinit_zack = true;
                self.send_zfile(payload)?;
            }
            (SendState::AwaitingOfferReply, Header::Zskip) => {
                info!("제안 거절됨 (ZSKIP)");
                self.start_keepalive();
                self.core.emit(SessionEvent::OfferSkipped);
            }
            (SendState::AwaitingOfferReply, header @ Header::Zrpos(_)) => {
                let offset = header.offset().unwrap_or(0);
                info!(offset, "제안 수락됨, 전송 시작");
                self.file_offset = offset;
                self.sent_zdata = false;
                self.state = SendState::Sending;
                self.core.emit(SessionEvent::OfferAccepted { offset });
            }
            // 늦게 도착한 keep-alive ZACK은 상태를 바꾸지 않는다
            (state @ SendState::AwaitingOfferReply, Header::Zack(_))
            | (state @ SendState::Sending, Header::Zack(_)) => {
                self.got_zsinit_zack = true;
                self.state = state;
            }
            // 전송 중 ZRPOS는 재동기 ping. 신뢰 전송 가정이라 되감지 않는다
            (SendState::Sending, Header::Zrpos(_)) => {
                debug!("전송 중 ZRPOS 수신, 재전송 없이 무시");
                self.state = SendState::Sending;
            }
            (SendState::AwaitingZrinit, header @ Header::Zrinit(_)) => {
                self.consume_zrinit(&header)?;
                self.core.emit(SessionEvent::FileEnd);
                self.start_keepalive();
            }
            (SendState::Closing, Header::Zfin) => {
                self.core.send(&OVER_AND_OUT)?;
                self.sent_oo = true;
                self.state = SendState::Ended;
                info!("세션 정상 종료 (over-and-out 송신)");
                self.core.emit(SessionEvent::SessionEnd);
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

    // ------------------------------------------------------------------
    // 호출자 동작

    /// 파일 하나를 제안한다
    ///
    /// 응답은 이벤트로 돌아온다: 수락이면 `OfferAccepted { offset }`,
    /// 거절이면 `OfferSkipped`.
    pub fn send_offer(&mut self, details: &FileDetails) -> Result<()> {
        match self.state {
            SendState::Idle => {}
            SendState::AwaitingEscapeAck { .. }
            | SendState::AwaitingOfferReply
            | SendState::Sending => return Err(Error::AlreadySending),
            _ => {
                return Err(Error::ProtocolViolation(format!(
                    "{} 상태에서는 제안할 수 없음",
                    self.state.name()
                )))
            }
        }
        details.validate()?;
        debug!(name = %details.name, size = ?details.size, "파일 제안");

        let payload = details.to_payload();
        self.stop_keepalive();

        if !self.peer_escctl && !self.got_zsinit_zack {
            // 이스케이프 인지를 먼저 확보하고 ZACK이 오면 ZFILE을 보낸다
            self.state = SendState::AwaitingEscapeAck { payload };
            self.send_zsinit()
        } else {
            self.send_zfile(payload)
        }
    }

    fn send_zfile(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sent_zdata = false;
        self.state = SendState::AwaitingOfferReply;
        self.send_header_and_data(
            &Header::Zfile([0; 4]),
            Framing::Binary16,
            &payload,
            SubpacketEnd::EndAck,
        )
    }

    /// 파일 데이터 조각 전송 (중간 조각, ACK 요구 없음)
    ///
    /// `max_subpacket_size`보다 크면 내부에서 나눠 보낸다.
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SendState::Sending {
            return Err(Error::NotSending);
        }
        self.send_file_part(data, SubpacketEnd::NoEndNoAck)
    }

    /// 마지막 조각을 프레임 종료로 보내고 ZEOF로 파일을 닫는다
    ///
    /// 피어의 다음 ZRINIT가 도착하면 `FileEnd` 이벤트가 나오고
    /// keep-alive가 재개된다.
    pub fn end_file(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SendState::Sending {
            return Err(Error::NotSending);
        }
        // 마지막 조각의 프레임 종료 표시가 ZEOF와 중복은 아니다:
        // 수신측에 다음은 서브패킷이 아니라 헤더라고 알리는 신호다
        self.send_file_part(data, SubpacketEnd::EndNoAck)?;
        self.state = SendState::AwaitingZrinit;
        self.core
            .send_header(&Header::zeof(self.file_offset), Framing::Hex)?;
        self.file_offset = 0;
        Ok(())
    }

    fn send_file_part(&mut self, data: &[u8], final_end: SubpacketEnd) -> Result<()> {
        if !self.sent_zdata {
            self.core
                .send_header(&Header::zdata(self.file_offset), Framing::Binary16)?;
            self.sent_zdata = true;
        }

        let max = self.config.max_subpacket_size;
        let mut offset = 0;
        // 빈 end_file도 빈 조각 하나는 내보내야 하므로 최소 한 번은 돈다
        loop {
            let chunk_end = (offset + max).min(data.len());
            let at_end = chunk_end >= data.len();
            let end = if at_end {
                final_end
            } else {
                SubpacketEnd::NoEndNoAck
            };

            let subpacket = Subpacket::new(data[offset..chunk_end].to_vec(), end);
            let bytes = subpacket.encode(&mut self.core.zdle, CrcWidth::Crc16);
            self.core.send(&bytes)?;

            self.file_offset += (chunk_end - offset) as u32;
            offset = chunk_end;
            if offset >= data.len() {
                return Ok(());
            }
        }
    }

    /// 세션 종료 핸드쉐이크 시작 (ZFIN)
    ///
    /// 마지막 수신 헤더가 ZRINIT/ZSKIP이거나, 직전에 보낸 ZSINIT에 대한
    /// ZACK일 때만 허용된다.
    pub fn close(&mut self) -> Result<()> {
        let last = self.core.last_header_name;
        let ok = matches!(last, Some("ZRINIT") | Some("ZSKIP"))
            || (self.core.last_sent_header == Some("ZSINIT") && last == Some("ZACK"));
        if !ok {
            return Err(Error::InvalidClose(last.unwrap_or("(없음)").into()));
        }
        self.stop_keepalive();
        self.state = SendState::Closing;
        self.core.send_header(&Header::Zfin, Framing::Hex)
    }

    /// 헤더와 서브패킷을 하나의 쓰기로 내보낸다
    fn send_header_and_data(
        &mut self,
        header: &Header,
        framing: Framing,
        payload: &[u8],
        end: SubpacketEnd,
    ) -> Result<()> {
        let mut bytes = self.core.header_bytes(header, framing);
        bytes.extend_from_slice(
            &Subpacket::new(payload.to_vec(), end).encode(&mut self.core.zdle, CrcWidth::Crc16),
        );
        debug!(name = header.name(), payload_len = payload.len(), "헤더+데이터 송신");
        self.core.send(&bytes)?;
        self.core.last_sent_header = Some(header.name());
        Ok(())
    }
}
