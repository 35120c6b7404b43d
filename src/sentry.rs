//! Sentry — 터미널 트래픽 속의 ZMODEM 세션 시작 감지
//!
//! 모든 입력은 sentry를 거친다. ZMODEM처럼 보이지 않는 동안은 전부
//! 터미널로 흘려보내고, ZRQINIT/ZRINIT hex 헤더의 공통 시그니처가
//! 보이면 세션을 파싱해 `Detection`으로 호출자에게 확인을 구한다.
//! 확인되면 이후 입력은 세션으로 라우팅되고, 세션이 끝나면 종료
//! 마커 뒤의 바이트는 다시 터미널 몫이 된다.
//!
//! 감지는 확정이 아니다: 뒤이어 도착한 바이트가 ZMODEM이 아니라고
//! 판명되면 감지는 철회(retract)되고, 그 후의 confirm은 실패한다.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::session::{find_subarray, ByteSink, Session, SessionRole};
use crate::{Error, Result, ABORT_SEQUENCE, XON, ZDLE, ZPAD};

/// 스캔 캐시 상한. ZRQINIT hex 헤더 전체 길이와 같다
const MAX_HEX_START_CACHE: usize = 21;

/// ZRQINIT/ZRINIT hex 헤더의 공통 앞부분: `* * ZDLE 'B' '0'`
/// (다음 바이트가 ZRQINIT이면 '0', ZRINIT이면 '1')
const COMMON_HEX_START: [u8; 5] = [ZPAD, ZPAD, ZDLE, b'B', b'0'];

type SharedSink = Arc<Mutex<ByteSink>>;

struct SentryState {
    cache: Vec<u8>,
    active: Option<Arc<Mutex<Session>>>,
    parsed: Option<Arc<Mutex<Session>>>,
    generation: u64,
}

/// 세션 시작 후보를 나타내는 철회 가능한 핸들
///
/// `confirm()`으로 세션을 활성화하거나 `deny()`로 중단 시퀀스를
/// 보낸다. sentry가 그 사이 후보를 철회했다면 confirm은 실패한다.
pub struct Detection {
    state: Arc<Mutex<SentryState>>,
    session: Arc<Mutex<Session>>,
    to_terminal: SharedSink,
    sender: SharedSink,
    generation: u64,
    role: SessionRole,
}

impl Detection {
    /// 감지가 아직 유효한지
    pub fn is_valid(&self) -> bool {
        let state = self.state.lock();
        state.generation == self.generation
            && state
                .parsed
                .as_ref()
                .is_some_and(|parsed| Arc::ptr_eq(parsed, &self.session))
    }

    /// 감지된 세션의 역할
    pub fn session_role(&self) -> SessionRole {
        self.role
    }

    /// ZMODEM 세션 시작이 맞다고 확인
    ///
    /// 세션의 송신 싱크와 garbage 싱크를 sentry에 배선하고 활성
    /// 세션으로 설치한 뒤 공유 핸들을 돌려준다.
    pub fn confirm(&self) -> Result<Arc<Mutex<Session>>> {
        let mut state = self.state.lock();
        let valid = state.generation == self.generation
            && state
                .parsed
                .as_ref()
                .is_some_and(|parsed| Arc::ptr_eq(parsed, &self.session));
        if !valid {
            return Err(Error::StaleDetection);
        }

        {
            let mut session = self.session.lock();
            let sender = self.sender.clone();
            session.set_sender(Box::new(move |bytes| (sender.lock())(bytes)));
            let terminal = self.to_terminal.clone();
            session.set_garbage_sink(Box::new(move |bytes| (terminal.lock())(bytes)));
        }

        state.parsed = None;
        state.active = Some(self.session.clone());
        info!(role = self.role.as_str(), "ZMODEM 세션 확인됨");
        Ok(self.session.clone())
    }

    /// 세션 시작이 아니라고 거부, 피어에게 중단 시퀀스를 보낸다
    pub fn deny(&self) {
        (self.sender.lock())(&ABORT_SEQUENCE);
    }
}

/// 스캔 결과 (상태 잠금 안에서 계산, 콜백은 잠금 해제 후 호출)
enum Outcome {
    Detected {
        session: Arc<Mutex<Session>>,
        role: SessionRole,
        generation: u64,
        retract_first: bool,
        to_terminal: Vec<u8>,
    },
    NotDetected {
        retract: bool,
        send_abort: bool,
        to_terminal: Vec<u8>,
    },
}

/// 터미널 트래픽 감시자
pub struct Sentry {
    state: Arc<Mutex<SentryState>>,
    to_terminal: SharedSink,
    sender: SharedSink,
    on_detect: Box<dyn FnMut(Detection) + Send>,
    on_retract: Box<dyn FnMut() + Send>,
}

impl Sentry {
    /// 새 sentry 생성
    ///
    /// - `to_terminal`: 프로토콜이 아닌 트래픽을 받는 싱크
    /// - `sender`: 피어로 나가는 바이트 싱크 (세션에도 배선된다)
    /// - `on_detect`: 새 감지가 생길 때마다 호출
    /// - `on_retract`: 대기 중이던 감지가 철회될 때 호출
    pub fn new(
        to_terminal: impl FnMut(&[u8]) + Send + 'static,
        sender: impl FnMut(&[u8]) + Send + 'static,
        on_detect: impl FnMut(Detection) + Send + 'static,
        on_retract: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SentryState {
                cache: Vec::new(),
                active: None,
                parsed: None,
                generation: 0,
            })),
            to_terminal: Arc::new(Mutex::new(Box::new(to_terminal))),
            sender: Arc::new(Mutex::new(Box::new(sender))),
            on_detect: Box::new(on_detect),
            on_retract: Box::new(on_retract),
        }
    }

    /// 확인된 활성 세션 (없으면 `None`)
    pub fn confirmed_session(&self) -> Option<Arc<Mutex<Session>>> {
        self.state.lock().active.clone()
    }

    /// 도착한 입력 한 조각을 소비
    ///
    /// 활성 세션이 있으면 그쪽으로, 없으면 감지 스캔 후 터미널로.
    /// 세션이 이 호출로 끝났다면 종료 마커 뒤 바이트는 새 입력으로
    /// 재스캔된다.
    pub fn consume(&mut self, input: &[u8]) -> Result<()> {
        let mut input = input.to_vec();

        let active = self.state.lock().active.clone();
        if let Some(active) = active {
            let mut session = active.lock();
            let result = session.consume(&input);
            let ended = session.has_ended();
            let trailing = if ended && session.role() == SessionRole::Receive {
                session.trailing_bytes().unwrap_or_default()
            } else {
                Vec::new()
            };
            drop(session);

            if ended {
                self.state.lock().active = None;
            }
            result?;
            if !ended {
                return Ok(());
            }
            input = trailing;
        }

        let outcome = self.scan_locked(&input);
        match outcome {
            Outcome::Detected {
                session,
                role,
                generation,
                retract_first,
                to_terminal,
            } => {
                if retract_first {
                    (self.on_retract)();
                }
                (self.on_detect)(Detection {
                    state: self.state.clone(),
                    session,
                    to_terminal: self.to_terminal.clone(),
                    sender: self.sender.clone(),
                    generation,
                    role,
                });
                if !to_terminal.is_empty() {
                    (self.to_terminal.lock())(&to_terminal);
                }
            }
            Outcome::NotDetected {
                retract,
                send_abort,
                to_terminal,
            } => {
                if send_abort {
                    // 감지 철회 직후의 외톨이 'C'는 피어의 YMODEM 다운그레이드
                    // 시도다. 가망이 없으니 바로 중단을 보낸다
                    debug!("감지 철회 후 'C' 수신, 중단 시퀀스 송신");
                    (self.sender.lock())(&ABORT_SEQUENCE);
                }
                if retract {
                    (self.on_retract)();
                }
                if !to_terminal.is_empty() {
                    (self.to_terminal.lock())(&to_terminal);
                }
            }
        }
        Ok(())
    }

    /// 상태 잠금 안에서 스캔을 수행하고 할 일을 결정한다
    fn scan_locked(&self, input: &[u8]) -> Outcome {
        let mut state = self.state.lock();

        match Self::scan(&mut state.cache, input) {
            Some((session, held_back)) => {
                let role = session.role();
                let same_role = state
                    .parsed
                    .as_ref()
                    .map(|parsed| parsed.lock().role() == role);
                let retract_first = same_role.is_some();

                // 같은 역할의 감지를 갈아끼우는 중이면, 이 바이트들은
                // 직전 후보를 파싱하느라 소비된 것이라 터미널로 보내지
                // 않는다
                let to_terminal = match same_role {
                    Some(true) => Vec::new(),
                    _ => input[..input.len() - held_back].to_vec(),
                };

                let session = Arc::new(Mutex::new(session));
                state.parsed = Some(session.clone());
                state.generation += 1;
                Outcome::Detected {
                    session,
                    role,
                    generation: state.generation,
                    retract_first,
                    to_terminal,
                }
            }
            None => {
                let expired = state.parsed.take();
                let retract = expired.is_some();
                if retract {
                    state.generation += 1;
                }
                Outcome::NotDetected {
                    retract,
                    send_abort: retract && input.len() == 1 && input[0] == b'C',
                    to_terminal: input.to_vec(),
                }
            }
        }
    }

    /// 캐시에 입력을 누적하고 세션 시작을 찾는다
    ///
    /// 성공하면 (세션, 이번 입력 중 헤더에 속한 말미 바이트 수).
    /// 시그니처가 없으면 캐시를 최신 바이트 기준 상한까지만 남긴다.
    /// read 경계에 걸린 시그니처도 캐시 덕분에 다음 호출에서 잡힌다.
    fn scan(cache: &mut Vec<u8>, input: &[u8]) -> Option<(Session, usize)> {
        cache.extend_from_slice(input);

        let Some(at) = find_subarray(cache, &COMMON_HEX_START) else {
            Self::truncate_cache(cache);
            return None;
        };

        let header_span = cache.len() - at;
        cache.drain(..at);

        let Some(session) = Session::parse(cache) else {
            Self::truncate_cache(cache);
            return None;
        };

        // 말미 XON은 파싱 대상이 아니다
        if cache.len() == 1 && cache[0] == XON {
            cache.clear();
        }

        // 헤더 뒤에 바이트가 더 있었다면 세션 시작이 아니다. 이 판정은
        // 송신측이 첫 헤더 하나만 보낸다는 사실에 기댄다
        if !cache.is_empty() {
            return None;
        }

        Some((session, header_span.min(input.len())))
    }

    fn truncate_cache(cache: &mut Vec<u8>) {
        if cache.len() > MAX_HEX_START_CACHE {
            let excess = cache.len() - MAX_HEX_START_CACHE;
            cache.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    struct Harness {
        sentry: Sentry,
        terminal: Arc<Mutex<Vec<u8>>>,
        sent: Arc<Mutex<Vec<u8>>>,
        detections: Arc<Mutex<Vec<Detection>>>,
        retractions: Arc<Mutex<usize>>,
    }

    fn harness() -> Harness {
        let terminal = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let detections = Arc::new(Mutex::new(Vec::new()));
        let retractions = Arc::new(Mutex::new(0));

        let terminal_sink = terminal.clone();
        let sender_sink = sent.clone();
        let detections_sink = detections.clone();
        let retractions_sink = retractions.clone();

        let sentry = Sentry::new(
            move |bytes| terminal_sink.lock().extend_from_slice(bytes),
            move |bytes| sender_sink.lock().extend_from_slice(bytes),
            move |detection| detections_sink.lock().push(detection),
            move || *retractions_sink.lock() += 1,
        );

        Harness {
            sentry,
            terminal,
            sent,
            detections,
            retractions,
        }
    }

    #[test]
    fn test_plain_text_goes_to_terminal() {
        let mut h = harness();
        h.sentry.consume(b"Hello").unwrap();
        assert_eq!(h.terminal.lock().clone(), b"Hello");
        assert!(h.detections.lock().is_empty());
    }

    #[test]
    fn test_zrqinit_detected_without_terminal_leak() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();

        assert_eq!(h.detections.lock().len(), 1);
        assert!(h.terminal.lock().is_empty());

        let detections = h.detections.lock();
        let detection = detections.first().unwrap();
        assert!(detection.is_valid());
        assert_eq!(detection.session_role(), SessionRole::Receive);
    }

    #[test]
    fn test_zrinit_detected_as_send_session() {
        use crate::header::zrinit_flags::{CANFDX, CANOVIO};
        let mut h = harness();
        h.sentry
            .consume(&Header::zrinit(CANFDX | CANOVIO, 0).to_hex())
            .unwrap();

        let detections = h.detections.lock();
        assert_eq!(detections.len(), 1);
        assert_eq!(
            detections.first().unwrap().session_role(),
            SessionRole::Send
        );
    }

    #[test]
    fn test_signature_split_across_reads() {
        let mut h = harness();
        let wire = Header::Zrqinit.to_hex();
        h.sentry.consume(&wire[..9]).unwrap();
        assert!(h.detections.lock().is_empty());
        h.sentry.consume(&wire[9..]).unwrap();
        assert_eq!(h.detections.lock().len(), 1);
        // 첫 조각은 이미 터미널로 나갔고 두 번째 조각은 전부 헤더 몫
        assert_eq!(h.terminal.lock().clone(), wire[..9].to_vec());
    }

    #[test]
    fn test_garbage_prefix_still_reaches_terminal() {
        let mut h = harness();
        let mut input = b"shell$ ".to_vec();
        input.extend_from_slice(&Header::Zrqinit.to_hex());
        h.sentry.consume(&input).unwrap();

        assert_eq!(h.detections.lock().len(), 1);
        assert_eq!(h.terminal.lock().clone(), b"shell$ ");
    }

    #[test]
    fn test_retraction_on_following_garbage() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();
        h.sentry.consume(b"actually just text").unwrap();

        assert_eq!(*h.retractions.lock(), 1);
        assert_eq!(h.terminal.lock().clone(), b"actually just text");
        // 철회된 감지는 더 이상 확인할 수 없다
        let detections = h.detections.lock();
        let detection = detections.first().unwrap();
        assert!(!detection.is_valid());
        assert!(matches!(detection.confirm(), Err(Error::StaleDetection)));
    }

    #[test]
    fn test_stray_c_after_retraction_sends_abort() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();
        h.sentry.consume(b"C").unwrap();

        assert_eq!(*h.retractions.lock(), 1);
        assert_eq!(h.sent.lock().clone(), ABORT_SEQUENCE.to_vec());
    }

    #[test]
    fn test_same_role_replacement_suppresses_terminal_output() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();

        assert_eq!(h.detections.lock().len(), 2);
        assert_eq!(*h.retractions.lock(), 1);
        assert!(h.terminal.lock().is_empty());

        let detections = h.detections.lock();
        assert!(!detections[0].is_valid());
        assert!(detections[1].is_valid());
    }

    #[test]
    fn test_confirmed_session_receives_routed_bytes() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();

        let session = {
            let detections = h.detections.lock();
            detections.first().unwrap().confirm().unwrap()
        };
        assert!(h.sentry.confirmed_session().is_some());

        // 세션 시작: ZRINIT가 sentry의 sender 싱크로 나간다
        session
            .lock()
            .as_receive_mut()
            .unwrap()
            .start()
            .unwrap();
        assert!(!h.sent.lock().is_empty());

        // 세션으로 라우팅되는 garbage는 터미널로 이어진다
        h.sentry.consume(b"motd banner").unwrap();
        assert_eq!(h.terminal.lock().clone(), b"motd banner");
    }

    #[test]
    fn test_deny_sends_abort() {
        let mut h = harness();
        h.sentry.consume(&Header::Zrqinit.to_hex()).unwrap();
        h.detections.lock().first().unwrap().deny();
        assert_eq!(h.sent.lock().clone(), ABORT_SEQUENCE.to_vec());
    }
}
