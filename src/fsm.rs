//! 흐름 제어 상태 기계
//!
//! 상태 하나 + 이벤트 enum + 전이 함수. 콜백 구조체 대신
//! (state, event, pcb) -> (새 상태, 액션 목록) 형태로 모든 전이를
//! 한 곳에서 매치한다. FSM은 큐를 조작하고 Action을 돌려줄 뿐,
//! 실제 송출/전달/보고는 PCB가 수행한다.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::diag;
use crate::frame::{ControlCommand, Frame};
use crate::pcb::Pcb;

/// PCB 역할 (생성 시 고정, 전송 중 전환 불가)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 송신측
    Sender,

    /// 수신측
    Receiver,
}

impl Role {
    /// 역할별 초기 상태
    pub fn initial_state(self) -> State {
        match self {
            Role::Sender => State::Ready,
            Role::Receiver => State::Idle,
        }
    }
}

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// 송신측 대기 (새 전송 가능)
    Ready,

    /// 시작 CTR에 대한 ACK 대기
    WaitStartAck,

    /// SINGLE에 대한 SINGLE_ACK 대기
    WaitSingleAck,

    /// 전 데이터 송출 후 갭 보고 대기
    Sync,

    /// 데이터 프레임 송출 중
    Writing,

    /// 수신측 대기
    Idle,

    /// 데이터 프레임 수신 중
    Reading,

    /// 전 프레임 수신 완료, 지연 프레임 유예 대기
    SyncAck,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// FSM 이벤트
///
/// RECV_*는 input()의 분류 결과, SEND_*는 호출자 요청, Timeout은
/// update()가 데드라인 경과 시 발화한다.
#[derive(Debug)]
pub enum Event {
    SendCtr,
    SendMng(ControlCommand),
    SendSingleCtr,
    RecvAck,
    RecvSingleAck(u8),
    RecvCtr(Frame),
    RecvSingleCtr(Frame),
    RecvData(Frame),
    Timeout,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::SendCtr => "SEND_CTR",
            Event::SendMng(_) => "SEND_MNG",
            Event::SendSingleCtr => "SEND_SINGLE_CTR",
            Event::RecvAck => "RECV_ACK",
            Event::RecvSingleAck(_) => "RECV_SINGLE_ACK",
            Event::RecvCtr(_) => "RECV_CTR",
            Event::RecvSingleCtr(_) => "RECV_SINGLE_CTR",
            Event::RecvData(_) => "RECV_DATA",
            Event::Timeout => "TIMEOUT",
        }
    }
}

/// 전이 부수효과
#[derive(Debug)]
pub enum Action {
    /// 프레임 송출
    Emit(Frame),

    /// 애플리케이션으로 재조립 페이로드 전달
    Deliver(Bytes),

    /// 전송 완료 보고
    Complete,

    /// 전송 실패 보고 (예산 소진)
    Fail(FailReason),

    /// 상대의 UNBOND 수신 보고
    PeerUnbond,
}

/// 전송 실패 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// 제어 핸드쉐이크 재전송 소진
    AckTimeout,

    /// NAK 라운드 소진 (송신측)
    SyncExhausted,

    /// NAK 라운드 소진 (수신측)
    ReadExhausted,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::AckTimeout => write!(f, "제어 ACK 재시도 소진"),
            FailReason::SyncExhausted => write!(f, "송신측 NAK 라운드 소진"),
            FailReason::ReadExhausted => write!(f, "수신측 NAK 라운드 소진"),
        }
    }
}

impl Pcb {
    /// FSM 전이 진입점
    pub(crate) fn dispatch(&mut self, event: Event) -> Vec<Action> {
        // UNBOND 관리 프레임은 상태와 무관하게 즉시 리셋한다
        if let Event::RecvCtr(frame) = &event {
            if frame.payload.is_empty() && frame.value == ControlCommand::Unbond as u8 {
                warn!(conversation = self.conversation_id, "UNBOND 수신, 리셋");
                self.reset();
                return vec![Action::PeerUnbond];
            }
        }
        if let Event::SendMng(cmd) = &event {
            let frame = Frame::mng(*cmd);
            self.reset();
            return vec![Action::Emit(frame)];
        }

        match self.role {
            Role::Sender => self.dispatch_sender(event),
            Role::Receiver => self.dispatch_receiver(event),
        }
    }

    fn dispatch_sender(&mut self, event: Event) -> Vec<Action> {
        match (self.state, event) {
            // 단일 프레임 fast path 시작
            (State::Ready, Event::SendSingleCtr) => {
                self.retries_left = self.cfg.max_nak_loops;
                self.arm_timeout();
                self.state = State::WaitSingleAck;
                match self.snd_queue.peek_front().cloned() {
                    Some(frame) => vec![Action::Emit(frame)],
                    None => vec![],
                }
            }

            // 다중 프레임 경로 시작: 프레임 수를 알리는 CTR
            (State::Ready, Event::SendCtr) => {
                self.retries_left = self.cfg.max_nak_loops;
                self.nak_loops_used = 0;
                self.arm_timeout();
                self.state = State::WaitStartAck;
                vec![Action::Emit(Frame::ctr_start(self.max_frame_count as u8))]
            }

            (State::WaitStartAck, Event::RecvAck) => {
                if self.diag_on(diag::IN_ACK) {
                    debug!(conversation = self.conversation_id, "시작 ACK 수신, 송출 개시");
                }
                self.deadline = None;
                self.write_cursor = 0;
                self.state = State::Writing;
                // 송출은 execute의 pump가 이어받는다
                vec![]
            }

            (State::WaitStartAck, Event::Timeout) => {
                let retry = Frame::ctr_start(self.max_frame_count as u8);
                self.retry_control(retry, FailReason::AckTimeout)
            }

            (State::WaitSingleAck, Event::RecvSingleAck(token)) => {
                if token != self.single_token {
                    // 이전 전송의 늦은 SINGLE_ACK
                    return vec![];
                }
                if self.diag_on(diag::IN_ACK) {
                    debug!(conversation = self.conversation_id, "SINGLE_ACK 수신, 완료");
                }
                self.snd_queue.clear();
                self.deadline = None;
                self.state = State::Ready;
                vec![Action::Complete]
            }

            (State::WaitSingleAck, Event::Timeout) => {
                match self.snd_queue.peek_front().cloned() {
                    Some(frame) => self.retry_control(frame, FailReason::AckTimeout),
                    None => {
                        self.state = State::Ready;
                        vec![]
                    }
                }
            }

            // 갭 보고: SYNC가 정상이지만 수신측 타임아웃이 빠르면
            // WRITING 중에도 도착할 수 있다
            (State::Writing, Event::RecvCtr(frame)) | (State::Sync, Event::RecvCtr(frame)) => {
                self.handle_gap_report(frame)
            }

            // 갭 없음: 전송 완료
            (State::Sync, Event::RecvAck) => {
                if self.diag_on(diag::IN_ACK) {
                    debug!(conversation = self.conversation_id, "무갭 ACK 수신, 전송 완료");
                }
                self.snd_queue.clear();
                self.deadline = None;
                self.nak_loops_used = 0;
                self.state = State::Ready;
                vec![Action::Complete]
            }

            (State::Sync, Event::Timeout) => {
                self.nak_loops_used += 1;
                if self.nak_loops_used > self.cfg.max_nak_loops {
                    self.fail(FailReason::SyncExhausted)
                } else {
                    self.arm_timeout();
                    vec![]
                }
            }

            (state, event) => {
                self.ignore(state, &event);
                vec![]
            }
        }
    }

    fn dispatch_receiver(&mut self, event: Event) -> Vec<Action> {
        match (self.state, event) {
            (State::Idle, Event::RecvCtr(frame)) => self.handle_start(frame),

            // 단일 프레임 fast path: 즉시 전달하고 IDLE 유지
            (State::Idle, Event::RecvSingleCtr(frame)) => {
                if self.last_single_token == Some(frame.value) {
                    // SINGLE_ACK 소실 후 재전송: 재확인만, 재전달 금지
                    self.stats.duplicate_frames += 1;
                    return vec![Action::Emit(Frame::single_ack(frame.value))];
                }
                self.last_single_token = Some(frame.value);
                if self.diag_on(diag::RECV) {
                    debug!(
                        conversation = self.conversation_id,
                        bytes = frame.payload.len(),
                        "단일 프레임 수신, 즉시 전달"
                    );
                }
                vec![
                    Action::Deliver(frame.payload),
                    Action::Emit(Frame::single_ack(frame.value)),
                ]
            }

            (State::Idle, Event::RecvData(_)) => {
                // 이전 전송의 잔여 데이터 프레임
                self.stats.duplicate_frames += 1;
                vec![]
            }

            (State::Reading, Event::RecvData(frame)) => self.handle_data(frame),

            (State::Reading, Event::RecvCtr(frame)) => {
                if frame.payload.is_empty() && frame.value as u16 == self.max_frame_count {
                    // ACK가 소실되어 재전송된 시작 CTR: 재확인
                    self.arm_timeout();
                    vec![Action::Emit(Frame::ack())]
                } else if frame.payload.is_empty() && frame.value >= 2 {
                    // 다른 프레임 수의 새 전송: 기대치 재설정
                    self.handle_start(frame)
                } else {
                    vec![]
                }
            }

            (State::Reading, Event::Timeout) => self.handle_read_timeout(),

            (State::SyncAck, Event::RecvData(_)) => {
                // 유예 중 늦게 도착한 중복
                self.stats.duplicate_frames += 1;
                vec![]
            }

            (State::SyncAck, Event::Timeout) => self.finalize_receive(),

            (State::SyncAck, Event::RecvCtr(frame)) => {
                // 유예 중 새 전송 시작: 현재 것을 먼저 확정한다
                let mut actions = self.finalize_receive();
                actions.extend(self.handle_start(frame));
                actions
            }

            (state, event) => {
                self.ignore(state, &event);
                vec![]
            }
        }
    }

    /// 시작 CTR 처리: 수신 기대치를 세우고 ACK를 돌려준다
    fn handle_start(&mut self, frame: Frame) -> Vec<Action> {
        if !frame.payload.is_empty() || frame.value < 2 {
            // NAK이나 예약 관리 명령은 수신 시작이 아니다
            return vec![];
        }
        self.max_frame_count = frame.value as u16;
        self.rcv_queue.clear();
        self.sync_queue.clear();
        self.nak_loops_used = 0;
        self.nak_round_active = false;
        self.state = State::Reading;
        self.arm_timeout();
        if self.diag_on(diag::RECV) {
            debug!(
                conversation = self.conversation_id,
                frames = self.max_frame_count,
                "다중 프레임 수신 시작"
            );
        }
        vec![Action::Emit(Frame::ack())]
    }

    /// 데이터 프레임 삽입: SN 정렬, 중복은 버림
    fn handle_data(&mut self, frame: Frame) -> Vec<Action> {
        if frame.sn > self.max_frame_count {
            if self.diag_on(diag::IN_DATA) {
                warn!(
                    sn = frame.sn,
                    max = self.max_frame_count,
                    "윈도우 밖 데이터 프레임, 버림"
                );
            }
            return vec![];
        }

        let sn = frame.sn;
        // NAK 라운드 중의 도착분은 sync 큐에 모았다가 병합한다
        let inserted = if self.nak_round_active {
            if self.rcv_queue.contains_sn(sn) {
                false
            } else {
                self.sync_queue.insert_ordered(frame)
            }
        } else {
            self.rcv_queue.insert_ordered(frame)
        };

        if !inserted {
            self.stats.duplicate_frames += 1;
            return vec![];
        }
        if self.diag_on(diag::IN_DATA) {
            debug!(sn, "데이터 프레임 수신");
        }

        if self.missing_now().is_empty() {
            return self.complete_reading();
        }
        vec![]
    }

    /// [1, max_frame_count] 대비 누락 SN (수신 + sync 큐 합산)
    fn missing_now(&self) -> Vec<u16> {
        (1..=self.max_frame_count)
            .filter(|sn| !self.rcv_queue.contains_sn(*sn) && !self.sync_queue.contains_sn(*sn))
            .collect()
    }

    /// 전 프레임 확보: sync 큐를 수신 큐에 병합하고 유예로 전환
    fn complete_reading(&mut self) -> Vec<Action> {
        self.rcv_queue.splice_from(&mut self.sync_queue);
        self.nak_round_active = false;
        self.state = State::SyncAck;
        self.arm_grace();
        if self.diag_on(diag::OUT_ACK) {
            debug!(
                conversation = self.conversation_id,
                frames = self.max_frame_count,
                "전 프레임 수신, ACK 송출"
            );
        }
        vec![Action::Emit(Frame::ack())]
    }

    /// READING 타임아웃: 갭을 계산해 NAK 송출
    fn handle_read_timeout(&mut self) -> Vec<Action> {
        let mut missing = self.missing_now();
        if missing.is_empty() {
            // 마지막 프레임과 타임아웃이 경합한 경우
            return self.complete_reading();
        }

        self.nak_loops_used += 1;
        self.stats.nak_rounds += 1;
        if self.nak_loops_used > self.cfg.max_nak_loops {
            return self.fail(FailReason::ReadExhausted);
        }

        // 한 프레임에 담기는 만큼만 지목하고 나머지는 다음 라운드로
        let cap = (self.cfg.frame_payload() / 2).max(1);
        if missing.len() > cap {
            missing.truncate(cap);
        }

        if self.diag_on(diag::OUT_SYNC) {
            debug!(
                conversation = self.conversation_id,
                round = self.nak_loops_used,
                missing = missing.len(),
                "NAK 송출"
            );
        }
        self.nak_round_active = true;
        self.arm_timeout();
        vec![Action::Emit(Frame::nak(&missing))]
    }

    /// 유예 종료: 수신 큐를 SN 순으로 재조립해 전달
    fn finalize_receive(&mut self) -> Vec<Action> {
        let mut payload = BytesMut::new();
        while let Some(frame) = self.rcv_queue.pop_front() {
            if frame.sn == 0 {
                continue;
            }
            payload.extend_from_slice(&frame.payload);
        }
        self.sync_queue.clear();
        self.deadline = None;
        self.nak_loops_used = 0;
        self.state = State::Idle;
        if self.diag_on(diag::RECV) {
            debug!(
                conversation = self.conversation_id,
                bytes = payload.len(),
                "재조립 완료, 전달"
            );
        }
        vec![Action::Deliver(payload.freeze())]
    }

    /// 갭 보고 처리: 지목된 프레임만 선택 재전송
    fn handle_gap_report(&mut self, frame: Frame) -> Vec<Action> {
        if frame.payload.is_empty() {
            // 시작 CTR의 늦은 중복 등, 송신측에는 의미 없음
            return vec![];
        }

        self.nak_loops_used += 1;
        self.stats.nak_rounds += 1;
        if self.nak_loops_used > self.cfg.max_nak_loops {
            return self.fail(FailReason::SyncExhausted);
        }

        let missing = frame.missing_sns();
        if self.diag_on(diag::IN_SYNC) {
            debug!(
                conversation = self.conversation_id,
                round = self.nak_loops_used,
                missing = missing.len(),
                "갭 보고 수신, 선택 재전송"
            );
        }

        let frames: Vec<Frame> = missing
            .iter()
            .filter_map(|sn| self.snd_queue.iter().find(|f| f.sn == *sn).cloned())
            .collect();
        self.stats.retransmitted_frames += frames.len() as u64;
        self.arm_timeout();
        frames.into_iter().map(Action::Emit).collect()
    }

    /// 제어 프레임 재전송 (핸드쉐이크 타임아웃)
    fn retry_control(&mut self, frame: Frame, reason: FailReason) -> Vec<Action> {
        if self.retries_left == 0 {
            return self.fail(reason);
        }
        self.retries_left -= 1;
        self.stats.retransmitted_frames += 1;
        self.arm_timeout();
        vec![Action::Emit(frame)]
    }

    /// 전송 실패: 큐를 비우고 역할 초기 상태로 복귀
    fn fail(&mut self, reason: FailReason) -> Vec<Action> {
        warn!(
            conversation = self.conversation_id,
            %reason,
            "전송 실패, 초기 상태로 복귀"
        );
        self.reset();
        vec![Action::Fail(reason)]
    }

    fn ignore(&self, state: State, event: &Event) {
        if self.diag_on(diag::INPUT) {
            debug!(%state, event = event.name(), "상태에 맞지 않는 이벤트, 무시");
        }
    }

    pub(crate) fn arm_timeout(&mut self) {
        self.deadline = Some(self.clock + Duration::from_millis(self.cfg.timeout_ms));
    }

    fn arm_grace(&mut self) {
        self.deadline = Some(self.clock + Duration::from_millis(self.cfg.grace_ms));
    }
}
