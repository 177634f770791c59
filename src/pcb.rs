//! 패킷 제어 블록 (PCB)
//!
//! 큐 3개, 스크래치 버퍼, 설정, 출력 싱크를 소유하는 연결 단위 상태.
//! 코어는 스레드/타이머를 만들지 않는다: input()은 전송이 바이트를 줄 때,
//! update()는 호출자 주기에 맞춰 동기로 불린다. &mut self가 단일 쓰기
//! 주체를 강제하므로 별도 동기화는 없다.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::Config;
use crate::diag;
use crate::error::{Error, Result};
use crate::frame::{self, ControlCommand, Frame, FrameKind};
use crate::fsm::{Action, Event, FailReason, Role, State};
use crate::link::FrameSink;
use crate::queue::{PendingData, SegmentQueue};
use crate::stats::TransferStats;
use crate::{MAX_FRAME_COUNT, PKT_HEADER_LEN};

/// 애플리케이션 통지
///
/// 실패를 포함한 모든 종결은 여기로 보고된다. 조용한 탈락은 없다.
#[derive(Debug)]
pub enum Notify {
    /// 재조립 완료된 수신 페이로드
    Delivered(Bytes),

    /// 전송 완료 (송신측)
    Completed,

    /// 전송 실패 (재시도/NAK 예산 소진)
    Failed(FailReason),

    /// 상대의 UNBOND 관리 프레임 수신
    PeerUnbond,
}

/// 패킷 제어 블록
pub struct Pcb {
    /// 연결(대화) 식별자
    pub(crate) conversation_id: u32,

    /// 역할 (생성 시 고정)
    pub(crate) role: Role,

    /// 현재 FSM 상태
    pub(crate) state: State,

    /// 송신 큐
    pub(crate) snd_queue: SegmentQueue,

    /// 수신 큐
    pub(crate) rcv_queue: SegmentQueue,

    /// 갭 복구 대기 큐
    pub(crate) sync_queue: SegmentQueue,

    /// 인코딩 스크래치 버퍼, (mtu + 4) * 3. PCB 밖으로 나가지 않는다.
    pub(crate) buffer: Vec<u8>,

    /// 설정
    pub(crate) cfg: Config,

    /// 현재 전송의 프레임 수
    pub(crate) max_frame_count: u16,

    /// 출력 싱크
    pub(crate) output: Option<Box<dyn FrameSink>>,

    /// 마지막 관측 시각. update가 갱신하고, input은 이 값 기준으로
    /// 데드라인을 건다.
    pub(crate) clock: Instant,

    /// 현재 대기 상태의 데드라인
    pub(crate) deadline: Option<Instant>,

    /// 핸드쉐이크 재전송 잔여 횟수
    pub(crate) retries_left: u32,

    /// 이번 전송에서 소비한 NAK 라운드 수
    pub(crate) nak_loops_used: u32,

    /// WRITING 송출 커서 (송신 큐 인덱스)
    pub(crate) write_cursor: usize,

    /// NAK 라운드 진행 중 여부 (재전송 도착분은 sync 큐로)
    pub(crate) nak_round_active: bool,

    /// 단일 프레임 전송 토큰 (송신측, 전송마다 증가)
    pub(crate) single_token: u8,

    /// 마지막으로 전달한 단일 프레임 토큰 (수신측 중복 억제)
    pub(crate) last_single_token: Option<u8>,

    /// 통지 큐 (poll_notify로 소비)
    pub(crate) notifies: VecDeque<Notify>,

    /// 통계
    pub(crate) stats: TransferStats,
}

impl Pcb {
    /// 새 PCB 생성. MTU는 최대값으로 시작한다.
    ///
    /// 스크래치 버퍼 할당 실패는 Error::Allocation (PCB 레코드 자체가 아니라
    /// 버퍼 할당의 실패).
    pub fn create(conversation_id: u32, role: Role) -> Result<Self> {
        Self::with_config(conversation_id, role, Config::default())
    }

    /// 설정을 지정해 PCB 생성
    pub fn with_config(conversation_id: u32, role: Role, cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let buf_len = (cfg.mtu + PKT_HEADER_LEN) * 3;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(buf_len)
            .map_err(|_| Error::Allocation { requested: buf_len })?;

        Ok(Self {
            conversation_id,
            role,
            state: role.initial_state(),
            snd_queue: SegmentQueue::new(),
            rcv_queue: SegmentQueue::new(),
            sync_queue: SegmentQueue::new(),
            buffer,
            cfg,
            max_frame_count: 1,
            output: None,
            clock: Instant::now(),
            deadline: None,
            retries_left: 0,
            nak_loops_used: 0,
            write_cursor: 0,
            nak_round_active: false,
            single_token: 0,
            last_single_token: None,
            notifies: VecDeque::new(),
            stats: TransferStats::new(),
        })
    }

    /// PCB 해제: 큐 3개를 비우고 버퍼를 반환하며 설정을 0으로 만든다.
    ///
    /// 이미 비어 있는 PCB에 다시 호출해도 안전하다.
    pub fn release(&mut self) {
        self.snd_queue.clear();
        self.rcv_queue.clear();
        self.sync_queue.clear();
        self.buffer = Vec::new();
        self.cfg.mtu = 0;
        self.cfg.timeout_ms = 0;
        self.cfg.grace_ms = 0;
        self.cfg.max_nak_loops = 0;
        self.cfg.log_mask = 0;
        self.max_frame_count = 0;
        self.output = None;
        self.deadline = None;
        self.notifies.clear();
    }

    /// MTU 설정. [PKT_HEADER_LEN, MAX_ATT_PAYLOAD] 밖이면 기존 값을 유지한다.
    ///
    /// 거부는 mtu() 읽기로 확인한다.
    pub fn set_mtu(&mut self, mtu: usize) {
        if mtu < PKT_HEADER_LEN || mtu > crate::MAX_ATT_PAYLOAD {
            warn!(
                conversation = self.conversation_id,
                mtu, "MTU 범위 밖, 무시"
            );
            return;
        }
        let need = (mtu + PKT_HEADER_LEN) * 3;
        if self.buffer.try_reserve_exact(need).is_err() {
            warn!(
                conversation = self.conversation_id,
                need, "스크래치 버퍼 확장 실패, MTU 유지"
            );
            return;
        }
        self.cfg.mtu = mtu;
    }

    /// 현재 유효 MTU
    pub fn mtu(&self) -> usize {
        self.cfg.mtu
    }

    /// 전송-쓰기 능력 설치. 송신 경로 사용 전 필수.
    pub fn set_output(&mut self, sink: Box<dyn FrameSink>) {
        self.output = Some(sink);
    }

    /// 인바운드 전송 바이트 입력 지점
    ///
    /// 디코딩 실패 프레임은 버려지고 FSM 상태는 변하지 않는다.
    pub fn input(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = match frame::decode(bytes, self.cfg.frame_payload()) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.decode_errors += 1;
                if self.diag_on(diag::INPUT) {
                    warn!(
                        conversation = self.conversation_id,
                        error = %e,
                        "프레임 디코딩 실패, 버림"
                    );
                }
                return Err(Error::Decode(e));
            }
        };

        self.stats.frames_received += 1;
        if self.diag_on(diag::INPUT) {
            debug!(
                conversation = self.conversation_id,
                sn = frame.sn,
                kind = ?frame.kind,
                len = frame.payload.len(),
                "프레임 수신"
            );
        }

        let event = match self.classify(frame) {
            Some(event) => event,
            None => return Ok(()),
        };
        let actions = self.dispatch(event);
        self.execute(actions)
    }

    /// 디코딩된 프레임을 FSM 이벤트로 분류
    fn classify(&mut self, frame: Frame) -> Option<Event> {
        match frame.kind {
            FrameKind::Ack => Some(Event::RecvAck),
            FrameKind::SingleAck => Some(Event::RecvSingleAck(frame.value)),
            FrameKind::Single => Some(Event::RecvSingleCtr(frame)),
            FrameKind::Control => Some(Event::RecvCtr(frame)),
            FrameKind::Data => {
                if frame.sn == 0 {
                    // SN 0 데이터 프레임은 규격 위반
                    self.stats.decode_errors += 1;
                    if self.diag_on(diag::IN_DATA) {
                        warn!(
                            conversation = self.conversation_id,
                            "SN 0 데이터 프레임, 버림"
                        );
                    }
                    None
                } else {
                    Some(Event::RecvData(frame))
                }
            }
            // decode에서 이미 걸러진다
            FrameKind::Invalid => None,
        }
    }

    /// 페이로드 전송 시작 (송신 역할 전용)
    ///
    /// 한 프레임에 들어가면 SINGLE fast path, 아니면 CTR/ACK 윈도우 경로.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.output.is_none() {
            return Err(Error::NoOutput);
        }
        if self.state != State::Ready {
            return Err(Error::NotReady { state: self.state });
        }

        let per = self.cfg.frame_payload();
        let max_bytes = per * MAX_FRAME_COUNT as usize;
        if payload.len() > max_bytes {
            return Err(Error::BufferOverflow {
                len: payload.len(),
                max: max_bytes,
            });
        }

        let event = if payload.len() <= per {
            self.single_token = self.single_token.wrapping_add(1);
            self.max_frame_count = 1;
            self.snd_queue.clear();
            self.snd_queue.push_back(Frame::single(
                self.single_token,
                Bytes::copy_from_slice(payload),
            ));
            Event::SendSingleCtr
        } else {
            self.snd_queue.clear();
            let mut sn: u16 = 1;
            for part in payload.chunks(per) {
                self.snd_queue.push_back(Frame::data(sn, Bytes::copy_from_slice(part)));
                sn += 1;
            }
            self.max_frame_count = sn - 1;
            Event::SendCtr
        };

        if self.diag_on(diag::SEND) {
            debug!(
                conversation = self.conversation_id,
                bytes = payload.len(),
                frames = self.max_frame_count,
                "전송 시작"
            );
        }

        let actions = self.dispatch(event);
        self.execute(actions)
    }

    /// 관리 프레임(UNBOND) 송신. 진행 중 전송은 버려진다.
    pub fn send_unbond(&mut self) -> Result<()> {
        if self.output.is_none() {
            return Err(Error::NoOutput);
        }
        let actions = self.dispatch(Event::SendMng(ControlCommand::Unbond));
        self.execute(actions)
    }

    /// 타임아웃/재시도 구동. 호출자가 주기적으로 불러야 한다.
    pub fn update(&mut self) -> Result<()> {
        self.update_at(Instant::now())
    }

    /// 주입된 시각 기준 update (테스트에서 시간을 제어할 때 사용)
    pub fn update_at(&mut self, now: Instant) -> Result<()> {
        self.clock = now;

        // WRITING 재개: 남은 데이터 프레임 송출
        if self.state == State::Writing {
            return self.pump_writes();
        }

        let due = matches!(self.deadline, Some(d) if now >= d);
        if !due {
            return Ok(());
        }
        self.deadline = None;

        let actions = self.dispatch(Event::Timeout);
        self.execute(actions)
    }

    /// 다음 통지 꺼내기
    pub fn poll_notify(&mut self) -> Option<Notify> {
        self.notifies.pop_front()
    }

    /// 수신 큐 헤드 기준 전달 대기 데이터 길이
    pub fn peek_size(&self) -> PendingData {
        self.rcv_queue.total_pending_length(self.max_frame_count)
    }

    /// 진행 중 전송 취소: 큐를 비우고 역할 초기 상태로 복귀.
    /// 어느 상태에서 불러도 안전하다.
    pub fn reset(&mut self) {
        self.snd_queue.clear();
        self.rcv_queue.clear();
        self.sync_queue.clear();
        self.state = self.role.initial_state();
        self.deadline = None;
        self.write_cursor = 0;
        self.nak_round_active = false;
        self.nak_loops_used = 0;
        self.retries_left = 0;
        self.max_frame_count = 1;
    }

    /// 현재 FSM 상태
    pub fn state(&self) -> State {
        self.state
    }

    /// 역할
    pub fn role(&self) -> Role {
        self.role
    }

    /// 연결 식별자
    pub fn conversation_id(&self) -> u32 {
        self.conversation_id
    }

    /// 통계
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 큐 3개의 (send, receive, sync) 길이
    pub fn queue_lens(&self) -> (usize, usize, usize) {
        (
            self.snd_queue.len(),
            self.rcv_queue.len(),
            self.sync_queue.len(),
        )
    }

    /// 큐 카운터 불변식 검사 (카운터 == 실제 길이, 3개 큐 모두)
    pub fn queue_counters_consistent(&self) -> bool {
        self.snd_queue.counter_consistent()
            && self.rcv_queue.counter_consistent()
            && self.sync_queue.counter_consistent()
    }

    /// FSM 액션 실행: 송출/전달/보고
    pub(crate) fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut result = Ok(());
        for action in actions {
            match action {
                Action::Emit(frame) => {
                    if let Err(e) = self.emit(&frame) {
                        // 첫 에러만 보존하고 남은 액션은 계속 처리
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                Action::Deliver(bytes) => {
                    self.stats.delivered_bytes += bytes.len() as u64;
                    self.notifies.push_back(Notify::Delivered(bytes));
                }
                Action::Complete => {
                    self.stats.completed_transfers += 1;
                    self.notifies.push_back(Notify::Completed);
                }
                Action::Fail(reason) => {
                    self.stats.failed_transfers += 1;
                    self.notifies.push_back(Notify::Failed(reason));
                }
                Action::PeerUnbond => {
                    self.notifies.push_back(Notify::PeerUnbond);
                }
            }
        }

        // WRITING 진입 직후에는 바로 송출을 시작한다
        if self.state == State::Writing {
            let pumped = self.pump_writes();
            if result.is_ok() {
                result = pumped;
            }
        }
        result
    }

    /// WRITING 상태에서 송신 큐의 데이터 프레임을 커서 순서대로 내보낸다
    ///
    /// 송출 실패 시 커서가 그대로 남아 다음 update에서 재개된다.
    fn pump_writes(&mut self) -> Result<()> {
        while self.state == State::Writing {
            let next_frame = self.snd_queue.iter().nth(self.write_cursor).cloned();
            let frame = match next_frame {
                Some(frame) => frame,
                None => {
                    // 전부 송출: 갭 보고 대기로 전환
                    self.state = State::Sync;
                    self.arm_timeout();
                    if self.diag_on(diag::OUT_SYNC) {
                        debug!(
                            conversation = self.conversation_id,
                            frames = self.max_frame_count,
                            "데이터 송출 완료, SYNC 대기"
                        );
                    }
                    break;
                }
            };
            if let Err(e) = self.emit(&frame) {
                // 전송 에러는 로컬 타임아웃과 동일하게 재시도 예산에서 차감한다
                self.nak_loops_used += 1;
                if self.nak_loops_used > self.cfg.max_nak_loops {
                    self.stats.failed_transfers += 1;
                    self.notifies
                        .push_back(Notify::Failed(FailReason::SyncExhausted));
                    self.reset();
                }
                return Err(e);
            }
            self.write_cursor += 1;
            if self.diag_on(diag::OUT_DATA) {
                debug!(sn = frame.sn, "데이터 프레임 송출");
            }
        }
        Ok(())
    }

    /// 프레임 1개를 인코딩해 싱크로 송출
    ///
    /// 전송 에러는 호출자에 전파되고, 미도달 프레임은 타임아웃 경로의
    /// 재시도 예산 안에서 복구된다.
    pub(crate) fn emit(&mut self, frame: &Frame) -> Result<()> {
        let sink = self.output.as_mut().ok_or(Error::NoOutput)?;
        let n = frame::encode_into(frame, self.cfg.mtu, &mut self.buffer);
        match sink.write(&self.buffer[..n]) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                if diag::enabled(self.cfg.log_mask, diag::OUTPUT) {
                    debug!(
                        conversation = self.conversation_id,
                        sn = frame.sn,
                        kind = ?frame.kind,
                        bytes = n,
                        "프레임 송출"
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    conversation = self.conversation_id,
                    error = %e,
                    "프레임 송출 실패"
                );
                Err(Error::Transport(e))
            }
        }
    }

    pub(crate) fn diag_on(&self, category: u16) -> bool {
        diag::enabled(self.cfg.log_mask, category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::MAX_ATT_PAYLOAD;

    #[test]
    fn test_create_defaults() {
        let pcb = Pcb::create(1, Role::Sender).unwrap();
        assert_eq!(pcb.mtu(), MAX_ATT_PAYLOAD);
        assert_eq!(pcb.state(), State::Ready);
        assert_eq!(pcb.queue_lens(), (0, 0, 0));

        let pcb = Pcb::create(2, Role::Receiver).unwrap();
        assert_eq!(pcb.state(), State::Idle);
    }

    #[test]
    fn test_set_mtu_rejection_readback() {
        let mut pcb = Pcb::create(1, Role::Sender).unwrap();
        let before = pcb.mtu();

        pcb.set_mtu(PKT_HEADER_LEN - 1);
        assert_eq!(pcb.mtu(), before);

        pcb.set_mtu(MAX_ATT_PAYLOAD + 1);
        assert_eq!(pcb.mtu(), before);

        pcb.set_mtu(20);
        assert_eq!(pcb.mtu(), 20);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pcb = Pcb::create(1, Role::Sender).unwrap();
        pcb.release();
        assert_eq!(pcb.mtu(), 0);
        assert_eq!(pcb.queue_lens(), (0, 0, 0));
        // 빈 PCB에 중복 해제
        pcb.release();
        assert_eq!(pcb.queue_lens(), (0, 0, 0));
    }

    #[test]
    fn test_send_requires_output() {
        let mut pcb = Pcb::create(1, Role::Sender).unwrap();
        assert!(matches!(pcb.send(&[1, 2, 3]), Err(Error::NoOutput)));
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let cfg = Config {
            mtu: 20,
            ..Config::default()
        };
        let mut pcb = Pcb::with_config(1, Role::Sender, cfg).unwrap();
        pcb.set_output(Box::new(MemoryLink::new()));

        let too_big = vec![0u8; 16 * MAX_FRAME_COUNT as usize + 1];
        assert!(matches!(
            pcb.send(&too_big),
            Err(Error::BufferOverflow { .. })
        ));
        assert_eq!(pcb.state(), State::Ready);
    }

    #[test]
    fn test_send_rejected_while_in_flight() {
        let mut pcb = Pcb::create(1, Role::Sender).unwrap();
        pcb.set_output(Box::new(MemoryLink::new()));

        pcb.send(&[1, 2, 3]).unwrap();
        assert_eq!(pcb.state(), State::WaitSingleAck);
        assert!(matches!(pcb.send(&[4, 5]), Err(Error::NotReady { .. })));
    }

    #[test]
    fn test_input_discards_undecodable_bytes() {
        let mut pcb = Pcb::create(1, Role::Receiver).unwrap();
        let state_before = pcb.state();

        assert!(pcb.input(&[1, 2]).is_err());
        assert!(pcb.input(&[0, 0, 0xEE, 0]).is_err());

        assert_eq!(pcb.state(), state_before);
        assert_eq!(pcb.stats().decode_errors, 2);
        assert_eq!(pcb.queue_lens(), (0, 0, 0));
    }
}
