//! 송신 PCB ↔ 수신 PCB 종단 간 전송 테스트
//!
//! MemoryLink로 양방향 링크를 만들고 update_at으로 시간을 수동 진행시켜
//! 타임아웃/NAK 경로를 결정적으로 구동한다.

use std::time::{Duration, Instant};

use bytes::Bytes;
use snp::frame;
use snp::link::{FailingSink, LossyLink, MemoryLink};
use snp::{Config, FrameKind, Notify, Pcb, Role, State};

const TIMEOUT_MS: u64 = 500;
const GRACE_MS: u64 = 100;

fn test_config(mtu: usize, max_nak_loops: u32) -> Config {
    Config {
        mtu,
        timeout_ms: TIMEOUT_MS,
        grace_ms: GRACE_MS,
        max_nak_loops,
        ..Config::default()
    }
}

/// 테스트 하네스: 링크 양쪽에 PCB 하나씩
struct Harness {
    sender: Pcb,
    receiver: Pcb,
    /// 송신측 출력이 쌓이는 곳 (수신측으로 갈 프레임)
    to_receiver: MemoryLink,
    /// 수신측 출력이 쌓이는 곳 (송신측으로 갈 프레임)
    to_sender: MemoryLink,
    now: Instant,
}

impl Harness {
    fn new(cfg: Config) -> Self {
        let to_receiver = MemoryLink::new();
        let to_sender = MemoryLink::new();

        let mut sender = Pcb::with_config(1, Role::Sender, cfg.clone()).unwrap();
        sender.set_output(Box::new(to_receiver.clone()));
        let mut receiver = Pcb::with_config(1, Role::Receiver, cfg).unwrap();
        receiver.set_output(Box::new(to_sender.clone()));

        Self {
            sender,
            receiver,
            to_receiver,
            to_sender,
            now: Instant::now(),
        }
    }

    /// 쌓인 프레임을 빈 큐가 될 때까지 상대 PCB로 전달
    fn pump(&mut self) {
        loop {
            let mut moved = false;
            for frame in self.to_receiver.drain() {
                let _ = self.receiver.input(&frame);
                moved = true;
            }
            for frame in self.to_sender.drain() {
                let _ = self.sender.input(&frame);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    /// 시간을 진행시키고 양쪽 update 후 프레임 전달
    fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
        let _ = self.sender.update_at(self.now);
        let _ = self.receiver.update_at(self.now);
        self.pump();
    }

    fn take_delivered(&mut self) -> Option<Bytes> {
        while let Some(notify) = self.receiver.poll_notify() {
            if let Notify::Delivered(data) = notify {
                return Some(data);
            }
        }
        None
    }

    fn sender_notify(&mut self) -> Option<Notify> {
        self.sender.poll_notify()
    }
}

fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn single_frame_completes_in_one_round_trip() {
    let mut h = Harness::new(test_config(247, 6));
    let payload = patterned_payload(100);

    h.sender.send(&payload).unwrap();
    h.pump();

    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
    assert!(matches!(h.sender_notify(), Some(Notify::Completed)));
    assert_eq!(h.sender.state(), State::Ready);
    assert_eq!(h.receiver.state(), State::Idle);

    // 왕복 1회: 양쪽 각 1프레임
    assert_eq!(h.sender.stats().frames_sent, 1);
    assert_eq!(h.receiver.stats().frames_sent, 1);
}

#[test]
fn single_frame_path_boundary_is_mtu_minus_header() {
    // mtu - 4 바이트까지는 단일 프레임
    let mut h = Harness::new(test_config(20, 6));
    h.sender.send(&patterned_payload(16)).unwrap();
    h.pump();
    assert_eq!(h.sender.stats().frames_sent, 1);
    assert!(h.take_delivered().is_some());

    // 1바이트 초과부터 다중 프레임 경로
    let mut h = Harness::new(test_config(20, 6));
    h.sender.send(&patterned_payload(17)).unwrap();
    let start = h.to_receiver.drain();
    assert_eq!(start.len(), 1);
    assert_eq!(start[0][2], FrameKind::Control as u8);
    assert_eq!(start[0][3], 2); // ceil(17 / 16)
}

#[test]
fn multi_frame_round_trip_in_order() {
    let mut h = Harness::new(test_config(20, 6));
    let payload = patterned_payload(100); // 7 프레임

    h.sender.send(&payload).unwrap();
    h.pump();

    // 수신측은 전 프레임 확보 후 유예가 끝나야 전달한다
    assert_eq!(h.receiver.state(), State::SyncAck);
    assert!(h.take_delivered().is_none());
    assert!(matches!(h.sender_notify(), Some(Notify::Completed)));

    h.advance(GRACE_MS + 10);
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
    assert_eq!(h.receiver.state(), State::Idle);
}

#[test]
fn sixty_bytes_mtu_20_reassembles_after_out_of_order_arrival() {
    // 60바이트, mtu 20, 헤더 4 -> ceil(60/16) = 4 프레임
    let cfg = test_config(20, 6);
    let payload = patterned_payload(60);
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();

    // 시작 CTR이 4 프레임을 알린다
    let start = h.to_receiver.drain();
    assert_eq!(start[0][3], 4);
    h.receiver.input(&start[0]).unwrap();

    // ACK -> 송신측이 데이터 4개를 송출
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }
    let data = h.to_receiver.drain();
    assert_eq!(data.len(), 4);

    // 2, 3, 4를 먼저 먹인다
    for frame in &data[1..] {
        h.receiver.input(frame).unwrap();
    }
    assert_eq!(h.receiver.state(), State::Reading);

    // 타임아웃 -> NAK 라운드 1회: 누락은 1번뿐
    h.now += Duration::from_millis(TIMEOUT_MS + 10);
    h.receiver.update_at(h.now).unwrap();
    let naks = h.to_sender.drain();
    assert_eq!(naks.len(), 1);
    let nak = frame::decode(&naks[0], 16).unwrap();
    assert_eq!(nak.missing_sns(), vec![1]);

    // 마지막으로 1번 도착 -> 전 프레임 확보
    h.receiver.input(&data[0]).unwrap();
    assert_eq!(h.receiver.state(), State::SyncAck);

    // 유예가 끝나면 원본 60바이트가 순서대로 나온다
    h.now += Duration::from_millis(GRACE_MS + 10);
    h.receiver.update_at(h.now).unwrap();
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
}

#[test]
fn reordered_arrival_reassembles_exactly() {
    let cfg = test_config(20, 6);
    let payload = patterned_payload(80); // 5 프레임
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }
    let mut data = h.to_receiver.drain();
    assert_eq!(data.len(), 5);

    // 역순 도착
    data.reverse();
    for frame in &data {
        h.receiver.input(frame).unwrap();
    }

    h.advance(GRACE_MS + 10);
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
}

#[test]
fn nak_retransmits_only_named_frames() {
    let cfg = test_config(20, 6);
    let payload = patterned_payload(80); // 5 프레임
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }

    // 2번과 4번을 링크에서 떨어뜨린다
    let data = h.to_receiver.drain();
    for frame in &data {
        let sn = u16::from_le_bytes([frame[0], frame[1]]);
        if sn != 2 && sn != 4 {
            h.receiver.input(frame).unwrap();
        }
    }

    // NAK 라운드: 2, 4만 지목
    h.now += Duration::from_millis(TIMEOUT_MS + 10);
    h.receiver.update_at(h.now).unwrap();
    let naks = h.to_sender.drain();
    let nak = frame::decode(&naks[0], 16).unwrap();
    assert_eq!(nak.missing_sns(), vec![2, 4]);

    // 선택 재전송: 지목된 프레임만 다시 나온다 (go-back-N 아님)
    h.sender.input(&naks[0]).unwrap();
    let retx = h.to_receiver.drain();
    assert_eq!(retx.len(), 2);
    let sns: Vec<u16> = retx
        .iter()
        .map(|f| u16::from_le_bytes([f[0], f[1]]))
        .collect();
    assert_eq!(sns, vec![2, 4]);
    assert_eq!(h.sender.stats().retransmitted_frames, 2);

    // 복구 완료 후 원본과 일치
    for frame in &retx {
        h.receiver.input(frame).unwrap();
    }
    h.advance(GRACE_MS + 10);
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
    assert!(matches!(h.sender_notify(), Some(Notify::Completed)));
}

#[test]
fn duplicate_data_frames_do_not_corrupt_payload_or_counters() {
    let cfg = test_config(20, 6);
    let payload = patterned_payload(60);
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }

    // 모든 데이터 프레임을 두 번씩 먹인다
    let data = h.to_receiver.drain();
    for frame in &data {
        h.receiver.input(frame).unwrap();
        let _ = h.receiver.input(frame);
    }

    assert_eq!(h.receiver.stats().duplicate_frames, data.len() as u64);
    assert!(h.receiver.queue_counters_consistent());
    let (_, rcv_len, sync_len) = h.receiver.queue_lens();
    assert_eq!(rcv_len + sync_len, data.len());

    h.advance(GRACE_MS + 10);
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);
}

#[test]
fn lost_single_ack_does_not_deliver_twice() {
    let cfg = test_config(20, 6);
    let payload = patterned_payload(10);
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();
    let single = h.to_receiver.drain();
    h.receiver.input(&single[0]).unwrap();
    assert_eq!(h.take_delivered().unwrap().as_ref(), &payload[..]);

    // SINGLE_ACK 소실
    let _ = h.to_sender.drain();

    // 송신측 타임아웃 -> SINGLE 재전송
    h.now += Duration::from_millis(TIMEOUT_MS + 10);
    h.sender.update_at(h.now).unwrap();
    let retry = h.to_receiver.drain();
    assert_eq!(retry.len(), 1);

    // 수신측은 재확인만 하고 재전달하지 않는다
    h.receiver.input(&retry[0]).unwrap();
    assert!(h.take_delivered().is_none());
    assert_eq!(h.receiver.stats().duplicate_frames, 1);

    // 재전송된 ACK로 송신측 완료
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }
    assert!(matches!(h.sender_notify(), Some(Notify::Completed)));
}

#[test]
fn missing_frame_exhausts_nak_rounds_on_both_sides() {
    // 4 프레임 중 3번이 절대 도착하지 않는다, max_nak_loops = 2
    let cfg = test_config(20, 2);
    let payload = patterned_payload(60);
    let mut h = Harness::new(cfg);

    h.sender.send(&payload).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }
    for frame in h.to_receiver.drain() {
        let sn = u16::from_le_bytes([frame[0], frame[1]]);
        if sn != 3 {
            h.receiver.input(&frame).unwrap();
        }
    }

    // 재시도 라운드를 전부 소진할 때까지 시간 진행.
    // 3번 프레임은 매 라운드 링크에서 떨어뜨린다.
    let mut receiver_failed = false;
    let mut sender_failed = false;
    for _ in 0..12 {
        h.now += Duration::from_millis(TIMEOUT_MS + 10);
        let _ = h.sender.update_at(h.now);
        let _ = h.receiver.update_at(h.now);
        for nak in h.to_sender.drain() {
            let _ = h.sender.input(&nak);
        }
        for frame in h.to_receiver.drain() {
            let sn = u16::from_le_bytes([frame[0], frame[1]]);
            if sn != 3 {
                let _ = h.receiver.input(&frame);
            }
        }

        while let Some(notify) = h.receiver.poll_notify() {
            match notify {
                Notify::Failed(_) => receiver_failed = true,
                Notify::Delivered(_) => panic!("부분 전달이 발생함"),
                _ => {}
            }
        }
        while let Some(notify) = h.sender.poll_notify() {
            if matches!(notify, Notify::Failed(_)) {
                sender_failed = true;
            }
        }
        if receiver_failed && sender_failed {
            break;
        }
    }

    assert!(receiver_failed, "수신측 실패 보고 없음");
    assert!(sender_failed, "송신측 실패 보고 없음");
    assert_eq!(h.sender.state(), State::Ready);
    assert_eq!(h.receiver.state(), State::Idle);
    assert_eq!(h.receiver.queue_lens(), (0, 0, 0));
}

#[test]
fn transport_error_fails_after_retries() {
    let mut pcb = Pcb::with_config(1, Role::Sender, test_config(20, 3)).unwrap();
    pcb.set_output(Box::new(FailingSink));

    // 첫 송출부터 실패가 호출자에게 전파된다
    assert!(pcb.send(&patterned_payload(10)).is_err());
    assert_eq!(pcb.state(), State::WaitSingleAck);

    // 타임아웃 재시도 예산 안에서 종결된다
    let mut now = Instant::now();
    let mut failed = false;
    for _ in 0..8 {
        now += Duration::from_millis(TIMEOUT_MS + 10);
        let _ = pcb.update_at(now);
        while let Some(notify) = pcb.poll_notify() {
            if matches!(notify, Notify::Failed(_)) {
                failed = true;
            }
        }
        if failed {
            break;
        }
    }
    assert!(failed);
    assert_eq!(pcb.state(), State::Ready);
}

#[test]
fn unbond_resets_receiver_mid_transfer() {
    let cfg = test_config(20, 6);
    let mut h = Harness::new(cfg);

    h.sender.send(&patterned_payload(60)).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    assert_eq!(h.receiver.state(), State::Reading);

    h.sender.send_unbond().unwrap();
    assert_eq!(h.sender.state(), State::Ready);
    for frame in h.to_receiver.drain() {
        let _ = h.receiver.input(&frame);
    }

    assert_eq!(h.receiver.state(), State::Idle);
    assert_eq!(h.receiver.queue_lens(), (0, 0, 0));
    let mut saw_unbond = false;
    while let Some(notify) = h.receiver.poll_notify() {
        if matches!(notify, Notify::PeerUnbond) {
            saw_unbond = true;
        }
    }
    assert!(saw_unbond);
}

#[test]
fn peek_size_reports_pending_bytes_while_reading() {
    let cfg = test_config(20, 6);
    let mut h = Harness::new(cfg);

    assert_eq!(h.receiver.peek_size(), snp::PendingData::NoData);

    h.sender.send(&patterned_payload(60)).unwrap();
    let start = h.to_receiver.drain();
    h.receiver.input(&start[0]).unwrap();
    for ack in h.to_sender.drain() {
        h.sender.input(&ack).unwrap();
    }

    // 처음 두 프레임만 도착한 시점
    let data = h.to_receiver.drain();
    h.receiver.input(&data[0]).unwrap();
    h.receiver.input(&data[1]).unwrap();
    assert_eq!(h.receiver.peek_size(), snp::PendingData::Ready(32));
}

#[test]
fn lossy_link_converges_with_retries() {
    let cfg = Config {
        mtu: 64,
        timeout_ms: 100,
        grace_ms: 40,
        max_nak_loops: 60,
        ..Config::default()
    };
    let payload = patterned_payload(2000); // 34 프레임

    let to_receiver = MemoryLink::new();
    let to_sender = MemoryLink::new();

    let mut sender = Pcb::with_config(1, Role::Sender, cfg.clone()).unwrap();
    // 송신 -> 수신 방향만 20% 손실 + 10% 중복
    sender.set_output(Box::new(LossyLink::new(to_receiver.clone(), 0.2, 0.1)));
    let mut receiver = Pcb::with_config(1, Role::Receiver, cfg).unwrap();
    receiver.set_output(Box::new(to_sender.clone()));

    sender.send(&payload).unwrap();

    let mut now = Instant::now();
    let mut delivered: Option<Bytes> = None;
    'outer: for _ in 0..400 {
        now += Duration::from_millis(60);
        let _ = sender.update_at(now);
        let _ = receiver.update_at(now);
        loop {
            let mut moved = false;
            for frame in to_receiver.drain() {
                let _ = receiver.input(&frame);
                moved = true;
            }
            for frame in to_sender.drain() {
                let _ = sender.input(&frame);
                moved = true;
            }
            if !moved {
                break;
            }
        }
        while let Some(notify) = receiver.poll_notify() {
            if let Notify::Delivered(data) = notify {
                delivered = Some(data);
                break 'outer;
            }
        }
    }

    let delivered = delivered.expect("손실 링크에서 수렴 실패");
    assert_eq!(delivered.as_ref(), &payload[..]);
    assert!(receiver.queue_counters_consistent());
    assert!(receiver.stats().duplicate_frames > 0 || receiver.stats().nak_rounds > 0);
}
