//! # SNP (Segmented Notification Protocol)
//!
//! 소형 프레임 알림 채널 위의 신뢰성 세그먼트 전송 프로토콜
//!
//! ## 핵심 특징
//! - **4바이트 헤더**: SN(2) + type(1) + value(1), 와이어는 리틀엔디언 고정
//! - **단일 프레임 fast path**: SINGLE / SINGLE_ACK 1왕복으로 완료
//! - **윈도우 전송**: CTR/ACK 핸드쉐이크 후 DATA 프레임 순차 송출
//! - **NAK 선택 재전송**: 누락 SN만 지목해 복구 (go-back-N 아님)
//! - **FSM 구동**: 상태 + 이벤트 + 전이 함수, 내부 스레드/타이머 없음
//! - **역할 고정**: 송신(READY) / 수신(IDLE)은 PCB 생성 시 결정

pub mod config;
pub mod diag;
pub mod error;
pub mod frame;
pub mod fsm;
pub mod link;
pub mod pcb;
pub mod queue;
pub mod stats;

pub use config::Config;
pub use error::{DecodeError, Error, Result, TransportError};
pub use frame::{ControlCommand, Frame, FrameKind};
pub use fsm::{FailReason, Role, State};
pub use link::{ChannelSink, FrameSink, LossyLink, MemoryLink};
pub use pcb::{Notify, Pcb};
pub use queue::{PendingData, SegmentQueue};
pub use stats::TransferStats;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 와이어 헤더 길이 (바이트)
pub const PKT_HEADER_LEN: usize = 4;

/// ATT 알림 페이로드 상한 (바이트)
pub const MAX_ATT_PAYLOAD: usize = 247;

/// 전송당 최대 데이터 프레임 수 (시작 CTR의 value 바이트 한계)
pub const MAX_FRAME_COUNT: u8 = u8::MAX;
