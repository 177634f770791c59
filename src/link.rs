//! 전송 어댑터 경계
//!
//! 코어는 `FrameSink::write` 하나만 소비한다. 실제 링크(UDP, BLE notify 등)는
//! 바깥에서 공급되고, 여기서는 테스트/데모용 링크 구현을 제공한다.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// 전송-쓰기 능력 (코어가 소비)
///
/// 프레임 1개가 write 1회. 실패는 호출자에게 그대로 전파되고
/// 재시도 예산 안에서 타임아웃 경로로 복구된다.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// 공유 인메모리 프레임 큐 링크 (테스트 하네스)
///
/// clone한 핸들끼리 같은 큐를 본다. write가 쌓고 drain이 꺼낸다.
#[derive(Clone, Default)]
pub struct MemoryLink {
    frames: Arc<Mutex<VecDeque<Bytes>>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 쌓인 프레임을 전부 꺼낸다
    pub fn drain(&self) -> Vec<Bytes> {
        self.frames.lock().drain(..).collect()
    }

    /// 대기 중인 프레임 수
    pub fn pending(&self) -> usize {
        self.frames.lock().len()
    }
}

impl FrameSink for MemoryLink {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.frames.lock().push_back(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

/// 손실/중복 주입 링크 (MemoryLink 래퍼)
pub struct LossyLink {
    inner: MemoryLink,

    /// 프레임 소실 확률 (0.0 ~ 1.0)
    pub drop_rate: f64,

    /// 프레임 중복 확률 (0.0 ~ 1.0)
    pub dup_rate: f64,
}

impl LossyLink {
    pub fn new(inner: MemoryLink, drop_rate: f64, dup_rate: f64) -> Self {
        Self {
            inner,
            drop_rate,
            dup_rate,
        }
    }
}

impl FrameSink for LossyLink {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.drop_rate {
            // 링크에서 소실된 것으로 취급
            return Ok(());
        }
        self.inner.write(frame)?;
        if rng.gen::<f64>() < self.dup_rate {
            self.inner.write(frame)?;
        }
        Ok(())
    }
}

/// tokio unbounded 채널로 내보내는 싱크
///
/// unbounded send는 동기 호출이므로 코어의 동기 write 계약과 맞는다.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| TransportError::Closed)
    }
}

/// 항상 실패하는 싱크 (전송 에러 경로 테스트용)
pub struct FailingSink;

impl FrameSink for FailingSink {
    fn write(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}
