//! 전송 통계

use std::time::{Duration, Instant};

/// PCB 단위 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 송신 프레임 수 (재전송 포함)
    pub frames_sent: u64,

    /// 수신 프레임 수 (디코딩 성공 기준)
    pub frames_received: u64,

    /// 재전송 프레임 수
    pub retransmitted_frames: u64,

    /// 중복 수신으로 버린 프레임 수
    pub duplicate_frames: u64,

    /// NAK 라운드 수
    pub nak_rounds: u64,

    /// 디코딩 실패 수
    pub decode_errors: u64,

    /// 완료된 전송 수
    pub completed_transfers: u64,

    /// 실패한 전송 수 (예산 소진)
    pub failed_transfers: u64,

    /// 애플리케이션에 전달한 총 바이트
    pub delivered_bytes: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_sent: 0,
            frames_received: 0,
            retransmitted_frames: 0,
            duplicate_frames: 0,
            nak_rounds: 0,
            decode_errors: 0,
            completed_transfers: 0,
            failed_transfers: 0,
            delivered_bytes: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전달 기준 처리율 (bytes/sec)
    pub fn delivery_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.delivered_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Transfers: {} ok, {} failed | Frames: {} sent, {} recv | Retx: {} | Dup: {} | NAK rounds: {} | Delivered: {} bytes",
            self.elapsed().as_secs_f64(),
            self.completed_transfers,
            self.failed_transfers,
            self.frames_sent,
            self.frames_received,
            self.retransmitted_frames,
            self.duplicate_frames,
            self.nak_rounds,
            self.delivered_bytes,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
