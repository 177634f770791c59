//! 프레임 정의와 와이어 코덱
//!
//! - 제어 프레임: SN 0, value 바이트가 명령/개수
//! - 데이터 프레임: SN 1 이상, 페이로드 최대 mtu - 4
//!
//! ```text
//! |<------- 4 bytes Header ------->|
//! +--------+--------+------+-------+
//! |   SN (LE u16)   | type | value |
//! +--------+--------+------+-------+
//! |      payload (<= mtu - 4)      |
//! +--------------------------------+
//! ```
//!
//! 와이어 바이트 순서는 호스트와 무관하게 항상 리틀엔디언이다.
//! 디코딩은 all-or-nothing: 부분 프레임은 절대 반환하지 않는다.

use bytes::{Bytes, BytesMut};

use crate::error::DecodeError;
use crate::PKT_HEADER_LEN;

/// 프레임 타입 (헤더 type 바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// 제어 프레임 (시작 CTR / NAK 갭 보고 / 관리)
    Control = 0,

    /// 다중 프레임 전송 확인
    Ack = 1,

    /// 데이터 프레임
    Data = 2,

    /// 단일 프레임 전송 확인
    SingleAck = 3,

    /// 단일 프레임 (fast path)
    Single = 4,

    /// 디코딩 불가 타입 (와이어에 나가지 않음)
    Invalid = 5,
}

impl FrameKind {
    /// type 바이트에서 변환
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => FrameKind::Control,
            1 => FrameKind::Ack,
            2 => FrameKind::Data,
            3 => FrameKind::SingleAck,
            4 => FrameKind::Single,
            _ => FrameKind::Invalid,
        }
    }
}

/// 관리 제어 프레임 명령 (value 바이트)
///
/// 시작 CTR의 value는 프레임 수(2 이상)이므로 명령 값과 겹치지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    /// 데이터 전송 (예약)
    Data = 0,

    /// 연결 해제 요청
    Unbond = 1,
}

/// 전송 단위 프레임 (세그먼트)
///
/// 송출 이후에는 불변. kind에 따라 value(제어) 또는 payload(데이터) 중
/// 하나만 의미를 가진다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 시퀀스 번호 (0 = 제어 프레임)
    pub sn: u16,

    /// 프레임 타입
    pub kind: FrameKind,

    /// command/value 바이트
    pub value: u8,

    /// 페이로드
    pub payload: Bytes,
}

impl Frame {
    /// 다중 전송 시작 CTR 프레임 (value = 전체 프레임 수)
    pub fn ctr_start(frame_count: u8) -> Self {
        Self {
            sn: 0,
            kind: FrameKind::Control,
            value: frame_count,
            payload: Bytes::new(),
        }
    }

    /// 다중 전송 ACK
    pub fn ack() -> Self {
        Self {
            sn: 0,
            kind: FrameKind::Ack,
            value: 0,
            payload: Bytes::new(),
        }
    }

    /// 갭 보고(NAK) CTR 프레임
    ///
    /// payload에 누락 SN 목록을 LE u16 연속으로 싣는다.
    pub fn nak(missing: &[u16]) -> Self {
        let mut buf = BytesMut::with_capacity(missing.len() * 2);
        for sn in missing {
            buf.extend_from_slice(&sn.to_le_bytes());
        }
        Self {
            sn: 0,
            kind: FrameKind::Control,
            value: missing.len() as u8,
            payload: buf.freeze(),
        }
    }

    /// 관리 프레임
    pub fn mng(cmd: ControlCommand) -> Self {
        Self {
            sn: 0,
            kind: FrameKind::Control,
            value: cmd as u8,
            payload: Bytes::new(),
        }
    }

    /// 데이터 프레임
    pub fn data(sn: u16, payload: Bytes) -> Self {
        Self {
            sn,
            kind: FrameKind::Data,
            value: 0,
            payload,
        }
    }

    /// 단일 프레임 (token은 재전송 중복 식별용)
    pub fn single(token: u8, payload: Bytes) -> Self {
        Self {
            sn: 0,
            kind: FrameKind::Single,
            value: token,
            payload,
        }
    }

    /// 단일 ACK (token 에코)
    pub fn single_ack(token: u8) -> Self {
        Self {
            sn: 0,
            kind: FrameKind::SingleAck,
            value: token,
            payload: Bytes::new(),
        }
    }

    /// 제어 프레임 여부 (SN 0)
    pub fn is_control(&self) -> bool {
        self.sn == 0
    }

    /// NAK payload에서 누락 SN 목록 복원
    pub fn missing_sns(&self) -> Vec<u16> {
        self.payload
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    /// 와이어 길이 (헤더 + 페이로드)
    pub fn wire_len(&self) -> usize {
        PKT_HEADER_LEN + self.payload.len()
    }
}

/// 프레임을 버퍼에 인코딩하고 기록한 길이를 반환
///
/// 페이로드는 mtu - 4로 잘린다. 버퍼는 PCB 소유 스크래치이며
/// 호출 스택 밖으로 나가지 않는다.
pub fn encode_into(frame: &Frame, mtu: usize, buf: &mut Vec<u8>) -> usize {
    let cap = mtu.saturating_sub(PKT_HEADER_LEN);
    let take = frame.payload.len().min(cap);

    buf.clear();
    buf.extend_from_slice(&frame.sn.to_le_bytes());
    buf.push(frame.kind as u8);
    buf.push(frame.value);
    buf.extend_from_slice(&frame.payload[..take]);
    buf.len()
}

/// 바이트에서 프레임 디코딩
///
/// max_payload는 수신측 한도(mtu - 4). 초과분은 PayloadTooLarge로 거부한다.
pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Frame, DecodeError> {
    if bytes.len() < PKT_HEADER_LEN {
        return Err(DecodeError::Truncated {
            got: bytes.len(),
            expected: PKT_HEADER_LEN,
        });
    }

    let payload_len = bytes.len() - PKT_HEADER_LEN;
    if payload_len > max_payload {
        return Err(DecodeError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let kind = FrameKind::from_byte(bytes[2]);
    if kind == FrameKind::Invalid {
        return Err(DecodeError::UnknownType { type_byte: bytes[2] });
    }

    Ok(Frame {
        sn: u16::from_le_bytes([bytes[0], bytes[1]]),
        kind,
        value: bytes[3],
        payload: Bytes::copy_from_slice(&bytes[PKT_HEADER_LEN..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame::data(7, Bytes::from(vec![1, 2, 3, 4, 5]));
        let mut buf = Vec::new();
        let n = encode_into(&frame, 20, &mut buf);

        assert_eq!(n, PKT_HEADER_LEN + 5);
        let restored = decode(&buf[..n], 16).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn test_wire_order_is_little_endian() {
        let frame = Frame::data(0x0102, Bytes::new());
        let mut buf = Vec::new();
        encode_into(&frame, 20, &mut buf);

        // SN 하위 바이트가 먼저
        assert_eq!(&buf[..4], &[0x02, 0x01, 2, 0]);
    }

    #[test]
    fn test_decode_truncated() {
        let err = decode(&[0, 0, 1], 100).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { got: 3, expected: 4 });
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode(&[0, 0, 0xFF, 0], 100).unwrap_err();
        assert_eq!(err, DecodeError::UnknownType { type_byte: 0xFF });
    }

    #[test]
    fn test_decode_payload_too_large() {
        let bytes = [0u8; 24]; // 페이로드 20 bytes
        let err = decode(&bytes, 16).unwrap_err();
        assert_eq!(err, DecodeError::PayloadTooLarge { len: 20, max: 16 });
    }

    #[test]
    fn test_encode_truncates_to_mtu() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; 100]));
        let mut buf = Vec::new();
        let n = encode_into(&frame, 20, &mut buf);
        assert_eq!(n, 20);
    }

    #[test]
    fn test_nak_missing_list_roundtrip() {
        let frame = Frame::nak(&[3, 7, 250]);
        assert_eq!(frame.value, 3);
        assert!(frame.is_control());

        let mut buf = Vec::new();
        let n = encode_into(&frame, 64, &mut buf);
        let restored = decode(&buf[..n], 60).unwrap();
        assert_eq!(restored.missing_sns(), vec![3, 7, 250]);
    }
}
