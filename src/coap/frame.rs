//! # Frame Templates
//!
//! A [`Frame`] is one CoAP message serialized exactly once through
//! `coap-lite` and then mutated in place for every subsequent send. Only two
//! fields ever change: the 16-bit message ID at bytes 2..4 and, for
//! notifications, the value of the Observe option.
//!
//! ## Mutation Rules
//!
//! - [`Frame::next_mid`] increments byte 3 and carries into byte 2 when it
//!   wraps. The buffer length never changes.
//! - [`Frame::next_notification`] bumps the message ID and then the Observe
//!   value. The value is a variable-length big-endian integer of 0 to 3
//!   bytes, so a carry out of the most significant byte grows the option by
//!   one byte and rewrites its length nibble. A 3-byte value that overflows
//!   collapses to a zero-length option and the frame is marked exhausted:
//!   every later call returns [`FrameError::ObserveExhausted`].

use std::net::SocketAddr;

use coap_lite::{CoapOption, CoapRequest, MessageClass, MessageType, Packet, ResponseType};

use super::{decode_uint, encode_uint, find_option, Method, TargetUri, CODE_NOT_FOUND, HEADER_LEN, OPTION_OBSERVE};
use crate::error::{BenchError, FrameError};

/// Largest Observe value that fits the 3-byte option.
pub const MAX_OBSERVE: u32 = 0x00FF_FFFF;

/// A reusable, mutable CoAP message.
#[derive(Clone, Debug)]
pub struct Frame {
    bytes: Vec<u8>,
    /// Offset of the Observe option's header byte.
    observe_offset: Option<usize>,
    exhausted: bool,
}

impl Frame {
    /// Wrap an already-serialized CoAP message.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let tkl = (bytes[0] & 0x0F) as usize;
        if bytes.len() < HEADER_LEN + tkl {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let observe_offset = find_option(&bytes, OPTION_OBSERVE).map(|(header, _, _)| header);
        Ok(Self {
            bytes,
            observe_offset,
            exhausted: false,
        })
    }

    /// Serialize a request for `uri` once.
    ///
    /// The message ID starts at zero and the token is empty; the benchmark
    /// matches responses by message ID alone.
    pub fn request_template(
        method: Method,
        uri: &TargetUri,
        payload: Option<&[u8]>,
        confirmable: bool,
    ) -> Result<Self, BenchError> {
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(method.into());
        request.set_path(uri.path());
        for query in uri.query() {
            request
                .message
                .add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
        }
        request.message.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        if let Some(payload) = payload {
            request.message.payload = payload.to_vec();
        }

        let bytes = request
            .message
            .to_bytes()
            .map_err(|e| BenchError::Codec(format!("{:?}", e)))?;
        Ok(Self::from_bytes(bytes)?)
    }

    /// Serialize a 2.05 Content notification carrying `token` and an Observe
    /// option seeded at `start_seq`.
    pub fn notification_template(
        token: &[u8],
        start_seq: u32,
        confirmable: bool,
    ) -> Result<Self, BenchError> {
        let mut packet = Packet::new();
        packet.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.set_token(token.to_vec());
        packet.add_option(CoapOption::Observe, encode_uint(start_seq.min(MAX_OBSERVE)));

        let bytes = packet
            .to_bytes()
            .map_err(|e| BenchError::Codec(format!("{:?}", e)))?;
        let frame = Self::from_bytes(bytes)?;
        if frame.observe_offset.is_none() {
            return Err(FrameError::MissingObserve.into());
        }
        Ok(frame)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn message_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn set_message_id(&mut self, mid: u16) {
        let [hi, lo] = mid.to_be_bytes();
        self.bytes[2] = hi;
        self.bytes[3] = lo;
    }

    pub fn token(&self) -> &[u8] {
        let tkl = (self.bytes[0] & 0x0F) as usize;
        &self.bytes[HEADER_LEN..HEADER_LEN + tkl]
    }

    /// Increment the message ID and return the frame.
    #[inline]
    pub fn next_mid(&mut self) -> &[u8] {
        self.bytes[3] = self.bytes[3].wrapping_add(1);
        if self.bytes[3] == 0 {
            self.bytes[2] = self.bytes[2].wrapping_add(1);
        }
        &self.bytes
    }

    /// Current Observe value, `None` for frames without the option.
    pub fn observe_value(&self) -> Option<u32> {
        let offset = self.observe_offset?;
        let len = (self.bytes[offset] & 0x0F) as usize;
        Some(decode_uint(&self.bytes[offset + 1..offset + 1 + len]))
    }

    /// Length in bytes of the Observe value, `None` without the option.
    pub fn observe_len(&self) -> Option<usize> {
        self.observe_offset
            .map(|offset| (self.bytes[offset] & 0x0F) as usize)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Advance to the next notification: new message ID, Observe value + 1.
    pub fn next_notification(&mut self) -> Result<&[u8], FrameError> {
        let offset = self.observe_offset.ok_or(FrameError::MissingObserve)?;
        if self.exhausted {
            return Err(FrameError::ObserveExhausted);
        }
        self.next_mid();

        let len = (self.bytes[offset] & 0x0F) as usize;
        let start = offset + 1;
        for i in (start..start + len).rev() {
            self.bytes[i] = self.bytes[i].wrapping_add(1);
            if self.bytes[i] != 0 {
                return Ok(&self.bytes);
            }
        }

        // Every value byte carried out.
        if len >= 3 {
            self.bytes.drain(start..start + len);
            self.bytes[offset] &= 0xF0;
            self.exhausted = true;
            return Err(FrameError::ObserveExhausted);
        }
        self.bytes.insert(start, 0x01);
        self.bytes[offset] = (self.bytes[offset] & 0xF0) | (len as u8 + 1);
        Ok(&self.bytes)
    }

    /// Build the "4.04 Not Found" frame that ends an observe relationship:
    /// the header and token of the next notification, without options.
    pub fn deregistration_frame(&mut self) -> Vec<u8> {
        self.next_mid();
        let end = HEADER_LEN + self.token().len();
        let mut frame = self.bytes[..end].to_vec();
        frame[1] = CODE_NOT_FOUND;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{CODE_CONTENT, CODE_GET};

    fn request() -> Frame {
        let uri = TargetUri::parse("coap://127.0.0.1:5683/benchmark").unwrap();
        Frame::request_template(Method::Get, &uri, None, true).unwrap()
    }

    #[test]
    fn test_request_template_layout() {
        let frame = request();
        assert_eq!(frame.bytes()[0] & 0xC0, 0x40);
        assert_eq!(frame.bytes()[1], CODE_GET);
        assert_eq!(frame.message_id(), 0);
        assert!(frame.token().is_empty());
        assert!(frame.observe_value().is_none());
    }

    #[test]
    fn test_next_mid_counts_from_zero() {
        let mut frame = request();
        let len = frame.len();
        for n in 1..=70_000u32 {
            frame.next_mid();
            assert_eq!(frame.message_id(), (n % 65_536) as u16);
        }
        assert_eq!(frame.len(), len);
    }

    #[test]
    fn test_next_mid_byte_carry_and_wrap() {
        let mut frame = request();
        frame.set_message_id(255);
        let bytes = frame.next_mid();
        assert_eq!((bytes[2], bytes[3]), (1, 0));
        assert_eq!(frame.message_id(), 256);

        frame.set_message_id(65_535);
        frame.next_mid();
        assert_eq!(frame.message_id(), 0);
    }

    #[test]
    fn test_notification_template() {
        let frame = Frame::notification_template(&[1, 2, 3, 4], 1, true).unwrap();
        assert_eq!(frame.bytes()[1], CODE_CONTENT);
        assert_eq!(frame.token(), &[1, 2, 3, 4]);
        assert_eq!(frame.observe_value(), Some(1));
        assert_eq!(frame.observe_len(), Some(1));
    }

    #[test]
    fn test_observe_grows_from_one_to_two_bytes() {
        let mut frame = Frame::notification_template(&[9, 9], 0xFF, false).unwrap();
        let before = frame.len();
        let mid = frame.message_id();

        frame.next_notification().unwrap();
        assert_eq!(frame.observe_value(), Some(0x0100));
        assert_eq!(frame.observe_len(), Some(2));
        assert_eq!(frame.len(), before + 1);
        assert_eq!(frame.message_id(), mid.wrapping_add(1));
    }

    #[test]
    fn test_observe_grows_from_empty_and_two_bytes() {
        let mut frame = Frame::notification_template(&[], 0, true).unwrap();
        assert_eq!(frame.observe_len(), Some(0));
        frame.next_notification().unwrap();
        assert_eq!(frame.observe_value(), Some(1));

        let mut frame = Frame::notification_template(&[], 0xFFFF, true).unwrap();
        frame.next_notification().unwrap();
        assert_eq!(frame.observe_value(), Some(0x10000));
        assert_eq!(frame.observe_len(), Some(3));
    }

    #[test]
    fn test_observe_exhaustion_is_terminal() {
        let mut frame = Frame::notification_template(&[7], MAX_OBSERVE, true).unwrap();
        let before = frame.len();

        assert_eq!(frame.next_notification(), Err(FrameError::ObserveExhausted));
        assert!(frame.is_exhausted());
        assert_eq!(frame.observe_len(), Some(0));
        assert_eq!(frame.len(), before - 3);

        let mid = frame.message_id();
        assert_eq!(frame.next_notification(), Err(FrameError::ObserveExhausted));
        assert_eq!(frame.message_id(), mid);
    }

    #[test]
    fn test_next_notification_requires_observe() {
        let mut frame = request();
        assert_eq!(frame.next_notification(), Err(FrameError::MissingObserve));
    }

    #[test]
    fn test_deregistration_frame() {
        let mut frame = Frame::notification_template(&[1, 2, 3, 4], 5, true).unwrap();
        let mid = frame.message_id();
        let dereg = frame.deregistration_frame();
        assert_eq!(dereg.len(), HEADER_LEN + 4);
        assert_eq!(dereg[1], CODE_NOT_FOUND);
        assert_eq!(&dereg[4..], &[1, 2, 3, 4]);
        assert_eq!(u16::from_be_bytes([dereg[2], dereg[3]]), mid.wrapping_add(1));
    }

    #[test]
    fn test_from_bytes_rejects_truncated() {
        assert_eq!(Frame::from_bytes(vec![0x40, 0x01]).unwrap_err(), FrameError::Truncated(2));
        assert!(Frame::from_bytes(vec![0x42, 0x01, 0, 0, 0xAA]).is_err());
    }
}
