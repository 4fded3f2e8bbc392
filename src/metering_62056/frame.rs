//! Frame handling on top of the raw byte stream.
//!
//! [`FrameDetector`] collects inbound bytes into a sliding window and reports
//! a frame as soon as one of the terminators shows up at its end:
//!
//! 1. `ACK`
//! 2. `ETX` followed by the block check character
//! 3. `STX`
//! 4. `CR LF`, unless the bytes are the echo of the last sent frame
//!
//! [`OutFrame`] holds the last command sent to the meter.

use super::transport::Transport;
use super::utils::{self, format_hex_ascii_pretty, ACK, CR, ETX, LF, SOH, STX};
use super::Iec62056ParseError;
use log::{error, trace};
use std::time::{Duration, Instant};

pub const MAX_IN_BUF_SIZE: usize = 128;
pub const MAX_OUT_BUF_SIZE: usize = 128;

/// Max. time spent in one receive call, keeps the scheduler tick short.
pub const RECEIVE_BUDGET: Duration = Duration::from_millis(15);

/// 84 NULs at 300 bps take ~2.24s
pub const BATTERY_WAKEUP_SIZE: usize = 84;

pub const ID_REQUEST: [u8; 5] = [b'/', b'?', b'!', CR, LF];

pub struct OutFrame {
    buf: [u8; MAX_OUT_BUF_SIZE],
    len: usize,
}

impl OutFrame {
    pub fn new() -> Self {
        OutFrame { buf: [0; MAX_OUT_BUF_SIZE], len: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn build_id_request(&mut self) {
        self.buf[..ID_REQUEST.len()].copy_from_slice(&ID_REQUEST);
        self.len = ID_REQUEST.len();
    }

    pub fn build_battery_wakeup(&mut self) {
        self.buf[..BATTERY_WAKEUP_SIZE].fill(0);
        self.len = BATTERY_WAKEUP_SIZE;
    }

    /// Option select message: `ACK 0 Z 1 CR LF`, 1 is programming mode
    pub fn build_option_select(&mut self, baud_rate_char: u8) {
        let frame = [ACK, b'0', baud_rate_char, b'1', CR, LF];
        self.buf[..frame.len()].copy_from_slice(&frame);
        self.len = frame.len();
    }

    /// `SOH <cmd> <type> STX <data> ETX BCC`, the BCC covers everything after SOH
    pub fn build_command(&mut self, cmd: u8, cmd_type: u8, data: &[u8]) -> Result<(), Iec62056ParseError> {
        let size = data.len() + 6;
        if size > MAX_OUT_BUF_SIZE {
            return Err(Iec62056ParseError::FrameTooLarge(size));
        }

        let mut n = 0;
        for b in [SOH, cmd, cmd_type, STX] {
            self.buf[n] = b;
            n += 1;
        }
        self.buf[n..n + data.len()].copy_from_slice(data);
        n += data.len();
        self.buf[n] = ETX;
        n += 1;

        self.buf[n] = utils::update_bcc(0, &self.buf[1..n]);
        self.len = n + 1;
        Ok(())
    }

    /// `SOH R1 STX <obis>() ETX BCC`
    pub fn build_readout_command(&mut self, obis: &str) -> Result<(), Iec62056ParseError> {
        let mut data = Vec::with_capacity(obis.len() + 2);
        data.extend_from_slice(obis.as_bytes());
        data.extend_from_slice(b"()");
        self.build_command(b'R', b'1', &data)
    }

    /// `SOH P1 STX (<password>) ETX BCC`
    pub fn build_password(&mut self, password: &str) -> Result<(), Iec62056ParseError> {
        let mut data = Vec::with_capacity(password.len() + 2);
        data.push(b'(');
        data.extend_from_slice(password.as_bytes());
        data.push(b')');
        self.build_command(b'P', b'1', &data)
    }
}

impl Default for OutFrame {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FrameDetector {
    buf: [u8; MAX_IN_BUF_SIZE],
    len: usize,
    /// Running block check, restarted on every STX
    bcc: u8,
    /// Block check character received after the last ETX
    received_bcc: u8,
}

impl FrameDetector {
    pub fn new() -> Self {
        FrameDetector { buf: [0; MAX_IN_BUF_SIZE], len: 0, bcc: 0, received_bcc: 0 }
    }

    /// Bytes of the last completed frame
    pub fn frame(&self, size: usize) -> &[u8] {
        &self.buf[..size.min(MAX_IN_BUF_SIZE)]
    }

    pub fn received_bcc(&self) -> u8 {
        self.received_bcc
    }

    pub fn bcc(&self) -> u8 {
        self.bcc
    }

    pub fn reset_bcc(&mut self) {
        self.bcc = 0;
    }

    /// Adds the first `size` bytes of the buffer to the running block check.
    pub fn accumulate(&mut self, size: usize) {
        let size = size.min(MAX_IN_BUF_SIZE);
        self.bcc = utils::update_bcc(self.bcc, &self.buf[..size]);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends one byte, dropping the oldest one once the buffer is full.
    pub fn push(&mut self, b: u8) {
        if self.len < MAX_IN_BUF_SIZE {
            self.buf[self.len] = b;
            self.len += 1;
        } else {
            self.buf.copy_within(1.., 0);
            self.buf[MAX_IN_BUF_SIZE - 1] = b;
        }
    }

    /// Checks the terminators after a new byte. Returns the frame size or 0.
    pub fn check_terminator(&mut self, last_sent: &mut OutFrame) -> usize {
        let n = self.len;
        if n == 0 {
            return 0;
        }

        if self.buf[n - 1] == ACK {
            trace!("RX: {}", format_hex_ascii_pretty(&self.buf[..n]));
            trace!("Detected ACK");
            return self.complete();
        }

        // it is not possible to have CR LF and ETX in buffer at one time
        if n >= 2 && self.buf[n - 2] == ETX {
            trace!("RX: {}", format_hex_ascii_pretty(&self.buf[..n]));
            self.received_bcc = self.buf[n - 1];
            trace!("Detected ETX, BCC: 0x{:02x}", self.received_bcc);
            return self.complete();
        }

        if self.buf[n - 1] == STX {
            trace!("RX: {}", format_hex_ascii_pretty(&self.buf[..n]));
            trace!("Detected STX");
            self.reset_bcc();
            return self.complete();
        }

        if n >= 2 && self.buf[n - 2] == CR && self.buf[n - 1] == LF {
            trace!("RX: {}", format_hex_ascii_pretty(&self.buf[..n]));

            if self.buf[..n] == *last_sent.as_slice() {
                trace!("Echo. Ignore frame.");
                last_sent.clear();
                self.len = 0;
                return 0;
            }

            return self.complete();
        }

        0
    }

    fn complete(&mut self) -> usize {
        let size = self.len;
        self.len = 0;
        size
    }

    /// Pulls bytes from the transport until a frame is complete, the input
    /// runs dry or `budget` is used up.
    pub fn receive<T: Transport>(&mut self, transport: &mut T, last_sent: &mut OutFrame, budget: Duration) -> usize {
        let start = Instant::now();

        loop {
            match transport.available() {
                Ok(0) => return 0,
                Ok(_) => {}
                Err(e) => {
                    error!("Unable to query serial input: {e}");
                    return 0;
                }
            }

            if start.elapsed() > budget {
                return 0;
            }

            let b = match transport.read_byte() {
                Ok(Some(b)) => b,
                Ok(None) => return 0,
                Err(e) => {
                    error!("Unable to read from serial port: {e}");
                    return 0;
                }
            };

            self.push(b);
            let size = self.check_terminator(last_sent);
            if size > 0 || self.len == 0 {
                // frame or dropped echo
                return size;
            }
        }
    }
}

impl Default for FrameDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_62056::transport::mock::MockTransport;

    fn feed_all(det: &mut FrameDetector, out: &mut OutFrame, data: &[u8]) -> Vec<usize> {
        let mut sizes = Vec::new();
        for b in data {
            det.push(*b);
            sizes.push(det.check_terminator(out));
        }
        sizes
    }

    #[test]
    fn test_readout_command() {
        let mut out = OutFrame::new();
        out.build_readout_command("0F0880FF").unwrap();
        let expected: [u8; 16] = [SOH, b'R', b'1', STX, b'0', b'F', b'0', b'8', b'8', b'0', b'F', b'F', b'(', b')', ETX, 0x15];
        assert_eq!(out.as_slice(), &expected);
    }

    #[test]
    fn test_password_frame() {
        let mut out = OutFrame::new();
        out.build_password("00000000").unwrap();
        let expected: [u8; 16] = [SOH, b'P', b'1', STX, b'(', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b')', ETX, 0x61];
        assert_eq!(out.as_slice(), &expected);
    }

    #[test]
    fn test_checksum_round_trip() {
        let mut out = OutFrame::new();
        for obis in ["0F0880FF", "1-0:1.8.1*255", "", "C.1.0"] {
            out.build_readout_command(obis).unwrap();
            let frame = out.as_slice();
            let bcc = frame[frame.len() - 1];
            assert_eq!(utils::update_bcc(0, &frame[1..frame.len() - 1]), bcc);
        }
    }

    #[test]
    fn test_command_too_large() {
        let mut out = OutFrame::new();
        let obis = "A".repeat(MAX_OUT_BUF_SIZE);
        assert!(matches!(out.build_readout_command(&obis), Err(Iec62056ParseError::FrameTooLarge(_))));
    }

    #[test]
    fn test_fixed_frames() {
        let mut out = OutFrame::new();
        out.build_id_request();
        assert_eq!(out.as_slice(), b"/?!\r\n");
        out.build_option_select(b'5');
        assert_eq!(out.as_slice(), &[ACK, b'0', b'5', b'1', CR, LF]);
        out.build_battery_wakeup();
        assert_eq!(out.len(), BATTERY_WAKEUP_SIZE);
        assert!(out.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_detect_ack() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        assert_eq!(feed_all(&mut det, &mut out, &[0x15, ACK]), vec![0, 2]);
        assert_eq!(det.frame(2), &[0x15, ACK]);
    }

    #[test]
    fn test_detect_etx_bcc() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let sizes = feed_all(&mut det, &mut out, b"1(2)\x03\x7f");
        assert_eq!(sizes, vec![0, 0, 0, 0, 0, 6]);
        assert_eq!(det.received_bcc(), 0x7f);
    }

    #[test]
    fn test_detect_stx_resets_bcc() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        det.push(b'x');
        det.accumulate(1);
        assert_eq!(det.bcc(), b'x');
        det.clear();
        assert_eq!(feed_all(&mut det, &mut out, &[SOH, b'P', b'0', STX]), vec![0, 0, 0, 4]);
        assert_eq!(det.bcc(), 0);
    }

    #[test]
    fn test_detect_crlf() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let sizes = feed_all(&mut det, &mut out, b"/ABC5\r\n");
        assert_eq!(sizes, vec![0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(det.frame(7), b"/ABC5\r\n");
    }

    #[test]
    fn test_no_terminator() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let sizes = feed_all(&mut det, &mut out, b"garbage\r");
        assert!(sizes.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_echo_suppression() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        out.build_id_request();
        let sizes = feed_all(&mut det, &mut out, b"/?!\r\n");
        assert_eq!(sizes, vec![0, 0, 0, 0, 0]);
        assert!(out.is_empty());

        // the real answer after the echo is reported
        let sizes = feed_all(&mut det, &mut out, b"/ABC5\r\n");
        assert_eq!(sizes[6], 7);
    }

    #[test]
    fn test_sliding_window() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let garbage = vec![b'x'; MAX_IN_BUF_SIZE * 2];
        let sizes = feed_all(&mut det, &mut out, &garbage);
        assert!(sizes.iter().all(|s| *s == 0));

        // terminator is still visible with a full buffer
        let sizes = feed_all(&mut det, &mut out, b"\r\n");
        assert_eq!(sizes, vec![0, MAX_IN_BUF_SIZE]);
        let frame = det.frame(MAX_IN_BUF_SIZE);
        assert_eq!(&frame[MAX_IN_BUF_SIZE - 2..], b"\r\n");
    }

    #[test]
    fn test_receive_from_transport() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let mut t = MockTransport::new();

        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 0);

        t.feed(b"\x020F0880FF(1)\x03\x00rest");
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 1);
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 13);
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 0);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn test_receive_stops_after_echo() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let mut t = MockTransport::new();
        out.build_id_request();
        t.feed(b"/?!\r\n/ABC5\r\n");
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 0);
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 7);
        assert_eq!(det.frame(7), b"/ABC5\r\n");
    }

    #[test]
    fn test_receive_respects_budget() {
        let mut det = FrameDetector::new();
        let mut out = OutFrame::new();
        let mut t = MockTransport::new();
        t.read_delay = Duration::from_millis(10);
        t.feed(b"0123456789\r\n");

        let start = Instant::now();
        assert_eq!(det.receive(&mut t, &mut out, RECEIVE_BUDGET), 0);
        assert!(start.elapsed() < Duration::from_millis(100));

        // one or two bytes fit into 15 ms, the rest stays for the next call
        let left = t.pending();
        assert!((10..=11).contains(&left), "{left} bytes left");

        let mut size = 0;
        while size == 0 {
            size = det.receive(&mut t, &mut out, RECEIVE_BUDGET);
        }
        assert_eq!(size, 12);
        assert_eq!(det.frame(size), b"0123456789\r\n");
    }
}
