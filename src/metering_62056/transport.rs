//! Byte level access to the optical reading head.
//!
//! The session polls the line, it never blocks on it. Every call returns
//! immediately with what is available right now.

use log::{debug, error};
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

pub trait Transport {
    /// Number of bytes that can be read without waiting
    fn available(&mut self) -> io::Result<usize>;
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Drops everything pending in the input buffer
    fn discard_input(&mut self) -> io::Result<usize>;
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens the port with 7E1 at 300 bps, the IEC 62056-21 start settings.
    pub fn open(path: &str) -> Result<Self, tokio_serial::Error> {
        let port = tokio_serial::new(path, 300)
            .data_bits(DataBits::Seven)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(1))
            .open()?;

        debug!("Opened serial port {path}");
        return Ok(SerialTransport { port });
    }
}

impl Transport for SerialTransport {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.port.read(&mut b) {
            Ok(1) => Ok(Some(b[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn discard_input(&mut self) -> io::Result<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        self.port.clear(ClearBuffer::Input)?;
        Ok(pending)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        if let Err(e) = self.port.set_baud_rate(baud_rate) {
            error!("Unable to switch baud rate to {baud_rate}: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Inbound bytes, shared so a test can feed a transport owned by someone else
    pub type SharedInput = Arc<Mutex<VecDeque<u8>>>;

    /// Scripted transport for session tests
    #[derive(Default)]
    pub struct MockTransport {
        input: SharedInput,
        pub written: Vec<Vec<u8>>,
        pub baud_rates: Vec<u32>,
        pub discards: usize,
        /// Time every single byte read takes
        pub read_delay: Duration,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn input(&self) -> SharedInput {
            self.input.clone()
        }

        pub fn feed(&mut self, data: &[u8]) {
            feed(&self.input, data);
        }

        pub fn pending(&self) -> usize {
            self.input.lock().unwrap().len()
        }

        pub fn last_written(&self) -> Option<&[u8]> {
            self.written.last().map(|w| w.as_slice())
        }
    }

    pub fn feed(input: &SharedInput, data: &[u8]) {
        input.lock().unwrap().extend(data.iter().copied());
    }

    impl Transport for MockTransport {
        fn available(&mut self) -> io::Result<usize> {
            Ok(self.pending())
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            if !self.read_delay.is_zero() {
                std::thread::sleep(self.read_delay);
            }
            Ok(self.input.lock().unwrap().pop_front())
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.push(data.to_vec());
            Ok(())
        }

        fn discard_input(&mut self) -> io::Result<usize> {
            let mut input = self.input.lock().unwrap();
            let n = input.len();
            input.clear();
            self.discards += 1;
            Ok(n)
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
            self.baud_rates.push(baud_rate);
            Ok(())
        }
    }

    #[test]
    fn test_mock_transport() {
        let mut t = MockTransport::new();
        t.feed(b"ab");
        assert_eq!(t.available().unwrap(), 2);
        assert_eq!(t.read_byte().unwrap(), Some(b'a'));
        assert_eq!(t.discard_input().unwrap(), 1);
        assert_eq!(t.read_byte().unwrap(), None);
        t.write_all(b"/?!\r\n").unwrap();
        assert_eq!(t.last_written(), Some(&b"/?!\r\n"[..]));

        let shared = t.input();
        feed(&shared, b"xyz");
        assert_eq!(t.pending(), 3);
    }
}
