use super::structs::DeviceIdentification;
use super::Iec62056ParseError;
use log::debug;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// XORs every byte of `data` into the block check accumulator.
pub fn update_bcc(bcc: u8, data: &[u8]) -> u8 {
    data.iter().fold(bcc, |acc, b| acc ^ b)
}

/// Extracts the identification message from a received frame.
///
/// The frame must end with CR LF. The `/` marker is searched backwards from
/// the end, and at least `/XXXZ\r\n` has to follow it, otherwise the frame is
/// treated as garbage.
pub fn find_identification(frame: &[u8]) -> Option<&[u8]> {
    const MIN_ID_FRAME_SIZE: usize = 7;

    if frame.len() < MIN_ID_FRAME_SIZE || !frame.ends_with(&[CR, LF]) {
        return None;
    }

    let body = &frame[..frame.len() - 2];
    let pos = body.iter().rposition(|b| *b == b'/')?;
    if frame.len() - pos < MIN_ID_FRAME_SIZE {
        debug!("Invalid ID packet");
        return None;
    }

    Some(&body[pos..])
}

/// Parses the raw identification bytes. Bytes that are not ASCII never shift
/// the positions of the manufacturer or the baud rate character.
pub fn parse_identification_line(line: &[u8]) -> Result<DeviceIdentification, Iec62056ParseError> {
    // Example formats:
    // /ELS5\@V5.3
    // /ISK5MT382-1000
    // /EBZ5DD3BL10-112

    if line.first() != Some(&b'/') {
        return Err(Iec62056ParseError::MissingIdentification);
    }

    let manufacturer = line.get(1..4)
        .map(|m| String::from_utf8_lossy(m).to_string())
        .unwrap_or_default();

    // proto A with baud rate 0 if the meter does not report a character
    let baud_rate_char = line.get(4).copied().unwrap_or(0);
    let mode_e_requested = line.get(5..7) == Some(&b"\\2"[..]);

    Ok(DeviceIdentification {
        manufacturer,
        baud_rate_char,
        mode_e_requested,
        full_id: String::from_utf8_lossy(line).to_string(),
    })
}

pub fn format_ascii_pretty(data: &[u8]) -> String {
    data.iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect()
}

/// Renders bytes as `01.52.31 (3) |.R1|` for the raw frame logs.
pub fn format_hex_ascii_pretty(data: &[u8]) -> String {
    let hex = data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<String>>()
        .join(".");

    format!("{} ({}) |{}|", hex, data.len(), format_ascii_pretty(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_bcc() {
        assert_eq!(update_bcc(0, &[]), 0);
        assert_eq!(update_bcc(0, &[0x50, 0x31]), 0x61);
        assert_eq!(update_bcc(0x61, &[0x61]), 0);
    }

    #[test]
    fn test_password_frame_bcc() {
        let payload = b"P1\x02(00000000)\x03";
        assert_eq!(update_bcc(0, payload), 0x61);
    }

    #[test]
    fn test_find_identification() {
        let frame = b"/ABC5\r\n";
        assert_eq!(find_identification(frame), Some(&b"/ABC5"[..]));

        let frame = b"\x00\x00/ISK5MT382-1000\r\n";
        assert_eq!(find_identification(frame), Some(&b"/ISK5MT382-1000"[..]));
    }

    #[test]
    fn test_find_identification_garbage() {
        assert_eq!(find_identification(b"/AB\r\n"), None);
        assert_eq!(find_identification(b"ABCDEFG\r\n"), None);
        assert_eq!(find_identification(b"/ABC5\x03\x11"), None);
        // marker too close to the end
        assert_eq!(find_identification(b"xxxxx/AB\r\n"), None);
    }

    #[test]
    fn test_parse_identification_line() {
        let id = parse_identification_line(b"/ELS5\\@V5.3").unwrap();
        assert_eq!(id.manufacturer, "ELS");
        assert_eq!(id.baud_rate_char, b'5');
        assert!(!id.mode_e_requested);
        assert_eq!(id.full_id, "/ELS5\\@V5.3");

        let id = parse_identification_line(b"/ISK5\\2MT382-1000").unwrap();
        assert!(id.mode_e_requested);

        let id = parse_identification_line(b"/AB").unwrap();
        assert_eq!(id.baud_rate_char, 0);
        assert_eq!(id.manufacturer, "");

        assert!(parse_identification_line(b"ISK5").is_err());
        assert!(parse_identification_line(b"").is_err());
    }

    #[test]
    fn test_parse_identification_non_ascii() {
        // multi-byte character inside the manufacturer
        let id = parse_identification_line(b"/A\xc3\xa95XYZ").unwrap();
        assert_eq!(id.baud_rate_char, b'5');
        assert_eq!(id.full_id, "/A\u{e9}5XYZ");

        // invalid UTF-8 does not move the baud rate character
        let id = parse_identification_line(b"/\xffBC5").unwrap();
        assert_eq!(id.baud_rate_char, b'5');
        assert_eq!(id.manufacturer, "\u{fffd}BC");

        let id = parse_identification_line(b"/A\xff\xff5XYZ").unwrap();
        assert_eq!(id.baud_rate_char, b'5');
    }

    #[test]
    fn test_format_hex_ascii_pretty() {
        assert_eq!(format_hex_ascii_pretty(&[0x01, b'R', b'1']), "01.52.31 (3) |.R1|");
        assert_eq!(format_hex_ascii_pretty(&[]), " (0) ||");
    }
}
