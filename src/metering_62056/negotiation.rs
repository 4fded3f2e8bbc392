//! Protocol mode and baud rate negotiation for IEC 62056-21.
//!
//! The fifth character of the identification message (`Z` in `/XXXZ`)
//! announces both the protocol mode and the highest baud rate the meter
//! supports. Mode B uses `A`..`F`, mode C uses `0`..`6`, anything else
//! is mode A.

use std::fmt;

pub const BAUD_RATES: [u32; 7] = [300, 600, 1200, 2400, 4800, 9600, 19200];
pub const MAX_BAUD_RATE: u32 = BAUD_RATES[BAUD_RATES.len() - 1];
pub const PROTO_B_MIN_BAUD_RATE: u32 = BAUD_RATES[1];

pub const PROTO_B_RANGE_BEGIN: u8 = b'A';
pub const PROTO_B_RANGE_END: u8 = b'F';
pub const PROTO_C_RANGE_BEGIN: u8 = b'0';
pub const PROTO_C_RANGE_END: u8 = b'6';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    ModeA,
    ModeB,
    ModeC,
    ModeD,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolMode::ModeA => write!(f, "A"),
            ProtocolMode::ModeB => write!(f, "B"),
            ProtocolMode::ModeC => write!(f, "C"),
            ProtocolMode::ModeD => write!(f, "D"),
        }
    }
}

fn is_proto_b(z: u8) -> bool {
    (PROTO_B_RANGE_BEGIN..=PROTO_B_RANGE_END).contains(&z)
}

fn is_proto_c(z: u8) -> bool {
    (PROTO_C_RANGE_BEGIN..=PROTO_C_RANGE_END).contains(&z)
}

/// Classifies the session by the identification baud rate character.
pub fn protocol_mode(z: u8, force_mode_d: bool) -> ProtocolMode {
    if force_mode_d {
        ProtocolMode::ModeD
    } else if is_proto_b(z) {
        ProtocolMode::ModeB
    } else if is_proto_c(z) {
        ProtocolMode::ModeC
    } else {
        ProtocolMode::ModeA
    }
}

fn lowest_baud_rate(mode: ProtocolMode) -> u32 {
    match mode {
        ProtocolMode::ModeB => PROTO_B_MIN_BAUD_RATE,
        _ => BAUD_RATES[0],
    }
}

/// Maps an identification character to its baud rate. Characters outside
/// both ranges map to the lowest rate of `mode`.
pub fn identification_to_baud_rate(mode: ProtocolMode, z: u8) -> u32 {
    if is_proto_b(z) {
        BAUD_RATES[1 + (z - PROTO_B_RANGE_BEGIN) as usize]
    } else if is_proto_c(z) {
        BAUD_RATES[(z - PROTO_C_RANGE_BEGIN) as usize]
    } else {
        lowest_baud_rate(mode)
    }
}

/// Inverse of [`identification_to_baud_rate`]. Rates that are not in the
/// table of `mode` map to its lowest character.
pub fn baud_rate_to_identification(mode: ProtocolMode, baud_rate: u32) -> u8 {
    if mode == ProtocolMode::ModeB {
        BAUD_RATES.iter()
            .skip(1)
            .position(|r| *r == baud_rate)
            .map(|i| PROTO_B_RANGE_BEGIN + i as u8)
            .unwrap_or(PROTO_B_RANGE_BEGIN)
    } else {
        BAUD_RATES.iter()
            .position(|r| *r == baud_rate)
            .map(|i| PROTO_C_RANGE_BEGIN + i as u8)
            .unwrap_or(PROTO_C_RANGE_BEGIN)
    }
}

/// Chooses the baud rate character to propose in the option select message.
///
/// Without a cap (`0` or the table maximum) the meter's own character is
/// echoed back. With a cap below the advertised rate, the highest table rate
/// not above the cap is used; mode B never goes below 600 bps.
pub fn negotiate(mode: ProtocolMode, z: u8, baud_rate_max: u32) -> u8 {
    if baud_rate_max == 0 || baud_rate_max == MAX_BAUD_RATE {
        return z;
    }

    let advertised = identification_to_baud_rate(mode, z);
    if advertised <= baud_rate_max {
        return baud_rate_to_identification(mode, advertised);
    }

    let mut negotiated = BAUD_RATES.iter()
        .rev()
        .copied()
        .find(|r| *r <= baud_rate_max)
        .unwrap_or(BAUD_RATES[0]);

    if mode == ProtocolMode::ModeB && negotiated < PROTO_B_MIN_BAUD_RATE {
        negotiated = PROTO_B_MIN_BAUD_RATE;
    }

    baud_rate_to_identification(mode, negotiated)
}

pub fn is_valid_baud_rate(baud_rate: u32) -> bool {
    BAUD_RATES.contains(&baud_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mode() {
        assert_eq!(protocol_mode(b'5', false), ProtocolMode::ModeC);
        assert_eq!(protocol_mode(b'0', false), ProtocolMode::ModeC);
        assert_eq!(protocol_mode(b'A', false), ProtocolMode::ModeB);
        assert_eq!(protocol_mode(b'F', false), ProtocolMode::ModeB);
        assert_eq!(protocol_mode(b'G', false), ProtocolMode::ModeA);
        assert_eq!(protocol_mode(b'7', false), ProtocolMode::ModeA);
        assert_eq!(protocol_mode(0, false), ProtocolMode::ModeA);
        assert_eq!(protocol_mode(b'5', true), ProtocolMode::ModeD);
    }

    #[test]
    fn test_identification_to_baud_rate() {
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeC, b'0'), 300);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeC, b'5'), 9600);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeC, b'6'), 19200);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeB, b'A'), 600);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeB, b'E'), 9600);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeB, b'Z'), 600);
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeA, b'Z'), 300);
    }

    #[test]
    fn test_mode_c_bijection() {
        for z in PROTO_C_RANGE_BEGIN..=PROTO_C_RANGE_END {
            let rate = identification_to_baud_rate(ProtocolMode::ModeC, z);
            assert_eq!(baud_rate_to_identification(ProtocolMode::ModeC, rate), z);
        }
        for rate in BAUD_RATES {
            let z = baud_rate_to_identification(ProtocolMode::ModeC, rate);
            assert_eq!(identification_to_baud_rate(ProtocolMode::ModeC, z), rate);
        }
    }

    #[test]
    fn test_mode_b_bijection() {
        for z in PROTO_B_RANGE_BEGIN..=PROTO_B_RANGE_END {
            let rate = identification_to_baud_rate(ProtocolMode::ModeB, z);
            assert_eq!(baud_rate_to_identification(ProtocolMode::ModeB, rate), z);
        }
        for rate in &BAUD_RATES[1..] {
            let z = baud_rate_to_identification(ProtocolMode::ModeB, *rate);
            assert_eq!(identification_to_baud_rate(ProtocolMode::ModeB, z), *rate);
        }
    }

    #[test]
    fn test_unknown_rate_maps_to_lowest_char() {
        assert_eq!(baud_rate_to_identification(ProtocolMode::ModeC, 1234), b'0');
        assert_eq!(baud_rate_to_identification(ProtocolMode::ModeB, 300), b'A');
    }

    #[test]
    fn test_negotiate_without_cap() {
        assert_eq!(negotiate(ProtocolMode::ModeC, b'5', 0), b'5');
        assert_eq!(negotiate(ProtocolMode::ModeC, b'5', MAX_BAUD_RATE), b'5');
        assert_eq!(negotiate(ProtocolMode::ModeB, b'E', 0), b'E');
    }

    #[test]
    fn test_negotiate_with_cap() {
        // meter offers 9600, we allow 2400
        assert_eq!(negotiate(ProtocolMode::ModeC, b'5', 2400), b'3');
        // cap above the advertised rate keeps the meter rate
        assert_eq!(negotiate(ProtocolMode::ModeC, b'3', 9600), b'3');
        // cap between two table entries
        assert_eq!(negotiate(ProtocolMode::ModeC, b'6', 5000), b'4');
        assert_eq!(negotiate(ProtocolMode::ModeB, b'F', 4800), b'D');
    }

    #[test]
    fn test_negotiate_mode_b_floor() {
        assert_eq!(negotiate(ProtocolMode::ModeB, b'E', 300), b'A');
        assert_eq!(identification_to_baud_rate(ProtocolMode::ModeB, b'A'), PROTO_B_MIN_BAUD_RATE);
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolMode::ModeC.to_string(), "C");
        assert_eq!(ProtocolMode::ModeD.to_string(), "D");
    }
}
