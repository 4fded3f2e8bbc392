use super::Iec62056ParseError;
use lazy_static::lazy_static;
use log::trace;
use regex::Regex;

/// Max. number of characters before the unit. In reality this number is
/// related to the number of digits on the meter's display.
const MAX_NUMBER_LEN: usize = 20;

lazy_static! {
    // Valid OBIS codes may be empty, max. length is arbitrary chosen
    static ref OBIS_CODE: Regex = Regex::new(r"^[0-9A-Z:.\-*]{0,25}$").unwrap();
    static ref NUMBER: Regex = Regex::new(r"^-?[0-9.]+$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObisLine {
    pub code: String,
    pub value1: String,
    pub value2: String,
}

pub fn parse_obis_line(line: &str) -> Result<ObisLine, Iec62056ParseError> {
    // Example formats:
    // 0F0880FF(001234.56*kWh)
    // 1-0:1.8.1(000123.456*kWh)
    // 1-0:1.6.0(02.123*kW)(2401011200)

    let mut open1 = None;
    let mut close1 = None;
    let mut open2 = None;
    let mut close2 = None;

    for (i, c) in line.char_indices() {
        match c {
            '(' if open1.is_none() => open1 = Some(i),
            ')' if close1.is_none() => close1 = Some(i),
            '(' if open2.is_none() => open2 = Some(i),
            ')' if close2.is_none() => close2 = Some(i),
            _ => {}
        }
    }

    let (open1, close1) = match (open1, close1) {
        (Some(o), Some(c)) if c > o => (o, c),
        _ => {
            trace!("Missing expected open and closing bracket");
            return Err(Iec62056ParseError::InvalidDataLine);
        }
    };

    let code = &line[..open1];
    let value1 = &line[open1 + 1..close1];
    let value2 = match (open2, close2) {
        (Some(o), Some(c)) if c > o => &line[o + 1..c],
        _ => "",
    };

    if !validate_obis_code(code) {
        return Err(Iec62056ParseError::InvalidObisCode(code.to_string()));
    }

    Ok(ObisLine {
        code: code.to_string(),
        value1: value1.to_string(),
        value2: value2.to_string(),
    })
}

/// Accepts the empty code and up to 25 of `0-9 A-Z : . - *`
pub fn validate_obis_code(code: &str) -> bool {
    OBIS_CODE.is_match(code)
}

/// Checks the numeric part of a value, a trailing unit after `*` is ignored.
pub fn validate_number(value: &str) -> bool {
    let number = strip_unit(value);
    !number.is_empty() && number.len() <= MAX_NUMBER_LEN && NUMBER.is_match(number)
}

pub fn parse_number(value: &str) -> Result<f64, Iec62056ParseError> {
    if !validate_number(value) {
        return Err(Iec62056ParseError::InvalidNumber(value.to_string()));
    }

    strip_unit(value)
        .parse::<f64>()
        .map_err(|_| Iec62056ParseError::InvalidNumber(value.to_string()))
}

fn strip_unit(value: &str) -> &str {
    match value.find('*') {
        Some(pos) => &value[..pos],
        None => value,
    }
}
