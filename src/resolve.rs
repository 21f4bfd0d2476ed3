//! Content-based classification of untyped scalars and the numeric literal
//! codecs both engines share.
//!
//! The literal sets follow the YAML core schema and are confined to this
//! module so they can be audited (or swapped) as one conformance seam.

use crate::tag::TagId;

/// The type a wildcard-tagged scalar is inferred to have from its text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicKind {
    Null,
    True,
    False,
    Integer,
    Float,
    FloatInfinity,
    FloatNan,
    Unrecognized,
}

/// Classify a scalar's text. Pure and total; never consults context.
pub fn classify(text: &str) -> IntrinsicKind {
    match text {
        "" | "~" | "null" | "Null" | "NULL" => return IntrinsicKind::Null,
        "true" | "True" | "TRUE" => return IntrinsicKind::True,
        "false" | "False" | "FALSE" => return IntrinsicKind::False,
        ".nan" | ".NaN" | ".NAN" => return IntrinsicKind::FloatNan,
        _ => {}
    }
    let unsigned = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    match unsigned {
        ".inf" | ".Inf" | ".INF" => return IntrinsicKind::FloatInfinity,
        _ => {}
    }
    if is_integer(text) {
        IntrinsicKind::Integer
    } else if is_float(text) {
        IntrinsicKind::Float
    } else {
        IntrinsicKind::Unrecognized
    }
}

/// The built-in tag a classified scalar resolves to.
pub fn intrinsic_tag(kind: IntrinsicKind) -> TagId {
    match kind {
        IntrinsicKind::Null => TagId::NULL,
        IntrinsicKind::True | IntrinsicKind::False => TagId::BOOL,
        IntrinsicKind::Integer => TagId::INT,
        IntrinsicKind::Float | IntrinsicKind::FloatInfinity | IntrinsicKind::FloatNan => {
            TagId::FLOAT
        }
        IntrinsicKind::Unrecognized => TagId::STR,
    }
}

fn is_integer(text: &str) -> bool {
    if let Some(rest) = text.strip_prefix("0x") {
        return digit_run(rest, |c| c.is_ascii_hexdigit());
    }
    if let Some(rest) = text.strip_prefix("0o") {
        return digit_run(rest, |c| ('0'..='7').contains(&c));
    }
    let rest = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    digit_run(rest, |c| c.is_ascii_digit())
}

/// Non-empty run of digits with `_` separators permitted between them.
fn digit_run(text: &str, is_digit: impl Fn(char) -> bool) -> bool {
    let mut seen = false;
    for c in text.chars() {
        if is_digit(c) {
            seen = true;
        } else if c != '_' {
            return false;
        }
    }
    seen
}

fn is_float(text: &str) -> bool {
    let rest = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    let (mantissa, exponent) = match rest.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (rest, None),
    };
    let mantissa_ok = match mantissa.split_once('.') {
        Some((whole, frac)) => {
            let whole_ok = whole.is_empty() || digit_run(whole, |c| c.is_ascii_digit());
            let frac_ok = frac.is_empty() || digit_run(frac, |c| c.is_ascii_digit());
            (whole_ok && frac_ok) && !(whole.is_empty() && frac.is_empty())
        }
        // Without a dot an exponent is required, otherwise it is an integer.
        None => exponent.is_some() && digit_run(mantissa, |c| c.is_ascii_digit()),
    };
    if !mantissa_ok {
        return false;
    }
    match exponent {
        Some(e) => {
            let e = e
                .strip_prefix('-')
                .or_else(|| e.strip_prefix('+'))
                .unwrap_or(e);
            digit_run(e, |c| c.is_ascii_digit())
        }
        None => true,
    }
}

/// Parse an integer literal: signed/unsigned decimal, `0x` hex, `0o` octal,
/// `_` separators ignored. Range checking against the target type is the
/// caller's job.
pub fn parse_integer(text: &str) -> Option<i128> {
    if !is_integer(text) {
        return None;
    }
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = if let Some(hex) = rest.strip_prefix("0x") {
        (16, hex)
    } else if let Some(octal) = rest.strip_prefix("0o") {
        (8, octal)
    } else {
        (10, rest)
    };
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    let magnitude = i128::from_str_radix(&cleaned, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Parse a float literal, accepting the infinity/NaN spellings alongside
/// decimal/exponent forms.
pub fn parse_float(text: &str) -> Option<f64> {
    match classify(text) {
        IntrinsicKind::FloatNan => return Some(f64::NAN),
        IntrinsicKind::FloatInfinity => {
            return Some(if text.starts_with('-') {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            });
        }
        IntrinsicKind::Integer | IntrinsicKind::Float => {}
        _ => return None,
    }
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if let Some(value) = parse_integer(&cleaned) {
        return Some(value as f64);
    }
    cleaned.parse::<f64>().ok()
}

/// Canonical text form of a float: the literal infinity/NaN spellings, or
/// the shortest decimal that round-trips.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        ".nan".to_string()
    } else if value == f64::INFINITY {
        ".inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-.inf".to_string()
    } else {
        format!("{value:?}")
    }
}
