use super::SizeParseError;
use memchr::memchr2;

/// Decimal literal split into `integer + fraction / denominator` scaled by
/// `10^exponent`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Decimal {
    pub(crate) integer: u128,
    pub(crate) fraction: u128,
    pub(crate) denominator: u128,
    pub(crate) exponent: i32,
}

impl Decimal {
    /// Multiplies the literal by `scale` and truncates towards zero.
    pub(crate) fn scaled(self, scale: u128) -> Result<u128, SizeParseError> {
        let numerator = self
            .integer
            .checked_mul(self.denominator)
            .and_then(|value| value.checked_add(self.fraction))
            .and_then(|value| value.checked_mul(scale))
            .ok_or(SizeParseError::TooLarge)?;

        let magnitude = pow_u128(10, self.exponent.unsigned_abs())?;
        if self.exponent >= 0 {
            numerator
                .checked_mul(magnitude)
                .map(|value| value / self.denominator)
                .ok_or(SizeParseError::TooLarge)
        } else {
            let divisor = self
                .denominator
                .checked_mul(magnitude)
                .ok_or(SizeParseError::TooLarge)?;
            Ok(numerator / divisor)
        }
    }
}

pub(crate) fn parse_decimal_with_exponent(text: &str) -> Result<Decimal, SizeParseError> {
    let bytes = text.as_bytes();
    let (mantissa_text, exponent_text) = if let Some(position) = memchr2(b'e', b'E', bytes) {
        (&text[..position], Some(&text[position + 1..]))
    } else {
        (text, None)
    };

    let (integer, fraction, denominator) = parse_decimal_mantissa(mantissa_text)?;

    let exponent = match exponent_text {
        Some("") => return Err(SizeParseError::Invalid),
        Some(component) => component
            .parse::<i32>()
            .map_err(|_| SizeParseError::Invalid)?,
        None => 0,
    };

    Ok(Decimal {
        integer,
        fraction,
        denominator,
        exponent,
    })
}

pub(crate) fn pow_u128(base: u32, exponent: u32) -> Result<u128, SizeParseError> {
    let mut result = 1u128;
    let mut factor = u128::from(base);
    let mut exp = exponent;

    while exp > 0 {
        if (exp & 1) == 1 {
            result = result.checked_mul(factor).ok_or(SizeParseError::TooLarge)?;
        }

        exp >>= 1;
        if exp > 0 {
            factor = factor.checked_mul(factor).ok_or(SizeParseError::TooLarge)?;
        }
    }

    Ok(result)
}

fn parse_decimal_mantissa(text: &str) -> Result<(u128, u128, u128), SizeParseError> {
    let bytes = text.as_bytes();

    let Some(position) = memchr2(b'.', b',', bytes) else {
        if bytes.is_empty() {
            return Err(SizeParseError::Invalid);
        }
        return Ok((parse_digits(bytes)?, 0, 1));
    };

    let (integer_bytes, fractional_with_sep) = bytes.split_at(position);
    let fractional_bytes = &fractional_with_sep[1..];

    if memchr2(b'.', b',', fractional_bytes).is_some() {
        return Err(SizeParseError::Invalid);
    }
    if integer_bytes.is_empty() && fractional_bytes.is_empty() {
        return Err(SizeParseError::Invalid);
    }

    let integer = parse_digits(integer_bytes)?;
    let mut denominator = 1u128;
    let mut fraction = 0u128;

    for &byte in fractional_bytes {
        if !byte.is_ascii_digit() {
            return Err(SizeParseError::Invalid);
        }

        denominator = denominator.checked_mul(10).ok_or(SizeParseError::TooLarge)?;
        fraction = fraction
            .checked_mul(10)
            .and_then(|value| value.checked_add(u128::from(byte - b'0')))
            .ok_or(SizeParseError::TooLarge)?;
    }

    Ok((integer, fraction, denominator))
}

fn parse_digits(bytes: &[u8]) -> Result<u128, SizeParseError> {
    let mut value = 0u128;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return Err(SizeParseError::Invalid);
        }

        value = value
            .checked_mul(10)
            .and_then(|acc| acc.checked_add(u128::from(byte - b'0')))
            .ok_or(SizeParseError::TooLarge)?;
    }

    Ok(value)
}
