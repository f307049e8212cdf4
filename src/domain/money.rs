use thiserror::Error;

/// Money is an integer count of minor currency units (cents for EUR/USD).
/// €50.00 is 5000 units. Floating point never touches a balance.
pub type MinorUnits = i64;

/// Minor units per major unit. Every wallet in this ledger shares one currency.
pub const UNITS_PER_MAJOR: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseAmountError {
    #[error("invalid money format: {0:?}")]
    InvalidFormat(String),

    #[error("amount is too large: {0:?}")]
    Overflow(String),
}

/// Format minor units as a decimal string.
/// Example: 5000 -> "50.00", -1234 -> "-12.34"
pub fn format_minor_units(amount: MinorUnits) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let per = UNITS_PER_MAJOR as u64;
    format!("{}{}.{:02}", sign, abs / per, abs % per)
}

/// Parse a decimal string into minor units.
/// Example: "50.00" -> 5000, "12.5" -> 1250, "100" -> 10000
///
/// More than two decimal places is an error rather than a silent truncation.
pub fn parse_minor_units(input: &str) -> Result<MinorUnits, ParseAmountError> {
    let invalid = || ParseAmountError::InvalidFormat(input.to_string());
    let overflow = || ParseAmountError::Overflow(input.to_string());

    let trimmed = input.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole_units: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };

    let fraction_units: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        2 => fraction.parse().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    let amount = whole_units
        .checked_mul(UNITS_PER_MAJOR)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or_else(overflow)?;

    Ok(if negative { -amount } else { amount })
}
