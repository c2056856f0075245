// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! ISO-8601 durations (`P1DT2H30M`, `PT0.5S`), as milliseconds.

pub fn parse_duration_ms(text: &str) -> Result<i64, String> {
    let body = text
        .strip_prefix('P')
        .ok_or_else(|| format!("duration '{text}' must start with 'P'"))?;
    if body.is_empty() {
        return Err(format!("duration '{text}' is empty"));
    }

    let (date, time) = match body.split_once('T') {
        Some((_, "")) => return Err(format!("duration '{text}' has an empty time part")),
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut total = 0f64;
    total += sum_components(date, &[('W', 604_800_000.0), ('D', 86_400_000.0)], text)?;
    if let Some(time) = time {
        total += sum_components(
            time,
            &[('H', 3_600_000.0), ('M', 60_000.0), ('S', 1_000.0)],
            text,
        )?;
    }

    if !total.is_finite() || total > i64::MAX as f64 {
        return Err(format!("duration '{text}' is too large"));
    }
    Ok(total.round() as i64)
}

fn sum_components(part: &str, units: &[(char, f64)], text: &str) -> Result<f64, String> {
    let mut total = 0f64;
    let mut number = String::new();
    let mut last_unit = None;

    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let rank = units
            .iter()
            .position(|(u, _)| *u == c)
            .ok_or_else(|| format!("unexpected '{c}' in duration '{text}'"))?;
        if last_unit.is_some_and(|last| rank <= last) {
            return Err(format!("units out of order in duration '{text}'"));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration '{text}'"))?;
        total += value * units[rank].1;
        number.clear();
        last_unit = Some(rank);
    }

    if !number.is_empty() {
        return Err(format!("missing unit in duration '{text}'"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration_ms("PT30S"), Ok(30_000));
        assert_eq!(parse_duration_ms("PT0.5S"), Ok(500));
        assert_eq!(parse_duration_ms("P1DT2H30M"), Ok(86_400_000 + 9_000_000));
        assert_eq!(parse_duration_ms("P2W"), Ok(1_209_600_000));
    }

    #[test]
    fn test_bad_durations() {
        for bad in ["", "30S", "P", "PT", "PT5", "PT5M3H", "P1X"] {
            assert!(parse_duration_ms(bad).is_err(), "{bad}");
        }
    }
}
