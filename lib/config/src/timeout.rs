use crate::{Error, Result};

/// Parses a timeout string into milliseconds.
///
/// Accepts `NNN` (milliseconds), `NNNms`, `Ns`, `Nm`, `Nh`. `"0"` means no
/// timeout and is passed through unchanged.
pub fn parse_timeout(input: &str) -> Result<u64> {
  let input = input.trim();
  if let Ok(ms) = input.parse::<u64>() {
    return Ok(ms);
  }
  let (num, multiplier) = if let Some(n) = input.strip_suffix("ms") {
    (n, 1)
  } else if let Some(n) = input.strip_suffix('h') {
    (n, 3_600_000)
  } else if let Some(n) = input.strip_suffix('m') {
    (n, 60_000)
  } else if let Some(n) = input.strip_suffix('s') {
    (n, 1_000)
  } else {
    return Err(Error::InvalidTimeout(input.to_string()));
  };
  let num: u64 = num
    .trim()
    .parse()
    .map_err(|_| Error::InvalidTimeout(input.to_string()))?;
  Ok(num * multiplier)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bare_milliseconds() {
    assert_eq!(parse_timeout("1500").unwrap(), 1500);
    assert_eq!(parse_timeout("0").unwrap(), 0);
  }

  #[test]
  fn parses_suffixed_units() {
    assert_eq!(parse_timeout("1500ms").unwrap(), 1500);
    assert_eq!(parse_timeout("2s").unwrap(), 2000);
    assert_eq!(parse_timeout("3m").unwrap(), 180_000);
    assert_eq!(parse_timeout("1h").unwrap(), 3_600_000);
  }

  #[test]
  fn rejects_garbage() {
    assert!(parse_timeout("banana").is_err());
    assert!(parse_timeout("5d").is_err());
  }
}
