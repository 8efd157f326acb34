//! Value parsers shared by the annotation processors. Durations and sizes
//! follow the HAProxy configuration syntax.

use super::AnnotationError;
use crate::store::NamespacedName;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

pub fn parse_bool(value: &str) -> Result<bool, AnnotationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        deprecated @ ("on" | "enabled") => {
            warn!("boolean value '{deprecated}' is deprecated, use 'true'");
            Ok(true)
        }
        deprecated @ ("off" | "disabled") => {
            warn!("boolean value '{deprecated}' is deprecated, use 'false'");
            Ok(false)
        }
        _ => Err(AnnotationError::InvalidBool(value.to_string())),
    }
}

/// Milliseconds of an HAProxy time value. A bare number is milliseconds.
pub fn parse_duration(value: &str) -> Result<u64, AnnotationError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let invalid = || AnnotationError::InvalidDuration(value.to_string());
    let amount = digits.parse::<u64>().map_err(|_| invalid())?;
    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid()),
    };
    amount.checked_mul(factor).ok_or_else(invalid)
}

/// Bytes of a size value with an optional `k`, `m` or `g` suffix.
pub fn parse_size(value: &str) -> Result<u64, AnnotationError> {
    let value = value.trim();
    let invalid = || AnnotationError::InvalidSize(value.to_string());
    let (digits, factor) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1u64 << 10),
        Some('m') => (&value[..value.len() - 1], 1 << 20),
        Some('g') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    let amount = digits.parse::<u64>().map_err(|_| invalid())?;
    amount.checked_mul(factor).ok_or_else(invalid)
}

pub fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, AnnotationError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| AnnotationError::InvalidNumber(value.to_string()))
}

/// Comma separated IP addresses and networks, in their original spelling.
pub fn parse_addresses(value: &str) -> Result<Vec<String>, AnnotationError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.parse::<IpAddr>().is_ok() || item.parse::<IpNet>().is_ok() {
                Ok(item.to_string())
            } else {
                Err(AnnotationError::InvalidAddress(item.to_string()))
            }
        })
        .collect()
}

/// A `name` or `namespace/name` reference; `name` alone lives in
/// `default_namespace`.
pub fn parse_k8s_path(value: &str, default_namespace: &str) -> Result<NamespacedName, AnnotationError> {
    let invalid = || AnnotationError::InvalidReference(value.to_string());
    let value = value.trim();
    let (namespace, name) = match value.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, value),
    };
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return Err(invalid());
    }
    Ok(NamespacedName::new(namespace, name))
}

/// Non-empty trimmed lines of a multi-line value.
pub fn lines(value: &str) -> impl Iterator<Item = &str> {
    value.lines().map(str::trim).filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_err, assert_ok};
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("true", true)]
    #[case("YES", true)]
    #[case("on", true)]
    #[case("enabled", true)]
    #[case("false", false)]
    #[case("no", false)]
    #[case("Off", false)]
    #[case("disabled", false)]
    fn test_bool(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(assert_ok!(parse_bool(input)), expected);
    }

    #[rstest]
    #[case("maybe")]
    #[case("1")]
    fn test_bool_rejects(#[case] input: &str) {
        assert_err!(parse_bool(input));
    }

    #[rstest]
    #[case("100", 100)]
    #[case("100ms", 100)]
    #[case("5s", 5_000)]
    #[case("2m", 120_000)]
    #[case("1h", 3_600_000)]
    #[case("1d", 86_400_000)]
    fn test_duration(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(assert_ok!(parse_duration(input)), expected);
    }

    #[rstest]
    #[case("")]
    #[case("s")]
    #[case("5 s")]
    #[case("5w")]
    #[case("-5s")]
    fn test_duration_rejects(#[case] input: &str) {
        assert_err!(parse_duration(input));
    }

    #[rstest]
    #[case("512", 512)]
    #[case("100k", 102_400)]
    #[case("1M", 1_048_576)]
    #[case("2g", 2_147_483_648)]
    fn test_size(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(assert_ok!(parse_size(input)), expected);
    }

    #[test]
    fn test_addresses() {
        assert_eq!(
            assert_ok!(parse_addresses("10.0.0.1, 192.168.0.0/16,,2001:db8::/32")),
            vec!["10.0.0.1", "192.168.0.0/16", "2001:db8::/32"]
        );
        assert_eq!(
            parse_addresses("10.0.0.1,example.com"),
            Err(AnnotationError::InvalidAddress("example.com".to_string()))
        );
    }

    #[rstest]
    #[case("secret", "default", "default", "secret")]
    #[case("auth/secret", "default", "auth", "secret")]
    fn test_k8s_path(
        #[case] input: &str,
        #[case] default_namespace: &str,
        #[case] namespace: &str,
        #[case] name: &str,
    ) {
        assert_eq!(
            assert_ok!(parse_k8s_path(input, default_namespace)),
            NamespacedName::new(namespace, name)
        );
    }

    #[rstest]
    #[case("/secret")]
    #[case("auth/")]
    #[case("")]
    #[case("a/b/c")]
    fn test_k8s_path_rejects(#[case] input: &str) {
        assert_err!(parse_k8s_path(input, "default"));
    }

    proptest! {
        #[test]
        fn test_duration_units_scale(amount in 0u64..1_000_000) {
            prop_assert_eq!(parse_duration(&amount.to_string()).ok(), Some(amount));
            prop_assert_eq!(parse_duration(&format!("{amount}s")).ok(), Some(amount * 1_000));
            prop_assert_eq!(parse_duration(&format!("{amount}m")).ok(), Some(amount * 60_000));
        }

        #[test]
        fn test_duration_never_panics(input in "\\PC*") {
            let _ = parse_duration(&input);
        }
    }
}
