//! Kubernetes-style resource quantities
//!
//! Only the subset the scaling policy needs: plain integers, decimal SI
//! suffixes (`k`, `M`, `G`, `T`, `P`, `E`), binary suffixes (`Ki` .. `Ei`)
//! and the milli suffix `m` used for CPU.

use crate::error::QuantityError;

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a byte quantity such as `10Gi`, `500M` or `1073741824`
pub fn parse_bytes(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    let invalid = || QuantityError::Invalid(s.to_string());

    for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES) {
        if let Some(number) = s.strip_suffix(suffix) {
            let value: f64 = number.trim().parse().map_err(|_| invalid())?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid());
            }
            return Ok((value * *multiplier as f64).round() as u64);
        }
    }

    let value: f64 = s.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(value.round() as u64)
}

/// Parse a CPU quantity into millicores: `250m` -> 250, `2` -> 2000
pub fn parse_millicores(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    let invalid = || QuantityError::Invalid(s.to_string());

    if let Some(number) = s.strip_suffix('m') {
        return number.trim().parse::<u64>().map_err(|_| invalid());
    }

    let cores: f64 = s.parse().map_err(|_| invalid())?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid());
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a percentage written as `50%` or `50pc`
pub fn parse_percentage(s: &str) -> Option<u32> {
    let s = s.trim();
    let number = s.strip_suffix('%').or_else(|| s.strip_suffix("pc"))?;
    number.trim().parse().ok()
}

/// Format bytes with the largest exact-enough binary suffix
pub fn format_bytes(bytes: u64) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    const KIB: f64 = (1u64 << 10) as f64;

    let b = bytes as f64;
    if b >= GIB {
        format!("{:.2}Gi", b / GIB)
    } else if b >= MIB {
        format!("{:.2}Mi", b / MIB)
    } else if b >= KIB {
        format!("{:.2}Ki", b / KIB)
    } else {
        format!("{}", bytes)
    }
}
