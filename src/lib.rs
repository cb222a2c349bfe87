#![warn(clippy::all, rust_2018_idioms)]

//! Headless host for the wiring simulator: circuit files, a stepping
//! session and plain-text tick reports.

pub mod error;
pub mod report;
pub mod session;

pub use error::{FrameArgError, LoadError};
pub use session::{read_file, write_file, CircuitFile, Session};

/// `0.0012, 'A'` -> `"1.200 mA"`.
pub fn to_metric_prefix(value: f64, unit: char) -> String {
    let prefixes = [
        (-12, "p"),
        (-9, "n"),
        (-6, "μ"),
        (-3, "m"),
        (0, ""),
        (3, "k"),
        (6, "M"),
        (9, "G"),
    ];

    if value == 0.0 || !value.is_finite() {
        return format!("{value} {unit}");
    }

    let exponent = (value.abs().log10() / 3.0).floor() as i32 * 3;
    match prefixes.iter().find(|&&(e, _)| e == exponent) {
        Some((e, symbol)) => format!("{:.3} {symbol}{unit}", value / 10_f64.powi(*e)),
        None => format!("{value:e} {unit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_prefixes() {
        assert_eq!(to_metric_prefix(0.0012, 'A'), "1.200 mA");
        assert_eq!(to_metric_prefix(12.0, 'V'), "12.000 V");
        assert_eq!(to_metric_prefix(-4700.0, 'Ω'), "-4.700 kΩ");
        assert_eq!(to_metric_prefix(0.0, 'V'), "0 V");
    }
}
