//! Command line value grammar and the assembled runtime settings.
//!
//! Option values arrive as raw strings and are parsed here rather than
//! by the CLI layer, so that every kind of malformed value maps to its
//! own exit code. The unit grammar follows the conventions of the
//! system's stock power daemon: bare scalars are loads for modes,
//! megahertz for frequencies and milliseconds for intervals.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{fail, Exit, Fatal};
use crate::types::{
    default_acstates, AcLineState, AcState, CpTime, Mhz, ADP, DEFAULT_PIDFILE, FREQ_DEFAULT_MAX,
    FREQ_DEFAULT_MIN, HADP,
};

/// Everything the daemon needs to know before it starts.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per AC line state policies, indexed by [`AcLineState`].
    pub acstates: [AcState; AcLineState::COUNT],
    /// The polling interval.
    pub interval: Duration,
    /// The number of tick-counter samples to keep.
    pub samples: usize,
    /// The pidfile path.
    pub pidfile: PathBuf,
    /// Log settings and state changes.
    pub verbose: bool,
    /// Do not detach; log ticks to stdout.
    pub foreground: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            acstates: default_acstates(),
            interval: Duration::from_millis(500),
            samples: 5,
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
            verbose: false,
            foreground: false,
        }
    }
}

/// Units recognised on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Scalar,
    Percent,
    Second,
    Millisecond,
    Hz,
    Khz,
    Mhz,
    Ghz,
    Thz,
    Unknown,
}

/// Split a value into its numeric part and unit suffix. The numeric
/// part is an optional sign followed by digits and dots; everything
/// after it is matched against the known suffixes, case-insensitively.
fn split_unit(value: &str) -> (Option<f64>, Unit) {
    let digits = value
        .char_indices()
        .skip(usize::from(value.starts_with('+') || value.starts_with('-')))
        .find(|(_, ch)| !ch.is_ascii_digit() && *ch != '.')
        .map_or(value.len(), |(at, _)| at);
    let (number, suffix) = value.split_at(digits);
    let unit = match suffix.to_ascii_lowercase().as_str() {
        "" => Unit::Scalar,
        "%" => Unit::Percent,
        "s" => Unit::Second,
        "ms" => Unit::Millisecond,
        "hz" => Unit::Hz,
        "khz" => Unit::Khz,
        "mhz" => Unit::Mhz,
        "ghz" => Unit::Ghz,
        "thz" => Unit::Thz,
        _ => Unit::Unknown,
    };
    (number.parse().ok(), unit)
}

/// Parse a load target into 1/1024 units.
///
/// Accepts scalars in [0, 1] and percentages in [0, 100]. The result
/// is clamped up to 1; a zero load target would divide by zero in
/// adaptive mode.
pub fn load(value: &str) -> Result<CpTime, Fatal> {
    if value.is_empty() {
        return Err(fail(Exit::Load, 0, "load target value missing"));
    }
    let (number, unit) = split_unit(value);
    match (number, unit) {
        (Some(scalar), Unit::Scalar) => {
            if !(0.0..=1.0).contains(&scalar) {
                return Err(fail(
                    Exit::OutOfRange,
                    0,
                    format!("load targets must be in the range [0.0, 1.0]: {value}"),
                ));
            }
            Ok(((1024.0 * scalar) as CpTime).max(1))
        }
        (Some(percent), Unit::Percent) => {
            if !(0.0..=100.0).contains(&percent) {
                return Err(fail(
                    Exit::OutOfRange,
                    0,
                    format!("load targets must be in the range [0%, 100%]: {value}"),
                ));
            }
            Ok(((1024.0 * percent / 100.0) as CpTime).max(1))
        }
        _ => Err(fail(
            Exit::Load,
            0,
            format!("load target not recognised: {value}"),
        )),
    }
}

/// Parse a frequency into MHz.
///
/// Accepts `hz`, `khz`, `mhz`, `ghz` and `thz` suffixes; a bare scalar
/// is taken as MHz. The accepted range is [0 Hz, 1 THz].
pub fn freq(value: &str) -> Result<Mhz, Fatal> {
    if value.is_empty() {
        return Err(fail(Exit::Freq, 0, "frequency value missing"));
    }
    let (number, unit) = split_unit(value);
    let Some(number) = number else {
        return Err(fail(
            Exit::Freq,
            0,
            format!("frequency value not recognised: {value}"),
        ));
    };
    let mhz = match unit {
        Unit::Hz => number / 1_000_000.0,
        Unit::Khz => number / 1_000.0,
        // bare scalars are MHz for powerd compatibility
        Unit::Scalar | Unit::Mhz => number,
        Unit::Ghz => number * 1_000.0,
        Unit::Thz => number * 1_000_000.0,
        _ => {
            return Err(fail(
                Exit::Freq,
                0,
                format!("frequency value not recognised: {value}"),
            ))
        }
    };
    if !(0.0..=1_000_000.0).contains(&mhz) {
        return Err(fail(
            Exit::OutOfRange,
            0,
            format!("target frequency must be in the range [0Hz, 1THz]: {value}"),
        ));
    }
    Ok(mhz as Mhz)
}

/// Parse a polling interval.
///
/// Accepts `s` and `ms` suffixes; a bare scalar is taken as
/// milliseconds.
pub fn ival(value: &str) -> Result<Duration, Fatal> {
    if value.is_empty() {
        return Err(fail(Exit::Ival, 0, "interval value missing"));
    }
    let (number, unit) = split_unit(value);
    let Some(number) = number else {
        return Err(fail(
            Exit::Ival,
            0,
            format!("interval not recognised: {value}"),
        ));
    };
    if number < 0.0 {
        return Err(fail(
            Exit::OutOfRange,
            0,
            format!("interval must be positive: {value}"),
        ));
    }
    match unit {
        Unit::Second => Ok(Duration::from_millis((number * 1000.0) as u64)),
        Unit::Scalar | Unit::Millisecond => Ok(Duration::from_millis(number as u64)),
        _ => Err(fail(
            Exit::Ival,
            0,
            format!("interval not recognised: {value}"),
        )),
    }
}

/// Parse a sample count.
///
/// The grammar accepts bare integers in [1, 1000], but a count of 1 is
/// rejected here as well: differencing needs at least two samples.
pub fn samples(value: &str) -> Result<usize, Fatal> {
    if value.is_empty() {
        return Err(fail(Exit::Samples, 0, "sample count value missing"));
    }
    let (number, unit) = split_unit(value);
    if unit != Unit::Scalar {
        return Err(fail(
            Exit::Samples,
            0,
            format!("sample count must be a scalar integer: {value}"),
        ));
    }
    let Some(number) = number else {
        return Err(fail(
            Exit::Samples,
            0,
            format!("sample count must be a scalar integer: {value}"),
        ));
    };
    if number.fract() != 0.0 {
        return Err(fail(
            Exit::OutOfRange,
            0,
            format!("sample count must be an integer: {value}"),
        ));
    }
    let count = number as i64;
    if !(1..=1000).contains(&count) {
        return Err(fail(
            Exit::OutOfRange,
            0,
            format!("sample count must be in the range [1, 1000]: {value}"),
        ));
    }
    if count == 1 {
        return Err(fail(
            Exit::OutOfRange,
            0,
            format!("sample count must be at least 2: {value}"),
        ));
    }
    Ok(count as usize)
}

/// Set a load target or fixed frequency for the given AC line state.
///
/// ```text
/// mode_predefined = "minimum" | "min" | "maximum" | "max" |
///                   "adaptive" | "adp" | "hiadaptive" | "hadp";
/// mode            = mode_predefined | load | freq;
/// ```
///
/// Plain values are tried as loads first, so bare scalars select
/// adaptive mode; frequencies need a unit suffix. Out-of-range
/// failures abort instead of falling through to the next rule.
pub fn set_mode(
    acstates: &mut [AcState; AcLineState::COUNT],
    line: AcLineState,
    value: &str,
) -> Result<(), Fatal> {
    let acstate = &mut acstates[line as usize];
    acstate.target_load = 0;
    acstate.target_freq = 0;

    match value.to_ascii_lowercase().as_str() {
        "minimum" | "min" => {
            acstate.target_freq = FREQ_DEFAULT_MIN;
            return Ok(());
        }
        "maximum" | "max" => {
            acstate.target_freq = FREQ_DEFAULT_MAX;
            return Ok(());
        }
        "adaptive" | "adp" => {
            acstate.target_load = ADP;
            return Ok(());
        }
        "hiadaptive" | "hadp" => {
            acstate.target_load = HADP;
            return Ok(());
        }
        _ => {}
    }

    match load(value) {
        Ok(target) => {
            acstate.target_load = target;
            return Ok(());
        }
        Err(err) if err.code == Exit::OutOfRange => return Err(err),
        Err(_) => {}
    }

    match freq(value) {
        Ok(target) => {
            acstate.target_freq = target;
            return Ok(());
        }
        Err(err) if err.code == Exit::OutOfRange => return Err(err),
        Err(_) => {}
    }

    Err(fail(Exit::Mode, 0, format!("mode not recognised: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FREQ_UNSET;

    #[test]
    fn loads_parse_as_1024ths() {
        assert_eq!(load("0.5").unwrap(), 512);
        assert_eq!(load("50%").unwrap(), 512);
        assert_eq!(load("1").unwrap(), 1024);
        assert_eq!(load("100%").unwrap(), 1024);
        assert_eq!(load("0.375").unwrap(), 384);
    }

    #[test]
    fn zero_load_is_clamped_to_one() {
        assert_eq!(load("0").unwrap(), 1);
        assert_eq!(load("0%").unwrap(), 1);
    }

    #[test]
    fn out_of_domain_loads_are_range_errors() {
        assert_eq!(load("1.5").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(load("150%").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(load("-0.1").unwrap_err().code, Exit::OutOfRange);
    }

    #[test]
    fn unrecognised_loads_fail_with_their_own_code() {
        assert_eq!(load("").unwrap_err().code, Exit::Load);
        assert_eq!(load("5s").unwrap_err().code, Exit::Load);
        assert_eq!(load("wat").unwrap_err().code, Exit::Load);
    }

    #[test]
    fn frequencies_normalise_to_mhz() {
        assert_eq!(freq("1000").unwrap(), 1000);
        assert_eq!(freq("2ghz").unwrap(), 2000);
        assert_eq!(freq("2GHz").unwrap(), 2000);
        assert_eq!(freq("1500000khz").unwrap(), 1500);
        assert_eq!(freq("1thz").unwrap(), 1_000_000);
        // sub-MHz values truncate to zero
        assert_eq!(freq("100hz").unwrap(), 0);
    }

    #[test]
    fn frequency_errors() {
        assert_eq!(freq("2000001").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(freq("-1").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(freq("5%").unwrap_err().code, Exit::Freq);
        assert_eq!(freq("").unwrap_err().code, Exit::Freq);
    }

    #[test]
    fn intervals_default_to_milliseconds() {
        assert_eq!(ival("500").unwrap(), Duration::from_millis(500));
        assert_eq!(ival("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(ival("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(ival("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn interval_errors() {
        assert_eq!(ival("-5").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(ival("5mhz").unwrap_err().code, Exit::Ival);
        assert_eq!(ival("").unwrap_err().code, Exit::Ival);
    }

    #[test]
    fn sample_counts_are_bounded_integers() {
        assert_eq!(samples("2").unwrap(), 2);
        assert_eq!(samples("5").unwrap(), 5);
        assert_eq!(samples("1000").unwrap(), 1000);
    }

    #[test]
    fn sample_count_errors() {
        assert_eq!(samples("0").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(samples("1").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(samples("1001").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(samples("2.5").unwrap_err().code, Exit::OutOfRange);
        assert_eq!(samples("5s").unwrap_err().code, Exit::Samples);
        assert_eq!(samples("").unwrap_err().code, Exit::Samples);
    }

    #[test]
    fn predefined_modes() {
        let mut acstates = default_acstates();
        set_mode(&mut acstates, AcLineState::Battery, "min").unwrap();
        assert_eq!(acstates[0].target_load, 0);
        assert_eq!(acstates[0].target_freq, FREQ_DEFAULT_MIN);

        set_mode(&mut acstates, AcLineState::Battery, "MAXIMUM").unwrap();
        assert_eq!(acstates[0].target_freq, FREQ_DEFAULT_MAX);

        set_mode(&mut acstates, AcLineState::Online, "adp").unwrap();
        assert_eq!(acstates[1].target_load, ADP);

        set_mode(&mut acstates, AcLineState::Unknown, "hiadaptive").unwrap();
        assert_eq!(acstates[2].target_load, HADP);
    }

    #[test]
    fn scalar_modes_are_loads_and_suffixed_modes_are_frequencies() {
        let mut acstates = default_acstates();
        set_mode(&mut acstates, AcLineState::Online, "0.75").unwrap();
        assert_eq!(acstates[1].target_load, 768);
        assert_eq!(acstates[1].target_freq, 0);

        set_mode(&mut acstates, AcLineState::Online, "1200mhz").unwrap();
        assert_eq!(acstates[1].target_load, 0);
        assert_eq!(acstates[1].target_freq, 1200);
    }

    #[test]
    fn mode_range_failures_do_not_fall_through() {
        let mut acstates = default_acstates();
        let err = set_mode(&mut acstates, AcLineState::Online, "150%").unwrap_err();
        assert_eq!(err.code, Exit::OutOfRange);
        let err = set_mode(&mut acstates, AcLineState::Online, "2thz").unwrap_err();
        assert_eq!(err.code, Exit::OutOfRange);
        let err = set_mode(&mut acstates, AcLineState::Online, "fast").unwrap_err();
        assert_eq!(err.code, Exit::Mode);
    }

    #[test]
    fn canonical_modes_are_idempotent() {
        for mode in ["min", "max", "adp", "hadp", "0.5", "50%", "1200mhz"] {
            let mut first = default_acstates();
            set_mode(&mut first, AcLineState::Online, mode).unwrap();
            let mut second = first;
            set_mode(&mut second, AcLineState::Online, mode).unwrap();
            assert_eq!(first, second, "mode {mode} must be idempotent");
        }
    }

    #[test]
    fn mode_failures_leave_targets_cleared() {
        let mut acstates = default_acstates();
        set_mode(&mut acstates, AcLineState::Online, "0.75").unwrap();
        let _ = set_mode(&mut acstates, AcLineState::Online, "fast");
        assert_eq!(acstates[1].target_load, 0);
        assert_eq!(acstates[1].target_freq, 0);
    }

    #[test]
    fn settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.interval, Duration::from_millis(500));
        assert_eq!(settings.samples, 5);
        assert_eq!(settings.pidfile, PathBuf::from(DEFAULT_PIDFILE));
        assert_eq!(settings.acstates[AcLineState::Battery as usize].freq_min, FREQ_UNSET);
    }
}
