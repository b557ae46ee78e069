//! Isolate meta file decoder
//!
//! Isolate writes a `key:value` report after every `--run`. Keys that do not
//! apply are omitted (no `cg-mem` without cgroups, no `exitsig` without a
//! signal), so a missing key means "unknown" to the decoder. Whether that is
//! acceptable depends on the reported status; see [`RunMetrics::from_meta`].

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

pub type RawMetadata = HashMap<String, String>;

/// Decode a meta file into a key/value map.
///
/// Never fails: lines without a `:` are skipped and invalid UTF-8 is decoded
/// lossily, so garbage in yields an empty (or partial) map.
pub fn decode(contents: &[u8]) -> RawMetadata {
    let text = String::from_utf8_lossy(contents);
    let mut meta = RawMetadata::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        meta.insert(key.to_string(), value.trim().to_string());
    }

    meta
}

/// A field that the reported status requires was missing or unparsable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("missing `{key}` for status {status}")]
    Missing { key: &'static str, status: &'static str },

    #[error("cannot parse `{key}` value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("unknown status code {0:?}")]
    UnknownStatus(String),
}

/// Raw execution status from isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateStatus {
    /// No `status` key: the program exited normally with code 0
    Ok,
    /// `TO`
    TimeOut,
    /// `RE`: non-zero exit code
    RuntimeError,
    /// `SG`: killed by a signal
    Signal,
    /// `XX`: isolate's own internal error
    InternalError,
}

impl IsolateStatus {
    pub fn from_meta(meta: &RawMetadata) -> Result<Self, DecodeError> {
        match meta.get("status").map(String::as_str) {
            None | Some("") => Ok(Self::Ok),
            Some("TO") => Ok(Self::TimeOut),
            Some("RE") => Ok(Self::RuntimeError),
            Some("SG") => Ok(Self::Signal),
            Some("XX") => Ok(Self::InternalError),
            Some(other) => Err(DecodeError::UnknownStatus(other.to_string())),
        }
    }

    fn code(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::TimeOut => "TO",
            Self::RuntimeError => "RE",
            Self::Signal => "SG",
            Self::InternalError => "XX",
        }
    }
}

/// Which meta key carries peak memory for the current accounting regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKey {
    /// `cg-mem`, reported when the box runs under a control group
    CgMem,
    /// `max-rss`, reported for classic rlimit boxes
    MaxRss,
}

impl MemoryKey {
    pub fn for_regime(cgroups_enabled: bool) -> Self {
        if cgroups_enabled {
            Self::CgMem
        } else {
            Self::MaxRss
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CgMem => "cg-mem",
            Self::MaxRss => "max-rss",
        }
    }
}

/// Typed view of a run's meta file
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    pub status: IsolateStatus,
    /// CPU time in seconds
    pub time: f64,
    /// Wall clock time in seconds
    pub wall_time: f64,
    /// Peak memory in KB
    pub memory_kb: u64,
    pub exit_code: i32,
    pub exit_signal: i32,
    /// isolate's human-readable `message`, if any
    pub message: Option<String>,
}

impl RunMetrics {
    /// Extract typed metrics.
    ///
    /// `OK`, `RE` and `SG` must carry `time`, `time-wall` and the regime's
    /// memory key; `RE` must carry `exitcode` and `SG` must carry `exitsig`.
    /// A required key that is missing, or any present key that does not
    /// parse, is an error rather than a zero.
    ///
    /// `TO` stands on its own: isolate may kill the box before it can measure
    /// anything. Missing measurements are listed in `message`.
    pub fn from_meta(meta: &RawMetadata, memory_key: MemoryKey) -> Result<Self, DecodeError> {
        let status = IsolateStatus::from_meta(meta)?;
        let required = match status {
            IsolateStatus::InternalError | IsolateStatus::TimeOut => None,
            _ => Some(status),
        };

        let time = measurement(meta, "time", required)?;
        let wall_time = measurement(meta, "time-wall", required)?;
        let memory_kb = field::<u64>(meta, memory_key.as_str(), required)?;
        let exit_code = field::<i32>(
            meta,
            "exitcode",
            (status == IsolateStatus::RuntimeError).then_some(status),
        )?;
        let exit_signal = field::<i32>(
            meta,
            "exitsig",
            (status == IsolateStatus::Signal).then_some(status),
        )?;

        let mut message = meta.get("message").filter(|m| !m.is_empty()).cloned();
        if status == IsolateStatus::TimeOut {
            let unmeasured: Vec<&str> = [
                ("time", time.is_none()),
                ("time-wall", wall_time.is_none()),
                (memory_key.as_str(), memory_kb.is_none()),
            ]
            .into_iter()
            .filter_map(|(key, missing)| missing.then_some(key))
            .collect();

            if !unmeasured.is_empty() {
                let note = format!("not measured: {}", unmeasured.join(", "));
                message = Some(match message {
                    Some(m) => format!("{} ({})", m, note),
                    None => note,
                });
            }
        }

        Ok(Self {
            status,
            time: time.unwrap_or_default(),
            wall_time: wall_time.unwrap_or_default(),
            memory_kb: memory_kb.unwrap_or_default(),
            exit_code: exit_code.unwrap_or_default(),
            exit_signal: exit_signal.unwrap_or_default(),
            message,
        })
    }
}

/// A time in seconds; must be a finite number when present.
fn measurement(
    meta: &RawMetadata,
    key: &'static str,
    required_by: Option<IsolateStatus>,
) -> Result<Option<f64>, DecodeError> {
    match field::<f64>(meta, key, required_by)? {
        Some(value) if !value.is_finite() => Err(DecodeError::Invalid {
            key,
            value: meta.get(key).cloned().unwrap_or_default(),
        }),
        value => Ok(value),
    }
}

/// Parse an optional key; `required_by` names the status that makes it mandatory.
fn field<T: FromStr>(
    meta: &RawMetadata,
    key: &'static str,
    required_by: Option<IsolateStatus>,
) -> Result<Option<T>, DecodeError> {
    match meta.get(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| DecodeError::Invalid {
                key,
                value: value.clone(),
            }),
        None => match required_by {
            Some(status) => Err(DecodeError::Missing {
                key,
                status: status.code(),
            }),
            None => Ok(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_on_first_colon() {
        let meta = decode(b"time:0.015\nmessage:Caught fatal signal 11: SIGSEGV\n\n");
        assert_eq!(meta["time"], "0.015");
        assert_eq!(meta["message"], "Caught fatal signal 11: SIGSEGV");
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn test_decode_ignores_garbage() {
        let meta = decode(b"not a meta file\n\xff\xfe\n");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_parse_meta_success() {
        let meta = decode(b"time:0.01\ntime-wall:0.02\ncg-mem:1024\nexitcode:0\n");
        let metrics = RunMetrics::from_meta(&meta, MemoryKey::CgMem).unwrap();

        assert_eq!(metrics.status, IsolateStatus::Ok);
        assert_eq!(metrics.time, 0.01);
        assert_eq!(metrics.wall_time, 0.02);
        assert_eq!(metrics.memory_kb, 1024);
        assert_eq!(metrics.exit_code, 0);
    }

    #[test]
    fn test_parse_meta_tle() {
        let meta = decode(b"time:1.000\ntime-wall:1.204\nmax-rss:2048\nstatus:TO\nkilled:1\n");
        let metrics = RunMetrics::from_meta(&meta, MemoryKey::MaxRss).unwrap();

        assert_eq!(metrics.status, IsolateStatus::TimeOut);
        assert_eq!(metrics.time, 1.0);
    }

    #[test]
    fn test_status_to_regardless_of_other_fields() {
        let meta = decode(b"status:TO\n");
        assert_eq!(IsolateStatus::from_meta(&meta), Ok(IsolateStatus::TimeOut));

        let metrics = RunMetrics::from_meta(&meta, MemoryKey::CgMem).unwrap();
        assert_eq!(metrics.status, IsolateStatus::TimeOut);
        assert_eq!(
            metrics.message.as_deref(),
            Some("not measured: time, time-wall, cg-mem")
        );
    }

    #[test]
    fn test_timeout_keeps_isolate_message() {
        let meta = decode(b"status:TO\ntime:2.001\nmessage:Time limit exceeded\n");
        let metrics = RunMetrics::from_meta(&meta, MemoryKey::MaxRss).unwrap();

        assert_eq!(metrics.time, 2.001);
        assert_eq!(
            metrics.message.as_deref(),
            Some("Time limit exceeded (not measured: time-wall, max-rss)")
        );
    }

    #[test]
    fn test_timeout_still_rejects_garbage_measurements() {
        let meta = decode(b"status:TO\ntime:soon\n");
        assert_eq!(
            RunMetrics::from_meta(&meta, MemoryKey::CgMem),
            Err(DecodeError::Invalid {
                key: "time",
                value: "soon".to_string()
            })
        );
    }

    #[test]
    fn test_non_finite_times_are_rejected() {
        for (report, key) in [
            (&b"time:NaN\ntime-wall:0.1\ncg-mem:10\n"[..], "time"),
            (&b"time:0.1\ntime-wall:inf\ncg-mem:10\n"[..], "time-wall"),
        ] {
            assert!(matches!(
                RunMetrics::from_meta(&decode(report), MemoryKey::CgMem),
                Err(DecodeError::Invalid { key: k, .. }) if k == key
            ));
        }
    }

    #[test]
    fn test_parse_meta_signal() {
        let meta = decode(
            b"time:0.001\ntime-wall:0.003\nmax-rss:1300\nstatus:SG\nexitsig:11\nmessage:Caught fatal signal 11\n",
        );
        let metrics = RunMetrics::from_meta(&meta, MemoryKey::MaxRss).unwrap();

        assert_eq!(metrics.status, IsolateStatus::Signal);
        assert_eq!(metrics.exit_signal, 11);
        assert_eq!(metrics.message.as_deref(), Some("Caught fatal signal 11"));
    }

    #[test]
    fn test_signal_without_exitsig_is_an_error() {
        let meta = decode(b"time:0.001\ntime-wall:0.003\nmax-rss:1300\nstatus:SG\n");
        assert_eq!(
            RunMetrics::from_meta(&meta, MemoryKey::MaxRss),
            Err(DecodeError::Missing {
                key: "exitsig",
                status: "SG"
            })
        );
    }

    #[test]
    fn test_wall_time_parse_failure_is_reported() {
        let meta = decode(b"time:0.5\ntime-wall:abc\ncg-mem:10\n");
        assert_eq!(
            RunMetrics::from_meta(&meta, MemoryKey::CgMem),
            Err(DecodeError::Invalid {
                key: "time-wall",
                value: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_memory_key_follows_regime() {
        let meta = decode(b"time:0.1\ntime-wall:0.1\nmax-rss:512\n");
        assert!(RunMetrics::from_meta(&meta, MemoryKey::MaxRss).is_ok());
        assert!(matches!(
            RunMetrics::from_meta(&meta, MemoryKey::CgMem),
            Err(DecodeError::Missing { key: "cg-mem", .. })
        ));
    }

    #[test]
    fn test_internal_error_needs_no_measurements() {
        let meta = decode(b"status:XX\nmessage:Cannot create control group\n");
        let metrics = RunMetrics::from_meta(&meta, MemoryKey::CgMem).unwrap();
        assert_eq!(metrics.status, IsolateStatus::InternalError);
    }

    #[test]
    fn test_unknown_status() {
        let meta = decode(b"status:ZZ\n");
        assert_eq!(
            IsolateStatus::from_meta(&meta),
            Err(DecodeError::UnknownStatus("ZZ".to_string()))
        );
    }
}
