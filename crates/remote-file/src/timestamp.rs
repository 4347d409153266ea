use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use filetime::FileTime;

use crate::error::{Error, Result};

/// Obsolete HTTP-date forms recipients still have to accept: RFC 850 and
/// asctime. Both are UTC.
const OBSOLETE_HTTP_DATE_FORMATS: &[&str] =
    &["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"];

/// Parse an HTTP-date (`Last-Modified`) value.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc2822(raw) {
        return Some(t.with_timezone(&Utc));
    }
    OBSOLETE_HTTP_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// FTP MDTM replies are UTC without an offset.
pub fn from_ftp_mdtm(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Timestamps are equal when they fall in the same whole second.
pub fn same_second(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}

pub fn to_file_time(t: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(t.timestamp(), t.timestamp_subsec_nanos())
}

/// Modification time of `path`, or `None` when it does not exist.
pub fn local_mtime(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("failed to stat {}", path.display()), e)),
    };
    let ft = FileTime::from_last_modification_time(&meta);
    Ok(DateTime::from_timestamp(ft.unix_seconds(), ft.nanoseconds()))
}

/// Set both access and modification time of `path`.
pub fn set_file_times(path: &Path, t: DateTime<Utc>) -> Result<()> {
    let ft = to_file_time(t);
    filetime::set_file_times(path, ft, ft).map_err(|e| {
        Error::io(
            format!("failed to set timestamps on {}", path.display()),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_imf_fixdate() {
        let t = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").expect("parse");
        assert_eq!(t.timestamp(), 784111777);
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn parses_rfc850_and_asctime_dates() {
        for raw in ["Sunday, 06-Nov-94 08:49:37 GMT", "Sun Nov  6 08:49:37 1994"] {
            let t = parse_http_date(raw).unwrap_or_else(|| panic!("parse {raw:?}"));
            assert_eq!(t.timestamp(), 784111777, "{raw}");
        }
    }

    #[test]
    fn sub_second_differences_are_equal() {
        let a = DateTime::from_timestamp(1_700_000_000, 100).unwrap();
        let b = DateTime::from_timestamp(1_700_000_000, 999_000_000).unwrap();
        let c = DateTime::from_timestamp(1_700_000_001, 0).unwrap();
        assert!(same_second(a, b));
        assert!(!same_second(a, c));
    }

    #[test]
    fn mdtm_is_utc() {
        let naive =
            NaiveDateTime::parse_from_str("20240102030405", "%Y%m%d%H%M%S").expect("naive");
        assert_eq!(from_ftp_mdtm(naive).to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn set_and_read_back_mtime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("f");
        assert_eq!(local_mtime(&p).unwrap(), None);
        fs::write(&p, "x").expect("write");
        let t = from_unix(1_000_000_000).unwrap();
        set_file_times(&p, t).expect("set times");
        assert!(same_second(local_mtime(&p).unwrap().unwrap(), t));
    }
}
