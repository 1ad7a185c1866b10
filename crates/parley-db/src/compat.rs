//! Schema compatibility shim.
//!
//! Deployments that predate the `is_group` column still run the current
//! binary. Every statement touching that column goes through
//! [`with_column_fallback`]: run the primary statement, and if SQLite
//! reports that exact column as missing, run a reduced statement that
//! omits it. Any other failure propagates untouched.

use rusqlite::Error;

/// Run `primary`; if it failed because `column` does not exist in the
/// schema, run `fallback` instead.
pub fn with_column_fallback<T>(
    column: &str,
    primary: impl FnOnce() -> Result<T, Error>,
    fallback: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    match primary() {
        Err(ref e) if is_missing_column(e, column) => fallback(),
        other => other,
    }
}

/// Match the two signatures SQLite uses for an unknown column:
/// "table X has no column named Y" on INSERT, "no such column: Y" (which
/// may be table-qualified, "no such column: m.Y") on SELECT. Anything
/// else is a real failure.
fn is_missing_column(err: &Error, column: &str) -> bool {
    let msg = match err {
        Error::SqliteFailure(_, Some(msg)) => msg.as_str(),
        _ => return false,
    };
    (msg.contains("no column named") || msg.contains("no such column:"))
        && msg.contains(column)
}
