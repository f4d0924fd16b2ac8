use std::error::Error as StdError;

/// Format a tokio-postgres error for display, preferring the database error
/// detail when present.
pub fn format_pg_error(e: &tokio_postgres::Error) -> String {
    let mut msg = e.to_string();

    // Server-reported errors carry the useful message.
    if let Some(db_err) = e.as_db_error() {
        msg = db_err.to_string();
    } else if let Some(source) = e.source() {
        msg = format!("{}: {}", msg, source);
    }

    msg
}
