use beacon_core::StoreError;

/// SQLSTATE classes worth retrying: serialization failures, deadlocks and
/// connection exceptions.
const TRANSIENT_STATES: &[&str] = &["40001", "40P01", "57P01", "57P03"];

/// Map a sqlx error onto the store taxonomy.
///
/// Connection-level failures become [`StoreError::Unavailable`] so the
/// processor retries them; everything else is a hard failure.
#[must_use]
pub fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Tls(e) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db)
            if db
                .code()
                .is_some_and(|code| code.starts_with("08") || TRANSIENT_STATES.contains(&&*code)) =>
        {
            StoreError::Unavailable(db.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Serialization(error.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_transient() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_sqlx_error(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn logical_failures_are_not() {
        assert!(matches!(map_sqlx_error(sqlx::Error::RowNotFound), StoreError::Database(_)));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::ColumnNotFound("props".to_string())),
            StoreError::Database(_)
        ));
    }
}
