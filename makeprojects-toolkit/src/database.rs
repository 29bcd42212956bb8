//! PostgreSQL pool creation for the `database` backend

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{config::DatabaseConfig, error::Result};

/// Create a pool from `config`, retrying with exponential backoff
///
/// Waits `retry_delay_secs * 2^(attempt-1)` between attempts and gives up
/// after `max_retries` retries.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt = 0;

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::error!(
                        url = %sanitize_connection_url(&config.url),
                        "Failed to connect to database after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = config.retry_delay(attempt);
                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout())
        .connect(&config.url)
        .await
        .map_err(|e| {
            crate::error::Error::Internal(format!(
                "Failed to connect to database at '{}' ({}): {}",
                sanitize_connection_url(&config.url),
                categorize_db_error(&e),
                e
            ))
        })
}

/// Mask the password in a connection URL for logging
fn sanitize_connection_url(url: &str) -> String {
    let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) else {
        return url.to_string();
    };
    let credentials = &url[scheme_end + 3..at_pos];
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at_pos..]),
        None => url.to_string(),
    }
}

fn categorize_db_error(err: &sqlx::Error) -> &'static str {
    match err {
        sqlx::Error::Configuration(_) => "configuration error",
        sqlx::Error::Io(_) => "network I/O error",
        sqlx::Error::Tls(_) => "TLS error",
        sqlx::Error::PoolTimedOut => "pool timed out",
        sqlx::Error::Database(_) => "database error",
        _ => "connection error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_masks_password() {
        assert_eq!(
            sanitize_connection_url("postgres://app:s3cret@db:5432/projects"),
            "postgres://app:***@db:5432/projects"
        );
    }

    #[test]
    fn test_sanitize_leaves_passwordless_urls() {
        assert_eq!(
            sanitize_connection_url("postgres://db/projects"),
            "postgres://db/projects"
        );
        assert_eq!(
            sanitize_connection_url("postgres://app@db/projects"),
            "postgres://app@db/projects"
        );
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize_db_error(&sqlx::Error::PoolTimedOut), "pool timed out");
        assert_eq!(categorize_db_error(&sqlx::Error::RowNotFound), "connection error");
    }
}
