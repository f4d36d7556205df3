use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use bay_domain::OwnerId;
use bay_store::{IdempotencyRecord, MetadataStore, StoreError};
use tracing::debug;

use crate::error::Error;

/// A response as recorded for replay: exactly the status and body the
/// first execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

/// Run `op` under an optional idempotency key.
///
/// With a key, a matching prior record replays its response byte-identically
/// and a mismatched fingerprint is rejected as a conflict — that shape means
/// the client reused a key for a different request. Only successful (2xx)
/// outcomes are recorded; failures may be retried with the same key.
pub async fn with_idempotency<F, Fut>(
    store: &Arc<dyn MetadataStore>,
    owner: &OwnerId,
    key: Option<&str>,
    fingerprint: &str,
    retention: Duration,
    op: F,
) -> Result<StoredResponse, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, Error>>,
{
    let Some(key) = key else {
        return op().await;
    };

    if let Some(record) = store.get_idempotency(owner, key).await? {
        if record.request_fingerprint == fingerprint {
            debug!(owner = %owner, key = %key, "idempotent replay");
            return Ok(StoredResponse {
                status: record.response_status,
                body: record.response_body,
            });
        }
        return Err(Error::Conflict(format!(
            "idempotency key '{key}' was used with a different request"
        )));
    }

    let response = op().await?;

    if (200..300).contains(&response.status) {
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            owner: owner.clone(),
            request_fingerprint: fingerprint.to_string(),
            response_status: response.status,
            response_body: response.body.clone(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(retention)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
        };
        match store.put_idempotency(&record).await {
            Ok(()) => {}
            // Lost a race with a concurrent request holding the same key:
            // the winner's stored response is the canonical one.
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                if let Some(winner) = store.get_idempotency(owner, key).await? {
                    if winner.request_fingerprint == fingerprint {
                        return Ok(StoredResponse {
                            status: winner.response_status,
                            body: winner.response_body,
                        });
                    }
                    return Err(Error::Conflict(format!(
                        "idempotency key '{key}' was used with a different request"
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(response)
}
