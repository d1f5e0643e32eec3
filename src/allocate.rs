//! Guest id allocation.
//!
//! The cluster hands out the lowest free id at the instant of the call.
//! Nothing is reserved: two callers racing can get the same id, and the
//! loser's create fails with the server's conflict error.

use crate::api::ClusterApi;
use crate::error::PveError;

pub async fn next_id<A: ClusterApi>(api: &A) -> Result<u32, PveError> {
    let id = api.next_id().await?;
    tracing::debug!(id, "allocated guest id");
    Ok(id)
}

/// Use `requested` when given, otherwise allocate. `0` counts as not given.
pub async fn resolve_new_id<A: ClusterApi>(
    api: &A,
    requested: Option<u32>,
) -> Result<u32, PveError> {
    match requested {
        Some(id) if id > 0 => Ok(id),
        _ => next_id(api).await,
    }
}
