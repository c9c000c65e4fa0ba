use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::store::{StoreError, Transaction};

/// True when the member already holds `limit` or more live reservations
/// ending after `now`.
pub async fn exceeds_active_limit(
    tx: &mut impl Transaction,
    member: Ulid,
    now: NaiveDateTime,
    limit: usize,
) -> Result<bool, StoreError> {
    Ok(tx.count_active_reservations(member, now).await? >= limit)
}
