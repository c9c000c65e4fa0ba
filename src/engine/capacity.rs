use crate::model::Session;
use crate::store::{StoreError, Transaction};

/// Whether one more member fits: live registrations below the session's
/// capacity. Must be read in the transaction that inserts the registration.
pub async fn has_free_slot(tx: &mut impl Transaction, session: &Session) -> Result<bool, StoreError> {
    let taken = tx.count_registrations(session.id).await?;
    Ok(taken < session.capacity)
}
