//! Stable device identifier attached to batch submissions.

use uuid::Uuid;

use crate::storage::Database;

const DEVICE_KEY: &str = "device_id";

/// Load the persisted device id, creating one on first use.
///
/// If storage is unavailable an ephemeral id is returned so submissions can
/// still proceed.
#[must_use]
pub fn device_id(db: &Database) -> String {
    match db.get_meta(DEVICE_KEY) {
        Ok(Some(id)) => return id,
        Ok(None) => {},
        Err(e) => tracing::warn!(error = %e, "could not read device id"),
    }

    let id = format!("device-{}", Uuid::new_v4());
    if let Err(e) = db.set_meta(DEVICE_KEY, &id) {
        tracing::warn!(error = %e, "device id will not survive restart");
    }
    id
}
