//! Usage-window accounting (spec §3's `Account`/`AccountUsage`
//! aggregate, Testable Property 6): opens a window the first time a
//! UserService goes in-use, closes it idempotently when it stops.
//!
//! The open window's row id is stashed in the UserService's property
//! bag rather than looked up fresh each time, so `set_in_use(true)`
//! twice in a row without an intervening `false` never opens a second
//! window.

use chrono::{DateTime, Utc};

use uds_domain::entities::{AccountUsage, UserService};
use uds_domain::ids::InternalId;
use uds_domain::Result;
use uds_store::Store;

const ACCOUNT_USAGE_PROPERTY: &str = "usageAccountStart";

/// Opens a usage window for `us` if it carries an `account_id` and does
/// not already have one open, returning the property to stash back onto
/// the row (caller persists it under lock alongside the `in_use` flip).
pub async fn open_if_needed(store: &dyn Store, us: &UserService, at: DateTime<Utc>) -> Result<Option<(String, String)>> {
    if us.get_property(ACCOUNT_USAGE_PROPERTY).is_some() {
        return Ok(None);
    }
    let Some(account_id) = us.account_id else {
        return Ok(None);
    };
    let usage = store
        .open_account_usage(AccountUsage {
            id: 0,
            account_id,
            user_service_id: us.uuid,
            user_name: us.user_id.map(|u| u.to_string()).unwrap_or_default(),
            pool_name: us.pool_id.to_string(),
            start: at,
            end: None,
        })
        .await?;
    Ok(Some((ACCOUNT_USAGE_PROPERTY.to_string(), usage.id.to_string())))
}

/// Closes the usage window open on `us`, if any, and reports the
/// property key that should be removed from the row.
pub async fn close_if_open(store: &dyn Store, us: &UserService, at: DateTime<Utc>) -> Result<Option<&'static str>> {
    let Some(usage_id) = us
        .get_property(ACCOUNT_USAGE_PROPERTY)
        .and_then(|s| s.parse::<InternalId>().ok())
    else {
        return Ok(None);
    };
    store.close_account_usage(usage_id, at).await?;
    Ok(Some(ACCOUNT_USAGE_PROPERTY))
}
