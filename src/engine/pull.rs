//! Pull: fetch the remote delta and turn it into a local patch.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::accessor::{iso_string, parse_iso_ms, read_field, serialize_key};
use crate::error::{Result, SyncError};
use crate::remote::{RemoteFilter, RemoteQuery};
use crate::types::{PullOutcome, SyncContext};

use super::{pk_string, set_field, TableEngine, PULL_PAGE_SIZE};

/// Per-pull matching state. The unique index is built at most once, on the
/// first row that needs it.
struct PullMatcher {
    unique_index: Option<HashMap<String, Value>>,
    seen_remote_keys: HashSet<String>,
}

impl TableEngine {
    /// Fetch all remote rows with `remote_timestamp >= last_pulled_at`
    /// (every row on first sync), match them to local records, and emit a
    /// patch ready for atomic application.
    ///
    /// The timestamp filter is inclusive: combined with the strictly-newer
    /// comparison in the merge this redelivers rows written in the same
    /// millisecond as the previous cycle's start instead of losing them.
    pub async fn pull(&self, last_pulled_at: Option<i64>, ctx: &SyncContext) -> Result<PullOutcome> {
        let descriptor = &self.descriptor;

        let mut filters = Vec::new();
        if let Some(filter) = self.scope_filter(ctx) {
            filters.push(filter);
        }
        if let Some(since) = last_pulled_at {
            filters.push(RemoteFilter::gte(
                descriptor.timestamps.remote_field.clone(),
                Value::String(iso_string(since)),
            ));
        }

        let mut outcome = PullOutcome::default();
        let mut matcher = PullMatcher {
            unique_index: None,
            seen_remote_keys: HashSet::new(),
        };

        let mut from = 0usize;
        loop {
            let query = RemoteQuery {
                filters: filters.clone(),
                range: Some((from, from + PULL_PAGE_SIZE - 1)),
            };
            let rows = self.gateway.select(&descriptor.remote_table, &query).await?;
            let page_len = rows.len();

            for row in &rows {
                self.merge_remote_row(row, ctx, &mut matcher, &mut outcome)?;
            }

            if page_len < PULL_PAGE_SIZE {
                break;
            }
            from += PULL_PAGE_SIZE;
        }

        debug!(
            table = %descriptor.label,
            created = outcome.patch.created.len(),
            updated = outcome.patch.updated.len(),
            deleted = outcome.patch.deleted.len(),
            "pull complete"
        );
        Ok(outcome)
    }

    fn merge_remote_row(
        &self,
        row: &Value,
        ctx: &SyncContext,
        matcher: &mut PullMatcher,
        outcome: &mut PullOutcome,
    ) -> Result<()> {
        let descriptor = &self.descriptor;

        let Some(pk) = read_field(row, &descriptor.keys.remote_pk) else {
            warn!(table = %descriptor.label, "remote row without primary key; skipping");
            return Ok(());
        };
        let remote_id = pk_string(pk);
        let is_deleted = self.remote_is_deleted(row);
        let remote_ts = self.remote_timestamp_ms(row);
        outcome.max_remote_updated_at = outcome.max_remote_updated_at.max(Some(remote_ts));

        let mut local = self.accessor.find_by_remote_id(&remote_id)?;

        // Unique-key matching covers live rows only: soft-deleted rows may
        // legitimately share a key with their live successor, and an old
        // tombstone must not claim an unrelated new local row.
        if !is_deleted && !descriptor.keys.unique_keys.is_empty() {
            if let Some(values) = self.remote_unique_key_values(row) {
                let key = serialize_key(&values);
                if !matcher.seen_remote_keys.insert(key.clone()) {
                    return Err(SyncError::DuplicateRemoteKey {
                        table: descriptor.remote_table.clone(),
                        key,
                    });
                }
                if local.is_none() {
                    if matcher.unique_index.is_none() {
                        matcher.unique_index = Some(self.accessor.build_unique_index(ctx)?);
                    }
                    local = matcher
                        .unique_index
                        .as_ref()
                        .and_then(|index| index.get(&key))
                        .cloned();
                }
            }
        }

        if is_deleted {
            if let Some(local) = local {
                outcome.patch.deleted.push(self.accessor.record_id(&local)?);
            }
            return Ok(());
        }

        let mut mapped = (descriptor.remote_to_local)(row, ctx);
        if !mapped.is_object() {
            return Err(SyncError::MapperOutput {
                table: descriptor.local_table.clone(),
            });
        }
        if read_field(&mapped, &descriptor.keys.local_remote_id_field).is_none() {
            set_field(
                &mut mapped,
                &descriptor.keys.local_remote_id_field,
                Value::String(remote_id.clone()),
            );
        }
        if read_field(&mapped, &descriptor.timestamps.local_field).is_none() {
            let ms = read_field(row, &descriptor.timestamps.remote_field)
                .and_then(Value::as_str)
                .and_then(parse_iso_ms)
                .unwrap_or(remote_ts);
            set_field(&mut mapped, &descriptor.timestamps.local_field, ms.into());
        }

        match local {
            Some(local) => {
                let local_ts = self.accessor.record_timestamp_ms(&local);
                // Strictly newer only: on equality the remote has merely
                // caught up, and reapplying would churn the row and
                // re-trigger a cycle.
                if remote_ts > local_ts {
                    let id = self.accessor.record_id(&local)?;
                    set_field(&mut mapped, "id", Value::String(id));
                    outcome.patch.updated.push(mapped);
                }
            }
            None => {
                let id = format!("{}:{}", descriptor.local_table, remote_id);
                set_field(&mut mapped, "id", Value::String(id));
                outcome.patch.created.push(mapped);
            }
        }
        Ok(())
    }
}
