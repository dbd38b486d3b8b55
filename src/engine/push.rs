//! Push: reconcile the local delta onto the remote table.
//!
//! Deletes run before upserts: reversing the order would re-create a row
//! under the same unique key before its predecessor is soft-deleted,
//! leaving a remote duplicate.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::accessor::{iso_string, read_field, serialize_key};
use crate::error::{Result, SyncError};
use crate::remote::{render_json_path, GatewayError, GatewayErrorKind, RemoteFilter, RemoteQuery};
use crate::types::{ChangedIds, PushConflict, PushSummary, SyncContext};

use super::{pk_string, set_field, TableEngine};

impl TableEngine {
    /// Push one table's local delta: soft-delete tombstoned rows, then
    /// upsert created and updated rows, writing the assigned remote ids
    /// back under suppression.
    pub async fn push(&self, changes: &ChangedIds, ctx: &SyncContext) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        self.push_deletes(&changes.deleted, &mut summary).await?;
        self.push_upserts(changes, ctx, &mut summary).await?;
        debug!(
            table = %self.descriptor.label,
            pushed = summary.pushed,
            conflicts = summary.conflicts.len(),
            "push complete"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Phase A — soft deletes
    // -----------------------------------------------------------------------

    async fn push_deletes(&self, ids: &[String], summary: &mut PushSummary) -> Result<()> {
        let descriptor = &self.descriptor;
        for id in ids {
            let Some(record) = self.store.find_by_id(&descriptor.local_table, id)? else {
                continue;
            };
            let Some(remote_id) = self.accessor.remote_id_of(&record) else {
                // Never reached the remote; the tombstone dies with us.
                continue;
            };

            let mut patch = Map::new();
            patch.insert(descriptor.soft_delete_field.clone(), Value::Bool(true));
            patch.insert(
                descriptor.timestamps.remote_field.clone(),
                Value::String(iso_string((self.time_provider)())),
            );

            let affected = self
                .gateway
                .update(
                    &descriptor.remote_table,
                    &descriptor.keys.remote_pk,
                    &Value::String(remote_id.clone()),
                    &Value::Object(patch),
                )
                .await?;
            if affected.is_empty() {
                debug!(table = %descriptor.label, remote_id, "soft delete matched no remote row");
            } else {
                summary.pushed += 1;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase B — upserts
    // -----------------------------------------------------------------------

    async fn push_upserts(
        &self,
        changes: &ChangedIds,
        ctx: &SyncContext,
        summary: &mut PushSummary,
    ) -> Result<()> {
        let descriptor = &self.descriptor;
        for id in changes.upsert_ids() {
            let Some(record) = self.store.find_by_id(&descriptor.local_table, id)? else {
                continue;
            };
            if let Some(filter) = &descriptor.should_sync_local {
                if !filter(&record, ctx) {
                    continue;
                }
            }

            let mut payload = (descriptor.local_to_remote)(&record, ctx);
            if !payload.is_object() {
                return Err(SyncError::MapperOutput {
                    table: descriptor.local_table.clone(),
                });
            }
            if let (Some(scope), Some(user_id)) = (&descriptor.scope, &ctx.user_id) {
                if read_field(&payload, &scope.user_field).is_none() {
                    set_field(&mut payload, &scope.user_field, Value::String(user_id.clone()));
                }
            }

            let local_ts = self.accessor.record_timestamp_ms(&record);
            let previous_remote_id = self.accessor.remote_id_of(&record);
            let target = match &previous_remote_id {
                Some(remote_id) => Some(remote_id.clone()),
                None => self.resolve_target_by_unique_key(&record, ctx).await?,
            };

            let returned = match target {
                Some(remote_id) => {
                    let current = self
                        .gateway
                        .find_by_pk(
                            &descriptor.remote_table,
                            &descriptor.keys.remote_pk,
                            &Value::String(remote_id.clone()),
                        )
                        .await?;
                    let remote_ts = current
                        .as_ref()
                        .map(|row| self.remote_timestamp_ms(row))
                        .unwrap_or(0);

                    // Last-write-wins, remote on ties: skipping on equality
                    // is what breaks symmetric push/pull cycles. The
                    // write-back still runs so a target resolved by unique
                    // key gets its remote id recorded even when the push
                    // itself is skipped.
                    if remote_ts >= local_ts {
                        summary.conflicts.push(PushConflict {
                            local_id: id.clone(),
                            remote_id: remote_id.clone(),
                            local_updated_at: local_ts,
                            remote_updated_at: remote_ts,
                        });
                        self.write_back(
                            id,
                            previous_remote_id.as_deref(),
                            &remote_id,
                            current.as_ref(),
                            local_ts,
                        )?;
                        continue;
                    }

                    let rows = self
                        .gateway
                        .update(
                            &descriptor.remote_table,
                            &descriptor.keys.remote_pk,
                            &Value::String(remote_id.clone()),
                            &payload,
                        )
                        .await?;
                    if rows.is_empty() {
                        warn!(table = %descriptor.label, remote_id, "update matched no remote row");
                        continue;
                    }
                    summary.pushed += 1;
                    (remote_id, rows.into_iter().next())
                }
                None => {
                    let rows = self.gateway.insert(&descriptor.remote_table, &payload).await?;
                    let Some(row) = rows.into_iter().next() else {
                        return Err(GatewayError::with_kind(
                            format!("insert into {} returned no rows", descriptor.remote_table),
                            GatewayErrorKind::Permanent,
                        )
                        .into());
                    };
                    let Some(pk) = read_field(&row, &descriptor.keys.remote_pk) else {
                        return Err(GatewayError::with_kind(
                            format!(
                                "insert into {} returned a row without a primary key",
                                descriptor.remote_table
                            ),
                            GatewayErrorKind::Permanent,
                        )
                        .into());
                    };
                    summary.pushed += 1;
                    (pk_string(pk), Some(row))
                }
            };

            let (new_remote_id, returned_row) = returned;
            self.write_back(
                id,
                previous_remote_id.as_deref(),
                &new_remote_id,
                returned_row.as_ref(),
                local_ts,
            )?;
        }
        Ok(())
    }

    /// Find the live remote row whose unique-key columns equal this
    /// record's extracted values, if unique keys are configured. The
    /// query carries the context's user scope: another user's row is
    /// never a link target.
    async fn resolve_target_by_unique_key(
        &self,
        record: &Value,
        ctx: &SyncContext,
    ) -> Result<Option<String>> {
        let descriptor = &self.descriptor;
        if descriptor.keys.unique_keys.is_empty() {
            return Ok(None);
        }

        let values = self.accessor.unique_key_values(record)?;
        let mut filters: Vec<RemoteFilter> = descriptor
            .keys
            .unique_keys
            .iter()
            .zip(values.iter())
            .map(|(key, value)| RemoteFilter::eq(render_json_path(&key.remote_path), value.clone()))
            .collect();
        filters.push(RemoteFilter::eq(
            descriptor.soft_delete_field.clone(),
            Value::Bool(false),
        ));
        if let Some(filter) = self.scope_filter(ctx) {
            filters.push(filter);
        }

        let rows = self
            .gateway
            .select(
                &descriptor.remote_table,
                &RemoteQuery {
                    filters,
                    range: Some((0, 0)),
                },
            )
            .await?;

        match rows.first().and_then(|row| read_field(row, &descriptor.keys.remote_pk)) {
            Some(pk) => {
                debug!(
                    table = %descriptor.label,
                    key = %serialize_key(&values),
                    "linked local record to existing remote row by unique key"
                );
                Ok(Some(pk_string(pk)))
            }
            None => Ok(None),
        }
    }

    /// Record the remote linkage locally: remote id plus the remote row's
    /// timestamp, in one suppressed atomic write — and only when something
    /// actually moved, otherwise every push would dirty the row again and
    /// provoke another cycle.
    fn write_back(
        &self,
        local_id: &str,
        previous_remote_id: Option<&str>,
        new_remote_id: &str,
        returned_row: Option<&Value>,
        local_ts: i64,
    ) -> Result<()> {
        let descriptor = &self.descriptor;
        let remote_ts = returned_row
            .map(|row| self.remote_timestamp_ms(row))
            .filter(|ms| *ms > 0)
            .unwrap_or(local_ts);

        let id_changed = previous_remote_id != Some(new_remote_id);
        if !id_changed && remote_ts <= local_ts {
            return Ok(());
        }

        let fields = [
            (
                descriptor.keys.local_remote_id_field.clone(),
                Value::String(new_remote_id.to_string()),
            ),
            (
                descriptor.timestamps.local_field.clone(),
                remote_ts.into(),
            ),
        ];
        self.accessor
            .write_suppressed(&self.suppressor, local_id, &fields)
    }
}
