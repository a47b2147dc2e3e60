//! Pre-flight checks run before any worker starts

use tracing::info;

use crate::dynamo::TableStore;
use crate::errors::{Error, Result};
use crate::models::{CapacityKind, TableDescription};
use crate::retry::Supervisor;

/// Describe the table and make sure it can take the requested load
///
/// The table must be ACTIVE. A provisioned table must have at least
/// `requested` units of `kind` capacity; on-demand tables always pass.
pub async fn check_table(
    store: &dyn TableStore,
    supervisor: &Supervisor,
    kind: CapacityKind,
    requested: Option<u32>,
) -> Result<TableDescription> {
    let table = supervisor
        .run("describe_table", 0, || store.describe_table())
        .await?;

    info!(table = %table.table_name, status = %table.status, item_count = ?table.item_count, "Table described");
    if !table.is_active() {
        return Err(Error::TableNotActive {
            table: table.table_name.clone(),
            status: table.status.clone(),
        });
    }

    match table.provisioned(kind) {
        Some(provisioned) => {
            info!(kind = %kind, provisioned, "Table uses provisioned capacity");
            if let Some(requested) = requested {
                if provisioned < i64::from(requested) {
                    return Err(Error::InsufficientCapacity {
                        table: table.table_name.clone(),
                        provisioned,
                        requested,
                    });
                }
            }
        }
        None => info!("Table uses on-demand capacity"),
    }

    Ok(table)
}
