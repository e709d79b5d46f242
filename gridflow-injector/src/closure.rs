//! Data-identifier closure resolution
//!
//! Flattens a rule's target (container → dataset → file) into the member
//! files the evaluator places, tagging each file with the dataset it was
//! reached through so DATASET grouping can form its units.

use crate::evaluator::FileSpec;
use crate::store::{InventoryClient, StoreResult};
use gridflow_core::DataIdentifier;
use gridflow_metadata::DidKind;
use std::collections::HashSet;
use tracing::warn;

/// Resolve the flattened file closure of a data identifier.
///
/// The walk is iterative and cycle-safe; files are returned in a
/// deterministic (scope, name) order.
pub async fn resolve_closure(
    inventory: &dyn InventoryClient,
    scope: &str,
    name: &str,
) -> StoreResult<Vec<FileSpec>> {
    let root = inventory
        .get_did(scope, name)
        .await?
        .ok_or_else(|| format!("data identifier {}:{} not found", scope, name))?;

    let mut files = Vec::new();
    let mut visited: HashSet<(String, String)> = HashSet::new();
    // (scope, name, kind, parent dataset)
    let mut stack: Vec<(String, String, DidKind, Option<DataIdentifier>)> = vec![(
        root.scope.clone(),
        root.name.clone(),
        root.did_kind,
        None,
    )];

    if root.did_kind == DidKind::File {
        return Ok(vec![FileSpec {
            scope: root.scope,
            name: root.name,
            bytes: root.bytes.unwrap_or(0),
            dataset: None,
        }]);
    }

    while let Some((scope, name, kind, dataset)) = stack.pop() {
        if !visited.insert((scope.clone(), name.clone())) {
            continue;
        }

        let children = inventory.list_children(&scope, &name).await?;
        for child in children {
            let Some(record) = inventory
                .get_did(&child.child_scope, &child.child_name)
                .await?
            else {
                warn!(
                    did = %format!("{}:{}", child.child_scope, child.child_name),
                    "Dangling attachment, skipped"
                );
                continue;
            };

            match record.did_kind {
                DidKind::File => files.push(FileSpec {
                    scope: record.scope,
                    name: record.name,
                    bytes: record.bytes.unwrap_or(0),
                    dataset: if kind == DidKind::Dataset {
                        Some(DataIdentifier::new(scope.clone(), name.clone()))
                    } else {
                        dataset.clone()
                    },
                }),
                DidKind::Dataset => stack.push((
                    record.scope,
                    record.name,
                    DidKind::Dataset,
                    dataset.clone(),
                )),
                DidKind::Container => stack.push((
                    record.scope,
                    record.name,
                    DidKind::Container,
                    dataset.clone(),
                )),
            }
        }
    }

    files.sort_by(|a, b| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));
    files.dedup_by(|a, b| a.scope == b.scope && a.name == b.name);
    Ok(files)
}
