//! Dependency graph validation
//!
//! The receive engine gates each module's hand-off on its predecessors,
//! so a cycle in `dependsOnIds` would deadlock the wait-set topology.
//! Validation runs before any fetch is started.

use crate::Manifest;
use std::collections::HashSet;
use zipline_errors::{Error, ManifestError};

/// Validate the module dependency graph of a manifest
///
/// # Errors
/// Returns `MissingDependency` if a `dependsOnIds` entry does not name a
/// module, or `CycleDetected` if the graph is not acyclic.
pub fn validate(manifest: &Manifest) -> Result<(), Error> {
    for (id, module) in &manifest.modules {
        for dep in &module.depends_on_ids {
            if !manifest.modules.contains_key(dep) {
                return Err(ManifestError::MissingDependency {
                    id: dep.clone(),
                    required_by: id.clone(),
                }
                .into());
            }
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for id in manifest.modules.keys() {
        if !visited.contains(id.as_str())
            && has_cycle(manifest, id, &mut visited, &mut rec_stack)
        {
            return Err(ManifestError::CycleDetected { id: id.clone() }.into());
        }
    }

    Ok(())
}

/// DFS cycle check over `dependsOnIds` edges
fn has_cycle<'a>(
    manifest: &'a Manifest,
    id: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> bool {
    visited.insert(id);
    rec_stack.insert(id);

    if let Some(module) = manifest.modules.get(id) {
        for dep in &module.depends_on_ids {
            if !visited.contains(dep.as_str()) {
                if has_cycle(manifest, dep, visited, rec_stack) {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                return true;
            }
        }
    }

    rec_stack.remove(id);
    false
}
