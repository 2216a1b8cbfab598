//! Task types ("cores") and their implementation variants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::resources::ResourceDescription;

/// Index of a task type in the catalog.
pub type CoreId = u32;
/// Index of an implementation within its task type.
pub type ImplId = u32;

/// One way of running a task type, with its own requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub core_id: CoreId,
    pub impl_id: ImplId,
    pub signature: String,
    pub requirements: ResourceDescription,
}

/// A task type and its implementations, in preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreDefinition {
    pub core_id: CoreId,
    pub signature: String,
    pub implementations: Vec<Implementation>,
}

/// Registry of task types known to the session.
///
/// Task types are discovered at runtime and never removed; ids are dense
/// and assigned in registration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreCatalog {
    cores: BTreeMap<CoreId, CoreDefinition>,
}

impl CoreCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type, returning its id. Registering a known
    /// signature again returns the existing id.
    pub fn register_core(&mut self, signature: &str) -> CoreId {
        if let Some(existing) = self.find_by_signature(signature) {
            return existing;
        }
        let core_id = self.cores.len() as CoreId;
        self.cores.insert(
            core_id,
            CoreDefinition {
                core_id,
                signature: signature.to_string(),
                implementations: Vec::new(),
            },
        );
        core_id
    }

    /// Append implementation variants to a known task type.
    pub fn add_implementations(
        &mut self,
        core_id: CoreId,
        variants: Vec<(String, ResourceDescription)>,
    ) -> CoreResult<Vec<ImplId>> {
        let core = self
            .cores
            .get_mut(&core_id)
            .ok_or(CoreError::UnknownCore(core_id))?;

        let mut ids = Vec::with_capacity(variants.len());
        for (signature, requirements) in variants {
            let impl_id = core.implementations.len() as ImplId;
            core.implementations.push(Implementation {
                core_id,
                impl_id,
                signature,
                requirements,
            });
            ids.push(impl_id);
        }
        Ok(ids)
    }

    /// Implementations of `core_id`; empty for an unknown type.
    pub fn implementations(&self, core_id: CoreId) -> &[Implementation] {
        self.cores
            .get(&core_id)
            .map(|c| c.implementations.as_slice())
            .unwrap_or(&[])
    }

    /// One implementation, or `UnknownImplementation`.
    pub fn implementation(&self, core_id: CoreId, impl_id: ImplId) -> CoreResult<&Implementation> {
        self.implementations(core_id)
            .get(impl_id as usize)
            .ok_or(CoreError::UnknownImplementation { core_id, impl_id })
    }

    pub fn core(&self, core_id: CoreId) -> Option<&CoreDefinition> {
        self.cores.get(&core_id)
    }

    /// The task type registered under `signature`.
    pub fn find_by_signature(&self, signature: &str) -> Option<CoreId> {
        self.cores
            .values()
            .find(|c| c.signature == signature)
            .map(|c| c.core_id)
    }

    pub fn core_ids(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.cores.keys().copied()
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_core_is_idempotent() {
        let mut catalog = CoreCatalog::new();
        let a = catalog.register_core("matmul");
        let b = catalog.register_core("fft");
        assert_eq!((a, b), (0, 1));
        assert_eq!(catalog.register_core("matmul"), 0);
        assert_eq!(catalog.core_count(), 2);
    }

    #[test]
    fn test_implementations_grow_in_order() {
        let mut catalog = CoreCatalog::new();
        let core = catalog.register_core("matmul");
        let ids = catalog
            .add_implementations(
                core,
                vec![
                    ("matmul_cpu".into(), ResourceDescription::cpus(1)),
                    ("matmul_big".into(), ResourceDescription::cpus(4)),
                ],
            )
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(catalog.implementation(core, 1).unwrap().signature, "matmul_big");
        assert!(matches!(
            catalog.implementation(core, 7),
            Err(CoreError::UnknownImplementation { impl_id: 7, .. })
        ));
    }

    #[test]
    fn test_unknown_core_is_rejected() {
        let mut catalog = CoreCatalog::new();
        let err = catalog
            .add_implementations(3, vec![("x".into(), ResourceDescription::cpus(1))])
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownCore(3)));
        assert!(catalog.implementations(3).is_empty());
    }
}
