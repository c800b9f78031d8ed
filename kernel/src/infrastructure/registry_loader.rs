// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Filesystem registry provider.
//!
//! Loads the base document from `registry_path` and applies override
//! layers from `layers_dir` in effective order: base → org → tenant →
//! user. Each produced [`EffectiveRegistry`] is an immutable snapshot.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::domain::ports::RegistryProvider;
use crate::domain::registry::{apply_layer, EffectiveRegistry, RegistryError};
use crate::domain::run::MissionInput;

pub struct FsRegistryProvider {
    base_path: PathBuf,
    layers_dir: PathBuf,
}

impl FsRegistryProvider {
    pub fn new(base_path: impl Into<PathBuf>, layers_dir: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into(), layers_dir: layers_dir.into() }
    }

    pub fn from_config(config: &crate::infrastructure::config::KernelConfig) -> Self {
        Self::new(&config.registry_path, &config.registry_layers_dir)
    }

    fn read_json(path: &Path) -> Result<Option<Value>, RegistryError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| RegistryError::Malformed(format!("{}: {e}", path.display())))?;
        Ok(Some(value))
    }

    fn layer_paths(&self, mission: &MissionInput) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(org_id) = &mission.org_id {
            paths.push(self.layers_dir.join("orgs").join(org_id).join("registry_override.json"));
        }
        paths.push(
            self.layers_dir.join("tenants").join(&mission.tenant_id).join("registry_override.json"),
        );
        if let Some(user_id) = &mission.user_id {
            paths.push(self.layers_dir.join("users").join(user_id).join("registry_override.json"));
        }
        paths
    }

}

impl RegistryProvider for FsRegistryProvider {
    /// Merge base + applicable layers into a fresh effective snapshot.
    fn load_for(&self, mission: &MissionInput) -> Result<EffectiveRegistry, RegistryError> {
        let mut merged = match Self::read_json(&self.base_path)? {
            Some(value) => value,
            None => {
                warn!(path = %self.base_path.display(), "base registry missing, starting empty");
                Value::Object(Default::default())
            }
        };
        for path in self.layer_paths(mission) {
            if let Some(layer) = Self::read_json(&path)? {
                merged = apply_layer(merged, &layer);
            }
        }
        EffectiveRegistry::from_value(merged)
    }
}

/// Fixed registry snapshot, used by tests and embedded deployments that
/// have no layer files on disk.
pub struct StaticRegistryProvider {
    registry: EffectiveRegistry,
}

impl StaticRegistryProvider {
    pub fn new(registry: EffectiveRegistry) -> Self {
        Self { registry }
    }
}

impl RegistryProvider for StaticRegistryProvider {
    fn load_for(&self, _mission: &MissionInput) -> Result<EffectiveRegistry, RegistryError> {
        Ok(self.registry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::TaskId;
    use serde_json::json;

    fn mission(tenant: &str, org: Option<&str>, user: Option<&str>) -> MissionInput {
        MissionInput {
            task_id: TaskId("t1".into()),
            tenant_id: tenant.into(),
            org_id: org.map(Into::into),
            user_id: user.map(Into::into),
            roles: vec![],
            user_message: "hello".into(),
            title: None,
            tags: vec![],
        }
    }

    #[test]
    fn layers_apply_in_org_tenant_user_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("registry.json");
        std::fs::write(
            &base,
            json!({
                "registry_id": "base",
                "limits": {"max_tool_calls": 10}
            })
            .to_string(),
        )
        .unwrap();

        let tenant_dir = dir.path().join("tenants/tenant_demo");
        std::fs::create_dir_all(&tenant_dir).unwrap();
        std::fs::write(
            tenant_dir.join("registry_override.json"),
            json!({"limits": {"max_tool_calls": 20}}).to_string(),
        )
        .unwrap();

        let user_dir = dir.path().join("users/u1");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(
            user_dir.join("registry_override.json"),
            json!({"limits": {"max_tool_calls": 30}}).to_string(),
        )
        .unwrap();

        let provider = FsRegistryProvider::new(&base, dir.path());

        let reg = provider.load_for(&mission("tenant_demo", None, None)).unwrap();
        assert_eq!(reg.limits().max_tool_calls, 20);

        let reg = provider.load_for(&mission("tenant_demo", None, Some("u1"))).unwrap();
        assert_eq!(reg.limits().max_tool_calls, 30);

        let reg = provider.load_for(&mission("other_tenant", None, None)).unwrap();
        assert_eq!(reg.limits().max_tool_calls, 10);
    }

    #[test]
    fn missing_base_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsRegistryProvider::new(dir.path().join("absent.json"), dir.path());
        let reg = provider.load_for(&mission("tenant_demo", None, None)).unwrap();
        assert!(reg.doc().actions.is_empty());
    }
}
