// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datastore configuration and orchestration template rendering.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use crate::clients::Flavor;
use crate::datastore::{DatastoreManager, DatastoreProfile};

/// Renders configuration files, overrides and stack templates.
///
/// Profiles are resolved once, when the renderer is built.
pub struct ConfigRenderer {
    profiles: HashMap<DatastoreManager, &'static dyn DatastoreProfile>,
}

impl Default for ConfigRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRenderer {
    /// Renderer covering every registered datastore manager.
    pub fn new() -> Self {
        Self {
            profiles: DatastoreManager::ALL
                .iter()
                .map(|m| (*m, m.profile()))
                .collect(),
        }
    }

    fn profile(&self, manager: DatastoreManager) -> &'static dyn DatastoreProfile {
        self.profiles
            .get(&manager)
            .copied()
            .unwrap_or_else(|| manager.profile())
    }

    /// Main configuration file for a datastore on a flavor.
    pub fn render_config(&self, manager: DatastoreManager, flavor: &Flavor) -> String {
        self.profile(manager).render_config(flavor)
    }

    /// Overrides file for a datastore.
    pub fn render_overrides(
        &self,
        manager: DatastoreManager,
        overrides: &BTreeMap<String, Value>,
    ) -> String {
        self.profile(manager).render_overrides(overrides)
    }

    /// Whether changing `key` needs a datastore restart.
    pub fn requires_restart(&self, manager: DatastoreManager, key: &str) -> bool {
        self.profile(manager).requires_restart(key)
    }

    /// Backup strategy name of a datastore, if it supports backups.
    pub fn backup_strategy(&self, manager: DatastoreManager) -> Option<&'static str> {
        self.profile(manager).backup_strategy()
    }

    /// Orchestration stack template for one instance.
    ///
    /// Creates the server, and the data volume plus its attachment when
    /// `volume_support` is set. One port resource is emitted per NIC.
    pub fn render_heat_template(
        &self,
        manager: DatastoreManager,
        volume_support: bool,
        device_path: &str,
        nic_count: usize,
    ) -> String {
        let mut parameters = serde_json::Map::new();
        for name in [
            "Flavor",
            "VolumeSize",
            "InstanceId",
            "ImageId",
            "DatastoreManager",
            "AvailabilityZone",
            "TenantId",
        ] {
            let kind = if name == "VolumeSize" { "number" } else { "string" };
            parameters.insert(name.to_string(), json!({ "type": kind }));
        }

        let mut resources = serde_json::Map::new();
        let mut networks = Vec::new();
        for index in 0..nic_count {
            let port = format!("Port{}", index);
            parameters.insert(format!("{}NetId", port), json!({ "type": "string" }));
            resources.insert(
                port.clone(),
                json!({
                    "Type": "OS::Neutron::Port",
                    "Properties": { "network_id": { "Ref": format!("{}NetId", port) } }
                }),
            );
            networks.push(json!({ "port": { "Ref": port } }));
        }

        resources.insert(
            "BaseInstance".to_string(),
            json!({
                "Type": "AWS::EC2::Instance",
                "Metadata": {
                    "AWS::CloudFormation::Init": {
                        "config": {
                            "files": {
                                "/etc/guest_info": {
                                    "content": {
                                        "Fn::Join": ["", [
                                            "[DEFAULT]\nguest_id=", { "Ref": "InstanceId" },
                                            "\ndatastore_manager=", { "Ref": "DatastoreManager" },
                                            "\ntenant_id=", { "Ref": "TenantId" }, "\n"
                                        ]]
                                    }
                                }
                            }
                        }
                    }
                },
                "Properties": {
                    "ImageId": { "Ref": "ImageId" },
                    "InstanceType": { "Ref": "Flavor" },
                    "AvailabilityZone": { "Ref": "AvailabilityZone" },
                    "SecurityGroups": [format!("{}_SecGroup", manager)],
                    "NetworkInterfaces": networks,
                }
            }),
        );

        if volume_support {
            resources.insert(
                "DataVolume".to_string(),
                json!({
                    "Type": "AWS::EC2::Volume",
                    "Properties": {
                        "Size": { "Ref": "VolumeSize" },
                        "AvailabilityZone": { "Ref": "AvailabilityZone" }
                    }
                }),
            );
            resources.insert(
                "MountPoint".to_string(),
                json!({
                    "Type": "AWS::EC2::VolumeAttachment",
                    "Properties": {
                        "InstanceId": { "Ref": "BaseInstance" },
                        "VolumeId": { "Ref": "DataVolume" },
                        "Device": device_path
                    }
                }),
            );
        }

        json!({
            "HeatTemplateFormatVersion": "2012-12-12",
            "Description": format!("Instance creation template for {}", manager),
            "Parameters": parameters,
            "Resources": resources,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heat_template_resources() {
        let renderer = ConfigRenderer::new();
        let rendered =
            renderer.render_heat_template(DatastoreManager::Mysql, true, "/dev/vdb", 1);
        let template: Value = serde_json::from_str(&rendered).unwrap();
        let resources = template["Resources"].as_object().unwrap();
        assert!(resources.contains_key("BaseInstance"));
        assert!(resources.contains_key("DataVolume"));
        assert!(resources.contains_key("Port0"));
        assert_eq!(resources["MountPoint"]["Properties"]["Device"], "/dev/vdb");
    }

    #[test]
    fn test_heat_template_without_volume() {
        let renderer = ConfigRenderer::new();
        let rendered =
            renderer.render_heat_template(DatastoreManager::Redis, false, "/dev/vdb", 0);
        let template: Value = serde_json::from_str(&rendered).unwrap();
        let resources = template["Resources"].as_object().unwrap();
        assert!(!resources.contains_key("DataVolume"));
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn test_delegates_to_profile() {
        let renderer = ConfigRenderer::new();
        let flavor = Flavor {
            id: "2".to_string(),
            name: "m1.small".to_string(),
            ram: 1024,
        };
        assert!(
            renderer
                .render_config(DatastoreManager::Mysql, &flavor)
                .contains("[mysqld]")
        );
        assert_eq!(
            renderer.backup_strategy(DatastoreManager::Mysql),
            Some("InnoBackupEx")
        );
    }
}
