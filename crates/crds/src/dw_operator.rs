//! DwOperator CRD
//!
//! Declares a dw-server Deployment the operator keeps alive, scaled and
//! labelled with the availability zone of each pod's node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "operator.demo.dw.io",
    version = "v1",
    kind = "DwOperator",
    namespaced,
    status = "DwOperatorStatus",
    shortname = "dwop",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.total_running"}"#
)]
pub struct DwOperatorSpec {
    /// Name of the managed Deployment
    pub name: String,

    /// Namespace of the managed Deployment (the resource's own namespace when empty)
    #[serde(default)]
    pub namespace: String,

    /// Desired replica count; 0 is treated as 1
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct DwOperatorStatus {
    /// Pods that have been bound to a node
    #[serde(default)]
    pub total_scheduled: i32,

    /// Pods in the Running phase
    #[serde(default)]
    pub total_running: i32,

    /// Running pods per availability zone
    #[serde(default, rename = "availability_zone")]
    pub zone_running: BTreeMap<String, i32>,
}

impl DwOperator {
    /// Namespace the Deployment lives in.
    #[must_use]
    pub fn target_namespace(&self) -> Option<&str> {
        if self.spec.namespace.is_empty() {
            self.metadata.namespace.as_deref()
        } else {
            Some(self.spec.namespace.as_str())
        }
    }

    /// Replica count to converge on.
    #[must_use]
    pub fn desired_replicas(&self) -> i32 {
        if self.spec.replicas == 0 { 1 } else { self.spec.replicas }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn operator(namespace: &str, replicas: i32) -> DwOperator {
        let mut op = DwOperator::new(
            "demo",
            DwOperatorSpec {
                name: "dw-server".to_string(),
                namespace: namespace.to_string(),
                replicas,
            },
        );
        op.metadata.namespace = Some("ops".to_string());
        op
    }

    #[test]
    fn test_crd_identity() {
        let crd = DwOperator::crd();
        assert_eq!(crd.spec.group, "operator.demo.dw.io");
        assert_eq!(crd.spec.names.kind, "DwOperator");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_zero_replicas_means_one() {
        assert_eq!(operator("", 0).desired_replicas(), 1);
        assert_eq!(operator("", 3).desired_replicas(), 3);
    }

    #[test]
    fn test_target_namespace_falls_back_to_own() {
        assert_eq!(operator("", 1).target_namespace(), Some("ops"));
        assert_eq!(operator("apps", 1).target_namespace(), Some("apps"));
    }

    #[test]
    fn test_status_wire_names() {
        let status = DwOperatorStatus {
            total_scheduled: 2,
            total_running: 1,
            zone_running: BTreeMap::from([("zone-a".to_string(), 1)]),
        };
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["total_scheduled"], 2);
        assert_eq!(json["total_running"], 1);
        assert_eq!(json["availability_zone"]["zone-a"], 1);
    }
}
