//! Per-kind attribute extraction from raw listing items.
//!
//! The source reports items as untyped JSON objects; this module pulls out
//! the per-kind attribute set the sink stores. Items without a name are
//! dropped; the primary key cannot be formed without one.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use observa_core::types::ResourceKind;

use crate::{ResourceDescriptor, SourceEvent};

/// Build a descriptor for one listing item, or `None` if the item carries no
/// name.
pub fn descriptor(kind: ResourceKind, item: &Value) -> Option<ResourceDescriptor> {
    let name = str_at(item, "/metadata/name")?;
    let namespace = str_at(item, "/metadata/namespace");
    let created_at = str_at(item, "/metadata/creationTimestamp")
        .as_deref()
        .and_then(parse_timestamp);

    Some(ResourceDescriptor {
        name,
        namespace,
        created_at,
        attributes: attributes(kind, item),
    })
}

/// Map one watch-stream line (`{"type": ..., "object": {...}}`) to a source
/// event, or `None` when the involved object carries no name.
pub fn event(line: &Value) -> Option<SourceEvent> {
    let object = line.get("object")?;
    let involved_name = str_at(object, "/involvedObject/name")?;

    Some(SourceEvent {
        event_type: str_at(object, "/type").unwrap_or_else(|| "Normal".to_string()),
        reason: str_at(object, "/reason").unwrap_or_default(),
        message: str_at(object, "/message").unwrap_or_default(),
        involved_kind: str_at(object, "/involvedObject/kind").unwrap_or_default(),
        involved_name,
        involved_namespace: str_at(object, "/involvedObject/namespace"),
        source_component: str_at(object, "/source/component"),
        first_seen_at: str_at(object, "/firstTimestamp")
            .as_deref()
            .and_then(parse_timestamp),
        last_seen_at: str_at(object, "/lastTimestamp")
            .as_deref()
            .and_then(parse_timestamp),
    })
}

fn attributes(kind: ResourceKind, item: &Value) -> Map<String, Value> {
    let mut attrs = Map::new();
    match kind {
        ResourceKind::Node => {
            attrs.insert("status".into(), json!(node_ready_status(item)));
            attrs.insert("capacity_cpu".into(), pick(item, "/status/capacity/cpu"));
            attrs.insert(
                "capacity_memory".into(),
                pick(item, "/status/capacity/memory"),
            );
            attrs.insert(
                "allocatable_cpu".into(),
                pick(item, "/status/allocatable/cpu"),
            );
            attrs.insert(
                "allocatable_memory".into(),
                pick(item, "/status/allocatable/memory"),
            );
            attrs.insert(
                "kubernetes_version".into(),
                pick(item, "/status/nodeInfo/kubeletVersion"),
            );
            attrs.insert("os_image".into(), pick(item, "/status/nodeInfo/osImage"));
            attrs.insert(
                "container_runtime".into(),
                pick(item, "/status/nodeInfo/containerRuntimeVersion"),
            );
        }
        ResourceKind::Namespace => {
            attrs.insert(
                "status".into(),
                json!(str_at(item, "/status/phase").unwrap_or_else(|| "Active".to_string())),
            );
        }
        ResourceKind::Pod => {
            attrs.insert("status".into(), pick(item, "/status/phase"));
            attrs.insert("node".into(), pick(item, "/spec/nodeName"));
            attrs.insert("pod_ip".into(), pick(item, "/status/podIP"));
            attrs.insert("restart_count".into(), json!(pod_restart_count(item)));
        }
        ResourceKind::Deployment => {
            attrs.insert("replicas".into(), json!(i64_at(item, "/spec/replicas", 0)));
            attrs.insert(
                "ready_replicas".into(),
                json!(i64_at(item, "/status/readyReplicas", 0)),
            );
            attrs.insert(
                "available_replicas".into(),
                json!(i64_at(item, "/status/availableReplicas", 0)),
            );
            attrs.insert(
                "strategy".into(),
                json!(str_at(item, "/spec/strategy/type")
                    .unwrap_or_else(|| "RollingUpdate".to_string())),
            );
        }
        ResourceKind::StatefulSet => {
            attrs.insert("replicas".into(), json!(i64_at(item, "/spec/replicas", 0)));
            attrs.insert(
                "ready_replicas".into(),
                json!(i64_at(item, "/status/readyReplicas", 0)),
            );
            attrs.insert(
                "service_name".into(),
                json!(str_at(item, "/spec/serviceName").unwrap_or_default()),
            );
        }
        ResourceKind::DaemonSet => {
            attrs.insert(
                "desired_nodes".into(),
                json!(i64_at(item, "/status/desiredNumberScheduled", 0)),
            );
            attrs.insert(
                "ready_nodes".into(),
                json!(i64_at(item, "/status/numberReady", 0)),
            );
        }
        ResourceKind::Service => {
            attrs.insert("type".into(), pick(item, "/spec/type"));
            attrs.insert("cluster_ip".into(), pick(item, "/spec/clusterIP"));
            attrs.insert("external_ip".into(), json!(load_balancer_address(item)));
            attrs.insert("ports".into(), service_ports(item));
        }
        ResourceKind::Ingress => {
            attrs.insert("ingress_class".into(), pick(item, "/spec/ingressClassName"));
            attrs.insert("hosts".into(), ingress_hosts(item));
            attrs.insert(
                "tls".into(),
                json!(item
                    .pointer("/spec/tls")
                    .and_then(Value::as_array)
                    .map(|t| !t.is_empty())
                    .unwrap_or(false)),
            );
            attrs.insert("address".into(), json!(load_balancer_address(item)));
        }
        ResourceKind::Job => {
            let completions = i64_at(item, "/spec/completions", 1);
            let succeeded = i64_at(item, "/status/succeeded", 0);
            let failed = i64_at(item, "/status/failed", 0);
            attrs.insert("completions".into(), json!(completions));
            attrs.insert("succeeded".into(), json!(succeeded));
            attrs.insert("failed".into(), json!(failed));
            attrs.insert("active".into(), json!(i64_at(item, "/status/active", 0)));
            attrs.insert(
                "status".into(),
                json!(job_status(completions, succeeded, failed)),
            );
        }
    }
    attrs
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn i64_at(value: &Value, pointer: &str, default: i64) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

/// Copy a string field through as-is, `null` when absent.
fn pick(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn node_ready_status(item: &Value) -> String {
    let conditions = item
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for condition in conditions {
        if condition.get("type").and_then(Value::as_str) == Some("Ready") {
            return if condition.get("status").and_then(Value::as_str) == Some("True") {
                "Ready".to_string()
            } else {
                "NotReady".to_string()
            };
        }
    }
    "Unknown".to_string()
}

fn pod_restart_count(item: &Value) -> i64 {
    item.pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|s| s.get("restartCount").and_then(Value::as_i64))
                .sum()
        })
        .unwrap_or(0)
}

fn load_balancer_address(item: &Value) -> Option<String> {
    let first = item
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())?;
    str_at(first, "/ip").or_else(|| str_at(first, "/hostname"))
}

fn service_ports(item: &Value) -> Value {
    let ports = item
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    Value::Array(
        ports
            .iter()
            .map(|p| {
                json!({
                    "port": p.get("port").cloned().unwrap_or(Value::Null),
                    "target_port": p.get("targetPort").map(|t| json!(t.to_string())).unwrap_or(Value::Null),
                    "protocol": p.get("protocol").cloned().unwrap_or(Value::Null),
                    "node_port": p.get("nodePort").cloned().unwrap_or(Value::Null),
                })
            })
            .collect(),
    )
}

fn ingress_hosts(item: &Value) -> Value {
    let rules = item
        .pointer("/spec/rules")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    Value::Array(
        rules
            .iter()
            .filter_map(|r| r.get("host").and_then(Value::as_str))
            .map(|h| Value::String(h.to_string()))
            .collect(),
    )
}

fn job_status(completions: i64, succeeded: i64, failed: i64) -> &'static str {
    if succeeded >= completions.max(1) {
        "Completed"
    } else if failed > 0 {
        "Failed"
    } else {
        "Running"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
