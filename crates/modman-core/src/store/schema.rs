//! Mapping between domain types and store nodes.
//!
//! Layout:
//!
//! ```text
//! /module-management/bundles/{bundle}                 Bundle
//! /module-management/nodes/{node}                     ClusterNode marker
//! /module-management/nodes/{node}/bundles/{bundle}    NodeBundle
//! /module-management/nodes/{node}/operations/{op}     Operation
//! ```
//!
//! Property names are part of the shared on-store format and are read by
//! every node in the cluster; renaming one is a breaking change.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use url::Url;

use crate::model::{BinaryFile, Bundle, NodeBundle, Operation, OperationAction, OperationState};

use super::{StoreError, StoreNode};

pub const ROOT: &str = "/module-management";

pub fn bundles_path() -> String {
    format!("{}/bundles", ROOT)
}

pub fn bundle_path(name: &str) -> String {
    format!("{}/bundles/{}", ROOT, name)
}

pub fn nodes_path() -> String {
    format!("{}/nodes", ROOT)
}

pub fn node_path(node: &str) -> String {
    format!("{}/nodes/{}", ROOT, node)
}

pub fn node_bundles_path(node: &str) -> String {
    format!("{}/nodes/{}/bundles", ROOT, node)
}

pub fn node_bundle_path(node: &str, name: &str) -> String {
    format!("{}/nodes/{}/bundles/{}", ROOT, node, name)
}

/// The operation queue (mailbox) of one node.
pub fn operations_path(node: &str) -> String {
    format!("{}/nodes/{}/operations", ROOT, node)
}

pub fn operation_path(node: &str, name: &str) -> String {
    format!("{}/nodes/{}/operations/{}", ROOT, node, name)
}

pub fn bundle_to_props(bundle: &Bundle) -> Value {
    let mut props = Map::new();
    props.insert("symbolicName".into(), json!(bundle.symbolic_name()));
    props.insert("version".into(), json!(bundle.version()));
    if let Some(display_name) = bundle.display_name() {
        props.insert("displayName".into(), json!(display_name));
    }
    if let Some(file_name) = bundle.file_name() {
        props.insert("fileName".into(), json!(file_name));
    }
    if let Some(checksum) = bundle.checksum() {
        props.insert("checksum".into(), json!(checksum));
    }
    if let Some(file) = bundle.file() {
        props.insert(
            "file".into(),
            json!({ "url": file.url.as_str(), "mimeType": file.mime_type }),
        );
    }
    Value::Object(props)
}

pub fn bundle_from_node(node: &StoreNode) -> Result<Bundle, StoreError> {
    let props = &node.props;
    let symbolic_name = required_str(node, "symbolicName")?;
    let version = required_str(node, "version")?;
    let mut bundle = Bundle::new(symbolic_name, version)
        .with_display_name(optional_str(props, "displayName"))
        .with_file_name(optional_str(props, "fileName"));
    if let Some(checksum) = optional_str(props, "checksum") {
        bundle = bundle.with_checksum(checksum);
    }
    if let Some(file) = props.get("file") {
        let url = file
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| schema_error(node, "file.url is missing"))?;
        let url = Url::parse(url).map_err(|e| schema_error(node, format!("file.url: {}", e)))?;
        let file = match file.get("mimeType").and_then(Value::as_str) {
            Some(mime_type) => BinaryFile::with_mime_type(url, mime_type),
            None => BinaryFile::new(url),
        };
        bundle = bundle.with_file(file);
    }
    Ok(bundle)
}

pub fn node_bundle_to_props(node_bundle: &NodeBundle) -> Value {
    let mut props = Map::new();
    props.insert("name".into(), json!(node_bundle.name));
    props.insert("bundle".into(), json!(node_bundle.bundle));
    props.insert("state".into(), json!(node_bundle.state));
    if let Some(checksum) = &node_bundle.checksum {
        props.insert("checksum".into(), json!(checksum));
    }
    Value::Object(props)
}

pub fn node_bundle_from_node(node: &StoreNode) -> Result<NodeBundle, StoreError> {
    let name = optional_str(&node.props, "name").unwrap_or_else(|| node.name().to_string());
    Ok(NodeBundle {
        bundle: optional_str(&node.props, "bundle").unwrap_or_else(|| name.clone()),
        name,
        checksum: optional_str(&node.props, "checksum"),
        state: required_str(node, "state")?,
    })
}

pub fn operation_to_props(operation: &Operation) -> Value {
    let mut props = Map::new();
    props.insert("action".into(), json!(operation.action().as_str()));
    props.insert("bundle".into(), json!(operation.bundle()));
    props.insert("node".into(), json!(operation.node()));
    props.insert("state".into(), json!(operation.state().as_str()));
    props.insert("createdAt".into(), json!(operation.created_at().to_rfc3339()));
    if let Some(name) = operation.explicit_name() {
        props.insert("name".into(), json!(name));
    }
    if let Some(reason) = operation.reason() {
        props.insert("reason".into(), json!(reason));
    }
    if let Some(claimed_at) = operation.claimed_at() {
        props.insert("claimedAt".into(), json!(claimed_at.to_rfc3339()));
    }
    if let Some(finished_at) = operation.finished_at() {
        props.insert("finishedAt".into(), json!(finished_at.to_rfc3339()));
    }
    Value::Object(props)
}

pub fn operation_from_node(node: &StoreNode) -> Result<Operation, StoreError> {
    let props = &node.props;
    let action: OperationAction = required_str(node, "action")?
        .parse()
        .map_err(|e: crate::error::ModuleError| schema_error(node, e.to_string()))?;
    let state: OperationState = required_str(node, "state")?
        .parse()
        .map_err(|e: crate::error::ModuleError| schema_error(node, e.to_string()))?;
    let bundle = required_str(node, "bundle")?;
    let target = required_str(node, "node")?;

    let mut operation = Operation::new(action, bundle, target);
    if let Some(name) = optional_str(props, "name") {
        operation = operation.with_name(name);
    }
    if let Some(created_at) = optional_time(node, "createdAt")? {
        operation = operation.with_created_at(created_at);
    }
    Ok(operation
        .restore(
            state,
            optional_str(props, "reason"),
            optional_time(node, "claimedAt")?,
            optional_time(node, "finishedAt")?,
        )
        .stored_at(node.path.clone(), node.revision))
}

pub fn cluster_node_props(node: &str, registered_at: DateTime<Utc>) -> Value {
    json!({ "id": node, "registeredAt": registered_at.to_rfc3339() })
}

fn optional_str(props: &Value, key: &str) -> Option<String> {
    props.get(key).and_then(Value::as_str).map(str::to_string)
}

fn required_str(node: &StoreNode, key: &str) -> Result<String, StoreError> {
    optional_str(&node.props, key)
        .ok_or_else(|| schema_error(node, format!("missing property '{}'", key)))
}

fn optional_time(node: &StoreNode, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    match node.props.get(key).and_then(Value::as_str) {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| schema_error(node, format!("{}: {}", key, e))),
    }
}

fn schema_error(node: &StoreNode, reason: impl Into<String>) -> StoreError {
    StoreError::Schema {
        path: node.path.clone(),
        reason: reason.into(),
    }
}
