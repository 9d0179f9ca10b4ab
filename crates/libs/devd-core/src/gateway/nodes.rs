//! Node identities and property names.
//!
//! The application knows nodes by their network address and properties by
//! `(subdevice_key, template_key, name)`. The cloud knows nodes by DSN and
//! properties by the joined `subdevice:template:name`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const PROP_NAME_DELIM: char = ':';

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("no node at address {0}")]
    UnknownAddress(String),

    #[error("no node with dsn {0}")]
    UnknownDsn(String),

    #[error("bad node property name {0:?}")]
    BadName(String),

    #[error("invalid node dsn {0:?}")]
    InvalidDsn(String),
}

/// One persisted `dsn <-> address` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMapping {
    pub dsn: String,
    pub address: String,
}

/// Nodes registered through this gateway, indexed both ways.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMap {
    by_dsn: BTreeMap<String, String>,
    by_address: BTreeMap<String, String>,
}

impl NodeMap {
    pub fn from_mappings(mappings: &[NodeMapping]) -> Self {
        let mut map = Self::default();
        for mapping in mappings {
            if let Err(err) = map.insert(&mapping.dsn, &mapping.address) {
                log::warn!("gateway: skipping saved node: {err}");
            }
        }
        map
    }

    pub fn mappings(&self) -> Vec<NodeMapping> {
        self.by_dsn
            .iter()
            .map(|(dsn, address)| NodeMapping { dsn: dsn.clone(), address: address.clone() })
            .collect()
    }

    /// Maps `dsn` to `address`, replacing any earlier pairing of either.
    pub fn insert(&mut self, dsn: &str, address: &str) -> Result<(), NodeError> {
        if !is_valid_dsn(dsn) {
            return Err(NodeError::InvalidDsn(dsn.to_string()));
        }
        if address.is_empty() {
            return Err(NodeError::Missing("address"));
        }
        if let Some(old) = self.by_dsn.remove(dsn) {
            self.by_address.remove(&old);
        }
        if let Some(old) = self.by_address.remove(address) {
            self.by_dsn.remove(&old);
        }
        self.by_dsn.insert(dsn.to_string(), address.to_string());
        self.by_address.insert(address.to_string(), dsn.to_string());
        Ok(())
    }

    /// Forgets the node. Returns its address.
    pub fn remove_dsn(&mut self, dsn: &str) -> Option<String> {
        let address = self.by_dsn.remove(dsn)?;
        self.by_address.remove(&address);
        Some(address)
    }

    pub fn dsn(&self, address: &str) -> Option<&str> {
        self.by_address.get(address).map(String::as_str)
    }

    pub fn address(&self, dsn: &str) -> Option<&str> {
        self.by_dsn.get(dsn).map(String::as_str)
    }

    pub fn dsn_for(&self, address: &str) -> Result<&str, NodeError> {
        self.dsn(address).ok_or_else(|| NodeError::UnknownAddress(address.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_dsn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dsn.is_empty()
    }
}

pub fn is_valid_dsn(dsn: &str) -> bool {
    !dsn.is_empty() && dsn.chars().all(|c| c.is_ascii_alphanumeric())
}

fn str_field<'a>(info: &'a Value, key: &'static str) -> Result<&'a str, NodeError> {
    info.get(key).and_then(Value::as_str).ok_or(NodeError::Missing(key))
}

/// Replaces `address` with the node's `dsn`. An object that already names a
/// dsn is left alone.
pub fn address_to_dsn(info: &mut Value, nodes: &NodeMap) -> Result<(), NodeError> {
    if info.get("dsn").and_then(Value::as_str).is_some() {
        return Ok(());
    }
    let dsn = nodes.dsn_for(str_field(info, "address")?)?.to_string();
    let obj = info.as_object_mut().ok_or(NodeError::Missing("address"))?;
    obj.remove("address");
    obj.insert("dsn".to_string(), json!(dsn));
    Ok(())
}

/// Replaces `dsn` with the node's `address`. An object that already names an
/// address is left alone.
pub fn dsn_to_address(info: &mut Value, nodes: &NodeMap) -> Result<(), NodeError> {
    if info.get("address").and_then(Value::as_str).is_some() {
        return Ok(());
    }
    let dsn = str_field(info, "dsn")?;
    let address = nodes.address(dsn).ok_or_else(|| NodeError::UnknownDsn(dsn.to_string()))?.to_string();
    let obj = info.as_object_mut().ok_or(NodeError::Missing("dsn"))?;
    obj.remove("dsn");
    obj.insert("address".to_string(), json!(address));
    Ok(())
}

/// Folds `subdevice_key`, `template_key` and `name` into the cloud name.
/// Returns the three separate fields as they were.
pub fn join_prop_name(prop: &mut Value) -> Result<Value, NodeError> {
    let name = str_field(prop, "name")?.to_string();
    let subdevice = str_field(prop, "subdevice_key")?.to_string();
    let template = str_field(prop, "template_key")?.to_string();
    let parts = json!({"name": name, "subdevice_key": subdevice, "template_key": template});
    let obj = prop.as_object_mut().ok_or(NodeError::Missing("name"))?;
    obj.remove("subdevice_key");
    obj.remove("template_key");
    obj.insert(
        "name".to_string(),
        json!(format!("{subdevice}{PROP_NAME_DELIM}{template}{PROP_NAME_DELIM}{name}")),
    );
    Ok(parts)
}

/// Inverse of [`join_prop_name`]. The last part keeps any further delimiters.
pub fn split_prop_name(prop: &mut Value) -> Result<(), NodeError> {
    let joined = str_field(prop, "name")?.to_string();
    let parts = split_name(&joined)?;
    let obj = prop.as_object_mut().ok_or(NodeError::Missing("name"))?;
    obj.insert("subdevice_key".to_string(), json!(parts.0));
    obj.insert("template_key".to_string(), json!(parts.1));
    obj.insert("name".to_string(), json!(parts.2));
    Ok(())
}

/// `subdevice:template:name` into its parts.
pub fn split_name(joined: &str) -> Result<(&str, &str, &str), NodeError> {
    let mut parts = joined.splitn(3, PROP_NAME_DELIM);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(sub), Some(template), Some(name)) if !sub.is_empty() && !template.is_empty() && !name.is_empty() => {
            Ok((sub, template, name))
        }
        _ => Err(NodeError::BadName(joined.to_string())),
    }
}

/// Cloud form of an application property: joined name, node dsn.
pub fn prop_to_cloud(prop: &mut Value, nodes: &NodeMap) -> Result<Value, NodeError> {
    let parts = join_prop_name(prop)?;
    address_to_dsn(prop, nodes)?;
    Ok(parts)
}

/// Application form of a cloud property: node address, split name.
pub fn prop_to_app(prop: &mut Value, nodes: &NodeMap) -> Result<(), NodeError> {
    str_field(prop, "dsn")?;
    dsn_to_address(prop, nodes)?;
    split_prop_name(prop)
}

/// Converts each `{"property": ...}` item for the application, dropping the
/// ones that name unknown nodes or malformed names.
pub fn props_to_app(items: &Value, nodes: &NodeMap) -> Vec<Value> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let mut item = item.clone();
            let prop = item.get_mut("property")?;
            match prop_to_app(prop, nodes) {
                Ok(()) => Some(item),
                Err(err) => {
                    log::warn!("gateway: dropping node property: {err}");
                    None
                }
            }
        })
        .collect()
}

/// Converts each `{"schedule": ...}` item's dsn to the node address.
pub fn schedules_to_app(items: &Value, nodes: &NodeMap) -> Vec<Value> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let mut item = item.clone();
            let sched = item.get_mut("schedule")?;
            if sched.get("dsn").and_then(Value::as_str).is_none() {
                log::warn!("gateway: node schedule without dsn");
                return None;
            }
            match dsn_to_address(sched, nodes) {
                Ok(()) => Some(item),
                Err(err) => {
                    log::warn!("gateway: dropping node schedule: {err}");
                    None
                }
            }
        })
        .collect()
}
