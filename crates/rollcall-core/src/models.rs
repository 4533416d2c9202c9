//! Service and node model plus the key layout on the coordination store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single endpoint of a service.
///
/// Stored on the backend as JSON `{"id": .., "ip": .., "port": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "ip")]
    pub address: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port`, the per-node segment of the backend key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.port)
    }
}

/// A named service and its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Same name and the same node set, ignoring order.
    pub fn same_nodes(&self, other: &Service) -> bool {
        if self.name != other.name || self.nodes.len() != other.nodes.len() {
            return false;
        }
        self.nodes.iter().all(|n| other.nodes.contains(n))
    }
}

/// Key layout: `<root>/<service>/<address>:<port>`.
pub mod keys {
    use super::Node;

    fn root(register_path: &str) -> &str {
        register_path.trim_end_matches('/')
    }

    /// Prefix scanned for discovery, always ending in `/` so `svc` never
    /// matches `svc-b`.
    pub fn service_prefix(register_path: &str, service: &str) -> String {
        format!("{}/{}/", root(register_path), service)
    }

    pub fn node_key(register_path: &str, service: &str, node: &Node) -> String {
        format!("{}{}", service_prefix(register_path, service), node.endpoint())
    }

    /// Prefix covering every service under the root.
    pub fn root_prefix(register_path: &str) -> String {
        format!("{}/", root(register_path))
    }

    /// Service name segment of a key under `register_path`, if any.
    pub fn service_of<'a>(register_path: &str, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&root_prefix(register_path))?;
        let (service, endpoint) = rest.split_once('/')?;
        if service.is_empty() || endpoint.is_empty() {
            return None;
        }
        Some(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_json_uses_ip_field() {
        let node = Node::new("n1", "10.0.0.1", 8080);
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, r#"{"id":"n1","ip":"10.0.0.1","port":8080}"#);

        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_node_key_layout() {
        let node = Node::new("n1", "10.0.0.1", 8080);
        assert_eq!(
            keys::node_key("/rollcall/services", "svc-a", &node),
            "/rollcall/services/svc-a/10.0.0.1:8080"
        );
        assert_eq!(
            keys::node_key("/rollcall/services/", "svc-a", &node),
            "/rollcall/services/svc-a/10.0.0.1:8080"
        );
    }

    #[test]
    fn test_prefix_does_not_overlap_similar_names() {
        let node = Node::new("n1", "10.0.0.1", 8080);
        let key = keys::node_key("/r", "svc-ab", &node);
        assert!(!key.starts_with(&keys::service_prefix("/r", "svc-a")));
        assert!(key.starts_with(&keys::service_prefix("/r", "svc-ab")));
    }

    #[test]
    fn test_service_of_key() {
        assert_eq!(keys::service_of("/r", "/r/svc-a/10.0.0.1:80"), Some("svc-a"));
        assert_eq!(keys::service_of("/r", "/r/svc-a/"), None);
        assert_eq!(keys::service_of("/r", "/other/svc-a/1.1.1.1:1"), None);
    }

    #[test]
    fn test_same_nodes_ignores_order() {
        let a = Service::new(
            "svc",
            vec![Node::new("n1", "10.0.0.1", 1), Node::new("n2", "10.0.0.2", 2)],
        );
        let b = Service::new(
            "svc",
            vec![Node::new("n2", "10.0.0.2", 2), Node::new("n1", "10.0.0.1", 1)],
        );
        let c = Service::new("svc", vec![Node::new("n1", "10.0.0.1", 1)]);
        assert!(a.same_nodes(&b));
        assert!(!a.same_nodes(&c));
    }
}
