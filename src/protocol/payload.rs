use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::gcounter::GCounter;

pub const BROADCAST: &str = "broadcast";
pub const BROADCAST_OK: &str = "broadcast_ok";
pub const PROPAGATE: &str = "propagate";
pub const READ: &str = "read";
pub const READ_OK: &str = "read_ok";
pub const TOPOLOGY: &str = "topology";
pub const TOPOLOGY_OK: &str = "topology_ok";
pub const ADD: &str = "add";
pub const ADD_OK: &str = "add_ok";

/// An opaque broadcast value. Only equality matters. Any JSON integer that
/// fits in an `i64` is accepted; fractional numbers are malformed.
pub type Value = i64;

/// Carried by both `broadcast` requests and the `propagate` notices they
/// fan out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueNotice {
    pub message: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadMessages {
    pub messages: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyRequest {
    #[serde(default)]
    pub topology: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddRequest {
    pub delta: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterNotice {
    pub counters: GCounter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadValue {
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Body;

    #[test]
    fn test_negative_delta_rejected() {
        let body = Body::new(ADD).with("delta", -1);
        assert!(body.parse::<AddRequest>().is_err());

        let body = Body::new(ADD).with("delta", 2.5);
        assert!(body.parse::<AddRequest>().is_err());

        let body = Body::new(ADD).with("delta", 7);
        assert_eq!(body.parse::<AddRequest>().unwrap(), AddRequest { delta: 7 });
    }

    #[test]
    fn test_topology_shape() {
        let body = Body::new(TOPOLOGY).with("topology", serde_json::json!({"n1": ["n2"]}));
        let request = body.parse::<TopologyRequest>().unwrap();
        assert_eq!(request.topology["n1"], vec!["n2".to_string()]);

        assert!(Body::new(TOPOLOGY).parse::<TopologyRequest>().is_ok());
        assert!(Body::new(TOPOLOGY).with("topology", 3).parse::<TopologyRequest>().is_err());
    }

    #[test]
    fn test_counter_notice_shape() {
        let body = Body::new(PROPAGATE).with("counters", serde_json::json!({"n1": 3, "n2": 4}));
        let notice = body.parse::<CounterNotice>().unwrap();

        assert_eq!(notice.counters.get("n2"), 4);
        assert_eq!(notice.counters.value().unwrap(), 7);
    }
}
