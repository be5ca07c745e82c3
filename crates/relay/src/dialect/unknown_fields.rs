use std::collections::HashMap;

/// Arbitrary additional JSON fields a canonical type doesn't model
/// explicitly, preserved on a round trip via `#[serde(flatten)]`.
#[derive(Default, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnknownFields(pub HashMap<String, serde_json::Value>);
