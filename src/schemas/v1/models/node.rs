use serde::Serialize;

/// The catalog address every cluster member records when it is marked
/// unavailable. The fan-out treats instances on such a node as unreachable
/// without attempting a connection.
pub const OFFLINE_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub address: String,
}

impl Node {
    pub fn is_offline(&self) -> bool {
        self.address == OFFLINE_ADDRESS
    }
}
