pub mod db;
pub mod ops;

use mesh_bus::BusError;
use mesh_maintenance::IntegrityError;

/// Map an error chain onto the ops exit-code contract: 3 when a retry is
/// reasonable (store unreachable, transient bus failure), 4 when a human is
/// required (broken ledger chain, integrity mismatch, anything unexplained).
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(bus) = cause.downcast_ref::<BusError>() {
            return if bus.is_transient() { 3 } else { 4 };
        }
        if cause.downcast_ref::<IntegrityError>().is_some() {
            return 4;
        }
    }
    // Connection-style failures surface as sqlx/io messages in the chain.
    let transient = err.chain().any(|c| {
        let msg = c.to_string();
        msg.contains("connect") || msg.contains("unreachable") || msg.contains("missing env var")
    });
    if transient {
        3
    } else {
        4
    }
}
