//! pimsync core: wire schemas and error taxonomy shared by every resource process.
//!
//! A resource process (one per synchronized account/protocol) links this crate
//! together with `pimsync-resource` to get a typed entity model, the on-the-wire
//! command frame format, and the error kinds the engine reports.

pub mod command;
pub mod entity;
pub mod error;
pub mod payload;
pub mod value;

pub use command::{CommandFrame, CommandId, FlushType, HEADER_SIZE};
pub use entity::{EntityType, Operation, Uid};
pub use error::ErrorKind;
pub use payload::{CommandPayload, MutationPayload, SynchronizeQuery};
pub use value::PropertyValue;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {}
}
