//! Wire formats for an OSD-2 object storage target.
//!
//! This crate holds everything that crosses the SCSI transport: the 200-byte
//! variable-length CDB (decode and build), the embedded capability, the
//! attribute list formats, the query list, and descriptor-format sense.
//! Nothing here touches storage; the target crate wires these codecs to the
//! store.
//!
//! All multi-byte integers on the wire are big-endian.

pub mod build;
pub mod capability;
pub mod cdb;
pub mod defs;
pub mod endian;
pub mod list;
pub mod query;
pub mod sense;

pub use build::CdbBuilder;
pub use capability::{Capability, CapabilityBuilder, DescriptorType, ObjectType, Permissions};
pub use cdb::{AttrDirective, Cdb, CdbError, ListDirective, PageDirective};
pub use defs::ServiceAction;
pub use list::{ListError, ListFormat, RetrievedList};
pub use sense::{SenseData, SenseKey};
