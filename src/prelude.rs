//! The prelude imports the crate's collaborator traits so host glue can
//! `use spi_storage::prelude::*` without naming them.

pub use crate::{HostLink as _SpiStorageHostLink, SpiBus as _SpiStorageSpiBus};
