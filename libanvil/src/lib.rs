pub(crate) mod alignment;
pub mod builder;
pub(crate) mod elf;
pub mod error;
pub(crate) mod exe_layout;
pub(crate) mod hash_table;
pub(crate) mod layout;
pub mod model;
pub(crate) mod object_layout;
pub(crate) mod sink;
pub(crate) mod strtab;
pub(crate) mod symbol_order;

pub use builder::Builder;
pub use builder::Config;
pub use error::BuildError;
pub use error::Result;
