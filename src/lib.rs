//! VUDO Runtime
//!
//! A host runtime for Spirits: WebAssembly modules that share a linear
//! memory with the host and call back into it through Loas, named bundles
//! of host functions. A [`Seance`] coordinates several Spirits by name.

pub use error::{Abort, Error, Result};
pub use gene::{FieldLayout, FieldType, FieldValue, GeneLayout, Record};
pub use loa::{BUILTIN_LOA, HostFunctions, Loa, LoaContext, LoaRegistry, VudoLoa, caller_memory};
pub use loader::{SpiritDefinition, SpiritSource, load_manifest, parse_manifest};
pub use memory::{Allocator, MemoryManager};
pub use seance::{Seance, SeanceBuilder};
pub use spirit::{LoadOptions, Loader, MemoryOptions, Spirit, SpiritFunc, SummonOptions};
pub use types::SpiritState;

pub mod error;
pub mod gene;
pub mod loa;
pub mod loader;
pub mod memory;
pub mod seance;
pub mod spirit;
pub mod types;
