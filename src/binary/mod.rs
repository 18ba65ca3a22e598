//! Binary-format layer: the bounded byte reader and the module decoder.

pub mod decode;
pub mod reader;

pub use decode::{decode_module, ModuleConfig};
pub use reader::{ReadError, Reader};
