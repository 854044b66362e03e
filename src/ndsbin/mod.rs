pub mod armbin;
pub mod blz;
pub mod codebin;
pub mod overlaybin;
pub mod ovtable;

pub use armbin::ArmBin;
pub use codebin::{BinError, CodeBin};
pub use overlaybin::OverlayBin;
pub use ovtable::OvtEntry;
