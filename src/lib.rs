pub mod branches;
pub mod error;
pub mod unionfs;

pub use branches::{parse_branch_spec, BranchConfig, BranchKind};
pub use error::{MallornError, Result};
pub use unionfs::MallornFs;
