use clap::Parser;
use std::path::PathBuf;

/// Mount a union of two directory trees: a read-only branch overlaid by a
/// read-write branch. Deletions are recorded as whiteouts, writes trigger
/// copy-up, and attribute changes on read-only entries are carried by
/// metadata sidecars.
#[derive(Parser, Debug)]
#[command(name = "mallorn", version, about)]
pub struct Args {
    /// Branch specification: PATH[=RO|=RW]:PATH[=RO|=RW].
    /// With no tags, the first path is the read-only branch.
    pub branches: String,

    /// Directory where the union is mounted.
    pub mountpoint: PathBuf,

    /// Attribute and entry cache timeout handed to the kernel, in seconds.
    #[arg(long, default_value_t = 1)]
    pub ttl: u64,

    /// Allow other users to access the mount (requires fuse.conf user_allow_other).
    #[arg(long)]
    pub allow_other: bool,

    /// Leave the mount in place when the process exits instead of auto-unmounting.
    #[arg(long)]
    pub no_auto_unmount: bool,
}
