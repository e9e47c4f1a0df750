//! The resolver: locating the effective entry for a union-relative path.
//!
//! The read-write branch strictly masks the read-only branch at the same
//! path, and a whiteout beats a read-only entry even when no read-write
//! content exists. Flags let callers pin a branch, suppress the whiteout
//! check, or demand a copy-up when the entry lives read-only.

use std::io;
use std::path::Path;

use super::access;
use super::branch;
use super::cow;
use super::mount::MountState;
use super::paths::{self, errno};
use super::types::{Cred, Resolution, Resolved, ResolveFlags};
use super::whiteout;

/// Locate the effective entry for `rel`.
///
/// Probes surface the most precise error they see and are never
/// retried; a missing whiteout is success, not an error.
pub(crate) fn resolve(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    flags: ResolveFlags,
) -> io::Result<Resolved> {
    tracing::trace!("resolve: {:?}, {:?}", rel, flags);

    if !flags.must_ro {
        // The read-write branch has priority.
        let rw_path = state.rw_path(rel);
        paths::check_path_len(&rw_path)?;

        match branch::lstat(&rw_path) {
            Ok(_) => {
                access::can_traverse(state, cred, rel)?;
                return Ok(Resolved {
                    place: Resolution::FoundInRw,
                    branch_path: rw_path,
                });
            }
            Err(e) => {
                if flags.must_rw {
                    return Err(e);
                }
            }
        }
    }

    let ro_path = state.ro_path(rel);
    paths::check_path_len(&ro_path)?;

    if flags.create_copyup {
        // The entry must exist read-only for a copy-up to make sense.
        branch::lstat(&ro_path)?;

        if !flags.ignore_whiteout && whiteout::find_whiteout(state, rel)?.is_some() {
            return Err(errno(libc::ENOENT));
        }

        access::can_traverse(state, cred, rel)?;

        match cow::copy_up(state, cred, rel) {
            Ok(rw_path) => Ok(Resolved {
                place: Resolution::CopiedUp,
                branch_path: rw_path,
            }),
            // A concurrent writer won the exclusive create; its replica
            // is the effective entry now.
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => {
                let rw_path = state.rw_path(rel);
                branch::lstat(&rw_path)?;
                Ok(Resolved {
                    place: Resolution::FoundInRw,
                    branch_path: rw_path,
                })
            }
            Err(e) => Err(e),
        }
    } else {
        branch::lstat(&ro_path)?;

        if !flags.ignore_whiteout && whiteout::find_whiteout(state, rel)?.is_some() {
            return Err(errno(libc::ENOENT));
        }

        access::can_traverse(state, cred, rel)?;

        Ok(Resolved {
            place: Resolution::FoundInRo,
            branch_path: ro_path,
        })
    }
}
