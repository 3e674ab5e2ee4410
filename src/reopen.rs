//! Fd reopening primitives (spec §6): thin `dup2`/`dup` wrappers used by the
//! socket restorer to install an accepted fd onto a specific target slot.

use crate::error::Result;
use nix::unistd::{close, dup, dup2};
use std::os::unix::io::RawFd;

/// dup2-equivalent that closes `src` after the copy (spec §6
/// `reopen_fd_as`).
pub fn reopen_fd_as(target: RawFd, src: RawFd) -> Result<()> {
    if target != src {
        dup2(src, target)?;
        close(src)?;
    }
    Ok(())
}

/// Relocate an image fd out of the way if it collides with a restored fd
/// slot (spec §6 `move_img_fd`), returning the new fd.
pub fn move_img_fd(img_fd: RawFd, conflict_target: RawFd) -> Result<RawFd> {
    if img_fd != conflict_target {
        return Ok(img_fd);
    }
    let moved = dup(img_fd)?;
    close(img_fd)?;
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn move_img_fd_is_noop_without_conflict() {
        let (r, w) = pipe().unwrap();
        assert_eq!(move_img_fd(r, 999).unwrap(), r);
        close(r).unwrap();
        close(w).unwrap();
    }
}
