//! Permission checks
//!
//! Root (euid 0) passes read and write unconditionally and execute when
//! any x bit is set. Otherwise the owner bits apply when the uid
//! matches, the group bits when the gid matches, and the other bits as
//! the fallback. Reading or writing a directory additionally requires
//! the matching x bit, so a directory that cannot be searched cannot be
//! modified either.

use super::{InodeAttr, S_IRGRP, S_IROTH, S_IRUSR, S_IWGRP, S_IWOTH, S_IWUSR, S_IXGRP, S_IXOTH,
    S_IXUSR, S_IFDIR, S_IFMT};
use crate::error::{Errno, KResult};

/// The credentials a permission check runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Cred {
    pub const fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
        }
    }

    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
        }
    }
}

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

/// Check one access against the inode attributes. `real` selects the
/// real ids instead of the effective ones (`access(2)`).
pub fn check(attr: &InodeAttr, cred: &Cred, access: Access, real: bool) -> KResult<()> {
    let uid = if real { cred.uid } else { cred.euid };
    let gid = if real { cred.gid } else { cred.egid };
    let mode = attr.mode;
    let is_dir = mode & S_IFMT == S_IFDIR;

    if uid == 0 {
        return match access {
            Access::Exec if mode & (S_IXUSR | S_IXGRP | S_IXOTH) == 0 => Err(Errno::Eacces),
            _ => Ok(()),
        };
    }

    let (r, w, x) = if attr.uid == uid {
        (S_IRUSR, S_IWUSR, S_IXUSR)
    } else if attr.gid == gid {
        (S_IRGRP, S_IWGRP, S_IXGRP)
    } else {
        (S_IROTH, S_IWOTH, S_IXOTH)
    };

    let wanted = match access {
        Access::Read => r,
        Access::Write => w,
        Access::Exec => x,
    };
    if mode & wanted == 0 {
        return Err(Errno::Eacces);
    }
    // Touching a directory's contents requires search permission too.
    if is_dir && access != Access::Exec && mode & x == 0 {
        return Err(Errno::Eacces);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{S_IFDIR, S_IFREG};
    use super::*;

    fn attr(mode: u32, uid: u32, gid: u32) -> InodeAttr {
        InodeAttr {
            mode,
            uid,
            gid,
            nlink: 1,
            ..InodeAttr::default()
        }
    }

    #[test]
    fn owner_bits_take_precedence() {
        let a = attr(S_IFREG | 0o400, 100, 100);
        let owner = Cred::new(100, 100);
        let other = Cred::new(200, 200);
        assert!(check(&a, &owner, Access::Read, false).is_ok());
        assert!(check(&a, &owner, Access::Write, false).is_err());
        assert!(check(&a, &other, Access::Read, false).is_err());
    }

    #[test]
    fn group_bits_apply_on_gid_match() {
        let a = attr(S_IFREG | 0o040, 100, 5);
        let member = Cred::new(200, 5);
        assert!(check(&a, &member, Access::Read, false).is_ok());
        assert!(check(&a, &member, Access::Write, false).is_err());
    }

    #[test]
    fn root_passes_read_write_but_needs_an_x_bit() {
        let a = attr(S_IFREG | 0o000, 100, 100);
        let root = Cred::root();
        assert!(check(&a, &root, Access::Read, false).is_ok());
        assert!(check(&a, &root, Access::Write, false).is_ok());
        assert!(check(&a, &root, Access::Exec, false).is_err());
        let exec = attr(S_IFREG | 0o001, 100, 100);
        assert!(check(&exec, &root, Access::Exec, false).is_ok());
    }

    #[test]
    fn directory_write_needs_search_bit() {
        let a = attr(S_IFDIR | 0o600, 100, 100);
        let owner = Cred::new(100, 100);
        assert!(check(&a, &owner, Access::Write, false).is_err());
        let searchable = attr(S_IFDIR | 0o700, 100, 100);
        assert!(check(&searchable, &owner, Access::Write, false).is_ok());
    }

    #[test]
    fn real_ids_apply_for_access_syscall() {
        let a = attr(S_IFREG | 0o400, 100, 100);
        let mut cred = Cred::new(100, 100);
        cred.euid = 200;
        // Effective check fails, real check passes.
        assert!(check(&a, &cred, Access::Read, false).is_err());
        assert!(check(&a, &cred, Access::Read, true).is_ok());
    }
}
