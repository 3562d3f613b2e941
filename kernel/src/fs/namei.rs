//! Path resolution
//!
//! Paths are normalized lexically (`.`, `..`, duplicate slashes), the
//! mount table picks the starting filesystem by longest prefix, and the
//! remaining components are looked up one by one through the parent
//! inode's `lookup` op. Symbolic links restart resolution with the
//! spliced target, up to [`SYMLOOP_MAX`] levels; `..` at a mount root
//! moves to the parent mount by plain string arithmetic.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::perm::{self, Access, Cred};
use super::{Inode, SYMLOOP_MAX};
use crate::error::{Errno, KResult};

/// Turn `path` into a normalized absolute path: rooted at `/`, no `.`
/// or `..` components, no duplicate or trailing slashes. Relative paths
/// are interpreted against `cwd` (itself absolute).
pub fn normalize(path: &str, cwd: &str) -> KResult<String> {
    if path.len() >= super::PATH_MAX {
        return Err(Errno::Enametoolong);
    }
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };

    let mut stack: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            name => {
                if name.len() > super::NAME_MAX {
                    return Err(Errno::Enametoolong);
                }
                stack.push(name);
            }
        }
    }
    if stack.is_empty() {
        return Ok(String::from("/"));
    }
    let mut out = String::new();
    for comp in stack {
        out.push('/');
        out.push_str(comp);
    }
    Ok(out)
}

/// True when mount point `prefix` covers `path` at a component
/// boundary.
pub fn is_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Resolve `path` to an inode, following a final symlink.
pub fn resolve(path: &str, cwd: Option<&str>, cred: Option<&Cred>) -> KResult<Arc<Inode>> {
    let normalized = normalize(path, cwd.unwrap_or("/"))?;
    let mut depth = 0;
    walk(&normalized, cred, true, &mut depth)
}

/// Resolve `path` without following a final symlink (`lstat`,
/// `readlink`, `unlink`).
pub fn resolve_no_follow(
    path: &str,
    cwd: Option<&str>,
    cred: Option<&Cred>,
) -> KResult<Arc<Inode>> {
    let normalized = normalize(path, cwd.unwrap_or("/"))?;
    let mut depth = 0;
    walk(&normalized, cred, false, &mut depth)
}

/// Resolve the parent directory of `path` and return it with the final
/// component name.
pub fn resolve_parent(
    path: &str,
    cwd: Option<&str>,
    cred: Option<&Cred>,
) -> KResult<(Arc<Inode>, String)> {
    let normalized = normalize(path, cwd.unwrap_or("/"))?;
    if normalized == "/" {
        return Err(Errno::Ebusy);
    }
    let split = normalized.rfind('/').unwrap();
    let (parent, name) = normalized.split_at(split);
    let parent = if parent.is_empty() { "/" } else { parent };
    let mut depth = 0;
    let dir = walk(parent, cred, true, &mut depth)?;
    if !dir.is_dir() {
        return Err(Errno::Enotdir);
    }
    Ok((dir, name[1..].to_string()))
}

fn walk(
    path: &str,
    cred: Option<&Cred>,
    follow_last: bool,
    depth: &mut usize,
) -> KResult<Arc<Inode>> {
    let (_sb, root, rest) = super::mount_for(path)?;
    let mut cur = root;
    // Absolute path of the directory `cur` was reached through, used to
    // splice relative symlink targets.
    let mut walked = path[..path.len() - rest.len()].trim_end_matches('/').to_string();
    if walked.is_empty() {
        walked.push('/');
    }

    if rest.is_empty() {
        return Ok(cur);
    }
    let components: Vec<&str> = rest.split('/').collect();
    for (i, comp) in components.iter().enumerate() {
        if !cur.is_dir() {
            return Err(Errno::Enotdir);
        }
        if let Some(cred) = cred {
            perm::check(&cur.attr.read(), cred, Access::Exec, false)?;
        }
        let child = cur.ops.lookup(&cur, comp)?;
        let last = i + 1 == components.len();

        if child.is_symlink() && (follow_last || !last) {
            *depth += 1;
            if *depth > SYMLOOP_MAX {
                return Err(Errno::Eloop);
            }
            let target = child.ops.readlink(&child)?;
            let tail = components[i + 1..].join("/");
            let spliced = if target.starts_with('/') {
                format!("{}/{}", target, tail)
            } else {
                format!("{}/{}/{}", walked, target, tail)
            };
            let normalized = normalize(&spliced, "/")?;
            return walk(&normalized, cred, follow_last, depth);
        }

        if walked != "/" {
            walked.push('/');
        }
        walked.push_str(comp);
        cur = child;
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_dots_and_slashes() {
        assert_eq!(normalize("/a/b/../c", "/").unwrap(), "/a/c");
        assert_eq!(normalize("/a//./b/", "/").unwrap(), "/a/b");
        assert_eq!(normalize("../..", "/x/y/z").unwrap(), "/x");
        assert_eq!(normalize("/../..", "/").unwrap(), "/");
        assert_eq!(normalize(".", "/tmp").unwrap(), "/tmp");
    }

    #[test]
    fn normalize_relative_uses_cwd() {
        assert_eq!(normalize("d/e", "/a/b").unwrap(), "/a/b/d/e");
        assert_eq!(normalize("", "/a").unwrap(), "/a");
    }

    #[test]
    fn prefix_matching_respects_component_boundaries() {
        assert!(is_prefix("/", "/anything"));
        assert!(is_prefix("/mnt", "/mnt"));
        assert!(is_prefix("/mnt", "/mnt/disk"));
        assert!(!is_prefix("/mnt", "/mntx"));
        assert!(!is_prefix("/mnt/disk", "/mnt"));
    }

    #[test]
    fn overlong_names_are_rejected() {
        let long = alloc::vec!["x"; 1]
            .into_iter()
            .cycle()
            .take(super::super::NAME_MAX + 1)
            .collect::<String>();
        assert_eq!(
            normalize(&alloc::format!("/{}", long), "/").unwrap_err(),
            Errno::Enametoolong
        );
    }
}
