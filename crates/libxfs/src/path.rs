//! Path name resolution.
//!
//! Paths are resolved from the root directory; a leading `/` is optional.
//! Empty components and `.` are skipped.

use std::sync::Arc;

use crate::{
    Mount,
    error::{Errno, Result},
    inode::{Inode, LockFlags},
    ops,
};

fn components(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.split(|&b| b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
}

/// Looks up and returns the inode for a given path.
pub fn resolve(mount: &Mount, path: &[u8]) -> Result<Arc<Inode>> {
    let mut ip = mount.root()?;
    for name in components(path) {
        if !ip.is_dir() {
            mount.iput(ip, LockFlags::empty());
            return Err(Errno::NotADirectory);
        }
        let next = ops::lookup(mount, &ip, name);
        mount.iput(ip, LockFlags::empty());
        ip = next?;
    }
    Ok(ip)
}

/// Returns the parent directory of the last component of `path` and the
/// component itself.
pub fn resolve_parent<'a>(mount: &Mount, path: &'a [u8]) -> Result<(Arc<Inode>, &'a [u8])> {
    let mut names: Vec<&[u8]> = components(path).collect();
    let Some(last) = names.pop() else {
        return Err(Errno::InvalidInput);
    };
    let mut dp = mount.root()?;
    for name in names {
        let next = ops::lookup(mount, &dp, name);
        mount.iput(dp, LockFlags::empty());
        dp = next?;
    }
    if !dp.is_dir() {
        mount.iput(dp, LockFlags::empty());
        return Err(Errno::NotADirectory);
    }
    Ok((dp, last))
}

#[cfg(test)]
mod tests {
    use xfs_types::S_IFREG;

    use super::*;
    use crate::test_utils::TestFs;

    #[test]
    fn resolve_nested() {
        let fs = TestFs::new();
        let root = fs.mount.root().unwrap();
        let a = ops::mkdir(&fs.mount, &root, b"a", 0o755).unwrap();
        let f = ops::create(&fs.mount, &a, b"f", S_IFREG).unwrap();

        let got = resolve(&fs.mount, b"/a/./f").unwrap();
        assert!(Arc::ptr_eq(&got, &f));
        fs.mount.iput(got, LockFlags::empty());

        let got = resolve(&fs.mount, b"a/f/..");
        assert_eq!(got.unwrap_err(), Errno::NotADirectory);
        let got = resolve(&fs.mount, b"/a/missing");
        assert_eq!(got.unwrap_err(), Errno::NotFound);

        let got = resolve(&fs.mount, b"/").unwrap();
        assert!(Arc::ptr_eq(&got, &root));
        fs.mount.iput(got, LockFlags::empty());

        let (dp, name) = resolve_parent(&fs.mount, b"/a/g").unwrap();
        assert!(Arc::ptr_eq(&dp, &a));
        assert_eq!(name, b"g");
        fs.mount.iput(dp, LockFlags::empty());
        assert_eq!(
            resolve_parent(&fs.mount, b"/a/f/g").unwrap_err(),
            Errno::NotADirectory
        );
        assert_eq!(resolve_parent(&fs.mount, b"/").unwrap_err(), Errno::InvalidInput);

        for ip in [f, a, root] {
            fs.mount.iput(ip, LockFlags::empty());
        }
    }
}
