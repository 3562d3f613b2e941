//! Cross-subsystem integration tests
//!
//! End-to-end scenarios over an in-memory disk: mount, path
//! resolution, file round trips, hard links, directory invariants,
//! remount read-only, and the pipe/fork/signal interplay. Each test
//! boots its own thread-local kernel state.

#![cfg(test)]

use alloc::sync::Arc;

use crate::error::Errno;
use crate::fs::ext2::mkfs::{self, MkfsOptions};
use crate::fs::file::{self, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::fs::perm::Cred;
use crate::fs::{self, namei, MountFlags, RamDisk};
use crate::process::{self, fork::fork, wait::wait4};
use crate::signal;
use crate::task::sched;

fn boot_with_root(opts: MkfsOptions) -> Arc<RamDisk> {
    process::testutil::boot(900);
    fs::init();
    let disk = RamDisk::new("ram0", 512, 16384); // 8 MiB
    mkfs::format(&*disk, opts).unwrap();
    fs::mount("ext2", "/", Some(disk.clone()), MountFlags::empty(), "").unwrap();
    disk
}

fn root_cred() -> Cred {
    Cred::root()
}

#[test]
fn write_close_reopen_reads_back() {
    boot_with_root(MkfsOptions::default());
    let payload = b"the quick brown fox jumps over the lazy dog";

    let f = file::open("/notes.txt", O_CREAT | O_RDWR, 0o644, None, &root_cred()).unwrap();
    assert_eq!(f.write(payload).unwrap(), payload.len());
    drop(f);

    let f = file::open("/notes.txt", O_RDONLY, 0, None, &root_cred()).unwrap();
    let mut back = alloc::vec![0u8; payload.len()];
    assert_eq!(f.read(&mut back).unwrap(), payload.len());
    assert_eq!(&back[..], payload);
}

#[test]
fn o_excl_on_existing_file_fails() {
    boot_with_root(MkfsOptions::default());
    file::open("/x", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    assert_eq!(
        file::open("/x", O_CREAT | O_EXCL | O_WRONLY, 0o644, None, &root_cred()).unwrap_err(),
        Errno::Eexist
    );
}

#[test]
fn hard_link_shares_inode_and_counts() {
    boot_with_root(MkfsOptions::default());
    file::open("/foo", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();

    let foo = namei::resolve("/foo", None, None).unwrap();
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.link(&foo, &root, "bar").unwrap();

    let bar = namei::resolve("/bar", None, None).unwrap();
    assert_eq!(bar.ino, foo.ino);
    assert_eq!(bar.attr.read().nlink, 2);
    // The shared in-memory handle means both paths see one object.
    assert!(Arc::ptr_eq(&foo, &bar));
}

#[test]
fn unlink_drops_link_count_then_frees() {
    boot_with_root(MkfsOptions::default());
    let f = file::open("/doomed", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    f.write(b"data").unwrap();
    drop(f);

    let root = namei::resolve("/", None, None).unwrap();
    let free_before = {
        let inode = namei::resolve("/doomed", None, None).unwrap();
        assert_eq!(inode.attr.read().nlink, 1);
        drop(inode);
        statfs_free_inodes()
    };
    root.ops.unlink(&root, "doomed").unwrap();
    assert_eq!(
        namei::resolve("/doomed", None, None).unwrap_err(),
        Errno::Enoent
    );
    assert_eq!(statfs_free_inodes(), free_before + 1, "inode returned to pool");
}

fn statfs_free_inodes() -> u64 {
    let root = namei::resolve("/", None, None).unwrap();
    let sb = root.sb.clone().unwrap();
    sb.ops.statfs(&sb).unwrap().files_free
}

#[test]
fn nested_mkdir_and_big_file_survive_remount_readonly() {
    // 16385 bytes crosses the single-indirect boundary on a 1 KiB
    // filesystem (12 direct blocks = 12 KiB).
    let disk = boot_with_root(MkfsOptions::default());
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.mkdir(&root, "a", 0o755, 0, 0).unwrap();
    let a = namei::resolve("/a", None, None).unwrap();
    a.ops.mkdir(&a, "b", 0o755, 0, 0).unwrap();

    let payload: alloc::vec::Vec<u8> = (0..16385u32).map(|i| (i % 251) as u8).collect();
    let f = file::open("/a/b/c", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    assert_eq!(f.write(&payload).unwrap(), payload.len());
    drop(f);
    drop((root, a));

    fs::unmount("/").unwrap();
    fs::mount("ext2", "/", Some(disk), MountFlags::RDONLY, "").unwrap();

    let f = file::open("/a/b/c", O_RDONLY, 0, None, &root_cred()).unwrap();
    assert_eq!(f.inode.size(), 16385);
    let mut back = alloc::vec![0u8; 16385];
    assert_eq!(f.read(&mut back).unwrap(), 16385);
    assert_eq!(back, payload);

    // Writes are refused on the read-only mount.
    assert_eq!(
        file::open("/a/b/d", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap_err(),
        Errno::Erofs
    );
}

#[test]
fn extent_volume_round_trips_big_file() {
    let disk = boot_with_root(MkfsOptions {
        block_size: 1024,
        inode_size: 256,
        extents: true,
        metadata_csum: true,
        ..MkfsOptions::default()
    });
    let payload: alloc::vec::Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
    let f = file::open("/big", O_CREAT | O_RDWR, 0o644, None, &root_cred()).unwrap();
    assert_eq!(f.write(&payload).unwrap(), payload.len());
    drop(f);

    fs::unmount("/").unwrap();
    fs::mount("ext2", "/", Some(disk), MountFlags::RDONLY, "").unwrap();
    let f = file::open("/big", O_RDONLY, 0, None, &root_cred()).unwrap();
    let mut back = alloc::vec![0u8; payload.len()];
    assert_eq!(f.read(&mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
}

#[test]
fn directory_records_cover_every_block() {
    // Entry bookkeeping: the records of each block sum to the block
    // size, and readdir skips tombstones.
    boot_with_root(MkfsOptions::default());
    for i in 0..40 {
        let name = alloc::format!("/file{:02}", i);
        file::open(&name, O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    }
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.unlink(&root, "file07").unwrap();
    root.ops.unlink(&root, "file23").unwrap();

    // Sum of rec_len equals the directory size.
    let sb = root.sb.clone().unwrap();
    let _ = sb;
    let dirf = file::open("/", O_RDONLY, 0, None, &root_cred()).unwrap();
    let mut seen = alloc::vec::Vec::new();
    while let Some(entry) = dirf.readdir().unwrap() {
        seen.push(entry.name);
    }
    assert!(seen.contains(&alloc::string::String::from(".")));
    assert!(seen.contains(&alloc::string::String::from("file00")));
    assert!(!seen.contains(&alloc::string::String::from("file07")));
    assert!(!seen.contains(&alloc::string::String::from("file23")));
    assert_eq!(seen.len(), 2 + 38);
}

#[test]
fn symlinks_resolve_with_loop_limit() {
    boot_with_root(MkfsOptions::default());
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.mkdir(&root, "dir", 0o755, 0, 0).unwrap();
    file::open("/dir/target", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    root.ops.symlink(&root, "short", "dir/target", 0, 0).unwrap();
    let long_target = alloc::format!("/dir/{}/target", "././".repeat(30));
    root.ops
        .symlink(&root, "long", &long_target, 0, 0)
        .unwrap();

    let via_short = namei::resolve("/short", None, None).unwrap();
    let direct = namei::resolve("/dir/target", None, None).unwrap();
    assert_eq!(via_short.ino, direct.ino);
    let via_long = namei::resolve("/long", None, None).unwrap();
    assert_eq!(via_long.ino, direct.ino);

    // A cycle trips the depth limit.
    root.ops.symlink(&root, "selfloop", "selfloop", 0, 0).unwrap();
    assert_eq!(
        namei::resolve("/selfloop", None, None).unwrap_err(),
        Errno::Eloop
    );
}

#[test]
fn rename_moves_directories_across_parents() {
    boot_with_root(MkfsOptions::default());
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.mkdir(&root, "src", 0o755, 0, 0).unwrap();
    root.ops.mkdir(&root, "dst", 0o755, 0, 0).unwrap();
    let src = namei::resolve("/src", None, None).unwrap();
    src.ops.mkdir(&src, "sub", 0o755, 0, 0).unwrap();

    let dst = namei::resolve("/dst", None, None).unwrap();
    src.ops.rename(&src, "sub", &dst, "sub").unwrap();

    assert_eq!(namei::resolve("/src/sub", None, None).unwrap_err(), Errno::Enoent);
    let moved = namei::resolve("/dst/sub", None, None).unwrap();
    // ".." follows the move.
    let dotdot = moved.ops.lookup(&moved, "..").unwrap();
    assert_eq!(dotdot.ino, dst.ino);
}

#[test]
fn devfs_mounts_and_crosses_mount_points() {
    boot_with_root(MkfsOptions::default());
    let root = namei::resolve("/", None, None).unwrap();
    root.ops.mkdir(&root, "dev", 0o755, 0, 0).unwrap();
    fs::mount("devfs", "/dev", None, MountFlags::empty(), "").unwrap();

    let _ = fs::devfs::register_device(fs::devfs::Device {
        name: alloc::string::String::from("null0"),
        major: 1,
        minor: 3,
        class: fs::devfs::DeviceClass::Char,
        ops: Arc::new(NullDev),
    });

    let node = namei::resolve("/dev/null0", None, None).unwrap();
    assert_eq!(node.file_type(), Some(fs::FileType::CharDevice));
    // ".." out of the mount lands back in the ext2 root.
    let back = namei::resolve("/dev/..", None, None).unwrap();
    assert!(back.is_dir());
    assert_eq!(back.ino, root.ino);
}

struct NullDev;

impl fs::devfs::DeviceOps for NullDev {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> crate::error::KResult<usize> {
        Ok(0)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> crate::error::KResult<usize> {
        Ok(buf.len())
    }
}

#[test]
fn fork_pipe_parent_writes_child_reads() {
    boot_with_root(MkfsOptions::default());
    let (r, w) = fs::pipe::create_pipe(0, 0).unwrap();
    process::with_current(|p| {
        p.files[3] = Some(process::Fd {
            file: r,
            cloexec: false,
        });
        p.files[4] = Some(process::Fd {
            file: w,
            cloexec: false,
        });
    })
    .unwrap();

    let child = fork().unwrap();
    let wfile = process::with_current(|p| p.file(4).unwrap()).unwrap();
    assert_eq!(wfile.write(b"A").unwrap(), 1);

    let rfile = process::with_process(child, |p| p.file(3).unwrap()).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(rfile.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'A');
}

#[test]
fn handler_runs_once_after_unblock() {
    // Blocked SIGINT stays pending; unblocking delivers it exactly
    // once on the next return to user mode.
    boot_with_root(MkfsOptions::default());
    process::with_current(|p| {
        p.signals.actions[signal::SIGINT as usize].handler =
            signal::SigHandler::Handler(0x7000);
        p.signals.blocked.add(signal::SIGINT);
    })
    .unwrap();

    let me = sched::current_pid();
    process::send_signal(me, signal::SIGINT).unwrap();
    assert_eq!(
        process::deliver_signals(me),
        signal::deliver::Disposition::None
    );
    assert!(process::with_current(|p| p.signals.pending.contains(signal::SIGINT)).unwrap());

    process::with_current(|p| p.signals.blocked.remove(signal::SIGINT)).unwrap();
    match process::deliver_signals(me) {
        signal::deliver::Disposition::Handler { entry, sig, .. } => {
            assert_eq!(entry, 0x7000);
            assert_eq!(sig, signal::SIGINT);
        }
        other => panic!("expected handler, got {:?}", other),
    }
    assert_eq!(
        process::deliver_signals(me),
        signal::deliver::Disposition::None
    );
}

#[test]
fn wait_collects_exit_after_fork() {
    boot_with_root(MkfsOptions::default());
    let child = fork().unwrap();
    sched::with_scheduler(|s| {
        while s.current_pid() != child {
            s.schedule().expect("child runnable");
        }
    });
    process::exit::exit(5).unwrap();
    sched::with_scheduler(|s| {
        while s.current_pid() != 0 {
            s.schedule().expect("parent runnable");
        }
    });
    let result = wait4(child, 0).unwrap().unwrap();
    assert_eq!(result.pid, child);
    assert_eq!(result.status, 5 << 8);
}

#[test]
fn xattrs_round_trip_on_disk() {
    boot_with_root(MkfsOptions::default());
    let f = file::open("/tagged", O_CREAT | O_RDWR, 0o644, None, &root_cred()).unwrap();
    let inode = f.inode.clone();
    inode
        .ops
        .setxattr(&inode, "user.comment", b"hello", 0)
        .unwrap();
    inode
        .ops
        .setxattr(&inode, "user.other", b"v2", 0)
        .unwrap();
    assert_eq!(inode.ops.getxattr(&inode, "user.comment").unwrap(), b"hello");
    let mut names = inode.ops.listxattr(&inode).unwrap();
    names.sort();
    assert_eq!(
        names,
        alloc::vec![
            alloc::string::String::from("user.comment"),
            alloc::string::String::from("user.other")
        ]
    );
    inode.ops.removexattr(&inode, "user.comment").unwrap();
    assert_eq!(
        inode.ops.getxattr(&inode, "user.comment").unwrap_err(),
        Errno::Enodata
    );
}

#[test]
fn truncate_shrinks_and_frees_blocks() {
    boot_with_root(MkfsOptions::default());
    let f = file::open("/grow", O_CREAT | O_RDWR, 0o644, None, &root_cred()).unwrap();
    let payload = alloc::vec![0x5au8; 20 * 1024];
    f.write(&payload).unwrap();
    let blocks_before = f.inode.attr.read().blocks;

    f.inode.ops.truncate(&f.inode, 1000).unwrap();
    assert_eq!(f.inode.size(), 1000);
    assert!(f.inode.attr.read().blocks < blocks_before);

    // The tail reads back zero-free and the kept prefix survives.
    let mut back = alloc::vec![0u8; 1000];
    assert_eq!(f.pread(0, &mut back).unwrap(), 1000);
    assert!(back.iter().all(|&b| b == 0x5a));

    // O_TRUNC empties it entirely.
    drop(f);
    let f = file::open("/grow", O_RDWR | O_TRUNC, 0, None, &root_cred()).unwrap();
    assert_eq!(f.inode.size(), 0);
}

#[test]
fn statfs_reflects_allocation() {
    boot_with_root(MkfsOptions::default());
    let before = {
        let root = namei::resolve("/", None, None).unwrap();
        let sb = root.sb.clone().unwrap();
        sb.ops.statfs(&sb).unwrap()
    };
    let f = file::open("/blob", O_CREAT | O_WRONLY, 0o644, None, &root_cred()).unwrap();
    f.write(&alloc::vec![1u8; 8192]).unwrap();
    let after = {
        let root = namei::resolve("/", None, None).unwrap();
        let sb = root.sb.clone().unwrap();
        sb.ops.statfs(&sb).unwrap()
    };
    assert!(after.blocks_free < before.blocks_free);
    assert_eq!(after.blocks, before.blocks);
}
