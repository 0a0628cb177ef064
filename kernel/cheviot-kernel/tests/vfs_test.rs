//! VFS operations over a ramfs root: directory mutation, rename,
//! exclusive create, name-cache behavior, dup/fcntl plumbing.

mod common;

use cheviot_core::Errno;
use cheviot_kernel::syscall::file::{F_DUPFD, F_GETFD, F_SETFD};
use cheviot_kernel::syscall::{O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};

use common::{boot_ramfs, test_kernel};

#[test]
fn mkdir_readdir_exactness() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        k.sys_mkdir(&user, "/a", 0o755).await.expect("mkdir /a");
        k.sys_mkdir(&user, "/a/b", 0o755).await.expect("mkdir /a/b");

        let fd = k.sys_opendir(&user, "/a").await.expect("opendir");
        let mut names = Vec::new();
        while let Some(entry) = k.sys_readdir(&user, fd).await.expect("readdir") {
            names.push(entry.name);
        }
        assert_eq!(names, vec![".", "..", "b"], "exactly dot, dotdot, b");

        // Rewind rescans from the start with no duplicates.
        k.sys_rewinddir(&user, fd).expect("rewind");
        let first = k.sys_readdir(&user, fd).await.unwrap().unwrap();
        assert_eq!(first.name, ".");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn mkdir_rmdir_mkdir_cycle() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        k.sys_mkdir(&user, "/d", 0o755).await.expect("first mkdir");
        k.sys_rmdir(&user, "/d").await.expect("rmdir");
        k.sys_mkdir(&user, "/d", 0o755).await.expect("second mkdir");

        let stat = k.sys_stat(&user, "/d").await.expect("stat");
        assert!(stat.st_mode & cheviot_fs::stat::S_IFDIR != 0);
    });
}

#[test]
fn rmdir_guards() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/d", 0o755).await.unwrap();
        k.sys_mkdir(&user, "/d/sub", 0o755).await.unwrap();

        assert_eq!(
            k.sys_rmdir(&user, "/d").await.unwrap_err(),
            Errno::ENOTEMPTY,
            "occupied directory"
        );

        let fd = k
            .sys_open(&user, "/f", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();
        assert_eq!(
            k.sys_rmdir(&user, "/f").await.unwrap_err(),
            Errno::ENOTDIR,
            "rmdir of a file"
        );
        assert_eq!(
            k.sys_unlink(&user, "/d/sub").await.unwrap_err(),
            Errno::EISDIR,
            "unlink of a directory"
        );
    });
}

#[test]
fn exclusive_create_succeeds_once() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/once", O_CREAT | O_EXCL | O_WRONLY, 0o600)
            .await
            .expect("first exclusive create");
        k.sys_close(&user, fd).await.unwrap();

        assert_eq!(
            k.sys_open(&user, "/once", O_CREAT | O_EXCL | O_WRONLY, 0o600)
                .await
                .unwrap_err(),
            Errno::EEXIST,
            "second exclusive create"
        );

        // Plain O_CREAT opens the existing file.
        let fd = k
            .sys_open(&user, "/once", O_CREAT | O_RDWR, 0o600)
            .await
            .expect("non-exclusive reopen");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn rename_moves_the_name() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/a", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"payload").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        k.sys_rename(&user, "/a", "/b").await.expect("rename");

        assert_eq!(k.sys_stat(&user, "/a").await.unwrap_err(), Errno::ENOENT);
        let stat = k.sys_stat(&user, "/b").await.expect("stat new name");
        assert_eq!(stat.st_size, 7);

        let fd = k.sys_open(&user, "/b", O_RDONLY, 0).await.unwrap();
        let data = k.sys_read(&user, fd, 16).await.unwrap();
        assert_eq!(&data, b"payload");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn negative_name_cache_invalidated_by_create() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        // Prime a negative entry.
        assert_eq!(
            k.sys_stat(&user, "/phantom").await.unwrap_err(),
            Errno::ENOENT
        );

        // Creating the name must defeat the cached absence.
        let fd = k
            .sys_open(&user, "/phantom", O_CREAT | O_WRONLY, 0o644)
            .await
            .expect("create over negative entry");
        k.sys_close(&user, fd).await.unwrap();
        assert!(k.sys_stat(&user, "/phantom").await.is_ok());
    });
}

#[test]
fn truncate_and_append() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/log", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"0123456789").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        k.sys_truncate(&user, "/log", 4).await.expect("truncate");
        assert_eq!(k.sys_stat(&user, "/log").await.unwrap().st_size, 4);

        let fd = k
            .sys_open(&user, "/log", O_WRONLY | cheviot_kernel::syscall::O_APPEND, 0)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"ab").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        let fd = k.sys_open(&user, "/log", O_RDONLY, 0).await.unwrap();
        let data = k.sys_read(&user, fd, 16).await.unwrap();
        assert_eq!(&data, b"0123ab");
        k.sys_close(&user, fd).await.unwrap();

        // O_TRUNC empties on open.
        let fd = k
            .sys_open(&user, "/log", O_WRONLY | O_TRUNC, 0)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();
        assert_eq!(k.sys_stat(&user, "/log").await.unwrap().st_size, 0);
    });
}

#[test]
fn dup_shares_offset_dup2_replaces() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/f", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"abcdef").await.unwrap();

        let dup = k.sys_dup(&user, fd).expect("dup");
        // One shared offset: a seek through one is seen by the other.
        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        let via_dup = k.sys_read(&user, dup, 3).await.unwrap();
        assert_eq!(&via_dup, b"abc");

        // dup2 onto an open descriptor closes it first.
        let other = k
            .sys_open(&user, "/g", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        let target = k.sys_dup2(&user, fd, other).await.expect("dup2");
        assert_eq!(target, other);
        let more = k.sys_read(&user, target, 3).await.unwrap();
        assert_eq!(&more, b"def", "offset still shared after dup2");

        // fcntl F_DUPFD allocates at or above the floor; cloexec bits.
        let high = k.sys_fcntl(&user, fd, F_DUPFD, 10).unwrap();
        assert!(high >= 10);
        assert_eq!(k.sys_fcntl(&user, fd, F_GETFD, 0).unwrap(), 0);
        k.sys_fcntl(&user, fd, F_SETFD, 1).unwrap();
        assert_eq!(k.sys_fcntl(&user, fd, F_GETFD, 0).unwrap(), 1);
    });
}

#[test]
fn chmod_chown_roundtrip() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        let fd = k
            .sys_open(&user, "/f", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();

        k.sys_chmod(&user, "/f", 0o600).await.expect("chmod");
        let stat = k.sys_stat(&user, "/f").await.unwrap();
        assert_eq!(stat.st_mode & 0o777, 0o600);

        k.sys_chown(&user, "/f", 7, 8).await.expect("chown");
        let stat = k.sys_stat(&user, "/f").await.unwrap();
        assert_eq!((stat.st_uid, stat.st_gid), (7, 8));
    });
}

#[test]
fn symlinks_splice_into_resolution() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/real", 0o755).await.unwrap();
        let fd = k
            .sys_open(&user, "/real/file", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"through the link").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        store.0.lock().add_symlink(0, "alias", "/real");

        let stat = k.sys_stat(&user, "/alias/file").await.expect("via symlink");
        assert_eq!(stat.st_size, 16);

        // A self-referencing link trips the expansion bound.
        store.0.lock().add_symlink(0, "loop", "/loop");
        assert_eq!(
            k.sys_stat(&user, "/loop").await.unwrap_err(),
            Errno::ELOOP
        );
    });
}

#[test]
fn chdir_makes_relative_paths_work() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/home", 0o755).await.unwrap();
        let fd = k
            .sys_open(&user, "/home/file", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();

        k.sys_chdir(&user, "/home").await.expect("chdir");
        assert!(k.sys_stat(&user, "file").await.is_ok(), "relative lookup");
        assert!(k.sys_stat(&user, "../home/file").await.is_ok());
    });
}
