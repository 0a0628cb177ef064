//! Mount machinery end to end: nested mounts, unmount semantics,
//! pivot_root and move_mount.

mod common;

use cheviot_core::Errno;
use cheviot_kernel::servers::ramfs::RamFs;
use cheviot_kernel::syscall::{O_CREAT, O_RDONLY, O_WRONLY};

use common::{boot_ramfs, mount_ramfs, test_kernel};

#[test]
fn nested_mount_shadows_and_unmount_restores() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;

        // A file inside the would-be mount point, visible before and
        // after but shadowed while the mount is up.
        k.sys_mkdir(&user, "/mnt", 0o755).await.unwrap();
        let fd = k
            .sys_open(&user, "/mnt/under", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();

        let mut inner = RamFs::new();
        inner.add_file(0, "over", b"mounted contents");
        let (server, _inner_store, port_fd) = mount_ramfs(&k, "/mnt", inner).await;

        assert!(k.sys_stat(&user, "/mnt/over").await.is_ok(), "mounted fs visible");
        assert_eq!(
            k.sys_stat(&user, "/mnt/under").await.unwrap_err(),
            Errno::ENOENT,
            "covered fs shadowed"
        );

        k.sys_unmount(&server, port_fd, false).await.expect("unmount");

        assert!(k.sys_stat(&user, "/mnt/under").await.is_ok(), "covered fs restored");
        assert_eq!(
            k.sys_stat(&user, "/mnt/over").await.unwrap_err(),
            Errno::ENOENT,
            "mounted fs gone"
        );
    });
}

#[test]
fn unmount_is_ebusy_while_files_open() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/mnt", 0o755).await.unwrap();

        let mut inner = RamFs::new();
        inner.add_file(0, "f", b"data");
        let (server, _store, port_fd) = mount_ramfs(&k, "/mnt", inner).await;

        let fd = k.sys_open(&user, "/mnt/f", O_RDONLY, 0).await.unwrap();
        assert_eq!(
            k.sys_unmount(&server, port_fd, false).await.unwrap_err(),
            Errno::EBUSY,
            "open handle below the mount"
        );

        k.sys_close(&user, fd).await.unwrap();
        k.sys_unmount(&server, port_fd, false)
            .await
            .expect("unmount after close");
    });
}

#[test]
fn unmount_drains_delayed_writes() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/mnt", 0o755).await.unwrap();
        let (server, store, port_fd) = mount_ramfs(&k, "/mnt", RamFs::new()).await;

        let fd = k
            .sys_open(&user, "/mnt/dirty", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"buffered").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        // No fsync: the unmount drain must commit the delayed write.
        k.sys_unmount(&server, port_fd, false).await.expect("unmount");
        assert_eq!(store.snapshot("/dirty").unwrap(), b"buffered");
    });
}

#[test]
fn pivot_root_swaps_namespaces() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        // Old root with a marker file and a mount point for the new root.
        let (user, _old_store) = boot_ramfs(&k).await;
        let fd = k
            .sys_open(&user, "/old-marker", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        k.sys_close(&user, fd).await.unwrap();
        k.sys_mkdir(&user, "/newroot", 0o755).await.unwrap();

        // New root fs, with the directory that will hold the old tree.
        let mut new_fs = RamFs::new();
        new_fs.add_file(0, "new-marker", b"new world");
        let (_server, _new_store, _port) = mount_ramfs(&k, "/newroot", new_fs).await;
        k.sys_mkdir(&user, "/newroot/old", 0o755).await.unwrap();

        let old_root_stat = k.sys_stat(&user, "/").await.unwrap();
        let new_root_stat = k.sys_stat(&user, "/newroot").await.unwrap();

        k.sys_pivot_root(&user, "/newroot", "/newroot/old")
            .await
            .expect("pivot_root");

        // "/" now stats as the new root.
        let root_now = k.sys_stat(&user, "/").await.unwrap();
        assert_eq!(root_now.st_ino, new_root_stat.st_ino);
        assert_ne!(root_now.st_ino, old_root_stat.st_ino);
        assert!(k.sys_stat(&user, "/new-marker").await.is_ok());

        // The old tree is still reachable under /old.
        assert!(
            k.sys_stat(&user, "/old/old-marker").await.is_ok(),
            "old root reachable through the pivot directory"
        );
    });
}

#[test]
fn move_mount_relocates_a_mount() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/first", 0o755).await.unwrap();
        k.sys_mkdir(&user, "/second", 0o755).await.unwrap();

        let mut inner = RamFs::new();
        inner.add_file(0, "movable", b"");
        let (_server, _store, _port) = mount_ramfs(&k, "/first", inner).await;

        assert!(k.sys_stat(&user, "/first/movable").await.is_ok());

        k.sys_move_mount(&user, "/second", "/first")
            .await
            .expect("move_mount");

        assert!(k.sys_stat(&user, "/second/movable").await.is_ok(), "moved");
        assert_eq!(
            k.sys_stat(&user, "/first/movable").await.unwrap_err(),
            Errno::ENOENT,
            "old location empty"
        );
    });
}

#[test]
fn closing_the_port_aborts_the_mount() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/mnt", 0o755).await.unwrap();
        let (server, _store, port_fd) = mount_ramfs(&k, "/mnt", RamFs::new()).await;

        // The server drops its port: every operation below the mount
        // fails with EIO from then on.
        k.sys_close(&server, port_fd).await.unwrap();
        assert_eq!(
            k.sys_stat(&user, "/mnt/anything").await.unwrap_err(),
            Errno::EIO
        );
    });
}
