//! Block-cache behavior observed through the syscall surface and the
//! server's on-"disk" state: delayed writes, the write-behind flusher,
//! fsync, truncation, and end-of-file handling.

mod common;

use cheviot_core::Errno;
use cheviot_fs::cache::BDFLUSH_WAKEUP_INTERVAL_TICKS;
use cheviot_fs::CLUSTER_SZ;
use cheviot_kernel::syscall::{O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};

use common::{boot_ramfs, test_kernel};

#[test]
fn write_then_fsync_reaches_the_server() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        let payload = vec![0x58u8; 16384]; // 'X'
        let fd = k
            .sys_open(&user, "/data", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        let n = k.sys_write(&user, fd, &payload).await.unwrap();
        assert_eq!(n, 16384);

        // Before fsync the bytes may only live in the cache.
        k.sys_fsync(&user, fd).await.expect("fsync");
        let disk = store.snapshot("/data").expect("file on server");
        assert_eq!(disk.len(), 16384);
        assert!(disk.iter().all(|&b| b == 0x58), "server sees the payload");

        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn delayed_write_commits_within_two_flusher_periods() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/lazy", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        // A full cluster goes out via the prompt (async) path.
        let cluster = vec![7u8; CLUSTER_SZ];
        k.sys_write(&user, fd, &cluster).await.unwrap();

        // Sleep two flusher wakeups; the write-behind task must have
        // committed by then.
        k.timers.sleep(2 * BDFLUSH_WAKEUP_INTERVAL_TICKS + 2).await;

        let disk = store.snapshot("/lazy").expect("file on server");
        assert_eq!(disk.len(), CLUSTER_SZ, "async write-back committed");
        assert!(disk.iter().all(|&b| b == 7));
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn read_observes_cached_write_before_flush() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/f", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"cached bytes").await.unwrap();

        // The server has not necessarily seen anything yet, but a read
        // through the cache must.
        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        let data = k.sys_read(&user, fd, 64).await.unwrap();
        assert_eq!(&data, b"cached bytes");

        // And the delayed write still reaches the server afterwards.
        k.sys_fsync(&user, fd).await.unwrap();
        assert_eq!(store.snapshot("/f").unwrap(), b"cached bytes");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn sparse_write_zero_fills_the_gap() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/sparse", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"head").await.unwrap();

        // Seek past the end and write: the gap reads back as zeros.
        k.sys_lseek(&user, fd, 100, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        k.sys_write(&user, fd, b"tail").await.unwrap();

        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        let data = k.sys_read(&user, fd, 256).await.unwrap();
        assert_eq!(data.len(), 104);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..100].iter().all(|&b| b == 0), "gap zero-filled");
        assert_eq!(&data[100..], b"tail");

        k.sys_fsync(&user, fd).await.unwrap();
        let disk = store.snapshot("/sparse").unwrap();
        assert_eq!(disk.len(), 104);
        assert!(disk[4..100].iter().all(|&b| b == 0));
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn truncate_discards_cached_tail() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/t", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"0123456789").await.unwrap();
        k.sys_fsync(&user, fd).await.unwrap();

        k.sys_ftruncate(&user, fd, 4).await.expect("ftruncate");
        assert_eq!(store.snapshot("/t").unwrap(), b"0123");

        // Rewriting past the truncation point must not resurrect stale
        // bytes from the cache.
        k.sys_lseek(&user, fd, 6, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        k.sys_write(&user, fd, b"Z").await.unwrap();
        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        let data = k.sys_read(&user, fd, 16).await.unwrap();
        assert_eq!(&data, b"0123\0\0Z");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn reads_are_bounded_by_eof() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        let fd = k
            .sys_open(&user, "/small", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"tiny").await.unwrap();
        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();

        let data = k.sys_read(&user, fd, 4096).await.unwrap();
        assert_eq!(&data, b"tiny", "short read at end of file");

        let empty = k.sys_read(&user, fd, 4096).await.unwrap();
        assert!(empty.is_empty(), "read at EOF returns zero bytes");
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn cross_cluster_write_and_read() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, store) = boot_ramfs(&k).await;

        // One and a half clusters, written in a single call.
        let len = CLUSTER_SZ + CLUSTER_SZ / 2;
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let fd = k
            .sys_open(&user, "/big", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        let n = k.sys_write(&user, fd, &payload).await.unwrap();
        assert_eq!(n, len);

        k.sys_lseek(&user, fd, 0, cheviot_kernel::syscall::file::SEEK_SET)
            .unwrap();
        let mut data = Vec::new();
        loop {
            let chunk = k.sys_read(&user, fd, 8192).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        assert_eq!(data, payload, "round trip across the cluster boundary");

        k.sys_fsync(&user, fd).await.unwrap();
        assert_eq!(store.snapshot("/big").unwrap(), payload);
        k.sys_close(&user, fd).await.unwrap();
    });
}

#[test]
fn aborted_superblock_fails_with_eio() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        let fd = k
            .sys_open(&user, "/f", O_CREAT | O_RDWR, 0o644)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"before abort").await.unwrap();
        k.sys_fsync(&user, fd).await.unwrap();

        // Kill the mount out from under everyone.
        let root = k.fs.root().unwrap();
        root.superblock.abort();

        assert_eq!(
            k.sys_stat(&user, "/f").await.unwrap_err(),
            Errno::EIO,
            "lookups fail after abort"
        );
        k.fs.cache.discard_superblock(root.superblock.id);
        let err = k.sys_read(&user, fd, 4).await.unwrap_err();
        assert_eq!(err, Errno::EIO, "reads fail after abort");
    });
}
