//! Process lifecycle across the VFS: fork isolation, exec from a
//! mounted file system, exit/waitpid interaction with open handles, and
//! signal interruption of blocked IPC.

mod common;

use cheviot_core::Errno;
use cheviot_kernel::proc::signal::{SIGTERM, SigAction, SigMaskHow};
use cheviot_kernel::syscall::{O_CREAT, O_RDONLY, O_WRONLY};
use cheviot_mm::{Prot, SegKind};

use common::{boot_ramfs, build_elf, dir_stat, test_kernel};

#[test]
fn fork_isolates_memory_both_ways() {
    let kernel = test_kernel();
    let parent = kernel.new_process("parent", None);

    let va = 0x1000u64;
    parent
        .addr_space
        .lock()
        .map(va, 0x2000, Prot::READ | Prot::WRITE, SegKind::Anon)
        .unwrap();
    parent
        .addr_space
        .lock()
        .copy_out(va, b"original contents")
        .unwrap();

    let child = kernel.sys_fork(&parent).unwrap();

    // Child reads what the parent had at fork time.
    let mut buf = [0u8; 17];
    child.addr_space.lock().copy_in(va, &mut buf).unwrap();
    assert_eq!(&buf, b"original contents");

    // Writes on either side stay private.
    child.addr_space.lock().copy_out(va, b"child!").unwrap();
    parent.addr_space.lock().copy_in(va, &mut buf).unwrap();
    assert_eq!(&buf, b"original contents");

    parent.addr_space.lock().copy_out(va, b"parent").unwrap();
    child.addr_space.lock().copy_in(va, &mut buf).unwrap();
    assert_eq!(&buf[..6], b"child!");
}

#[test]
fn exec_from_ramfs_replaces_image_and_sweeps_cloexec() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;

        // Install the program into the file system first.
        let program = build_elf(0x8000, &[(0x8000, b"prog-text", 9, 0x5)]);
        let fd = k
            .sys_open(&user, "/prog", O_CREAT | O_WRONLY, 0o755)
            .await
            .unwrap();
        k.sys_write(&user, fd, &program).await.unwrap();
        k.sys_fsync(&user, fd).await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        // Two descriptors: one close-on-exec, one inherited.
        let keep = k.sys_open(&user, "/prog", O_RDONLY, 0).await.unwrap();
        let sweep = k.sys_open(&user, "/prog", O_RDONLY, 0).await.unwrap();
        k.sys_fcntl(&user, sweep, cheviot_kernel::syscall::file::F_SETFD, 1)
            .unwrap();

        k.sys_exec(&user, "/prog", &["/prog", "arg1"], &["TERM=dumb"])
            .await
            .expect("exec");

        assert_eq!(*user.entry.lock(), 0x8000);
        let mut text = [0u8; 9];
        user.addr_space.lock().copy_in(0x8000, &mut text).unwrap();
        assert_eq!(&text, b"prog-text");

        assert!(user.handles.lock().get(keep).is_ok(), "plain fd survives");
        assert_eq!(
            user.handles.lock().get(sweep).unwrap_err(),
            Errno::EBADF,
            "close-on-exec fd swept"
        );

        // argv/env marshalled to the stack: argc is 2.
        let sp = *user.stack_ptr.lock();
        let mut argc = [0u8; 8];
        user.addr_space.lock().copy_in(sp, &mut argc).unwrap();
        assert_eq!(u64::from_le_bytes(argc), 2);
    });
}

#[test]
fn exec_of_non_elf_is_rejected() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        let fd = k
            .sys_open(&user, "/script", O_CREAT | O_WRONLY, 0o755)
            .await
            .unwrap();
        k.sys_write(&user, fd, b"#!/bin/sh\necho no\n").await.unwrap();
        k.sys_close(&user, fd).await.unwrap();

        assert_eq!(
            k.sys_exec(&user, "/script", &["/script"], &[])
                .await
                .unwrap_err(),
            Errno::EINVAL
        );
    });
}

#[test]
fn exit_closes_handles_and_releases_vnodes() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (parent, _store) = boot_ramfs(&k).await;
        let child = k.sys_fork(&parent).unwrap();

        let fd = k
            .sys_open(&child, "/owned", O_CREAT | O_WRONLY, 0o644)
            .await
            .unwrap();
        let vnode = child.handles.lock().get(fd).unwrap().vnode().unwrap();
        let refs_while_open = vnode.ref_cnt();
        assert!(refs_while_open >= 1);

        k.sys_exit(&child, 7).await;
        assert_eq!(child.handles.lock().open_count(), 0);
        assert_eq!(vnode.ref_cnt(), refs_while_open - 1, "fd reference released");

        let (pid, status) = k.sys_waitpid(&parent, None).await.unwrap();
        assert_eq!(pid, child.pid);
        assert_eq!(status, 7);
    });
}

#[test]
fn signal_interrupts_queued_ipc() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        // A mount with a server that never answers.
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/dead", 0o755).await.unwrap();
        let server = k.new_process("deadfs", None);
        let _port_fd = k.sys_mount(&server, "/dead", 0, &dir_stat()).await.unwrap();

        let victim = k.sys_fork(&user).unwrap();
        let victim_pid = victim.pid;

        // The victim's lookup will queue on the dead server's port and
        // sleep; the kill must unwind it with EINTR.
        {
            let k2 = k.clone();
            k.executor.spawn(async move {
                k2.timers.sleep(3).await;
                k2.sys_kill(victim_pid, SIGTERM).unwrap();
            });
        }
        let err = k.sys_stat(&victim, "/dead/file").await.unwrap_err();
        assert_eq!(err, Errno::EINTR);
    });
}

#[test]
fn sa_restart_leaves_ipc_queued() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _root_store) = boot_ramfs(&k).await;
        k.sys_mkdir(&user, "/slow", 0o755).await.unwrap();
        let server = k.new_process("slowfs", None);
        let port_fd = k.sys_mount(&server, "/slow", 0, &dir_stat()).await.unwrap();

        let victim = k.sys_fork(&user).unwrap();
        let victim_pid = victim.pid;
        k.sys_sigaction(
            &victim,
            SIGTERM,
            SigAction {
                handler: 0x1234,
                flags: cheviot_kernel::proc::signal::SA_RESTART,
                mask: 0,
            },
        )
        .unwrap();

        // Kill with SA_RESTART set, then answer the request; the lookup
        // completes instead of unwinding.
        {
            let k2 = k.clone();
            let server = server.clone();
            k.executor.spawn(async move {
                k2.timers.sleep(3).await;
                k2.sys_kill(victim_pid, SIGTERM).unwrap();
                k2.timers.sleep(3).await;
                let (msgid, _req) = k2
                    .sys_get_msg(&server, port_fd, cheviot_fs::wire::FSREQ_SZ)
                    .unwrap()
                    .expect("request still queued");
                k2.sys_reply_msg(
                    &server,
                    port_fd,
                    msgid,
                    -(Errno::ENOENT.to_errno() as isize),
                    &[],
                    0,
                )
                .unwrap();
            });
        }
        let err = k.sys_stat(&victim, "/slow/file").await.unwrap_err();
        assert_eq!(err, Errno::ENOENT, "restarted call ran to completion");
        assert!(victim.signals.deliverable() & (1 << SIGTERM) != 0, "signal still pending");
    });
}

#[test]
fn sigprocmask_blocks_and_sigsuspend_waits() {
    let kernel = test_kernel();
    let k = kernel.clone();
    kernel.run(async move {
        let (user, _store) = boot_ramfs(&k).await;
        let pid = user.pid;

        let old = k.sys_sigprocmask(&user, SigMaskHow::Block, 1 << SIGTERM);
        assert_eq!(old, 0);

        k.sys_kill(pid, SIGTERM).unwrap();
        assert_eq!(user.signals.deliverable(), 0, "masked while blocked");

        // sigsuspend with an empty mask sees the pending signal at once.
        let err = k.sys_sigsuspend(&user, 0).await;
        assert_eq!(err, Errno::EINTR);
        assert_eq!(
            k.sys_sigprocmask(&user, SigMaskHow::SetMask, 0),
            1 << SIGTERM,
            "old mask restored by sigsuspend"
        );
    });
}
