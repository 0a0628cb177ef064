//! Synchronous message-port IPC and pipes.
//!
//! A message port is the server end of a mounted file system. Senders
//! queue scatter/gather messages in FIFO order and sleep until the server
//! replies; servers receive, then perform partial stateful reads and
//! writes on the in-flight message before replying. The sender is pinned
//! for the message's lifetime, so the message owns its iov memory.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod msg;
pub mod pipe;

pub use msg::{IovSeg, Msg, MsgPort, MsgState};
pub use pipe::{PIPE_BUF_SZ, Pipe, PollEvents};
