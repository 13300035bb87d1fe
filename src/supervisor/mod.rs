//! Child process supervision.
//!
//! [`run_command`] spawns one external command and hands back a
//! [`ProcessHandle`]. Two reader tasks forward raw stdout/stderr chunks over a
//! bounded channel to a single supervising task, which is the only owner of
//! the process's [`CircularBuffer`](crate::log_buffer::CircularBuffer). Per
//! chunk it:
//! - invokes the optional `on_data` callback,
//! - appends the chunk's lines to the optional log buffer,
//! - forwards the chunk's lines, tagged with the process name, to an optional channel.
//!
//! On exit the buffer is checked for the lock marker; see [`run_command`] for
//! how the completion settles.

pub mod output;
pub mod process;

pub use output::{OutputChunk, ProcessOutput, StreamKind, chunk_lines};
pub use process::{
    Completion, DEFAULT_CHANNEL_CAPACITY, LOCK_EXIT_CODE, OutputCallback, ProcessController,
    ProcessHandle, RunOptions, Settled, run_command,
};
