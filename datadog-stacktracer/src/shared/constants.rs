// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Maximum number of return addresses captured for a single thread.
pub const MAX_STACK_DEPTH: usize = 1000;

/// Upper bound on threads tracked by the registry.
pub const MAX_REGISTERED_THREADS: usize = 1024;

/// Hard caps (in bytes, including room for the `...` truncation tail) on the
/// string fields of a frame.  These bound the packed frame to a fixed
/// footprint so frames can be shipped as raw byte copies.
pub const FRAME_OBJECT_LEN: usize = 56;
pub const FRAME_OBJECT_PATH_LEN: usize = 48;
pub const FRAME_FILENAME_LEN: usize = 64;
pub const FRAME_FILENAME_PATH_LEN: usize = 64;
pub const FRAME_FUNCTION_LEN: usize = 256;

/// Size of one packed frame: address, relative address, line, then the five
/// NUL-padded string fields.
pub const FRAME_PACKED_SIZE: usize = 8
    + 8
    + 4
    + FRAME_OBJECT_LEN
    + FRAME_OBJECT_PATH_LEN
    + FRAME_FILENAME_LEN
    + FRAME_FILENAME_PATH_LEN
    + FRAME_FUNCTION_LEN;

/// Addresses are handed to the external line decoder in chunks of this size
/// to bound the command line of a single invocation.
pub const RESOLVE_BLOCK_SIZE: usize = 256;

/// How long the requesting thread busy-waits for the signal rendezvous to
/// fill the capture buffer before giving up.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_millis(150);

/// Sleep between `iprobe` polls in the per-process monitor task.
pub const MONITOR_POLL: Duration = Duration::from_millis(50);

/// Fixed tag on which stack-gather requests are sent.  The reply tag is the
/// payload of the request, chosen fresh per gather.
pub const REQUEST_TAG: i32 = 1;
pub const REPLY_TAG_MIN: i32 = 2;
pub const REPLY_TAG_MAX: i32 = 0x7FFF;

/// Base and per-rank components of the requester deadline.
pub const GATHER_DEADLINE_BASE: Duration = Duration::from_secs(10);
pub const GATHER_DEADLINE_PER_RANK: Duration = Duration::from_millis(20);
