// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the stack and its logger: a fixed-capacity byte ring, wall clock
//! formatting, and the `vmm-sys-util` primitives the worker threads are built on.

pub use vmm_sys_util::{epoll, eventfd, rand};

pub mod ring_buffer;
pub mod time;
