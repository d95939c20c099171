// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod base_types;
pub mod error;
pub mod lock;
pub mod messages;
