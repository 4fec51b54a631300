// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The recording side: event rings, console mirrors, and the panic path.

pub(crate) mod crash;
pub mod events;
pub mod mirror;
pub(crate) mod rings;
