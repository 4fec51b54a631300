// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants and configuration shared by the recording and recovery sides.

pub(crate) mod configuration;
pub mod constants;
