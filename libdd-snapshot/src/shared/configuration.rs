// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::{CALLSTACK_MAX_NUM, NR_CPUS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the snapshot subsystem, fixed for the life of a boot.
///
/// The base address is the stable "physical" anchor published into the
/// persisted header; every pointer written into the region is expressed
/// relative to it so an external reader can interpret the dump without
/// knowing where the region was mapped in this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfiguration {
    base_address: u64,
    // Shared file backing the reservation; None maps anonymously, which
    // drops reset-survivability but keeps everything else working.
    backing_path: Option<PathBuf>,
    virtual_base_hint: Option<usize>,
    nr_cpus: usize,
    callstack: usize,
    preserve_last_kmsg: bool,
}

impl SnapshotConfiguration {
    pub fn new(
        base_address: u64,
        backing_path: Option<PathBuf>,
        virtual_base_hint: Option<usize>,
        nr_cpus: usize,
        callstack: usize,
        preserve_last_kmsg: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(base_address != 0, "snapshot base address must be non-zero");
        anyhow::ensure!(
            (1..=NR_CPUS).contains(&nr_cpus),
            "nr_cpus must be in 1..={NR_CPUS}, got {nr_cpus}"
        );
        anyhow::ensure!(
            (1..=CALLSTACK_MAX_NUM).contains(&callstack),
            "callstack depth must be in 1..={CALLSTACK_MAX_NUM}, got {callstack}"
        );
        Ok(Self {
            base_address,
            backing_path,
            virtual_base_hint,
            nr_cpus,
            callstack,
            preserve_last_kmsg,
        })
    }

    /// Builds a configuration from the boot-time base-address token
    /// (`snapshot_base=<token>` on a command line). The token accepts the
    /// same spellings the kernel's string-to-ulong parser does for the
    /// common cases: `0x`-prefixed hex or plain decimal.
    pub fn from_boot_token(token: &str, backing_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let base = parse_base_token(token)
            .ok_or_else(|| anyhow::anyhow!("unparseable base-address token {token:?}"))?;
        Self::new(base, backing_path, None, NR_CPUS, CALLSTACK_MAX_NUM, true)
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn backing_path(&self) -> Option<&PathBuf> {
        self.backing_path.as_ref()
    }

    pub fn virtual_base_hint(&self) -> Option<usize> {
        self.virtual_base_hint
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn callstack(&self) -> usize {
        self.callstack
    }

    pub fn preserve_last_kmsg(&self) -> bool {
        self.preserve_last_kmsg
    }
}

pub(crate) fn parse_base_token(token: &str) -> Option<u64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let parsed = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        token.parse::<u64>()
    };
    parsed.ok().filter(|base| *base != 0)
}
