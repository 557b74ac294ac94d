//! Bit-flag sets carried on the wire.
//!
//! Every set is a fixed-width unsigned integer. Decoding from a newer peer
//! keeps bits this build does not know about (`from_bits_retain`), so they
//! survive a decode/encode round-trip untouched.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::FuzzlinkError;

bitflags! {
    /// Executor capabilities negotiated during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Feature: u64 {
        const COVERAGE = 1 << 0;
        const COMPARISONS = 1 << 1;
        const EXTRA_COVERAGE = 1 << 2;
        const DELAY_KCOV_MMAP = 1 << 3;
        const SANDBOX_NONE = 1 << 4;
        const SANDBOX_SETUID = 1 << 5;
        const SANDBOX_NAMESPACE = 1 << 6;
        const SANDBOX_ANDROID = 1 << 7;
        const FAULT = 1 << 8;
        const LEAK = 1 << 9;
        const NET_INJECTION = 1 << 10;
        const NET_DEVICES = 1 << 11;
        const KCSAN = 1 << 12;
        const DEVLINK_PCI = 1 << 13;
        const NIC_VF = 1 << 14;
        const USB_EMULATION = 1 << 15;
        const VHCI_INJECTION = 1 << 16;
        const WIFI_EMULATION = 1 << 17;
        const LRWPAN_EMULATION = 1 << 18;
        const BINFMT_MISC = 1 << 19;
        const SWAP = 1 << 20;
    }
}

bitflags! {
    /// Flags that configure process-global executor state.
    ///
    /// Changing any of these (or the sandbox argument) between two
    /// programs forces the worker process to be relaunched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExecEnv: u64 {
        const DEBUG = 1 << 0;
        const SIGNAL = 1 << 1;
        const READ_ONLY_COVERAGE = 1 << 2;
        const RESET_STATE = 1 << 3;
        const SANDBOX_NONE = 1 << 4;
        const SANDBOX_SETUID = 1 << 5;
        const SANDBOX_NAMESPACE = 1 << 6;
        const SANDBOX_ANDROID = 1 << 7;
        const EXTRA_COVER = 1 << 8;
        const ENABLE_TUN = 1 << 9;
        const ENABLE_NET_DEV = 1 << 10;
        const ENABLE_NET_RESET = 1 << 11;
        const ENABLE_CGROUPS = 1 << 12;
        const ENABLE_CLOSE_FDS = 1 << 13;
        const ENABLE_DEVLINK_PCI = 1 << 14;
        const ENABLE_VHCI_INJECTION = 1 << 15;
        const ENABLE_WIFI = 1 << 16;
        const DELAY_KCOV_MMAP = 1 << 17;
        const ENABLE_NIC_VF = 1 << 18;
    }
}

bitflags! {
    /// Per-program flags that can change without a process restart.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExecFlag: u64 {
        const COLLECT_SIGNAL = 1 << 0;
        const COLLECT_COVER = 1 << 1;
        const DEDUP_COVER = 1 << 2;
        const COLLECT_COMPS = 1 << 3;
        const THREADED = 1 << 4;
    }
}

bitflags! {
    /// How the executor should treat a single request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RequestFlag: u64 {
        /// The payload is a prebuilt executable, not a program description.
        const IS_BINARY = 1 << 0;
        /// Capture stdout/stderr into `ExecResult::output`.
        const RETURN_OUTPUT = 1 << 1;
        /// Report program failure in `ExecResult::error` instead of
        /// tearing down the session.
        const RETURN_ERROR = 1 << 2;
    }
}

bitflags! {
    /// Outcome bits for one call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CallFlag: u8 {
        const EXECUTED = 1 << 0;
        const FINISHED = 1 << 1;
        const BLOCKED = 1 << 2;
        const FAULT_INJECTED = 1 << 3;
    }
}

impl Feature {
    /// Sandbox features are mutually exclusive in a request.
    pub const SANDBOXES: Feature = Feature::SANDBOX_NONE
        .union(Feature::SANDBOX_SETUID)
        .union(Feature::SANDBOX_NAMESPACE)
        .union(Feature::SANDBOX_ANDROID);

    /// Environment flags a worker needs to make use of these features.
    ///
    /// Sandbox features are not mapped; the caller picks exactly one.
    pub fn exec_env(self) -> ExecEnv {
        let mut env = ExecEnv::empty();
        if self.contains(Feature::COVERAGE) {
            env |= ExecEnv::SIGNAL;
        }
        if self.contains(Feature::EXTRA_COVERAGE) {
            env |= ExecEnv::EXTRA_COVER;
        }
        if self.contains(Feature::DELAY_KCOV_MMAP) {
            env |= ExecEnv::DELAY_KCOV_MMAP;
        }
        if self.contains(Feature::NET_INJECTION) {
            env |= ExecEnv::ENABLE_TUN;
        }
        if self.contains(Feature::NET_DEVICES) {
            env |= ExecEnv::ENABLE_NET_DEV;
        }
        if self.contains(Feature::DEVLINK_PCI) {
            env |= ExecEnv::ENABLE_DEVLINK_PCI;
        }
        if self.contains(Feature::NIC_VF) {
            env |= ExecEnv::ENABLE_NIC_VF;
        }
        if self.contains(Feature::VHCI_INJECTION) {
            env |= ExecEnv::ENABLE_VHCI_INJECTION;
        }
        if self.contains(Feature::WIFI_EMULATION) {
            env |= ExecEnv::ENABLE_WIFI;
        }
        env
    }

    /// Lower-case feature names for log lines, e.g. `coverage,fault`.
    pub fn names(self) -> String {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Inverse of [`Feature::names`] for a list of names, case-insensitive.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Feature, FuzzlinkError> {
        names.iter().try_fold(Feature::empty(), |acc, name| {
            let name = name.as_ref().trim();
            Feature::from_name(&name.to_ascii_uppercase())
                .map(|f| acc | f)
                .ok_or_else(|| FuzzlinkError::Other(format!("unknown feature {name:?}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_retained() {
        let raw = Feature::COVERAGE.bits() | (1 << 63);
        let f = Feature::from_bits_retain(raw);
        assert!(f.contains(Feature::COVERAGE));
        assert_eq!(f.bits(), raw);

        let bytes = bincode::serialize(&f).unwrap();
        let back: Feature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.bits(), raw);
    }

    #[test]
    fn call_flag_is_one_byte() {
        let bytes = bincode::serialize(&(CallFlag::EXECUTED | CallFlag::FINISHED)).unwrap();
        assert_eq!(bytes, vec![0x03]);
    }

    #[test]
    fn exec_env_for_features() {
        let env = (Feature::COVERAGE | Feature::NET_INJECTION | Feature::SANDBOX_NONE).exec_env();
        assert!(env.contains(ExecEnv::SIGNAL | ExecEnv::ENABLE_TUN));
        assert!(!env.intersects(ExecEnv::SANDBOX_NONE));
    }

    #[test]
    fn feature_names() {
        assert_eq!(
            (Feature::COVERAGE | Feature::FAULT).names(),
            "coverage,fault"
        );
        assert_eq!(Feature::empty().names(), "");
    }

    #[test]
    fn names_parse_back() {
        let set = Feature::COVERAGE | Feature::SANDBOX_NONE | Feature::LRWPAN_EMULATION;
        let names: Vec<String> = set.names().split(',').map(str::to_string).collect();
        assert_eq!(Feature::from_names(&names).unwrap(), set);
        assert_eq!(Feature::from_names(&["Fault"]).unwrap(), Feature::FAULT);
        assert!(Feature::from_names(&["teleport"]).is_err());
    }
}
