//! Host-configurable knobs, grounded on `vitte-compiler::CompilerOptions`'s
//! shape and naming.

use std::path::PathBuf;

use orus_modloader::oruspath_from_env;
use orus_vm::DEFAULT_FRAMES_MAX;

/// Everything a host can tune before interpreting anything. Construct with
/// [`VmConfig::from_env`] to pick up `ORUSPATH`, or [`VmConfig::default`] for
/// an isolated config that never touches the environment.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Extra module search roots, checked after the platform fallbacks and
    /// ahead of nothing — `ORUSPATH` entries are always last, per
    /// `search_roots`'s ordering. Read once here rather than per-resolution,
    /// so a module name resolves to the same path all run.
    pub oruspath: Vec<PathBuf>,
    /// Call-stack depth limit (`FRAMES_MAX`).
    pub frames_max: usize,
    /// Whether the optimizer pass registry (loop fusion, typed-register
    /// specialization) runs during compilation.
    pub run_optimizer: bool,
    /// Strict mode: compiler warnings are treated as errors. Named after
    /// `CompilerOptions::deny_warnings`.
    pub deny_warnings: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            oruspath: Vec::new(),
            frames_max: DEFAULT_FRAMES_MAX,
            run_optimizer: true,
            deny_warnings: false,
        }
    }
}

impl VmConfig {
    /// Reads `ORUSPATH` once; every other knob keeps its default. Hosts that
    /// want a from-scratch config unaffected by the process environment
    /// should use [`VmConfig::default`] instead.
    pub fn from_env() -> Self {
        VmConfig { oruspath: oruspath_from_env(), ..VmConfig::default() }
    }
}
