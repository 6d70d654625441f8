//! Anti-tamper gate and analysis-environment probes.
//!
//! The gate is the pair of operating-system debugger queries (local and
//! remote). It deters casual inspection only and is not a security
//! boundary; the probes below it are best-effort signals a caller may
//! combine as policy.

use log::warn;
use sysinfo::System;

use crate::error::{ProtectError, Result};

const DEBUGGER_FRONTENDS: &[&str] = &[
    "ollydbg.exe",
    "windbg.exe",
    "x64dbg.exe",
    "x32dbg.exe",
    "ida.exe",
    "ida64.exe",
    "idaq.exe",
    "procmon.exe",
    "processhacker.exe",
    "procexp.exe",
    "procdump.exe",
    "msvsmon.exe",
];

const VM_TOOLING: &[&str] = &["vmware", "vbox", "vmtools", "vmwaretray", "vmwareuser"];

/// True when the operating system reports a debugger attached to this
/// process, locally or remotely.
#[cfg(windows)]
pub fn debugger_attached() -> bool {
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Diagnostics::Debug::{
        CheckRemoteDebuggerPresent, IsDebuggerPresent,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    unsafe {
        if IsDebuggerPresent().as_bool() {
            return true;
        }
        let mut remote = BOOL(0);
        if CheckRemoteDebuggerPresent(GetCurrentProcess(), &mut remote).is_ok()
            && remote.as_bool()
        {
            return true;
        }
    }
    false
}

#[cfg(not(windows))]
pub fn debugger_attached() -> bool {
    false
}

/// Runs the gate: refuses with a tamper failure before any protected
/// decryption or execution when a debugger is attached.
pub fn ensure_untampered() -> Result<()> {
    if debugger_attached() {
        warn!("debugger detected, refusing protected operation");
        return Err(ProtectError::TamperDetected);
    }
    Ok(())
}

/// Best-effort scan for well-known debugger frontends running anywhere on
/// the machine.
pub fn debugger_frontend_running() -> bool {
    process_name_matches(|name| DEBUGGER_FRONTENDS.iter().any(|d| name == *d))
}

/// Best-effort scan for virtualization tooling processes.
pub fn vm_tooling_running() -> bool {
    process_name_matches(|name| VM_TOOLING.iter().any(|v| name.contains(v)))
}

fn process_name_matches<F: Fn(&str) -> bool>(predicate: F) -> bool {
    let mut system = System::new_all();
    system.refresh_all();
    system.processes().values().any(|process| {
        let name = process.name().to_string_lossy().to_lowercase();
        predicate(&name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_passes_without_a_debugger() {
        // The test runner itself is not started under a native debugger.
        assert!(ensure_untampered().is_ok());
    }

    #[test]
    fn probes_complete() {
        // Smoke: the scans must finish and return without touching the
        // gate's result.
        let _ = debugger_frontend_running();
        let _ = vm_tooling_running();
    }
}
