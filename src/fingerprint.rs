//! Machine identity: a SHA-256 digest over three hardware identifiers
//! (board serial, primary disk serial, processor identifier), rendered as
//! 64 hex characters.
//!
//! The digest is recomputed on every use and never cached across
//! processes; two computations on the same machine are byte-identical.

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::{ProtectError, Result};

/// Length of the rendered fingerprint in characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Hashes the concatenated identifiers into the canonical 64-character
/// hex form. Pure; the collection helpers below feed it.
pub fn fingerprint_from_parts(board: &str, disk: &str, cpu: &str) -> String {
    let combined = format!("{}{}{}", board.trim(), disk.trim(), cpu.trim());
    hex::encode(Sha256::digest(combined.as_bytes()))
}

/// Computes a fresh fingerprint for the current machine.
pub fn generate_fingerprint() -> Result<String> {
    let board = board_serial().unwrap_or_default();
    let disk = disk_serial().unwrap_or_default();
    let cpu = processor_id().unwrap_or_default();

    debug!(
        "identity sources: board={} disk={} cpu={}",
        !board.is_empty(),
        !disk.is_empty(),
        !cpu.is_empty()
    );

    if board.is_empty() && disk.is_empty() && cpu.is_empty() {
        return Err(ProtectError::Fingerprint(
            "no hardware identifier could be collected",
        ));
    }
    Ok(fingerprint_from_parts(&board, &disk, &cpu))
}

/// Board serial number, falling back to the system-product UUID when the
/// baseboard reports none.
fn board_serial() -> Option<String> {
    #[cfg(windows)]
    {
        wmi_value("baseboard", "serialnumber")
            .or_else(|| wmi_value("csproduct", "uuid"))
    }
    #[cfg(not(windows))]
    {
        read_dmi("board_serial").or_else(|| read_dmi("product_uuid"))
    }
}

/// Serial of the first physical disk drive.
fn disk_serial() -> Option<String> {
    #[cfg(windows)]
    {
        wmi_value("diskdrive", "serialnumber")
    }
    #[cfg(not(windows))]
    {
        // Physical disk serials need elevated access on most distros; the
        // machine id is the stable stand-in.
        std::fs::read_to_string("/sys/block/sda/device/serial")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/machine-id")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
    }
}

/// Processor identifier.
fn processor_id() -> Option<String> {
    #[cfg(windows)]
    {
        wmi_value("cpu", "processorid")
    }
    #[cfg(not(windows))]
    {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
        cpuinfo
            .lines()
            .find(|l| l.starts_with("model name") || l.starts_with("Hardware"))
            .and_then(|l| l.split(':').nth(1))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Runs `wmic <class> get <property> /value` and parses the result.
#[cfg(windows)]
fn wmi_value(class: &str, property: &str) -> Option<String> {
    use std::process::Command;

    let command = format!("wmic {} get {} /value", class, property);
    let output = Command::new("cmd")
        .args(["/c", command.as_str()])
        .output()
        .map_err(|e| warn!("wmic {class} query failed to start: {e}"))
        .ok()?;

    let text = String::from_utf8_lossy(&output.stdout);
    parse_wmi_output(&text, property)
}

/// Parses wmic output: the `/value` form (`Property=value` lines) first,
/// then the legacy header-plus-value layout.
#[allow(dead_code)]
fn parse_wmi_output(text: &str, property: &str) -> Option<String> {
    let needle = format!("{}=", property.to_ascii_lowercase());
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.to_ascii_lowercase().starts_with(&needle) {
            let value = trimmed[needle.len()..].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    let mut saw_header = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !saw_header && trimmed.to_ascii_lowercase().contains(&property.to_ascii_lowercase()) {
            saw_header = true;
            continue;
        }
        if saw_header {
            return Some(trimmed.to_string());
        }
    }
    warn!("no {property} value in wmic output");
    None
}

#[cfg(not(windows))]
fn read_dmi(name: &str) -> Option<String> {
    let path = format!("/sys/class/dmi/id/{name}");
    match std::fs::read_to_string(&path) {
        Ok(s) => {
            let s = s.trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        Err(e) => {
            warn!("could not read {path}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_hash_is_deterministic_and_hex() {
        let a = fingerprint_from_parts("BOARD-1", "DISK-2", "CPU-3");
        let b = fingerprint_from_parts("BOARD-1", "DISK-2", "CPU-3");
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_hardware_differs() {
        let a = fingerprint_from_parts("BOARD-1", "DISK-2", "CPU-3");
        let b = fingerprint_from_parts("BOARD-1", "DISK-2", "CPU-4");
        assert_ne!(a, b);
    }

    #[test]
    fn identifiers_are_trimmed_before_hashing() {
        let a = fingerprint_from_parts(" BOARD-1 \r\n", "DISK-2", "CPU-3");
        let b = fingerprint_from_parts("BOARD-1", "DISK-2", "CPU-3");
        assert_eq!(a, b);
    }

    #[test]
    fn wmi_value_form_parses() {
        let out = "\r\nSerialNumber=ABC123\r\n\r\n";
        assert_eq!(
            parse_wmi_output(out, "SerialNumber").as_deref(),
            Some("ABC123")
        );
    }

    #[test]
    fn wmi_header_form_parses() {
        let out = "SerialNumber\r\nXYZ789\r\n";
        assert_eq!(
            parse_wmi_output(out, "SerialNumber").as_deref(),
            Some("XYZ789")
        );
    }

    #[test]
    fn fresh_fingerprints_agree() {
        // Collection may legitimately fail in constrained environments;
        // when it works, two computations must be byte-identical.
        if let (Ok(a), Ok(b)) = (generate_fingerprint(), generate_fingerprint()) {
            assert_eq!(a, b);
            assert_eq!(a.len(), FINGERPRINT_LEN);
        }
    }
}
