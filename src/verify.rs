//! Post-transfer verification for bulk directory operations: compares a
//! relative-path -> size map built from the local filesystem against one
//! built from a recursive remote listing, and reports the symmetric
//! difference plus any size mismatches. Sizes only -- digest comparison is
//! explicitly out of scope for this core (see design notes).

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub success: bool,
    pub missing_on_remote: Vec<String>,
    pub extra_on_remote: Vec<String>,
    pub size_mismatches: Vec<String>,
}

/// Compares `local` and `remote` relative-path -> size maps, reporting
/// `success = false` whenever `had_upload_errors` is set even if the maps
/// agree, matching the contract that per-file upload errors always fail
/// verification.
pub fn compare(
    local: &BTreeMap<String, u64>,
    remote: &BTreeMap<String, u64>,
    had_transfer_errors: bool,
) -> VerificationReport {
    let mut missing_on_remote = Vec::new();
    let mut size_mismatches = Vec::new();
    for (path, local_size) in local {
        match remote.get(path) {
            None => missing_on_remote.push(path.clone()),
            Some(remote_size) if remote_size != local_size => size_mismatches.push(path.clone()),
            Some(_) => {}
        }
    }
    let extra_on_remote: Vec<String> =
        remote.keys().filter(|p| !local.contains_key(*p)).cloned().collect();

    let success = !had_transfer_errors
        && missing_on_remote.is_empty()
        && extra_on_remote.is_empty()
        && size_mismatches.is_empty();

    VerificationReport { success, missing_on_remote, extra_on_remote, size_mismatches }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_maps_verify_successfully() {
        let mut m = BTreeMap::new();
        m.insert("a.bin".to_string(), 10u64);
        m.insert("sub/b.bin".to_string(), 20u64);
        let report = compare(&m, &m, false);
        assert!(report.success);
        assert!(report.missing_on_remote.is_empty());
        assert!(report.extra_on_remote.is_empty());
        assert!(report.size_mismatches.is_empty());
    }

    #[test]
    fn missing_entry_fails_verification() {
        let mut local = BTreeMap::new();
        local.insert("a.bin".to_string(), 10u64);
        local.insert("b.bin".to_string(), 5u64);
        let mut remote = BTreeMap::new();
        remote.insert("a.bin".to_string(), 10u64);
        let report = compare(&local, &remote, false);
        assert!(!report.success);
        assert_eq!(report.missing_on_remote, vec!["b.bin".to_string()]);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut local = BTreeMap::new();
        local.insert("a.bin".to_string(), 10u64);
        let mut remote = BTreeMap::new();
        remote.insert("a.bin".to_string(), 11u64);
        let report = compare(&local, &remote, false);
        assert!(!report.success);
        assert_eq!(report.size_mismatches, vec!["a.bin".to_string()]);
    }

    #[test]
    fn extra_on_remote_is_reported() {
        let local: BTreeMap<String, u64> = BTreeMap::new();
        let mut remote = BTreeMap::new();
        remote.insert("stray.bin".to_string(), 1u64);
        let report = compare(&local, &remote, false);
        assert!(!report.success);
        assert_eq!(report.extra_on_remote, vec!["stray.bin".to_string()]);
    }

    #[test]
    fn transfer_errors_force_failure_even_if_maps_match() {
        let mut m = BTreeMap::new();
        m.insert("a.bin".to_string(), 10u64);
        let report = compare(&m, &m, true);
        assert!(!report.success);
    }

    #[test]
    fn empty_maps_verify_successfully() {
        let empty = BTreeMap::new();
        let report = compare(&empty, &empty, false);
        assert!(report.success);
    }
}
