// src/utils/system.rs: System functions

use sysinfo::System;


/// Determines number of cores that can be used for the external tools
///
/// # Arguments
///
/// * `requested` - Thread count from the command line or settings.
///
/// # Returns
///
/// min(requested, physical cores), never less than 1
pub fn detect_cores(requested: usize) -> usize {
    let physical_cores = System::physical_core_count().unwrap_or(1);
    physical_cores.min(requested).max(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cores_bounds() {
        assert_eq!(detect_cores(0), 1);
        assert_eq!(detect_cores(1), 1);
        let many = detect_cores(10_000);
        assert!(many >= 1 && many <= 10_000);
    }
}
