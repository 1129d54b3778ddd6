//! Caller privilege checks

use nix::unistd::geteuid;

/// Effective user id of this process
pub fn effective_uid() -> u32 {
    geteuid().as_raw()
}

/// Whether the caller runs with superuser privilege
pub fn is_privileged() -> bool {
    geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::NamedTempFile;

    #[test]
    fn new_files_belong_to_effective_uid() {
        let file = NamedTempFile::new().unwrap();
        let meta = file.as_file().metadata().unwrap();
        assert_eq!(meta.uid(), effective_uid());
        assert_eq!(is_privileged(), effective_uid() == 0);
    }
}
