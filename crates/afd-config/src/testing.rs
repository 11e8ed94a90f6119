//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated `$AFD_WORK_DIR` with the full layout created
//! - Source directories for ingest tests
//! - Writing `DIR_CONFIG` / `HOST_CONFIG` / `AFD_CONFIG`
//!
//! # Usage
//!
//! ```ignore
//! use afd_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let in1 = env.source_dir("in1");
//!     env.write_dir_config(&format!("[directory] {}\n", in1.display()));
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::path::WorkDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Work directory with layout created
    pub work_dir: WorkDir,
    /// Parent for source directories
    pub source_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> std::io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let work_dir = WorkDir::new(root.join("afd"));
        work_dir.create_layout()?;

        let source_root = root.join("sources");
        std::fs::create_dir_all(&source_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            work_dir,
            source_root,
            test_id,
        })
    }

    /// Create (if needed) and return a source directory
    pub fn source_dir(&self, name: &str) -> PathBuf {
        let dir = self.source_root.join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    pub fn write_dir_config(&self, contents: &str) {
        let _ = std::fs::write(self.work_dir.dir_config(), contents);
    }

    pub fn write_host_config(&self, contents: &str) {
        let _ = std::fs::write(self.work_dir.host_config(), contents);
    }

    pub fn write_afd_config(&self, contents: &str) {
        let _ = std::fs::write(self.work_dir.afd_config(), contents);
    }
}
