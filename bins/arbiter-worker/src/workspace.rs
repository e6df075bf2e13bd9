/// Per-job working directory
///
/// Layout shared with the sandbox image (mounted at `/sandbox`):
///
/// ```text
/// main.cpp
/// tests/order.txt              safe names, declared order, one per line
/// tests/<safe>.in
/// testdata/<safe>/<file>       optional attached data file
/// outs/<safe>.out              written by the sandbox
/// errs/<safe>.err              written by the sandbox
/// compile_stderr.txt           written by the sandbox
/// results.json                 written by the sandbox
/// ```
///
/// Each directory is allocated fresh and removed when the job is done, on
/// every path. `close()` removes it on a blocking thread; `Drop` is the
/// fallback for panics and cancellation and removes it in place.

use arbiter_common::types::SafeTest;
use futures_util::future::try_join_all;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, warn};

pub const SOURCE_FILE: &str = "main.cpp";
pub const TESTS_DIR: &str = "tests";
pub const ORDER_FILE: &str = "order.txt";
pub const TESTDATA_DIR: &str = "testdata";
pub const OUTS_DIR: &str = "outs";
pub const ERRS_DIR: &str = "errs";
pub const COMPILE_STDERR_FILE: &str = "compile_stderr.txt";
pub const RESULTS_FILE: &str = "results.json";

pub fn input_path(root: &Path, safe_name: &str) -> PathBuf {
    root.join(TESTS_DIR).join(format!("{}.in", safe_name))
}

pub fn output_path(root: &Path, safe_name: &str) -> PathBuf {
    root.join(OUTS_DIR).join(format!("{}.out", safe_name))
}

pub fn stderr_path(root: &Path, safe_name: &str) -> PathBuf {
    root.join(ERRS_DIR).join(format!("{}.err", safe_name))
}

/// Final path component of an attached file name, or `None` if it has none
fn attachment_name(name: &str) -> Option<&str> {
    Path::new(name.trim()).file_name().and_then(|n| n.to_str())
}

pub struct JobWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl JobWorkspace {
    /// Allocate `<base>/job-XXXXXX`, creating `base` if needed
    pub async fn create(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base).await?;
        let dir = tempfile::Builder::new().prefix("job-").tempdir_in(base)?;
        debug!(path = %dir.path().display(), "Allocated job workspace");
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the source file, every test input and attached data file
    pub async fn stage(&self, source_code: &str, tests: &[SafeTest]) -> io::Result<()> {
        let root = self.path();
        for sub in [TESTS_DIR, OUTS_DIR, ERRS_DIR] {
            fs::create_dir_all(root.join(sub)).await?;
        }

        fs::write(root.join(SOURCE_FILE), source_code).await?;

        let order: String = tests.iter().map(|t| format!("{}\n", t.safe_name)).collect();
        fs::write(root.join(TESTS_DIR).join(ORDER_FILE), order).await?;

        try_join_all(tests.iter().map(|test| stage_test(root, test))).await?;
        Ok(())
    }

    /// Remove the directory, reporting failure instead of swallowing it.
    /// Output trees can be large, so this stays off the runtime threads.
    pub async fn close(mut self) -> io::Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove abandoned job workspace");
            }
        }
    }
}

async fn stage_test(root: &Path, test: &SafeTest) -> io::Result<()> {
    fs::write(input_path(root, &test.safe_name), &test.case.input).await?;

    let Some((name, content)) = test.case.attached_file() else {
        return Ok(());
    };
    match attachment_name(name) {
        Some(file_name) => {
            let dir = root.join(TESTDATA_DIR).join(&test.safe_name);
            fs::create_dir_all(&dir).await?;
            fs::write(dir.join(file_name), content).await
        }
        None => {
            warn!(test = %test.safe_name, file = %name, "Skipping attached file without a usable name");
            Ok(())
        }
    }
}
