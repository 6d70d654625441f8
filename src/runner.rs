//! Execution dispatch and the degrading fallback executors.
//!
//! Preferred order: process hollowing (PE32, Windows), then a
//! delete-on-close temporary file whose directory entry vanishes when the
//! engine releases its handle, then an ordinary temporary file removed
//! explicitly after the wait. Every path blocks until the child exits and
//! reports its exit code; no temporary file survives the call.

use std::io::Write;

use log::{info, warn};

use crate::error::{ProtectError, Result};
#[cfg(windows)]
use crate::pe;

/// Runs an in-memory executable image and returns the child's exit code.
pub fn execute_from_memory(image: &[u8], args: &[String]) -> Result<i32> {
    #[cfg(windows)]
    {
        match pe::optional_magic(image) {
            Ok(pe::OPTIONAL_MAGIC_PE32) => match crate::hollow::run_image(image, args) {
                Ok(code) => return Ok(code),
                Err(e) => warn!("hollowing failed ({e}), falling back to transient file"),
            },
            Ok(magic) => {
                info!("optional-header magic {magic:#x} not hollowable, using fallback")
            }
            Err(e) => return Err(e),
        }
    }
    execute_via_transient_file(image, args)
}

/// The fallback chain on its own: delete-on-close first, then a plain
/// temporary file.
pub fn execute_via_transient_file(image: &[u8], args: &[String]) -> Result<i32> {
    #[cfg(windows)]
    {
        match execute_delete_on_close(image, args) {
            Ok(code) => return Ok(code),
            Err(e) => warn!("delete-on-close executor failed ({e}), using plain temp file"),
        }
    }
    execute_via_temp_file(image, args)
}

/// Ordinary temporary file: write, spawn, wait, delete. The file is
/// removed on every exit path, including spawn failure.
pub fn execute_via_temp_file(image: &[u8], args: &[String]) -> Result<i32> {
    let mut file = tempfile::Builder::new()
        .prefix("rt_")
        .suffix(if cfg!(windows) { ".exe" } else { ".bin" })
        .tempfile()?;
    file.write_all(image)?;
    file.flush()?;
    // Close the handle but keep the path; TempPath removes the file when
    // it goes out of scope, which covers the error returns below.
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }

    info!("running payload from temporary file {}", path.display());
    let status = std::process::Command::new(&path).args(args).status()?;

    if let Err(e) = path.close() {
        warn!("could not remove temporary file: {e}");
    }
    status
        .code()
        .ok_or_else(|| ProtectError::Process("child terminated without an exit code".into()))
}

/// Delete-on-close executor: the image is written to a temp file, then a
/// DELETE-access handle flagged delete-on-close is held for the child's
/// whole lifetime (the writer handle is closed first so the loader can
/// map the file). Dropping the keeper handle removes the directory entry
/// on success and failure alike.
#[cfg(windows)]
fn execute_delete_on_close(image: &[u8], args: &[String]) -> Result<i32> {
    use std::ffi::CString;
    use std::io;
    use std::ptr;
    use winapi::um::fileapi::{CreateFileA, OPEN_EXISTING};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::winbase::FILE_FLAG_DELETE_ON_CLOSE;
    use winapi::um::winnt::{
        DELETE, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, HANDLE,
    };

    struct KeeperHandle(HANDLE);
    impl Drop for KeeperHandle {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.0) };
        }
    }

    let mut file = tempfile::Builder::new()
        .prefix("rt_")
        .suffix(".exe")
        .tempfile()?;
    file.write_all(image)?;
    file.flush()?;
    let path = file.into_temp_path();
    let path_c = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| ProtectError::Process("temp path contains NUL".into()))?;

    // DELETE-access keeper: no read/write access, so the loader's own
    // mapping open is not blocked, and the entry dies with this handle.
    let keeper = unsafe {
        CreateFileA(
            path_c.as_ptr(),
            DELETE,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null_mut(),
            OPEN_EXISTING,
            FILE_FLAG_DELETE_ON_CLOSE,
            ptr::null_mut(),
        )
    };
    if keeper == INVALID_HANDLE_VALUE {
        return Err(ProtectError::Process(format!(
            "delete-on-close open failed: {}",
            io::Error::last_os_error()
        )));
    }
    let keeper = KeeperHandle(keeper);

    // The delete-on-close handle owns removal now; disarm TempPath so it
    // does not race the keeper.
    let path = path.keep().map_err(|e| {
        ProtectError::Process(format!("could not detach temp path: {e}"))
    })?;

    info!("running payload from delete-on-close file {}", path.display());
    let status = std::process::Command::new(&path).args(args).status()?;
    drop(keeper);

    status
        .code()
        .ok_or_else(|| ProtectError::Process("child terminated without an exit code".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_payload_fails() {
        // On Windows the PE sniff rejects it before any spawn; elsewhere
        // the spawn itself refuses the bytes. Either way the call fails.
        assert!(execute_from_memory(b"not an executable", &[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn temp_file_executor_runs_a_script_and_cleans_up() {
        // A shell script stands in for the image on Unix; the executor
        // only cares that the bytes run and the file disappears.
        let script = b"#!/bin/sh\nexit 42\n";
        let code = execute_via_temp_file(script, &[]).unwrap();
        assert_eq!(code, 42);
    }

    #[cfg(unix)]
    #[test]
    fn temp_file_executor_propagates_arguments() {
        let script = b"#!/bin/sh\nexit $#\n";
        let args = vec!["a".to_string(), "b".to_string()];
        let code = execute_via_temp_file(script, &args).unwrap();
        assert_eq!(code, 2);
    }
}
