//! Parent-side conversion of paths, arguments and environment entries into
//! the NUL-terminated arrays `posix_spawn` and `execve` expect.
//!
//! Everything here allocates, so it all runs before the spawn primitive or
//! `fork`; the child only ever sees the finished pointers.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::c_char;

use crate::error::{Result, SpawnError};

/// Owned strings plus a NULL-terminated pointer array into them.
pub(crate) struct CStringArray {
    items: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    fn new(items: Vec<CString>) -> Self {
        // CString keeps its bytes on the heap, so the pointers survive moves
        // of `items` itself.
        let ptrs = items
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Self { items, ptrs }
    }

    pub(crate) fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| SpawnError::InvalidRequest(format!("{what} contains a NUL byte")))
}

/// Marshal a filesystem path. Empty paths are rejected.
pub(crate) fn path(path: &Path, what: &str) -> Result<CString> {
    if path.as_os_str().is_empty() {
        return Err(SpawnError::InvalidRequest(format!("empty {what}")));
    }
    c_string(path.as_os_str().as_bytes(), what)
}

pub(crate) fn argv(args: &[OsString]) -> Result<CStringArray> {
    let items = args
        .iter()
        .map(|arg| c_string(arg.as_bytes(), "argument"))
        .collect::<Result<Vec<_>>>()?;
    Ok(CStringArray::new(items))
}

/// Marshal an explicit environment into `KEY=VALUE` entries.
pub(crate) fn envp(vars: &BTreeMap<OsString, OsString>) -> Result<CStringArray> {
    let items = vars
        .iter()
        .map(|(key, value)| env_entry(key, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(CStringArray::new(items))
}

fn env_entry(key: &OsStr, value: &OsStr) -> Result<CString> {
    let key = key.as_bytes();
    if key.is_empty() || key.contains(&b'=') {
        return Err(SpawnError::InvalidRequest(format!(
            "invalid environment key {:?}",
            String::from_utf8_lossy(key)
        )));
    }
    let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
    entry.extend_from_slice(key);
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    c_string(&entry, "environment entry")
}
