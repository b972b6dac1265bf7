use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::{Library, Symbol};
use log::{debug, warn};

use crate::error::WorkerError;

/// Where a node worker pool's script comes from. A compiled language has no
/// equivalent of `importlib`'s "load this module from a string or a file"
/// split, so this is the redesign that fills that gap: a prebuilt shared
/// object is `dlopen`'d directly, while inline source text is compiled to a
/// `cdylib` on the fly and then `dlopen`'d the same way.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// Path to an already-built shared object exporting the entry points
    /// below.
    Path(PathBuf),
    /// Rust source text to compile into a `cdylib` before loading.
    Source(String),
}

/// The symbols a loaded script must export. Arguments and return values
/// cross the FFI boundary as bincode-encoded `Vec<quickdist_proto::Value>`
/// buffers, since an arbitrary [`quickdist_proto::Value`] tree has no
/// stable `repr(C)` layout.
///
/// `quickdist_main(args_ptr, args_len, out_ptr, out_len) -> i32` runs one
/// call and writes an allocation owned by the callee (freed with
/// `quickdist_free`) through `out_ptr`/`out_len`. A non-zero return means
/// the buffer written is an error message instead of a result.
///
/// `quickdist_init() -> i32` is optional and runs once per process before
/// any call is served.
type MainFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;
type InitFn = unsafe extern "C" fn() -> i32;
type FreeFn = unsafe extern "C" fn(*mut u8, usize);

#[derive(Debug)]
pub struct LoadedScript {
    // Kept alive for as long as the function pointers below are used;
    // never read directly after construction.
    _library: Library,
    main: MainFn,
    init: Option<InitFn>,
    free: FreeFn,
    label: String,
}

impl LoadedScript {
    pub fn load(source: &ScriptSource) -> Result<LoadedScript, WorkerError> {
        match source {
            ScriptSource::Path(path) => Self::load_object(path),
            ScriptSource::Source(_) => {
                let so_path = compile_source_to_object(source)?;
                Self::load_object(&so_path)
            }
        }
    }

    fn load_object(path: &Path) -> Result<LoadedScript, WorkerError> {
        debug!("loading script object {}", path.display());
        let library = unsafe { Library::new(path) }.map_err(|e| WorkerError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let main: Symbol<MainFn> =
            unsafe { library.get(b"quickdist_main\0") }.map_err(|_| WorkerError::MissingMain {
                path: path.to_path_buf(),
            })?;
        let free: Symbol<FreeFn> =
            unsafe { library.get(b"quickdist_free\0") }.map_err(|_| WorkerError::MissingMain {
                path: path.to_path_buf(),
            })?;
        let init: Option<Symbol<InitFn>> = unsafe { library.get(b"quickdist_init\0") }.ok();

        let main = *main;
        let free = *free;
        let init = init.map(|s| *s);

        Ok(LoadedScript {
            _library: library,
            main,
            init,
            free,
            label: path.display().to_string(),
        })
    }

    pub fn run_init(&self) -> Result<(), WorkerError> {
        if let Some(init) = self.init {
            let rc = unsafe { init() };
            if rc != 0 {
                warn!("init() in {} returned {rc}", self.label);
                return Err(WorkerError::Call(format!(
                    "init() in {} returned {rc}",
                    self.label
                )));
            }
        }
        Ok(())
    }

    pub fn call(&self, args: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let rc = unsafe {
            (self.main)(args.as_ptr(), args.len(), &mut out_ptr, &mut out_len)
        };
        if out_ptr.is_null() {
            return if rc == 0 {
                Ok(Vec::new())
            } else {
                Err(WorkerError::Call(format!(
                    "main() in {} returned {rc} with no output",
                    self.label
                )))
            };
        }
        let bytes = unsafe { std::slice::from_raw_parts(out_ptr, out_len) }.to_vec();
        unsafe { (self.free)(out_ptr, out_len) };
        if rc != 0 {
            return Err(WorkerError::Call(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes)
    }
}

/// Compiles source text into a `cdylib` and returns the path to it. The
/// containing directory is deliberately leaked (not cleaned up on return):
/// the caller dlopens the file after this returns, and for a script shared
/// across a whole worker pool the object needs to outlive every subprocess
/// that loads it, not just this call.
pub fn compile_source_to_object(source: &ScriptSource) -> Result<PathBuf, WorkerError> {
    let text = match source {
        ScriptSource::Source(text) => text,
        ScriptSource::Path(path) => return Ok(path.clone()),
    };
    let dir = tempfile::tempdir()
        .map_err(|e| WorkerError::WriteSource {
            path: PathBuf::from("<tempdir>"),
            source: e,
        })?
        .into_path();
    let src_path = dir.join("script.rs");
    std::fs::write(&src_path, text).map_err(|e| WorkerError::WriteSource {
        path: src_path.clone(),
        source: e,
    })?;
    let so_path = dir.join("script.so");
    debug!("compiling inline script source to {}", so_path.display());
    compile_cdylib(&src_path, &so_path)?;
    Ok(so_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_a_missing_object_is_a_load_error() {
        let err = LoadedScript::load(&ScriptSource::Path(PathBuf::from(
            "/nonexistent/quickdist-test-script.so",
        )))
        .unwrap_err();
        assert!(matches!(err, WorkerError::Load { .. }));
    }

    #[test]
    fn compiling_a_path_source_is_a_no_op() {
        let path = PathBuf::from("/tmp/already-built.so");
        let resolved = compile_source_to_object(&ScriptSource::Path(path.clone())).unwrap();
        assert_eq!(resolved, path);
    }
}

fn compile_cdylib(src: &Path, out: &Path) -> Result<(), WorkerError> {
    let output = Command::new("rustc")
        .arg("--crate-type")
        .arg("cdylib")
        .arg("-O")
        .arg("-o")
        .arg(out)
        .arg(src)
        .output()
        .map_err(WorkerError::SpawnCompiler)?;
    if !output.status.success() {
        return Err(WorkerError::Compile {
            path: src.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
