//! Privileged-operation boundary.
//!
//! Actions that need elevated rights (writing to the EFI system partition,
//! backing up and restoring loader files) are sent through a
//! [`PrivilegedExecutor`] as an opcode plus an opaque byte payload. The
//! transport behind the executor is not our concern: callers see a
//! synchronous call that returns a status and an output payload.
//!
//! Payloads are JSON-encoded [`FileRequest`] values; file contents travel
//! as the raw `data` field.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SysencError, SysencResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    ReadFile,
    WriteFile,
    CopyFile,
    DeleteFile,
    FileExists,
    MakeDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    NotFound,
    AccessDenied,
    InvalidPayload,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Synchronous call path into a process holding elevated rights.
pub trait PrivilegedExecutor: Send + Sync {
    fn execute(&self, opcode: Opcode, input: &[u8]) -> (Status, Vec<u8>);
}

/// Executes requests in the current process.
///
/// Used when the caller already runs with sufficient rights, and in tests.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl PrivilegedExecutor for LocalExecutor {
    fn execute(&self, opcode: Opcode, input: &[u8]) -> (Status, Vec<u8>) {
        let request: FileRequest = match serde_json::from_slice(input) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(?opcode, "rejecting malformed privileged payload: {e}");
                return (Status::InvalidPayload, Vec::new());
            }
        };

        let result = match opcode {
            Opcode::ReadFile => std::fs::read(&request.path),
            Opcode::WriteFile => std::fs::write(&request.path, &request.data).map(|_| Vec::new()),
            Opcode::CopyFile => match &request.target {
                Some(target) => std::fs::copy(&request.path, target).map(|_| Vec::new()),
                None => return (Status::InvalidPayload, Vec::new()),
            },
            Opcode::DeleteFile => std::fs::remove_file(&request.path).map(|_| Vec::new()),
            Opcode::FileExists => Ok(vec![u8::from(request.path.exists())]),
            Opcode::MakeDir => std::fs::create_dir_all(&request.path).map(|_| Vec::new()),
        };

        match result {
            Ok(out) => (Status::Success, out),
            Err(e) => {
                tracing::debug!(?opcode, path = %request.path.display(), "privileged op failed: {e}");
                (status_from_io(&e), Vec::new())
            }
        }
    }
}

fn status_from_io(err: &std::io::Error) -> Status {
    match err.kind() {
        std::io::ErrorKind::NotFound => Status::NotFound,
        std::io::ErrorKind::PermissionDenied => Status::AccessDenied,
        _ => Status::Failed,
    }
}

fn call(
    exec: &dyn PrivilegedExecutor,
    opcode: Opcode,
    request: &FileRequest,
) -> SysencResult<Vec<u8>> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| SysencError::Other(anyhow::anyhow!("encoding privileged payload: {e}")))?;
    match exec.execute(opcode, &payload) {
        (Status::Success, out) => Ok(out),
        (status, _) => Err(SysencError::Device(format!(
            "privileged {opcode:?} on {} returned {status:?}",
            request.path.display()
        ))),
    }
}

fn request(path: &Path) -> FileRequest {
    FileRequest {
        path: path.to_path_buf(),
        ..FileRequest::default()
    }
}

pub fn read_file(exec: &dyn PrivilegedExecutor, path: &Path) -> SysencResult<Vec<u8>> {
    call(exec, Opcode::ReadFile, &request(path))
}

pub fn write_file(exec: &dyn PrivilegedExecutor, path: &Path, data: &[u8]) -> SysencResult<()> {
    let req = FileRequest {
        data: data.to_vec(),
        ..request(path)
    };
    call(exec, Opcode::WriteFile, &req).map(|_| ())
}

pub fn copy_file(exec: &dyn PrivilegedExecutor, from: &Path, to: &Path) -> SysencResult<()> {
    let req = FileRequest {
        target: Some(to.to_path_buf()),
        ..request(from)
    };
    call(exec, Opcode::CopyFile, &req).map(|_| ())
}

pub fn delete_file(exec: &dyn PrivilegedExecutor, path: &Path) -> SysencResult<()> {
    call(exec, Opcode::DeleteFile, &request(path)).map(|_| ())
}

pub fn file_exists(exec: &dyn PrivilegedExecutor, path: &Path) -> SysencResult<bool> {
    let out = call(exec, Opcode::FileExists, &request(path))?;
    Ok(out.first().copied() == Some(1))
}

pub fn make_dir(exec: &dyn PrivilegedExecutor, path: &Path) -> SysencResult<()> {
    call(exec, Opcode::MakeDir, &request(path)).map(|_| ())
}
