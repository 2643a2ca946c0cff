use std::fs::{self, File, Permissions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::targets::TargetGroup;

const SNAPSHOT_MODE: u32 = 0o644;

/// Replace the snapshot at `path` with `targets`.
///
/// The targets are written to a temporary file next to `path` and renamed
/// over it, readers never see a half written file.
pub fn write(path: &Path, targets: &[TargetGroup]) -> io::Result<()> {
    replace(path, targets, |from, to| fs::rename(from, to))
}

fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("snapshot path {path:?} has no file name"),
        )
    })?;

    let mut temp = std::ffi::OsString::from(".");
    temp.push(name);
    temp.push(".tmp");

    Ok(path.with_file_name(temp))
}

fn replace<R>(path: &Path, targets: &[TargetGroup], rename: R) -> io::Result<()>
where
    R: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let temp = temp_path(path)?;

    let result = write_temp(&temp, targets).and_then(|_| rename(&temp, path));
    if result.is_err() {
        if let Err(err) = fs::remove_file(&temp) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(message = "remove temporary snapshot failed", path = ?temp, %err);
            }
        }
    }

    result
}

fn write_temp(temp: &Path, targets: &[TargetGroup]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(temp)?);
    serde_json::to_writer(&mut writer, targets)?;
    writer.write_all(b"\n")?;

    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    file.set_permissions(Permissions::from_mode(SNAPSHOT_MODE))?;

    Ok(())
}
