//! # fuzzlink-extract
//!
//! Reads a syscall description file, collects every symbolic constant it
//! references and writes their numeric values for one architecture to
//! `<input>_<arch>.const`. Values come from a [`Resolver`]; the stock
//! [`CcResolver`] compiles a probe against a kernel tree.
//!
//! The output file is written whole or not at all.

pub mod arch;
pub mod compiler;
pub mod consts;
pub mod desc;
pub mod error;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub use arch::{ARCHS, Arch};
pub use compiler::{CcResolver, Resolver};
pub use desc::Description;
pub use error::ExtractError;

/// Resolve the constants of `input` for `arch` and write the `.const`
/// file next to it. Returns the output path.
pub fn extract(
    input: &Path,
    arch_name: &str,
    resolver: &dyn Resolver,
) -> Result<PathBuf, ExtractError> {
    let arch = arch::lookup(arch_name).ok_or_else(|| ExtractError::UnknownArch(arch_name.into()))?;
    let output = consts::output_path(input, arch.name);

    let text = std::fs::read_to_string(input).map_err(|e| ExtractError::io(input, e))?;
    let desc = Description::parse(input, &text)?;
    let names = consts::collect_names(&desc);
    debug!(
        syscalls = desc.syscalls.len(),
        names = names.len(),
        "parsed {}",
        input.display()
    );

    let values = if names.is_empty() {
        BTreeMap::new()
    } else {
        resolver.resolve(arch, &desc, &names)?
    };
    write_atomic(&output, consts::render(&values).as_bytes())?;
    info!(constants = values.len(), "wrote {}", output.display());
    Ok(output)
}

/// Write through a temporary file in the same directory so a failed run
/// never leaves a partial file behind.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ExtractError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ExtractError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| ExtractError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| ExtractError::io(path, e.error))?;
    Ok(())
}
