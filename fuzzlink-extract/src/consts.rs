//! Which names to resolve, and the `.const` file format.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::{Path, PathBuf};

use crate::desc::Description;

pub const HEADER: &str = "# AUTOGENERATED FILE";

/// Every symbolic name the description depends on, sorted.
///
/// Flag values, define names, `__NR_<call>` for each real syscall and
/// resource special values. Pseudo-syscalls (`syz_` prefix) have no
/// number. Anything that is not a C identifier (numbers, expressions)
/// needs no resolving and is dropped.
pub fn collect_names(desc: &Description) -> Vec<String> {
    let mut names = BTreeSet::new();
    names.extend(desc.flags.values().flatten().cloned());
    names.extend(desc.defines.keys().cloned());
    names.extend(
        desc.syscalls
            .iter()
            .filter(|sc| !sc.call_name.starts_with("syz_"))
            .map(|sc| format!("__NR_{}", sc.call_name)),
    );
    names.extend(desc.resources.iter().flat_map(|r| r.values.iter().cloned()));
    names.into_iter().filter(|n| is_identifier(n)).collect()
}

pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().enumerate().all(|(i, c)| {
            c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())
        })
}

/// The file contents for resolved constants, sorted by name.
pub fn render(consts: &BTreeMap<String, u64>) -> String {
    let mut out = String::with_capacity(HEADER.len() + 1 + consts.len() * 32);
    out.push_str(HEADER);
    out.push('\n');
    for (name, value) in consts {
        let _ = writeln!(out, "{name} = {value}");
    }
    out
}

/// `sys/fs.txt` for amd64 becomes `sys/fs_amd64.const`.
pub fn output_path(input: &Path, arch: &str) -> PathBuf {
    let text = input.to_string_lossy();
    let stem = text.strip_suffix(".txt").unwrap_or(&text);
    PathBuf::from(format!("{stem}_{arch}.const"))
}
