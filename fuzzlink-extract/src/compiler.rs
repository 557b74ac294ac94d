//! Resolving names to values by compiling and running a C probe.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::arch::Arch;
use crate::desc::Description;
use crate::error::ExtractError;

/// Turns symbolic names into numeric values for one architecture.
pub trait Resolver {
    /// `names` is sorted and non-empty. Every name must resolve.
    fn resolve(
        &self,
        arch: &Arch,
        desc: &Description,
        names: &[String],
    ) -> Result<BTreeMap<String, u64>, ExtractError>;
}

/// Resolves against a kernel tree with the host C compiler.
#[derive(Debug, Clone)]
pub struct CcResolver {
    compiler: String,
    linux: PathBuf,
    build: PathBuf,
}

impl CcResolver {
    /// Without a separate build directory the kernel is assumed to be
    /// built in place.
    pub fn new(linux: PathBuf, build: Option<PathBuf>) -> Self {
        let build = build.unwrap_or_else(|| {
            info!("no kernel build directory given, assuming in-place build");
            linux.clone()
        });
        let compiler = std::env::var("CC")
            .ok()
            .filter(|cc| !cc.is_empty())
            .unwrap_or_else(|| "cc".to_string());
        Self {
            compiler,
            linux,
            build,
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn build_dir(&self) -> &Path {
        &self.build
    }

    /// Compiler arguments besides input and output.
    pub fn args(&self, arch: &Arch, desc: &Description) -> Vec<String> {
        let src = self.linux.display();
        let bld = self.build.display();
        let harch = arch.kernel_header_arch;
        let mut args = vec![
            format!("-I{src}/arch/{harch}/include"),
            format!("-I{bld}/arch/{harch}/include/generated/uapi"),
            format!("-I{bld}/arch/{harch}/include/generated"),
            format!("-I{bld}/include"),
            format!("-I{src}/include"),
            format!("-I{src}/arch/{harch}/include/uapi"),
            format!("-I{src}/include/uapi"),
            format!("-I{bld}/include/generated/uapi"),
            format!("-I{src}"),
            "-include".to_string(),
            format!("{src}/include/linux/kconfig.h"),
        ];
        args.extend(arch.cflags.iter().map(|f| f.to_string()));
        args.extend(desc.incdirs.iter().map(|dir| format!("-I{src}/{dir}")));
        args
    }
}

impl Resolver for CcResolver {
    fn resolve(
        &self,
        arch: &Arch,
        desc: &Description,
        names: &[String],
    ) -> Result<BTreeMap<String, u64>, ExtractError> {
        let work = tempfile::tempdir().map_err(|e| ExtractError::io(std::env::temp_dir(), e))?;
        let binary = work.path().join("probe");
        let source = probe_source(arch, desc, names);
        debug!(compiler = %self.compiler, names = names.len(), "compiling constant probe");

        let mut child = Command::new(&self.compiler)
            .args(self.args(arch, desc))
            .args(["-x", "c", "-", "-o"])
            .arg(&binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractError::io(&self.compiler, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|e| ExtractError::io(&self.compiler, e))?;
        }
        let compiled = child
            .wait_with_output()
            .map_err(|e| ExtractError::io(&self.compiler, e))?;
        if !compiled.status.success() {
            return Err(ExtractError::Compile {
                compiler: self.compiler.clone(),
                stderr: String::from_utf8_lossy(&compiled.stderr).into_owned(),
            });
        }

        let ran = Command::new(&binary)
            .output()
            .map_err(|e| ExtractError::io(&binary, e))?;
        if !ran.status.success() {
            return Err(ExtractError::Probe(format!(
                "{}: {}",
                ran.status,
                String::from_utf8_lossy(&ran.stderr).trim()
            )));
        }
        parse_values(names, &String::from_utf8_lossy(&ran.stdout))
    }
}

/// C program printing the value of every name, space separated, in order.
pub fn probe_source(arch: &Arch, desc: &Description, names: &[String]) -> String {
    let mut src = String::new();
    for inc in desc.includes.iter().map(String::as_str).chain([arch.kernel_include]) {
        let _ = writeln!(src, "#include <{inc}>");
    }
    let guard = arch
        .c_defines
        .iter()
        .map(|d| format!("defined({d})"))
        .collect::<Vec<_>>()
        .join(" || ");
    let _ = writeln!(src, "#if !({guard})");
    let _ = writeln!(src, "#error \"compiler does not target {}\"", arch.name);
    let _ = writeln!(src, "#endif");
    for (name, value) in &desc.defines {
        let _ = writeln!(src, "#ifndef {name}\n#define {name} {value}\n#endif");
    }
    src.push_str("#include <stdio.h>\n\nint main(void)\n{\n");
    src.push_str("\tunsigned long long vals[] = {\n");
    for name in names {
        let _ = writeln!(src, "\t\t(unsigned long long)({name}),");
    }
    src.push_str("\t};\n");
    src.push_str("\tfor (unsigned i = 0; i < sizeof(vals) / sizeof(vals[0]); i++)\n");
    src.push_str("\t\tprintf(\"%s%llu\", i ? \" \" : \"\", vals[i]);\n");
    src.push_str("\tprintf(\"\\n\");\n\treturn 0;\n}\n");
    src
}

/// Pair probe output with the names it was generated for.
pub fn parse_values(names: &[String], output: &str) -> Result<BTreeMap<String, u64>, ExtractError> {
    let values = output
        .split_whitespace()
        .map(|v| {
            v.parse::<u64>()
                .map_err(|e| ExtractError::Probe(format!("bad value {v:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != names.len() {
        return Err(ExtractError::ValueCount {
            expected: names.len(),
            got: values.len(),
        });
    }
    Ok(names.iter().cloned().zip(values).collect())
}
