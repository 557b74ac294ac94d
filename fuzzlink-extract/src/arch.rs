//! Supported target architectures.

/// How to compile a probe for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    pub name: &'static str,
    /// Preprocessor symbols, at least one of which the compiler defines
    /// when targeting this architecture.
    pub c_defines: &'static [&'static str],
    /// Directory under `arch/` in the kernel tree.
    pub kernel_header_arch: &'static str,
    /// Header that declares the syscall numbers.
    pub kernel_include: &'static str,
    pub cflags: &'static [&'static str],
}

pub const ARCHS: &[Arch] = &[
    Arch {
        name: "amd64",
        c_defines: &["__x86_64__"],
        kernel_header_arch: "x86",
        kernel_include: "asm/unistd.h",
        cflags: &["-m64"],
    },
    Arch {
        name: "arm64",
        c_defines: &["__aarch64__"],
        kernel_header_arch: "arm64",
        kernel_include: "asm/unistd.h",
        cflags: &[],
    },
    Arch {
        name: "ppc64le",
        c_defines: &["__ppc64__", "__PPC64__", "__powerpc64__"],
        kernel_header_arch: "powerpc",
        kernel_include: "asm/unistd.h",
        cflags: &["-D__powerpc64__"],
    },
];

pub fn lookup(name: &str) -> Option<&'static Arch> {
    ARCHS.iter().find(|a| a.name == name)
}
