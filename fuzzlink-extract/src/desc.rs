//! Reader for the parts of a syscall description file that reference
//! symbolic constants.
//!
//! Recognized top-level lines:
//!
//! ```text
//! include <linux/fs.h>
//! incdir <drivers/tty>
//! define O_LARGEFILE 0100000
//! resource fd[int32]: -1, AT_FDCWD
//! open_flags = O_RDONLY, O_WRONLY, O_RDWR
//! open$dir(file ptr[in, filename], flags flags[open_flags]) fd
//! stat { ... }          struct, body skipped
//! sockaddr [ ... ]      union, body skipped
//! type name underlying  ignored
//! ```
//!
//! `#` starts a comment outside of string literals.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ExtractError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    /// Full name including any `$variant` suffix.
    pub name: String,
    /// Name of the underlying kernel syscall.
    pub call_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub base: String,
    /// Special values, e.g. `-1` or `AT_FDCWD`.
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub includes: Vec<String>,
    pub incdirs: Vec<String>,
    pub defines: BTreeMap<String, String>,
    pub flags: BTreeMap<String, Vec<String>>,
    pub syscalls: Vec<Syscall>,
    pub resources: Vec<Resource>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Block {
    None,
    Struct,
    Union,
}

impl Description {
    /// Parse description text. `path` only labels errors.
    pub fn parse(path: &Path, text: &str) -> Result<Self, ExtractError> {
        let mut desc = Self::default();
        let mut block = Block::None;
        for (i, raw) in text.lines().enumerate() {
            let err = |msg: &str| ExtractError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                msg: msg.to_string(),
            };
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            match block {
                Block::Struct if line.starts_with('}') => block = Block::None,
                Block::Union if line.starts_with(']') => block = Block::None,
                Block::Struct | Block::Union => {}
                Block::None => block = desc.parse_line(line).map_err(|m| err(&m))?,
            }
        }
        if block != Block::None {
            return Err(ExtractError::Parse {
                path: path.to_path_buf(),
                line: text.lines().count(),
                msg: "unterminated struct or union".into(),
            });
        }
        Ok(desc)
    }

    fn parse_line(&mut self, line: &str) -> Result<Block, String> {
        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match keyword {
            "include" => self.includes.push(angle_arg(rest)?),
            "incdir" => self.incdirs.push(angle_arg(rest)?),
            "define" => {
                let (name, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("define needs a name and a value")?;
                self.defines.insert(name.to_string(), value.trim().to_string());
            }
            "resource" => self.resources.push(parse_resource(rest)?),
            "type" => {}
            _ => return self.parse_decl(line),
        }
        Ok(Block::None)
    }

    fn parse_decl(&mut self, line: &str) -> Result<Block, String> {
        let paren = line.find('(');
        let equals = line.find('=');
        match (paren, equals) {
            (Some(p), e) if e.is_none_or(|e| p < e) => {
                let name = line[..p].trim();
                if name.is_empty() {
                    return Err("syscall without a name".into());
                }
                let call_name = name.split_once('$').map_or(name, |(call, _)| call);
                self.syscalls.push(Syscall {
                    name: name.to_string(),
                    call_name: call_name.to_string(),
                });
                Ok(Block::None)
            }
            (_, Some(e)) => {
                let name = line[..e].trim();
                let values = split_list(&line[e + 1..])
                    .filter(|v| !v.starts_with('"'))
                    .map(str::to_string)
                    .collect();
                self.flags.insert(name.to_string(), values);
                Ok(Block::None)
            }
            _ => {
                let opens = |c: char| {
                    line.split_whitespace().nth(1).is_some_and(|t| t.starts_with(c))
                };
                if opens('{') {
                    Ok(if line.ends_with('}') { Block::None } else { Block::Struct })
                } else if opens('[') {
                    Ok(if line.ends_with(']') { Block::None } else { Block::Union })
                } else {
                    Err(format!("unrecognized line {line:?}"))
                }
            }
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn angle_arg(rest: &str) -> Result<String, String> {
    rest.strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .map(|s| s.trim().to_string())
        .ok_or_else(|| format!("expected <path>, got {rest:?}"))
}

fn parse_resource(rest: &str) -> Result<Resource, String> {
    let (head, values) = rest.split_once(':').unwrap_or((rest, ""));
    let (name, base) = head
        .trim()
        .split_once('[')
        .and_then(|(n, b)| Some((n, b.strip_suffix(']')?)))
        .ok_or_else(|| format!("expected name[base], got {head:?}"))?;
    Ok(Resource {
        name: name.trim().to_string(),
        base: base.trim().to_string(),
        values: split_list(values).map(str::to_string).collect(),
    })
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|v| !v.is_empty())
}
