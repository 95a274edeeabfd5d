//! Script metadata descriptor.
//!
//! Every artifact carries a line-oriented descriptor listing its exports.
//! Sections are read strictly in order, each count line deciding how many
//! record lines follow:
//!
//! ```text
//! exportVarCount: 2
//! gain
//! table
//! exportFuncCount: 1
//! reset
//! exportForEachCount: 2
//! 0 - root
//! 3 - scale
//! objectSlotCount: 1
//! 1
//! pragmaCount: 1
//! threadable - false
//! ```
//!
//! The trailing pragma section is optional. The text ends at the first NUL
//! byte or at the end of the buffer.

use snafu::ensure;
use tracing::warn;

use crate::error::{MalformedMetadataSnafu, Result};
use crate::symbols::KernelSignature;

/// Longest accepted line, newline included.
pub const MAX_LINE: usize = 500;

const EXPORT_VAR: &str = "exportVarCount:";
const EXPORT_FUNC: &str = "exportFuncCount:";
const EXPORT_FOREACH: &str = "exportForEachCount:";
const OBJECT_SLOT: &str = "objectSlotCount:";
const PRAGMA: &str = "pragmaCount:";

/// One exported foreach kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelExport {
    pub signature: KernelSignature,
    pub name: String,
}

/// Parsed export descriptor of one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub variables: Vec<String>,
    pub functions: Vec<String>,
    pub kernels: Vec<KernelExport>,
    /// Variable indices holding object handles, in declaration order.
    pub object_slots: Vec<usize>,
    pub pragmas: Vec<(String, String)>,
}

impl ScriptMetadata {
    /// Parse a descriptor, stopping at the first NUL byte.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        match std::str::from_utf8(&bytes[..end]) {
            Ok(text) => Self::parse(text),
            Err(e) => MalformedMetadataSnafu { line: 0usize, reason: format!("not UTF-8: {e}") }.fail(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.split('\0').next().unwrap_or_default();
        let mut lines = Lines::new(text);

        let var_count = lines.count(EXPORT_VAR)?;
        let variables = lines.names(var_count)?;

        let func_count = lines.count(EXPORT_FUNC)?;
        let functions = lines.names(func_count)?;

        let kernel_count = lines.count(EXPORT_FOREACH)?;
        let kernels = (0..kernel_count).map(|_| lines.kernel()).collect::<Result<Vec<_>>>()?;

        let slot_count = lines.count(OBJECT_SLOT)?;
        // Counts are untrusted; storage grows only as records are read.
        let mut object_slots = Vec::new();
        for _ in 0..slot_count {
            let (line, index) = lines.number()?;
            if index < var_count {
                object_slots.push(index);
            } else {
                warn!(metadata.line = line, slot = index, var_count, "object slot out of range, ignored");
            }
        }

        let pragmas = if lines.peek_nonempty().is_some_and(|l| l.starts_with(PRAGMA)) {
            let count = lines.count(PRAGMA)?;
            (0..count).map(|_| lines.pragma()).collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(Self { variables, functions, kernels, object_slots, pragmas })
    }

    /// Whether variable `slot` holds an object handle.
    pub fn is_object(&self, slot: usize) -> bool {
        self.object_slots.contains(&slot)
    }

    pub fn pragma(&self, key: &str) -> Option<&str> {
        self.pragmas.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Sequential line reader with line-number bookkeeping.
struct Lines<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text, line: 0 }
    }

    fn next(&mut self) -> Result<&'a str> {
        self.line += 1;
        let line = self.line;
        ensure!(!self.rest.is_empty(), MalformedMetadataSnafu { line, reason: "unexpected end of metadata" });

        let (raw, rest) = match self.rest.find('\n') {
            Some(i) => (&self.rest[..=i], &self.rest[i + 1..]),
            None => (self.rest, ""),
        };
        ensure!(
            raw.len() < MAX_LINE,
            MalformedMetadataSnafu { line, reason: format!("line exceeds {} bytes", MAX_LINE - 1) }
        );

        self.rest = rest;
        Ok(raw.trim_end_matches(['\n', '\r']))
    }

    fn peek_nonempty(&self) -> Option<&'a str> {
        self.rest.lines().map(str::trim).find(|l| !l.is_empty())
    }

    fn malformed<T>(&self, reason: impl Into<String>) -> Result<T> {
        MalformedMetadataSnafu { line: self.line, reason: reason.into() }.fail()
    }

    fn count(&mut self, key: &str) -> Result<usize> {
        // Blank lines may separate sections.
        let mut text = self.next()?;
        while text.trim().is_empty() {
            text = self.next()?;
        }
        let Some(value) = text.trim_start().strip_prefix(key) else {
            return self.malformed(format!("expected '{key}', found '{text}'"));
        };
        match value.trim().parse() {
            Ok(count) => Ok(count),
            Err(_) => self.malformed(format!("invalid count in '{text}'")),
        }
    }

    fn names(&mut self, count: usize) -> Result<Vec<String>> {
        (0..count)
            .map(|_| {
                let name = self.next()?.trim();
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return self.malformed(format!("invalid symbol name '{name}'"));
                }
                Ok(name.to_string())
            })
            .collect()
    }

    fn number(&mut self) -> Result<(usize, usize)> {
        let text = self.next()?;
        match text.trim().parse() {
            Ok(n) => Ok((self.line, n)),
            Err(_) => self.malformed(format!("invalid slot index '{text}'")),
        }
    }

    fn kernel(&mut self) -> Result<KernelExport> {
        let text = self.next()?;
        let Some((sig, name)) = text.split_once(" - ") else {
            return self.malformed(format!("invalid kernel record '{text}'"));
        };
        let Ok(bits) = sig.trim().parse::<u32>() else {
            return self.malformed(format!("invalid kernel signature '{sig}'"));
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return self.malformed(format!("invalid kernel name '{name}'"));
        }
        Ok(KernelExport { signature: KernelSignature::from_repr_truncated(bits), name: name.to_string() })
    }

    fn pragma(&mut self) -> Result<(String, String)> {
        let text = self.next()?;
        match text.split_once(" - ") {
            Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
            _ => self.malformed(format!("invalid pragma '{text}'")),
        }
    }
}
