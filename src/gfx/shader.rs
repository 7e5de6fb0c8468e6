//! Shader sources, macro permutations and compiled binary blobs.
//!
//! Both device backends run shader text through the same small preprocessor
//! (`#include`, `#define`, `#if`/`#ifdef` blocks and `#error`) before handing
//! it to their compiler, so include resolution and macro handling behave the
//! same everywhere.

use std::collections::HashMap;

use super::types::{ConstantIndex, ShaderStage};
use super::DeviceError;

const MAX_INCLUDE_DEPTH: usize = 16;
const BINARY_MAGIC: &[u8; 4] = b"ANSB";
const BINARY_VERSION: u8 = 1;

/// One preprocessor define of a shader permutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderMacro {
    pub name: String,
    pub value: String,
}

impl ShaderMacro {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Resolves `#include "file"` directives while compiling.
pub trait ShaderIncluder {
    /// Returns the text of `file`, or `None` when it cannot be opened.
    fn open(&mut self, file: &str) -> Option<String>;
}

/// Includer for sources that must not include anything.
pub struct NoIncludes;

impl ShaderIncluder for NoIncludes {
    fn open(&mut self, _file: &str) -> Option<String> {
        None
    }
}

/// Compiled shader object as persisted in the binary cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub entry: String,
    pub code: Vec<u8>,
}

impl ShaderBinary {
    pub fn to_bytes(&self) -> Vec<u8> {
        let entry = self.entry.as_bytes();
        let mut bytes = Vec::with_capacity(8 + entry.len() + self.code.len());
        bytes.extend_from_slice(BINARY_MAGIC);
        bytes.push(BINARY_VERSION);
        bytes.push(match self.stage {
            ShaderStage::Vertex => 0,
            ShaderStage::Pixel => 1,
        });
        bytes.extend_from_slice(&(entry.len() as u16).to_le_bytes());
        bytes.extend_from_slice(entry);
        bytes.extend_from_slice(&self.code);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let invalid = |reason: &str| DeviceError::InvalidBinary(reason.to_string());

        if bytes.len() < 8 || &bytes[..4] != BINARY_MAGIC {
            return Err(invalid("missing shader binary header"));
        }
        if bytes[4] != BINARY_VERSION {
            return Err(invalid("unsupported shader binary version"));
        }
        let stage = match bytes[5] {
            0 => ShaderStage::Vertex,
            1 => ShaderStage::Pixel,
            _ => return Err(invalid("unknown shader stage")),
        };
        let entry_len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        let entry_end = 8 + entry_len;
        if bytes.len() < entry_end {
            return Err(invalid("truncated entry point"));
        }
        let entry = std::str::from_utf8(&bytes[8..entry_end])
            .map_err(|_| invalid("entry point is not utf-8"))?
            .to_string();

        Ok(Self {
            stage,
            entry,
            code: bytes[entry_end..].to_vec(),
        })
    }

    /// The code interpreted as shader text.
    pub fn source(&self) -> Result<&str, DeviceError> {
        std::str::from_utf8(&self.code)
            .map_err(|_| DeviceError::InvalidBinary("shader code is not utf-8".to_string()))
    }
}

// Preprocessor -----------------------------------------------------------------------

/// Expands includes, conditionals and macros of `source`.
pub fn preprocess(
    source: &str,
    macros: &[ShaderMacro],
    includer: &mut dyn ShaderIncluder,
) -> Result<String, String> {
    let mut preprocessor = Preprocessor {
        defines: macros
            .iter()
            .map(|m| (m.name.clone(), m.value.clone()))
            .collect(),
        includer,
        output: String::with_capacity(source.len()),
    };
    preprocessor.process(source, "<source>", 0)?;
    Ok(preprocessor.output)
}

struct Conditional {
    parent_active: bool,
    active: bool,
    taken: bool,
    seen_else: bool,
}

struct Preprocessor<'a> {
    defines: HashMap<String, String>,
    includer: &'a mut dyn ShaderIncluder,
    output: String,
}

impl Preprocessor<'_> {
    fn process(&mut self, source: &str, file: &str, depth: usize) -> Result<(), String> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(format!("{file}: includes nested too deeply"));
        }

        let mut stack: Vec<Conditional> = Vec::new();

        for (line_index, line) in source.lines().enumerate() {
            let location = || format!("{}({})", file, line_index + 1);
            let active = stack.last().map_or(true, |c| c.active);

            let Some(directive) = line.trim_start().strip_prefix('#') else {
                if active {
                    let expanded = self.substitute(line);
                    self.output.push_str(&expanded);
                    self.output.push('\n');
                }
                continue;
            };

            let (keyword, rest) = split_word(directive);
            match keyword {
                "ifdef" | "ifndef" | "if" => {
                    let value = match keyword {
                        "ifdef" => self.defines.contains_key(rest),
                        "ifndef" => !self.defines.contains_key(rest),
                        _ => self.evaluate(rest),
                    };
                    stack.push(Conditional {
                        parent_active: active,
                        active: active && value,
                        taken: value,
                        seen_else: false,
                    });
                }
                "else" => {
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| format!("{}: #else without #if", location()))?;
                    if top.seen_else {
                        return Err(format!("{}: duplicate #else", location()));
                    }
                    top.active = top.parent_active && !top.taken;
                    top.taken = true;
                    top.seen_else = true;
                }
                "endif" => {
                    stack
                        .pop()
                        .ok_or_else(|| format!("{}: #endif without #if", location()))?;
                }
                _ if !active => {}
                "include" => {
                    let name = rest.trim().trim_matches(|c| c == '"' || c == '<' || c == '>');
                    if name.is_empty() {
                        return Err(format!("{}: malformed #include", location()));
                    }
                    let text = self.includer.open(name).ok_or_else(|| {
                        format!("{}: cannot open include file '{}'", location(), name)
                    })?;
                    self.process(&text, name, depth + 1)?;
                }
                "define" => {
                    let (name, value) = split_word(rest);
                    if name.is_empty() {
                        return Err(format!("{}: malformed #define", location()));
                    }
                    let value = if value.is_empty() { "1" } else { value };
                    self.defines.insert(name.to_string(), value.to_string());
                }
                "undef" => {
                    self.defines.remove(rest.trim());
                }
                "error" => return Err(format!("{}: #error {}", location(), rest)),
                "pragma" => {}
                other => return Err(format!("{}: unknown directive #{}", location(), other)),
            }
        }

        if !stack.is_empty() {
            return Err(format!("{file}: unterminated #if block"));
        }
        Ok(())
    }

    fn evaluate(&self, expr: &str) -> bool {
        expr.split("||").any(|term| {
            term.split("&&")
                .all(|factor| self.evaluate_factor(factor.trim()))
        })
    }

    fn evaluate_factor(&self, factor: &str) -> bool {
        if let Some(inner) = factor.strip_prefix('!') {
            return !self.evaluate_factor(inner.trim());
        }
        if let Some(name) = factor
            .strip_prefix("defined")
            .map(|rest| rest.trim().trim_start_matches('(').trim_end_matches(')').trim())
        {
            return self.defines.contains_key(name);
        }
        for (op, expect_equal) in [("==", true), ("!=", false)] {
            if let Some((lhs, rhs)) = factor.split_once(op) {
                let equal = self.value_of(lhs.trim()) == self.value_of(rhs.trim());
                return equal == expect_equal;
            }
        }
        self.value_of(factor) != 0
    }

    fn value_of(&self, token: &str) -> i64 {
        if let Ok(number) = token.parse::<i64>() {
            return number;
        }
        self.defines
            .get(token)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }

    fn substitute(&self, line: &str) -> String {
        if self.defines.is_empty() {
            return line.to_string();
        }

        let mut out = String::with_capacity(line.len());
        let mut chars = line.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_ascii_alphabetic() || c == '_' {
                let mut end = start + c.len_utf8();
                while let Some(&(i, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        end = i + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &line[start..end];
                match self.defines.get(ident) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(ident),
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    }
}

// Constant tables ------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantSlot {
    /// Base vec4 register in the stage's register file.
    Register(u32),
    /// Texture binding; its sampler lives at the next binding.
    Texture(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantEntry {
    pub name: String,
    pub slot: ConstantSlot,
}

/// Named constants a compiled shader exposes.
///
/// Register constants are declared as `const Name: u32 = N;` and index the
/// stage's register array; textures are `@group(1) @binding(N) var Name: texture_2d<f32>;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstantTable {
    entries: Vec<ConstantEntry>,
    register_binding: Option<u32>,
}

impl ConstantTable {
    pub fn parse(source: &str) -> Self {
        let mut table = ConstantTable::default();

        for line in source.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("const ") {
                if let Some((name, register)) = parse_register_const(rest) {
                    table.push(name, ConstantSlot::Register(register));
                }
                continue;
            }

            let Some(binding) = parse_attribute(line, "@binding(") else {
                continue;
            };
            if line.contains("var<uniform>") && parse_attribute(line, "@group(") == Some(0) {
                table.register_binding = Some(binding);
            } else if line.contains("texture_2d") {
                if let Some(name) = line
                    .split_once("var ")
                    .and_then(|(_, rest)| rest.split_once(':'))
                    .map(|(name, _)| name.trim())
                {
                    table.push(name, ConstantSlot::Texture(binding));
                }
            }
        }

        table
    }

    fn push(&mut self, name: &str, slot: ConstantSlot) {
        if self.entries.iter().all(|entry| entry.name != name) {
            self.entries.push(ConstantEntry {
                name: name.to_string(),
                slot,
            });
        }
    }

    pub fn index_of(&self, name: &str) -> Option<ConstantIndex> {
        self.entries
            .iter()
            .position(|entry| entry.name == name)
            .map(|pos| ConstantIndex(pos as u32))
    }

    pub fn entry(&self, index: ConstantIndex) -> Option<&ConstantEntry> {
        self.entries.get(index.0 as usize)
    }

    pub fn entries(&self) -> &[ConstantEntry] {
        &self.entries
    }

    /// Binding of the register-file uniform in group 0, if the stage reads one.
    pub fn register_binding(&self) -> Option<u32> {
        self.register_binding
    }

    pub fn texture_bindings(&self) -> impl Iterator<Item = (ConstantIndex, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry.slot {
                ConstantSlot::Texture(binding) => Some((ConstantIndex(i as u32), binding)),
                ConstantSlot::Register(_) => None,
            })
    }
}

fn parse_register_const(rest: &str) -> Option<(&str, u32)> {
    let (name, rest) = rest.split_once(':')?;
    let (ty, value) = rest.split_once('=')?;
    if ty.trim() != "u32" {
        return None;
    }
    let value = value.trim().trim_end_matches(';').trim().trim_end_matches('u');
    Some((name.trim(), value.parse().ok()?))
}

fn parse_attribute(line: &str, attribute: &str) -> Option<u32> {
    let start = line.find(attribute)? + attribute.len();
    let end = line[start..].find(')')? + start;
    line[start..end].trim().parse().ok()
}
